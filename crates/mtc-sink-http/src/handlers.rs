//! Request handlers: negotiation, parameter validation, document printing

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;

use mtc_agent::Agent;
use mtc_printer::Printer;

use crate::filter::PathFilter;
use crate::stream;
use crate::AppState;

pub(crate) fn negotiate(agent: &Agent, headers: &HeaderMap) -> Arc<dyn Printer> {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json"))
        .unwrap_or(false);
    let format = if wants_json { "json" } else { "xml" };
    agent.printer(format).expect("printers are registered at construction")
}

pub(crate) fn document(printer: &Arc<dyn Printer>, status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, printer.mime_type())
        .body(body.into())
        .expect("static response parts")
}

pub(crate) fn error_document(
    agent: &Agent,
    printer: &Arc<dyn Printer>,
    status: StatusCode,
    code: &str,
    message: &str,
) -> Response {
    let body = printer.print_error(code, message, &agent.document_header());
    document(printer, status, body)
}

fn parse_filter(
    agent: &Agent,
    device: Option<&str>,
    params: &HashMap<String, String>,
) -> Result<Option<std::collections::HashSet<String>>, String> {
    let path = params.get("path").map(String::as_str);
    let devices = match device {
        Some(key) => {
            let device = agent
                .find_device(key)
                .ok_or_else(|| format!("could not find device {key}"))?;
            vec![device]
        }
        None => agent.devices(),
    };

    match path {
        Some(path) => {
            let filter =
                PathFilter::parse(path).ok_or_else(|| format!("invalid path {path}"))?;
            let ids = filter.select(&devices);
            if ids.is_empty() {
                return Err(format!("path {path} matched nothing"));
            }
            Ok(Some(ids))
        }
        None => match device {
            // a device-scoped request without a path still restricts
            Some(_) => Ok(Some(
                devices
                    .iter()
                    .flat_map(|d| d.data_items())
                    .map(|item| item.id().to_string())
                    .collect(),
            )),
            None => Ok(None),
        },
    }
}

// --- probe ---------------------------------------------------------------

pub(crate) async fn probe(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let printer = negotiate(&state.agent, &headers);
    let body = printer.print_probe(&state.agent.devices(), &state.agent.document_header());
    document(&printer, StatusCode::OK, body)
}

pub(crate) async fn device_probe(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
) -> Response {
    let printer = negotiate(&state.agent, &headers);
    match state.agent.find_device(&device) {
        Some(device) => {
            let body = printer.print_probe(&[device], &state.agent.document_header());
            document(&printer, StatusCode::OK, body)
        }
        None => error_document(
            &state.agent,
            &printer,
            StatusCode::NOT_FOUND,
            "NO_DEVICE",
            &format!("could not find device {device}"),
        ),
    }
}

// --- current -------------------------------------------------------------

pub(crate) async fn current(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    current_for(state, None, params, headers).await
}

pub(crate) async fn device_current(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    current_for(state, Some(device), params, headers).await
}

async fn current_for(
    state: AppState,
    device: Option<String>,
    params: HashMap<String, String>,
    headers: HeaderMap,
) -> Response {
    let agent = &state.agent;
    let printer = negotiate(agent, &headers);

    let filter = match parse_filter(agent, device.as_deref(), &params) {
        Ok(filter) => filter,
        Err(message) => {
            return error_document(
                agent,
                &printer,
                StatusCode::NOT_FOUND,
                "INVALID_REQUEST",
                &message,
            )
        }
    };

    let at = match params.get("at").map(|v| v.parse::<u64>()) {
        None => None,
        Some(Ok(at)) => {
            let (first, next) = agent.sequence_bounds();
            if at < first.saturating_sub(1) || at >= next {
                return error_document(
                    agent,
                    &printer,
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "OUT_OF_RANGE",
                    &format!("'at' must be between {first} and {}", next - 1),
                );
            }
            Some(at)
        }
        Some(Err(_)) => {
            return error_document(
                agent,
                &printer,
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "'at' must be an unsigned integer",
            )
        }
    };

    let observations: Vec<_> = agent
        .current(at)
        .into_iter()
        .filter(|obs| match &filter {
            Some(ids) => ids.contains(obs.data_item_id()),
            None => true,
        })
        .collect();
    let body = printer.print_current(&observations, &agent.document_header());
    document(&printer, StatusCode::OK, body)
}

// --- sample --------------------------------------------------------------

pub(crate) async fn sample(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    sample_for(state, None, params, headers).await
}

pub(crate) async fn device_sample(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    sample_for(state, Some(device), params, headers).await
}

async fn sample_for(
    state: AppState,
    device: Option<String>,
    params: HashMap<String, String>,
    headers: HeaderMap,
) -> Response {
    let agent = &state.agent;
    let printer = negotiate(agent, &headers);

    let filter = match parse_filter(agent, device.as_deref(), &params) {
        Ok(filter) => filter,
        Err(message) => {
            return error_document(
                agent,
                &printer,
                StatusCode::NOT_FOUND,
                "INVALID_REQUEST",
                &message,
            )
        }
    };

    let count = match params.get("count").map(|v| v.parse::<usize>()) {
        None => 100,
        Some(Ok(count)) if count > 0 => count,
        _ => {
            return error_document(
                agent,
                &printer,
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "'count' must be a positive integer",
            )
        }
    };

    let (first, next) = agent.sequence_bounds();
    let from = match params.get("from").map(|v| v.parse::<u64>()) {
        None => first,
        Some(Ok(from)) => {
            if from != 0 && (from < first || from > next) {
                return error_document(
                    agent,
                    &printer,
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "OUT_OF_RANGE",
                    &format!("'from' must be between {first} and {next}"),
                );
            }
            from.max(first)
        }
        Some(Err(_)) => {
            return error_document(
                agent,
                &printer,
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "'from' must be an unsigned integer",
            )
        }
    };

    if let Some(interval_ms) = params.get("interval").and_then(|v| v.parse::<u64>().ok()) {
        let heartbeat_ms = params
            .get("heartbeat")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000);
        return stream::stream_sample(
            Arc::clone(agent),
            printer,
            filter,
            from,
            count,
            interval_ms,
            heartbeat_ms,
        );
    }

    let (_, observations, _next) = agent.sample(from, count);
    let observations: Vec<_> = observations
        .into_iter()
        .filter(|obs| match &filter {
            Some(ids) => ids.contains(obs.data_item_id()),
            None => true,
        })
        .collect();
    let body = printer.print_sample(&observations, &agent.document_header());
    document(&printer, StatusCode::OK, body)
}

// --- assets --------------------------------------------------------------

pub(crate) async fn assets(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let agent = &state.agent;
    let printer = negotiate(agent, &headers);
    let include_removed = params
        .get("removed")
        .map(|v| v == "true")
        .unwrap_or(false);
    let list = agent.assets(
        params.get("device").map(String::as_str),
        params.get("type").map(String::as_str),
        include_removed,
    );
    let body = printer.print_assets(&list, &agent.document_header());
    document(&printer, StatusCode::OK, body)
}

pub(crate) async fn asset_by_id(
    State(state): State<AppState>,
    Path(ids): Path<String>,
    headers: HeaderMap,
) -> Response {
    let agent = &state.agent;
    let printer = negotiate(agent, &headers);

    let mut found = Vec::new();
    for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        match agent.asset(id) {
            Some(asset) => found.push(asset),
            None => {
                return error_document(
                    agent,
                    &printer,
                    StatusCode::NOT_FOUND,
                    "ASSET_NOT_FOUND",
                    &format!("could not find asset {id}"),
                )
            }
        }
    }
    let body = printer.print_assets(&found, &agent.document_header());
    document(&printer, StatusCode::OK, body)
}

pub(crate) async fn delete_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let agent = &state.agent;
    let printer = negotiate(agent, &headers);

    if !agent.remove_asset(None, &id) {
        return error_document(
            agent,
            &printer,
            StatusCode::NOT_FOUND,
            "ASSET_NOT_FOUND",
            &format!("could not find asset {id}"),
        );
    }
    let removed = agent.asset(&id).map(|a| vec![a]).unwrap_or_default();
    let body = printer.print_assets(&removed, &agent.document_header());
    document(&printer, StatusCode::OK, body)
}

pub(crate) async fn delete_assets(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let agent = &state.agent;
    let printer = negotiate(agent, &headers);
    let removed = agent.remove_all_assets(
        params.get("device").map(String::as_str),
        params.get("type").map(String::as_str),
    );
    let body = printer.print_assets(&removed, &agent.document_header());
    document(&printer, StatusCode::OK, body)
}
