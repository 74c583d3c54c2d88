//! Long-poll sample streaming
//!
//! A `sample?interval=` request turns into a multipart/x-mixed-replace
//! response. Each frame is a sample document; when nothing arrives within
//! the heartbeat interval an empty document keeps the connection alive.
//! Observer signal 0 (agent shutdown) terminates the stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::stream;

use mtc_agent::Agent;
use mtc_model::ChangeObserver;
use mtc_printer::Printer;

const BOUNDARY: &str = "mtconnect-frame";

struct StreamState {
    agent: Arc<Agent>,
    printer: Arc<dyn Printer>,
    filter: Option<HashSet<String>>,
    observer: ChangeObserver,
    from: u64,
    count: usize,
    interval: Duration,
    heartbeat: Duration,
    closed: bool,
}

pub(crate) fn stream_sample(
    agent: Arc<Agent>,
    printer: Arc<dyn Printer>,
    filter: Option<HashSet<String>>,
    from: u64,
    count: usize,
    interval_ms: u64,
    heartbeat_ms: u64,
) -> Response {
    // register interest before the first read so nothing admitted in
    // between is missed
    let observer = ChangeObserver::new();
    match &filter {
        Some(ids) => {
            for id in ids {
                if let Some(item) = agent.data_item(id) {
                    observer.observe(&item);
                }
            }
        }
        None => {
            for device in agent.devices() {
                for item in device.data_items() {
                    observer.observe(&item);
                }
            }
        }
    }

    let state = StreamState {
        agent,
        printer,
        filter,
        observer,
        from,
        count,
        interval: Duration::from_millis(interval_ms),
        heartbeat: Duration::from_millis(heartbeat_ms.max(interval_ms)),
        closed: false,
    };

    let body_stream = stream::unfold(state, |mut state| async move {
        if state.closed {
            return None;
        }
        let frame = next_frame(&mut state).await?;
        Some((Ok::<_, std::convert::Infallible>(frame), state))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace;boundary={BOUNDARY}"),
        )
        .body(Body::from_stream(body_stream))
        .expect("static response parts")
}

async fn next_frame(state: &mut StreamState) -> Option<String> {
    tokio::time::sleep(state.interval).await;

    // anything already buffered past our position counts as a signal
    let (_, next) = state.agent.sequence_bounds();
    let have_backlog = next > state.from;

    if !have_backlog {
        match state.observer.wait_for(state.heartbeat).await {
            Some(0) => {
                // shutdown sentinel: emit a final empty frame and finish
                state.closed = true;
                return Some(frame(&state.printer, &empty_document(state)));
            }
            Some(_) => {}
            None => {
                // heartbeat frame
                return Some(frame(&state.printer, &empty_document(state)));
            }
        }
    }

    let (_, observations, next_from) = state.agent.sample(state.from, state.count);
    let observations: Vec<_> = observations
        .into_iter()
        .filter(|obs| match &state.filter {
            Some(ids) => ids.contains(obs.data_item_id()),
            None => true,
        })
        .collect();
    state.from = next_from;

    if observations.is_empty() {
        return Some(frame(&state.printer, &empty_document(state)));
    }
    let document = state
        .printer
        .print_sample(&observations, &state.agent.document_header());
    Some(frame(&state.printer, &document))
}

fn empty_document(state: &StreamState) -> String {
    state
        .printer
        .print_sample(&[], &state.agent.document_header())
}

fn frame(printer: &Arc<dyn Printer>, document: &str) -> String {
    format!(
        "--{BOUNDARY}\r\nContent-type: {}\r\nContent-length: {}\r\n\r\n{document}\r\n",
        printer.mime_type(),
        document.len(),
    )
}
