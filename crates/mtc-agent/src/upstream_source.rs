//! Upstream agent source
//!
//! Relays another MTConnect agent: probe once, then current, then poll
//! sample from the feedback's next sequence. The XML transform's feedback
//! drives recovery: an instance-id change re-probes from sequence 0, a
//! stream error reopens the stream, transient request failures retry a
//! bounded number of times before the source fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mtc_config::UpstreamConfig;
use mtc_model::Asset;
use mtc_pipeline::{
    upstream_pipeline, Entity, PipelineContext, PipelineError, XmlTransformFeedback,
};

use crate::agent::Agent;
use crate::source::Source;
use crate::Result;

const MAX_RETRIES: u32 = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_COUNT: u32 = 1000;

pub struct UpstreamAgentSource {
    identity: String,
    config: UpstreamConfig,
    agent: Arc<Agent>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamAgentSource {
    pub fn new(agent: Arc<Agent>, config: UpstreamConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            identity: config.url.clone(),
            config,
            agent,
            stop_tx,
        task: Mutex::new(None),
        }
    }
}

enum Phase {
    Probe,
    Current,
    Sample,
}

#[async_trait]
impl Source for UpstreamAgentSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn start(&self) -> Result<()> {
        let agent = Arc::clone(&self.agent);
        let identity = self.identity.clone();
        let config = self.config.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            let feedback = Arc::new(Mutex::new(XmlTransformFeedback::default()));
            let context = PipelineContext::new(
                agent.clone() as Arc<dyn mtc_pipeline::PipelineContract>,
                identity.clone(),
                config.device.clone(),
            );
            let mut pipeline = upstream_pipeline(context, Arc::clone(&feedback));
            let client = reqwest::Client::new();
            let count = config.count.unwrap_or(DEFAULT_COUNT);
            let reconnect = Duration::from_secs(config.reconnect_interval_s.max(1));

            let mut phase = Phase::Probe;
            let mut retries = 0u32;

            loop {
                if *stop_rx.borrow() {
                    break;
                }

                let url = match phase {
                    Phase::Probe => format!("{}/probe", config.url),
                    Phase::Current => format!("{}/current", config.url),
                    Phase::Sample => {
                        let from = feedback.lock().next_sequence;
                        format!("{}/sample?from={from}&count={count}", config.url)
                    }
                };

                let response = tokio::select! {
                    response = fetch(&client, &url) => response,
                    _ = stop_rx.changed() => break,
                };
                let body = match response {
                    Ok(body) => {
                        retries = 0;
                        body
                    }
                    Err(e) => {
                        retries += 1;
                        warn!(upstream = %identity, error = %e, retries, "request failed");
                        if retries > MAX_RETRIES {
                            agent.source_failed(&identity).await;
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(reconnect) => continue,
                            _ = stop_rx.changed() => break,
                        }
                    }
                };

                match phase {
                    Phase::Probe => match mtc_model::parse_devices(&body) {
                        Ok((_, devices)) => {
                            for device in devices {
                                if device.is_agent() {
                                    continue;
                                }
                                if let Some(filter) = &config.device {
                                    if &device.name() != filter && &device.uuid() != filter {
                                        continue;
                                    }
                                }
                                if let Err(e) = agent.receive_device(device, false) {
                                    warn!(upstream = %identity, error = %e, "device intake failed");
                                }
                            }
                            phase = Phase::Current;
                        }
                        Err(e) => {
                            warn!(upstream = %identity, error = %e, "bad probe document");
                            tokio::select! {
                                _ = tokio::time::sleep(reconnect) => {}
                                _ = stop_rx.changed() => break,
                            }
                        }
                    },
                    Phase::Current | Phase::Sample => {
                        match pipeline.run(Entity::Raw(body)) {
                            Ok(()) => {
                                chase_assets(&agent, &client, &config.url, &feedback, &identity)
                                    .await;
                                phase = Phase::Sample;
                                tokio::select! {
                                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                                    _ = stop_rx.changed() => break,
                                }
                            }
                            Err(PipelineError::InstanceIdChanged) => {
                                info!(upstream = %identity, "instance id changed, re-probing");
                                phase = Phase::Probe;
                            }
                            Err(PipelineError::RestartStream) => {
                                info!(upstream = %identity, "stream error, reopening");
                                phase = Phase::Current;
                                tokio::select! {
                                    _ = tokio::time::sleep(reconnect) => {}
                                    _ = stop_rx.changed() => break,
                                }
                            }
                            Err(e) => {
                                warn!(upstream = %identity, error = %e, "document dropped");
                                tokio::select! {
                                    _ = tokio::time::sleep(reconnect) => {}
                                    _ = stop_rx.changed() => break,
                                }
                            }
                        }
                    }
                }
            }
            debug!(upstream = %identity, "upstream task finished");
        });

        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> std::result::Result<String, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("http status {}", response.status()));
    }
    response.text().await.map_err(|e| e.to_string())
}

/// Fetch the assets named by the stream's asset events and run them through
/// intake.
async fn chase_assets(
    agent: &Arc<Agent>,
    client: &reqwest::Client,
    base_url: &str,
    feedback: &Arc<Mutex<XmlTransformFeedback>>,
    identity: &str,
) {
    let events = std::mem::take(&mut feedback.lock().asset_events);
    for event in events {
        if event.removed {
            let device = agent.default_device();
            agent.remove_asset(device, &event.asset_id);
            continue;
        }
        let url = format!("{base_url}/asset/{}", event.asset_id);
        match fetch(client, &url).await {
            Ok(body) => {
                for asset in parse_assets_document(&body) {
                    agent.receive_asset(Arc::new(asset));
                }
            }
            Err(e) => warn!(upstream = %identity, asset = %event.asset_id, error = %e, "asset fetch failed"),
        }
    }
}

/// Extract the asset payloads from an MTConnectAssets document, keeping the
/// raw XML of each asset intact.
fn parse_assets_document(document: &str) -> Vec<Asset> {
    let Some(start) = document.find("<Assets>") else {
        return Vec::new();
    };
    let Some(end) = document.find("</Assets>") else {
        return Vec::new();
    };
    let inner = &document[start + "<Assets>".len()..end];

    split_top_level_elements(inner)
        .into_iter()
        .filter_map(|payload| {
            let (element, attrs) = root_element(&payload)?;
            let timestamp = attrs
                .get("timestamp")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Some(Asset::new(
                attrs.get("assetId").cloned().unwrap_or_default(),
                element,
                attrs.get("deviceUuid").cloned(),
                timestamp,
                payload,
            ))
        })
        .filter(|asset| !asset.asset_id().is_empty())
        .collect()
}

fn root_element(xml: &str) -> Option<(String, HashMap<String, String>)> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) | Ok(XmlEvent::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let attrs = e
                    .attributes()
                    .filter_map(|a| a.ok())
                    .filter_map(|a| {
                        let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                        let value = a.unescape_value().ok()?.into_owned();
                        Some((key, value))
                    })
                    .collect();
                return Some((name, attrs));
            }
            Ok(XmlEvent::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Split concatenated sibling elements ("<A>..</A><B/>") into raw chunks.
fn split_top_level_elements(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    let mut chunks = Vec::new();
    let mut start_position = 0usize;
    let mut depth = 0u32;

    loop {
        let position = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(XmlEvent::Start(_)) => {
                if depth == 0 {
                    start_position = position;
                }
                depth += 1;
            }
            Ok(XmlEvent::Empty(_)) => {
                if depth == 0 {
                    start_position = position;
                    let end = reader.buffer_position() as usize;
                    chunks.push(xml[start_position..end].to_string());
                }
            }
            Ok(XmlEvent::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    chunks.push(xml[start_position..end].to_string());
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    chunks
}
