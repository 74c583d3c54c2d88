//! SHDR adapter source
//!
//! A reconnecting TCP client reading pipe-delimited records from one
//! adapter. Connection lifecycle flows through the pipeline as connection
//! status entities so the coordinator drives connection_status and
//! availability; records flow through the SHDR transform chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mtc_config::AdapterConfig;
use mtc_pipeline::{shdr_pipeline, ConnectionStatus, Entity, PipelineContext, PipelineError};

use crate::agent::Agent;
use crate::source::Source;
use crate::Result;

pub struct ShdrAdapterSource {
    identity: String,
    config: AdapterConfig,
    auto_available: bool,
    agent: Arc<Agent>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ShdrAdapterSource {
    pub fn new(agent: Arc<Agent>, config: AdapterConfig, agent_auto_available: bool) -> Self {
        let auto_available = config.auto_available.unwrap_or(agent_auto_available);
        let (stop_tx, _) = watch::channel(false);
        Self {
            identity: config.identity(),
            config,
            auto_available,
            agent,
            stop_tx,
            task: Mutex::new(None),
        }
    }

    fn device_names(&self) -> Vec<String> {
        if !self.config.device.is_empty() {
            return vec![self.config.device.clone()];
        }
        self.agent
            .default_device()
            .map(|d| vec![d.name()])
            .unwrap_or_default()
    }
}

#[async_trait]
impl Source for ShdrAdapterSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn start(&self) -> Result<()> {
        let agent = Arc::clone(&self.agent);
        let identity = self.identity.clone();
        let config = self.config.clone();
        let auto_available = self.auto_available;
        let devices = self.device_names();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            let default_device = devices.first().cloned();
            let context = PipelineContext::new(
                agent.clone() as Arc<dyn mtc_pipeline::PipelineContract>,
                identity.clone(),
                default_device,
            );
            let mut pipeline = shdr_pipeline(context);
            let reconnect = Duration::from_secs(config.reconnect_interval_s.max(1));
            let read_timeout = config
                .legacy_timeout_s
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(600));

            let deliver_status = |pipeline: &mut mtc_pipeline::Pipeline, status| {
                let _ = pipeline.run(Entity::ConnectionStatus(status));
            };

            'outer: loop {
                if *stop_rx.borrow() {
                    break;
                }
                deliver_status(
                    &mut pipeline,
                    ConnectionStatus::Connecting {
                        source: identity.clone(),
                    },
                );

                let stream = tokio::select! {
                    connected = TcpStream::connect((config.host.as_str(), config.port)) => connected,
                    _ = stop_rx.changed() => break 'outer,
                };
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(adapter = %identity, error = %e, "connect failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(reconnect) => continue,
                            _ = stop_rx.changed() => break 'outer,
                        }
                    }
                };

                info!(adapter = %identity, "adapter connected");
                deliver_status(
                    &mut pipeline,
                    ConnectionStatus::Connected {
                        source: identity.clone(),
                        devices: devices.clone(),
                        auto_available,
                    },
                );

                let mut lines = BufReader::new(stream).lines();
                loop {
                    let next = tokio::select! {
                        line = tokio::time::timeout(read_timeout, lines.next_line()) => line,
                        _ = stop_rx.changed() => {
                            deliver_status(&mut pipeline, ConnectionStatus::Disconnected {
                                source: identity.clone(),
                                devices: devices.clone(),
                                auto_available,
                            });
                            break 'outer;
                        }
                    };

                    match next {
                        Ok(Ok(Some(line))) => {
                            if let Err(e) = pipeline.run(Entity::Raw(line)) {
                                match e {
                                    PipelineError::Malformed(reason) => {
                                        warn!(adapter = %identity, %reason, "dropped record");
                                    }
                                    other => {
                                        warn!(adapter = %identity, error = %other, "pipeline error");
                                    }
                                }
                            }
                        }
                        Ok(Ok(None)) => {
                            info!(adapter = %identity, "adapter closed the stream");
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!(adapter = %identity, error = %e, "read error");
                            break;
                        }
                        Err(_) => {
                            warn!(adapter = %identity, "no input within legacy timeout");
                            break;
                        }
                    }
                }

                deliver_status(
                    &mut pipeline,
                    ConnectionStatus::Disconnected {
                        source: identity.clone(),
                        devices: devices.clone(),
                        auto_available,
                    },
                );
                tokio::select! {
                    _ = tokio::time::sleep(reconnect) => {}
                    _ = stop_rx.changed() => break 'outer,
                }
            }
            debug!(adapter = %identity, "adapter task finished");
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
