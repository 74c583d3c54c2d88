//! MQTT sink
//!
//! Publishes the three feeds to the standard topic tree:
//! - `MTConnect/Device/<uuid>` on device-model change
//! - `MTConnect/Observation/<uuid>/<componentPath>/<Type>[<name>]` per
//!   admitted observation (a data item `topic` attribute overrides)
//! - `MTConnect/Asset/<assetId>` per asset change
//!
//! Payloads come from the JSON printer. Publishes ride rumqttc's request
//! queue: `publish_*` never blocks the kernel, and a full queue drops the
//! message with a log line rather than stalling admission.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, MqttOptions, QoS, Transport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mtc_agent::{Agent, Result, Sink};
use mtc_config::MqttConfig;
use mtc_model::{Asset, Device, Observation};
use mtc_printer::Printer;

pub struct MqttSink {
    agent: Arc<Agent>,
    config: MqttConfig,
    client: Mutex<Option<AsyncClient>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    pub fn new(agent: Arc<Agent>, config: MqttConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            agent,
            config,
            client: Mutex::new(None),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    fn printer(&self) -> Arc<dyn Printer> {
        self.agent
            .printer("json")
            .expect("printers are registered at construction")
    }

    fn publish(&self, topic: String, payload: String) {
        let client = self.client.lock();
        let Some(client) = client.as_ref() else {
            debug!(%topic, "mqtt client not started, dropping publish");
            return;
        };
        if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, true, payload) {
            warn!(%topic, error = %e, "mqtt publish dropped");
        }
    }

    fn observation_topic(observation: &Arc<Observation>) -> Option<String> {
        let item = observation.data_item()?;
        if let Some(topic) = item.topic() {
            return Some(topic.to_string());
        }
        let device = item.device()?;
        let leaf = format!("{}[{}]", item.observation_name(), item.source_name());
        let path = item.path();
        if path.is_empty() {
            Some(format!("MTConnect/Observation/{}/{leaf}", device.uuid()))
        } else {
            Some(format!(
                "MTConnect/Observation/{}/{path}/{leaf}",
                device.uuid()
            ))
        }
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &str {
        "MqttSink"
    }

    async fn start(&self) -> Result<()> {
        let client_id = format!("mtc-agent-{}", self.agent.instance_id());
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if self.config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        if let (Some(username), Some(password)) =
            (self.config.username.clone(), self.config.password.clone())
        {
            options.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 256);
        *self.client.lock() = Some(client);

        let host = self.config.host.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_loop.poll() => match event {
                        Ok(event) => debug!(?event, "mqtt event"),
                        Err(e) => {
                            warn!(error = %e, host = %host, "mqtt connection error, retrying");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    },
                    _ = stop_rx.changed() => break,
                }
            }
        });
        *self.task.lock() = Some(handle);

        // seed the retained device topics
        for device in self.agent.devices() {
            self.publish_device(&device);
        }
        info!(host = %self.config.host, port = self.config.port, "mqtt sink started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(client) = self.client.lock().take() {
            let _ = client.try_disconnect();
        }
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn publish_observation(&self, observation: &Arc<Observation>) {
        let Some(topic) = Self::observation_topic(observation) else {
            return;
        };
        let payload = self.printer().print_observation(observation);
        self.publish(topic, payload);
    }

    fn publish_asset(&self, asset: &Arc<Asset>) {
        let topic = format!("MTConnect/Asset/{}", asset.asset_id());
        let payload = self.printer().print_asset(asset);
        self.publish(topic, payload);
    }

    fn publish_device(&self, device: &Arc<Device>) {
        let topic = format!("MTConnect/Device/{}", device.uuid());
        let payload = self
            .printer()
            .print_device(device, &self.agent.document_header());
        self.publish(topic, payload);
    }
}
