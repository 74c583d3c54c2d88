//! REST sink
//!
//! Serves the probe/current/sample/asset surface over HTTP with content
//! negotiation (XML default, JSON on Accept) and chunked long-poll
//! streaming for `sample?interval=`. The sink reads the agent's buffers
//! directly; admitted observations reach blocked streamers through the
//! data-item observer channels, so `publish_observation` has nothing extra
//! to do.

pub mod filter;
mod handlers;
mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use mtc_agent::{Agent, AgentError, Result, Sink};
use mtc_model::{Asset, Device, Observation};

#[derive(Clone)]
pub(crate) struct AppState {
    pub agent: Arc<Agent>,
}

pub struct RestSink {
    agent: Arc<Agent>,
    host: String,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RestSink {
    pub fn new(agent: Arc<Agent>, host: impl Into<String>, port: u16) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            agent,
            host: host.into(),
            port,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    fn router(&self) -> Router {
        let state = AppState {
            agent: Arc::clone(&self.agent),
        };
        Router::new()
            .route("/", get(handlers::probe))
            .route("/probe", get(handlers::probe))
            .route("/:device/probe", get(handlers::device_probe))
            .route("/current", get(handlers::current))
            .route("/:device/current", get(handlers::device_current))
            .route("/sample", get(handlers::sample))
            .route("/:device/sample", get(handlers::device_sample))
            .route("/asset", get(handlers::assets).delete(handlers::delete_assets))
            .route("/assets", get(handlers::assets).delete(handlers::delete_assets))
            .route(
                "/asset/:ids",
                get(handlers::asset_by_id).delete(handlers::delete_asset),
            )
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }
}

#[async_trait]
impl Sink for RestSink {
    fn name(&self) -> &str {
        "RestSink"
    }

    async fn start(&self) -> Result<()> {
        let address = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            AgentError::SinkStartup("RestSink".to_string(), format!("bind {address}: {e}"))
        })?;
        info!(%address, "rest sink listening");

        let router = self.router();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "rest sink server failed");
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // streamers are woken through the data-item observers at admission
    fn publish_observation(&self, _observation: &Arc<Observation>) {}

    fn publish_asset(&self, _asset: &Arc<Asset>) {}

    fn publish_device(&self, _device: &Arc<Device>) {}
}
