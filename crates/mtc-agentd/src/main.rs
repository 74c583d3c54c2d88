//! The agent daemon
//!
//! config -> logging -> agent -> sinks -> sources, then wait for ctrl-c or
//! an internal shutdown (last external source failed).
//!
//! Exit codes: 0 normal stop, 1 unrecoverable intake error or sink startup
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mtc_agent::{Agent, ShdrAdapterSource, UpstreamAgentSource};
use mtc_sink_http::RestSink;
use mtc_sink_mqtt::MqttSink;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    // a single optional positional argument: the config file path
    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);
    let config = match mtc_config::load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "cannot load configuration");
            return ExitCode::from(1);
        }
    };

    if config.real_time {
        warn!("realtime scheduling requested but not supported on this platform, ignoring");
    }

    let agent = Agent::new(&config);
    if let Err(e) = agent.initialize() {
        error!(error = %e, "device intake failed");
        return ExitCode::from(1);
    }

    agent.add_sink(Arc::new(RestSink::new(
        Arc::clone(&agent),
        config.host.clone(),
        config.port,
    )));
    if let Some(mqtt) = config.mqtt.clone() {
        agent.add_sink(Arc::new(MqttSink::new(Arc::clone(&agent), mqtt)));
    }

    for adapter in &config.adapters {
        let source = ShdrAdapterSource::new(
            Arc::clone(&agent),
            adapter.clone(),
            config.auto_available,
        );
        if let Err(e) = agent.add_source(Arc::new(source)) {
            error!(error = %e, adapter = %adapter.identity(), "cannot register adapter");
            return ExitCode::from(1);
        }
    }
    for upstream in &config.upstreams {
        let source = UpstreamAgentSource::new(Arc::clone(&agent), upstream.clone());
        if let Err(e) = agent.add_source(Arc::new(source)) {
            error!(error = %e, upstream = %upstream.url, "cannot register upstream");
            return ExitCode::from(1);
        }
    }

    if let Err(e) = agent.start().await {
        error!(error = %e, "cannot start agent");
        return ExitCode::from(1);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping");
            agent.stop().await;
            ExitCode::SUCCESS
        }
        _ = agent.wait_for_shutdown() => {
            // internal shutdown: the last external source failed
            ExitCode::from(1)
        }
    }
}
