//! Connection coordinator: adapter lifecycle driving connection_status and
//! availability.

mod common;

use std::sync::Arc;

use common::{build_agent, feed, shdr_feed, StubSource};
use mtc_agent::agent_device;
use mtc_model::Value;

const ADAPTER: &str = "test-adapter:7878";

fn status_id() -> String {
    format!("{}_connection_status", agent_device::sanitize(ADAPTER))
}

#[test]
fn lifecycle_drives_connection_status_and_availability() {
    let agent = build_agent();
    agent.add_source(Arc::new(StubSource::new(ADAPTER))).unwrap();

    // the adapter component materialized on the agent device
    let agent_dev = agent.agent_device().expect("agent device enabled");
    assert!(agent_device::connection_status(&agent_dev, ADAPTER).is_some());
    let latest = agent.latest(&status_id()).expect("status initialized");
    assert!(latest.is_unavailable());

    let devices = vec!["LinuxCNC".to_string()];

    agent.connecting(ADAPTER);
    assert_eq!(
        agent.latest(&status_id()).unwrap().value(),
        &Value::Text("LISTENING".into())
    );

    agent.connected(ADAPTER, &devices, true);
    assert_eq!(
        agent.latest(&status_id()).unwrap().value(),
        &Value::Text("ESTABLISHED".into())
    );
    // autoAvailable flips the device availability
    assert_eq!(
        agent.latest("d1_avail").unwrap().value(),
        &Value::Text("AVAILABLE".into())
    );

    agent.disconnected(ADAPTER, &devices, true);
    assert_eq!(
        agent.latest(&status_id()).unwrap().value(),
        &Value::Text("CLOSED".into())
    );
    assert!(agent.latest("d1_avail").unwrap().is_unavailable());
}

#[test]
fn disconnect_resets_adapter_fed_items_only() {
    let agent = build_agent();
    agent.add_source(Arc::new(StubSource::new(ADAPTER))).unwrap();

    let mut pipeline = shdr_feed(&agent, "LinuxCNC");
    agent.connected(ADAPTER, &["LinuxCNC".to_string()], true);

    // the mapper claims cn2 and xm for this adapter
    feed(&mut pipeline, "2021-02-01T12:00:00Z|line|204|Xmode|AWAY");
    assert_eq!(
        agent.latest("cn2").unwrap().value(),
        &Value::Text("204".into())
    );

    agent.disconnected(ADAPTER, &["LinuxCNC".to_string()], true);

    // adapter-fed item resets to UNAVAILABLE
    assert!(agent.latest("cn2").unwrap().is_unavailable());
    // constrained item reverts to its constant instead
    assert_eq!(
        agent.latest("xm").unwrap().value(),
        &Value::Text("HOME".into())
    );
    // an item never fed by this adapter keeps its initial state and gains
    // no new observation
    let program_before = agent.latest("cn3").unwrap().sequence();
    agent.disconnected(ADAPTER, &["LinuxCNC".to_string()], true);
    assert_eq!(agent.latest("cn3").unwrap().sequence(), program_before);
}

#[test]
fn already_unavailable_items_are_skipped() {
    let agent = build_agent();
    agent.add_source(Arc::new(StubSource::new(ADAPTER))).unwrap();

    let mut pipeline = shdr_feed(&agent, "LinuxCNC");
    feed(&mut pipeline, "2021-02-01T12:00:00Z|line|204");

    agent.disconnected(ADAPTER, &["LinuxCNC".to_string()], false);
    let first_reset = agent.latest("cn2").unwrap().sequence();
    assert!(agent.latest("cn2").unwrap().is_unavailable());

    // a second disconnect produces no new observation
    agent.disconnected(ADAPTER, &["LinuxCNC".to_string()], false);
    assert_eq!(agent.latest("cn2").unwrap().sequence(), first_reset);
}

#[tokio::test]
async fn source_failure_without_externals_shuts_down() {
    let agent = build_agent();
    agent.add_source(Arc::new(StubSource::new(ADAPTER))).unwrap();

    agent.source_failed(ADAPTER).await;
    assert!(agent.is_shutting_down());
}

#[tokio::test]
async fn source_failure_with_remaining_external_continues() {
    let agent = build_agent();
    agent.add_source(Arc::new(StubSource::new(ADAPTER))).unwrap();
    agent
        .add_source(Arc::new(StubSource::new("other-adapter:7879")))
        .unwrap();

    agent.source_failed(ADAPTER).await;
    assert!(!agent.is_shutting_down());
}
