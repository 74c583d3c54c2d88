//! Adapter command dispatch: device field updates, calibration, uuid
//! re-keying, adapter version routing.

mod common;

use std::sync::Arc;

use common::{build_agent, feed, shdr_feed, StubSource};
use mtc_agent::agent_device;
use mtc_model::Value;

const ADAPTER: &str = "test-adapter:7878";

#[test]
fn manufacturer_and_serial_number() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(&mut pipeline, "*manufacturer: Fanuc");
    feed(&mut pipeline, "*serialNumber: XX-123");

    let device = agent.find_device("LinuxCNC").unwrap();
    let description = device.description();
    assert_eq!(description.manufacturer.as_deref(), Some("Fanuc"));
    assert_eq!(description.serial_number.as_deref(), Some("XX-123"));
}

#[test]
fn calibration_applies_unit_conversion() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(&mut pipeline, "*calibration: Xpos|2.0|1.0");
    feed(&mut pipeline, "2021-02-01T12:00:00Z|Xpos|10");

    // 10 * 2.0 + 1.0
    assert_eq!(agent.latest("xp").unwrap().value(), &Value::Sample(21.0));
}

#[test]
fn uuid_command_rekeys_and_announces() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(&mut pipeline, "*uuid: ZZZ");

    assert!(agent.find_device("ZZZ").is_some());
    // uuid lookups for the old key now miss (name still resolves)
    let by_old = agent.find_device("000");
    assert!(by_old.is_none());

    // the agent device announced remove-then-add
    let removed = agent.latest(agent_device::DEVICE_REMOVED_ID).unwrap();
    assert_eq!(removed.value(), &Value::Text("000".into()));
    let added = agent.latest(agent_device::DEVICE_ADDED_ID).unwrap();
    assert_eq!(added.value(), &Value::Text("ZZZ".into()));
}

#[test]
fn unknown_command_is_ignored() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    let (_, before) = agent.sequence_bounds();
    feed(&mut pipeline, "*frobnicate: on");
    let (_, after) = agent.sequence_bounds();
    assert_eq!(before, after);
    // the device is untouched
    assert!(agent.find_device("000").is_some());
}

#[test]
fn adapter_version_routes_to_agent_device() {
    let agent = build_agent();
    agent.add_source(Arc::new(StubSource::new(ADAPTER))).unwrap();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(&mut pipeline, "*adapterVersion: 2.1");
    feed(&mut pipeline, "*mtconnectVersion: 1.7");

    let prefix = agent_device::sanitize(ADAPTER);
    let version = agent
        .latest(&format!("{prefix}_adapter_software_version"))
        .unwrap();
    assert_eq!(version.value(), &Value::Text("2.1".into()));
    let mtconnect = agent
        .latest(&format!("{prefix}_mtconnect_version"))
        .unwrap();
    assert_eq!(mtconnect.value(), &Value::Text("1.7".into()));
}

#[test]
fn preserve_uuid_blocks_rekey() {
    let agent = build_agent();

    // a device declared with preserveUuid
    let preserved = r#"<MTConnectDevices xmlns="urn:mtconnect.org:MTConnectDevices:2.0">
      <Devices>
        <Device id="p1" name="Pinned" uuid="PPP" preserveUuid="true"/>
      </Devices>
    </MTConnectDevices>"#;
    let (_, devices) = mtc_model::parse_devices(preserved).unwrap();
    agent.receive_device(devices[0].clone(), false).unwrap();

    agent.receive_command("Pinned", "uuid", "QQQ", "test-adapter:7878");
    assert!(agent.find_device("PPP").is_some());
    assert!(agent.find_device("QQQ").is_none());
}
