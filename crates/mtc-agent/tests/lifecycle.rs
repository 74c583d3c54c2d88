//! Agent lifecycle: startup ordering, fan-out guarantees, shutdown
//! signaling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{feed, shdr_feed, test_config, CaptureSink};
use mtc_agent::{agent_device, Agent};
use mtc_model::{ChangeObserver, Value};

#[tokio::test]
async fn start_seeds_initial_values_then_flips_agent_availability() {
    let agent = Agent::new(&test_config());
    agent.initialize().unwrap();
    let sink = Arc::new(CaptureSink::default());
    agent.add_sink(sink.clone());

    agent.start().await.unwrap();

    // every data item produced an initial observation
    let observations = sink.observations.lock();
    assert!(observations.iter().any(|o| o.data_item_id() == "d1_avail"));
    assert!(observations.iter().any(|o| o.data_item_id() == "cn2"));

    // device_added fired for each device through the agent device
    let added: Vec<_> = observations
        .iter()
        .filter(|o| o.data_item_id() == agent_device::DEVICE_ADDED_ID)
        .collect();
    assert!(added.iter().any(|o| o.value() == &Value::Text("000".into())));
    drop(observations);

    // the agent device reports AVAILABLE once initialization finished
    let avail = agent.latest(agent_device::AVAILABILITY_ID).unwrap();
    assert_eq!(avail.value(), &Value::Text("AVAILABLE".into()));

    agent.stop().await;
}

#[tokio::test]
async fn sinks_see_admissions_in_sequence_order() {
    let agent = Agent::new(&test_config());
    agent.initialize().unwrap();
    let sink = Arc::new(CaptureSink::default());
    agent.add_sink(sink.clone());
    agent.initial_observations().unwrap();

    let mut pipeline = shdr_feed(&agent, "LinuxCNC");
    for i in 0..50 {
        feed(&mut pipeline, &format!("line|{i}"));
    }

    let observations = sink.observations.lock();
    let sequences: Vec<u64> = observations.iter().map(|o| o.sequence()).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sequences, sorted, "fan-out must follow admission order");
    // no sink ever saw an unadmitted observation
    assert!(sequences.iter().all(|&s| s != 0));
}

#[tokio::test]
async fn rejected_admissions_are_not_fanned_out() {
    let agent = Agent::new(&test_config());
    agent.initialize().unwrap();
    let sink = Arc::new(CaptureSink::default());
    agent.add_sink(sink.clone());
    agent.initial_observations().unwrap();

    // ASSET_CHANGED is discrete; feed a filtered item instead by hand:
    // an observation for an unknown data item never reaches the buffer,
    // so drive the duplicate path through a synthetic filtered item
    let device = agent.find_device("LinuxCNC").unwrap();
    let mut raw = mtc_model::DataItem::make(
        &[
            ("id".to_string(), "dup1".to_string()),
            ("type".to_string(), "MESSAGE".to_string()),
            ("category".to_string(), "EVENT".to_string()),
        ]
        .into(),
    )
    .unwrap();
    raw.add_filter(mtc_model::Filter::Duplicate);
    let item = device.add_data_item(raw);
    device.attach_items();

    let before = sink.observations.lock().len();
    agent.loopback().receive(&item, "A");
    agent.loopback().receive(&item, "A"); // duplicate, rejected
    agent.loopback().receive(&item, "B");
    let after = sink.observations.lock().len();
    assert_eq!(after - before, 2);
}

#[tokio::test]
async fn stop_releases_observers_with_sentinel() {
    let agent = Agent::new(&test_config());
    agent.initialize().unwrap();
    agent.initial_observations().unwrap();

    let item = agent.data_item("cn2").unwrap();
    let observer = ChangeObserver::new();
    observer.observe(&item);

    let waiter =
        tokio::spawn(async move { observer.wait_for(Duration::from_secs(5)).await });

    // give the waiter a chance to block
    tokio::time::sleep(Duration::from_millis(20)).await;
    agent.stop().await;

    let signaled = waiter.await.unwrap();
    assert_eq!(signaled, Some(0), "shutdown must wake streamers with 0");
}

#[tokio::test]
async fn wait_for_shutdown_resolves_after_stop() {
    let agent = Agent::new(&test_config());
    agent.initialize().unwrap();

    let waiter = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.wait_for_shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    agent.stop().await;
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait_for_shutdown resolves")
        .unwrap();
}
