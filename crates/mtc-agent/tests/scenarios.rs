//! End-to-end scenarios: SHDR records through the real pipeline into the
//! kernel, asserted on latest values.

mod common;

use chrono::{TimeZone, Utc};
use mtc_model::{DataSetValue, Value};

use common::{build_agent, feed, shdr_feed};

#[test]
fn descriptor_load_and_initial_values() {
    let agent = build_agent();

    let device = agent.find_device("LinuxCNC").expect("device by name");
    assert_eq!(device.uuid(), "000");

    // required device-level items were created with deterministic ids
    let avail = device.availability().expect("availability created");
    assert_eq!(avail.id(), "d1_avail");
    let latest = agent.latest("d1_avail").expect("initialized");
    assert!(latest.is_unavailable());

    // schema >= 2.0 also gets the asset items
    assert_eq!(device.asset_changed().unwrap().id(), "d1_asset_chg");
    assert_eq!(device.asset_removed().unwrap().id(), "d1_asset_rem");
    assert_eq!(device.asset_count().unwrap().id(), "d1_asset_count");
    // ASSET_CHANGED is discrete at >= 1.5
    assert!(device.asset_changed().unwrap().is_discrete());

    // constrained item starts at its constant
    let mode = agent.latest("xm").expect("initialized");
    assert_eq!(mode.value(), &Value::Text("HOME".into()));

    // condition starts unavailable
    let condition = agent.latest("xtemp").expect("initialized");
    assert!(condition.is_unavailable());
}

#[test]
fn simple_event_with_timestamp() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(&mut pipeline, "2021-02-01T12:00:00Z|line|204");

    let latest = agent.latest("cn2").expect("line observed");
    assert_eq!(latest.value(), &Value::Text("204".into()));
    assert_eq!(
        latest.timestamp(),
        Utc.with_ymd_and_hms(2021, 2, 1, 12, 0, 0).unwrap()
    );
}

#[test]
fn asset_ingestion_canonicalizes_and_counts() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(
        &mut pipeline,
        "2021-02-01T12:00:00Z|@ASSET@|@1|Part|<Part assetId='1'>TEST 1</Part>",
    );

    // "@1" on device 000 canonicalizes to "0001"
    let asset = agent.asset("0001").expect("asset stored");
    assert_eq!(asset.asset_type(), "Part");
    assert_eq!(asset.device_uuid().as_deref(), Some("000"));

    let changed = agent.latest("d1_asset_chg").expect("asset changed");
    assert_eq!(changed.value(), &Value::Text("0001".into()));
    assert_eq!(changed.asset_type(), Some("Part"));

    let counts = agent.latest("d1_asset_count").expect("count emitted");
    match counts.value() {
        Value::DataSet(set) => {
            assert_eq!(set["Part"].value, Some(DataSetValue::Int(1)));
        }
        other => panic!("expected data set, got {other:?}"),
    }
}

#[test]
fn asset_canonicalization_is_idempotent() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(
        &mut pipeline,
        "2021-02-01T12:00:00Z|@ASSET@|@1|Part|<Part assetId='1'>TEST 1</Part>",
    );
    feed(
        &mut pipeline,
        "2021-02-01T12:01:00Z|@ASSET@|0001|Part|<Part assetId='0001'>TEST 1B</Part>",
    );

    // the already-canonical id maps to the same entry
    let listed = agent.assets(Some("LinuxCNC"), Some("Part"), false);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].asset_id(), "0001");
    assert!(listed[0].payload().contains("TEST 1B"));
}

#[test]
fn data_set_merges_by_default_and_resets_on_trigger() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(&mut pipeline, "2021-02-01T12:00:00Z|vars|a=1 b=2 c=3");
    feed(&mut pipeline, "2021-02-01T12:00:01Z|vars|a=4");

    let latest = agent.latest("v1").expect("vars observed");
    match latest.value() {
        Value::DataSet(set) => {
            assert_eq!(set.len(), 3);
            assert_eq!(set["a"].value, Some(DataSetValue::Int(4)));
            assert_eq!(set["b"].value, Some(DataSetValue::Int(2)));
            assert_eq!(set["c"].value, Some(DataSetValue::Int(3)));
        }
        other => panic!("expected data set, got {other:?}"),
    }

    // a reset modifier replaces the whole set
    feed(&mut pipeline, "2021-02-01T12:00:02Z|vars|:MANUAL a=9");
    let latest = agent.latest("v1").expect("vars observed");
    match latest.value() {
        Value::DataSet(set) => {
            assert_eq!(set.len(), 1);
            assert_eq!(set["a"].value, Some(DataSetValue::Int(9)));
        }
        other => panic!("expected data set, got {other:?}"),
    }
}

#[test]
fn table_rows_with_cells() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(
        &mut pipeline,
        "2021-02-01T12:00:00Z|wpo|G53.1={X=1.0 Y=2.0 Z=3.0} G53.2={X=4.0 Y=5.0 Z=6.0} G53.3={X=7.0 Y=8.0 Z=9 U=10.0}",
    );

    let latest = agent.latest("w1").expect("wpo observed");
    match latest.value() {
        Value::Table(rows) => {
            assert_eq!(rows.len(), 3);
            let row = |key: &str| match rows[key].value.as_ref().unwrap() {
                DataSetValue::Row(cells) => cells.clone(),
                other => panic!("expected row, got {other:?}"),
            };
            assert_eq!(row("G53.1")["X"], DataSetValue::Float(1.0));
            assert_eq!(row("G53.2")["Z"], DataSetValue::Float(6.0));
            let g533 = row("G53.3");
            assert_eq!(g533.len(), 4);
            assert_eq!(g533["Z"], DataSetValue::Int(9));
            assert_eq!(g533["U"], DataSetValue::Float(10.0));
        }
        other => panic!("expected table, got {other:?}"),
    }
}

#[test]
fn time_series_values() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(&mut pipeline, "2021-02-01T12:00:00Z|Xts|4|100|1.1 2.2 3.3 4.4");

    let latest = agent.latest("xts").expect("time series observed");
    match latest.value() {
        Value::TimeSeries { rate, values } => {
            assert_eq!(*rate, Some(100.0));
            assert_eq!(values, &vec![1.1, 2.2, 3.3, 4.4]);
        }
        other => panic!("expected time series, got {other:?}"),
    }
}

#[test]
fn condition_levels_flow_through() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(
        &mut pipeline,
        "2021-02-01T12:00:00Z|Xtemp|fault|OT100|1|HIGH|Overtemp",
    );
    let latest = agent.latest("xtemp").expect("condition observed");
    let condition = latest.condition().expect("condition state");
    assert_eq!(condition.level, mtc_model::ConditionLevel::Fault);
    assert_eq!(condition.native_code.as_deref(), Some("OT100"));

    feed(&mut pipeline, "2021-02-01T12:00:01Z|Xtemp|normal||||");
    let latest = agent.latest("xtemp").expect("condition observed");
    assert_eq!(
        latest.condition().unwrap().level,
        mtc_model::ConditionLevel::Normal
    );
}

#[test]
fn sequences_are_strictly_increasing_and_contiguous() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    let (_, before) = agent.sequence_bounds();
    for i in 0..20 {
        feed(
            &mut pipeline,
            &format!("2021-02-01T12:00:{:02}Z|line|{i}", i % 60),
        );
    }
    let (first, observations, next) = agent.sample(before, 100);
    assert!(first <= before);
    assert_eq!(observations.len(), 20);
    for window in observations.windows(2) {
        assert_eq!(window[1].sequence(), window[0].sequence() + 1);
    }
    assert_eq!(next, observations.last().unwrap().sequence() + 1);
}

#[test]
fn remove_asset_keeps_changed_consistent() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(
        &mut pipeline,
        "2021-02-01T12:00:00Z|@ASSET@|@1|Part|<Part assetId='1'>TEST 1</Part>",
    );
    feed(&mut pipeline, "2021-02-01T12:01:00Z|@REMOVE_ASSET@|0001");

    // ASSET_REMOVED carries the id
    let removed = agent.latest("d1_asset_rem").expect("asset removed");
    assert_eq!(removed.value(), &Value::Text("0001".into()));

    // the prior ASSET_CHANGED pointed at the same id: knocked to UNAVAILABLE
    let changed = agent.latest("d1_asset_chg").expect("asset changed");
    assert!(changed.is_unavailable());

    // the entry is tombstoned, not gone
    let asset = agent.asset("0001").expect("still resolvable");
    assert!(asset.is_removed());

    // count dropped to zero: removed entry in the data set
    let counts = agent.latest("d1_asset_count").expect("count emitted");
    match counts.value() {
        Value::DataSet(set) => assert!(set["Part"].removed),
        other => panic!("expected data set, got {other:?}"),
    }
}

#[test]
fn remove_all_assets_by_type() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    feed(
        &mut pipeline,
        "2021-02-01T12:00:00Z|@ASSET@|@1|Part|<Part assetId='1'>A</Part>",
    );
    feed(
        &mut pipeline,
        "2021-02-01T12:00:01Z|@ASSET@|@2|Part|<Part assetId='2'>B</Part>",
    );
    feed(&mut pipeline, "2021-02-01T12:01:00Z|@REMOVE_ALL_ASSETS@|Part");

    assert!(agent.assets(Some("LinuxCNC"), Some("Part"), false).is_empty());
    assert_eq!(
        agent
            .assets(Some("LinuxCNC"), Some("Part"), true)
            .len(),
        2
    );
}

#[test]
fn duplicate_values_still_admit_without_filter() {
    let agent = build_agent();
    let mut pipeline = shdr_feed(&agent, "LinuxCNC");

    let (_, before) = agent.sequence_bounds();
    feed(&mut pipeline, "2021-02-01T12:00:00Z|line|204");
    feed(&mut pipeline, "2021-02-01T12:00:01Z|line|204");
    let (_, next) = agent.sequence_bounds();
    // no duplicate-suppression policy on `line`, both admitted
    assert_eq!(next - before, 2);
}
