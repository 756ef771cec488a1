// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end monitor scenarios: real TCP instrument, real SQLite store.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use spmbridge::monitor::{run_monitor, MonitorConfig};
use spmbridge::store::TrajectoryStore;
use spmbridge::value::WireValue;
use spmbridge_specs::{tcp_instrument, Handle, WireController};

fn monitor_config(dir: &std::path::Path, run_name: &str) -> MonitorConfig {
    MonitorConfig {
        run_name: run_name.to_owned(),
        interval_s: 0.02,
        rotate_entries: 10,
        action_window_s: 2.5,
        signal_labels: vec!["Current".to_owned()],
        spec_labels: vec!["Bias".to_owned()],
        db_directory: dir.display().to_string(),
        db_name: "trajectory.sqlite3".to_owned(),
    }
}

/// Scenario: one tick writes exactly one signal row and one spec row and
/// no action events.
#[test]
fn one_iteration_persists_one_sample_pair() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(0.5)]);
    controller.reply("Current_Get", vec![WireValue::Float(1.23)]);

    let instrument = tcp_instrument(controller.port(), false, true);
    let dir = tempfile::tempdir().expect("tempdir");
    let config = monitor_config(dir.path(), "r1");

    let summary =
        run_monitor(&instrument, &config, 1, CancellationToken::new()).expect("run");
    assert_eq!(summary.completed_iterations, 1);

    let store = TrajectoryStore::open(config.db_path()).expect("open");
    assert_eq!(store.count_rows("signal_samples").expect("count"), 1);
    assert_eq!(store.count_rows("spec_samples").expect("count"), 1);
    assert_eq!(store.count_rows("action_events").expect("count"), 0);

    let rows = store.list_signal_samples_in_window(summary.run_id, 0.0, 10.0).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dt_s, 0.0);
    assert_eq!(rows[0].values_json, r#"{"Current":1.23}"#);
    instrument.close();
}

/// Scenario: the bias spec moves 0.5 -> 0.5 -> 0.75 over three ticks; one
/// spec-change event appears with the right delta and window.
#[test]
fn spec_change_emits_an_action_event() {
    let controller = WireController::start();
    controller.reply("Current_Get", vec![WireValue::Float(1.0)]);
    let reads = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&reads);
    controller.handle("Bias_Get", move |_| {
        let mut reads = counter.lock();
        *reads += 1;
        // The first read is the connect probe.
        let value = if *reads >= 4 { 0.75 } else { 0.5 };
        Handle::Reply(vec![WireValue::Float(value)])
    });

    let instrument = tcp_instrument(controller.port(), false, true);
    let dir = tempfile::tempdir().expect("tempdir");
    let config = monitor_config(dir.path(), "r1");

    let summary =
        run_monitor(&instrument, &config, 3, CancellationToken::new()).expect("run");
    assert_eq!(summary.completed_iterations, 3);

    let store = TrajectoryStore::open(config.db_path()).expect("open");
    assert_eq!(store.count_rows("signal_samples").expect("count"), 3);
    assert_eq!(store.count_rows("spec_samples").expect("count"), 3);

    let events = store.list_action_events(Some(summary.run_id)).expect("events");
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.action_kind, "spec-change");
    assert_eq!(event.spec_label, "Bias");
    assert_eq!(event.old_value_json.as_deref(), Some("0.5"));
    assert_eq!(event.new_value_json.as_deref(), Some("0.75"));
    assert_eq!(event.delta_value, Some(0.25));
    assert!((event.signal_window_start_dt_s - (event.dt_s - 2.5)).abs() < 1e-9);
    assert!((event.signal_window_end_dt_s - (event.dt_s + 2.5)).abs() < 1e-9);

    // The event is retrievable by index in (dt_s, id) order.
    let by_idx = store
        .get_action_event_by_idx(summary.run_id, 0)
        .expect("query")
        .expect("first event");
    assert_eq!(by_idx.id, event.id);
    instrument.close();
}

/// Scenario: a controller fault during one tick lands in monitor_errors
/// and the loop keeps sampling.
#[test]
fn transient_poll_failure_is_recorded_and_survived() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(0.5)]);
    let mut reads = 0u32;
    controller.handle("Current_Get", move |_| {
        reads += 1;
        if reads == 2 {
            Handle::Refuse("acquisition busy".to_owned())
        } else {
            Handle::Reply(vec![WireValue::Float(1.0)])
        }
    });

    let instrument = tcp_instrument(controller.port(), false, true);
    let dir = tempfile::tempdir().expect("tempdir");
    let config = monitor_config(dir.path(), "r1");

    let summary =
        run_monitor(&instrument, &config, 3, CancellationToken::new()).expect("run");
    assert_eq!(summary.completed_iterations, 3);

    let store = TrajectoryStore::open(config.db_path()).expect("open");
    assert_eq!(store.count_rows("signal_samples").expect("count"), 2);
    assert_eq!(store.count_rows("spec_samples").expect("count"), 2);
    assert_eq!(store.count_rows("monitor_errors").expect("count"), 1);
    instrument.close();
}

/// Scenario: re-using a run name is refused and the first run's rows are
/// untouched.
#[test]
fn duplicate_run_name_is_refused() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(0.5)]);
    controller.reply("Current_Get", vec![WireValue::Float(1.0)]);

    let instrument = tcp_instrument(controller.port(), false, true);
    let dir = tempfile::tempdir().expect("tempdir");
    let config = monitor_config(dir.path(), "r1");

    let summary =
        run_monitor(&instrument, &config, 2, CancellationToken::new()).expect("first run");
    let err = run_monitor(&instrument, &config, 2, CancellationToken::new())
        .expect_err("second run should fail");
    assert!(err.to_string().contains("unique"));

    let store = TrajectoryStore::open(config.db_path()).expect("open");
    assert_eq!(store.get_run_id_by_name("r1").expect("query"), Some(summary.run_id));
    assert_eq!(store.count_rows("signal_samples").expect("count"), 2);
    instrument.close();
}

/// Segment rotation over a real run: rotate_entries=2 over five ticks
/// yields three catalog rows per category.
#[test]
fn segments_rotate_during_a_real_run() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(0.5)]);
    controller.reply("Current_Get", vec![WireValue::Float(1.0)]);

    let instrument = tcp_instrument(controller.port(), false, true);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = monitor_config(dir.path(), "r1");
    config.rotate_entries = 2;

    run_monitor(&instrument, &config, 5, CancellationToken::new()).expect("run");

    let store = TrajectoryStore::open(config.db_path()).expect("open");
    assert_eq!(store.count_rows("signal_catalog").expect("count"), 3);
    assert_eq!(store.count_rows("spec_catalog").expect("count"), 3);
    instrument.close();
}
