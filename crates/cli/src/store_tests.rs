// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn store() -> TrajectoryStore {
    let mut store = TrajectoryStore::open_in_memory().unwrap();
    store.initialize_schema().unwrap();
    store
}

// ===== Schema ================================================================

#[test]
fn initialize_schema_creates_all_tables() {
    let store = store();
    let tables = store.table_names().unwrap();
    for expected in [
        "action_events",
        "monitor_errors",
        "runs",
        "signal_catalog",
        "signal_samples",
        "spec_catalog",
        "spec_samples",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
    }
}

#[test]
fn initialize_schema_is_idempotent() {
    let mut store = store();
    store.initialize_schema().unwrap();
    store.initialize_schema().unwrap();
    assert_eq!(store.table_names().unwrap().len(), 7);
}

#[test]
fn delta_value_column_is_added_to_old_databases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trajectory.sqlite3");
    {
        // Simulate a pre-delta_value database.
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE action_events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id INTEGER NOT NULL,
                 dt_s REAL NOT NULL,
                 action_kind TEXT NOT NULL,
                 detected_at_utc TEXT NOT NULL,
                 spec_label TEXT NOT NULL,
                 signal_window_start_dt_s REAL NOT NULL,
                 signal_window_end_dt_s REAL NOT NULL,
                 old_value_json TEXT,
                 new_value_json TEXT
             )",
        )
        .unwrap();
    }

    let mut store = TrajectoryStore::open(&path).unwrap();
    store.initialize_schema().unwrap();

    let run_id = store.create_run("migrated", "2026-01-01T00:00:00Z").unwrap();
    store
        .insert_action_event(
            run_id,
            1.0,
            "spec-change",
            "2026-01-01T00:00:01Z",
            "Bias",
            0.0,
            2.0,
            Some(0.25),
            Some(&serde_json::json!(0.5)),
            Some(&serde_json::json!(0.75)),
        )
        .unwrap();
    let events = store.list_action_events(Some(run_id)).unwrap();
    assert_eq!(events[0].delta_value, Some(0.25));
}

// ===== Runs ==================================================================

#[test]
fn duplicate_run_name_fails_and_keeps_the_first_row() {
    let mut store = store();
    let first = store.create_run("r1", "2026-01-01T00:00:00Z").unwrap();
    let err = store.create_run("r1", "2026-01-02T00:00:00Z").unwrap_err();
    assert!(err.to_string().contains("unique"));
    assert_eq!(store.get_run_id_by_name("r1").unwrap(), Some(first));
    assert_eq!(store.count_rows("runs").unwrap(), 1);
}

#[test]
fn latest_run_id_tracks_insert_order() {
    let mut store = store();
    assert_eq!(store.get_latest_run_id().unwrap(), None);
    store.create_run("a", "2026-01-01T00:00:00Z").unwrap();
    let second = store.create_run("b", "2026-01-01T01:00:00Z").unwrap();
    assert_eq!(store.get_latest_run_id().unwrap(), Some(second));
}

#[test]
fn run_id_by_name_misses_cleanly() {
    let store = store();
    assert_eq!(store.get_run_id_by_name("ghost").unwrap(), None);
}

// ===== Foreign keys ==========================================================

#[test]
fn sample_requires_a_catalog_row_from_the_same_run() {
    let mut store = store();
    let run_a = store.create_run("a", "2026-01-01T00:00:00Z").unwrap();
    let run_b = store.create_run("b", "2026-01-01T00:00:00Z").unwrap();
    let catalog_a = store
        .insert_signal_catalog(run_a, "segment-0", None, None)
        .unwrap();

    // Same id, wrong run: the composite FK rejects it.
    let err = store
        .insert_signal_sample(run_b, catalog_a, 0.0, &serde_json::json!({"Z": 1.0}))
        .unwrap_err();
    assert!(err.to_string().contains("FOREIGN KEY") || err.to_string().contains("constraint"));

    // Right run works.
    store
        .insert_signal_sample(run_a, catalog_a, 0.0, &serde_json::json!({"Z": 1.0}))
        .unwrap();
}

#[test]
fn negative_dt_is_rejected() {
    let mut store = store();
    let run_id = store.create_run("r", "2026-01-01T00:00:00Z").unwrap();
    let catalog = store.insert_signal_catalog(run_id, "segment-0", None, None).unwrap();
    let err = store
        .insert_signal_sample(run_id, catalog, -0.5, &serde_json::json!({}))
        .unwrap_err();
    assert!(err.to_string().contains("constraint") || err.to_string().contains("CHECK"));
}

#[test]
fn sample_pair_rolls_back_on_bad_spec_id() {
    let mut store = store();
    let run_id = store.create_run("r", "2026-01-01T00:00:00Z").unwrap();
    let signal_id = store.insert_signal_catalog(run_id, "segment-0", None, None).unwrap();

    let err = store
        .insert_sample_pair(
            run_id,
            signal_id,
            9999, // no such spec catalog row
            0.0,
            &serde_json::json!({"Z": 1.23}),
            &serde_json::json!({"Bias": 0.5}),
        )
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::StoreError);
    assert_eq!(store.count_rows("signal_samples").unwrap(), 0);
    assert_eq!(store.count_rows("spec_samples").unwrap(), 0);
}

#[test]
fn sample_pair_inserts_both_rows() {
    let mut store = store();
    let run_id = store.create_run("r", "2026-01-01T00:00:00Z").unwrap();
    let signal_id = store.insert_signal_catalog(run_id, "segment-0", None, None).unwrap();
    let spec_id = store.insert_spec_catalog(run_id, "segment-0", None, None).unwrap();

    let (signal_row, spec_row) = store
        .insert_sample_pair(
            run_id,
            signal_id,
            spec_id,
            0.25,
            &serde_json::json!({"Z": 1.23}),
            &serde_json::json!({"Bias": 0.5}),
        )
        .unwrap();
    assert!(signal_row > 0);
    assert!(spec_row > 0);
    assert_eq!(store.count_rows("signal_samples").unwrap(), 1);
    assert_eq!(store.count_rows("spec_samples").unwrap(), 1);
}

// ===== Queries ===============================================================

#[test]
fn action_events_are_ordered_by_dt_then_id() {
    let mut store = store();
    let run_id = store.create_run("r", "2026-01-01T00:00:00Z").unwrap();
    for (dt, label) in [(2.0, "b"), (1.0, "a"), (2.0, "c")] {
        store
            .insert_action_event(
                run_id,
                dt,
                "spec-change",
                "2026-01-01T00:00:01Z",
                label,
                dt - 1.0,
                dt + 1.0,
                None,
                None,
                None,
            )
            .unwrap();
    }
    let events = store.list_action_events(Some(run_id)).unwrap();
    let labels: Vec<&str> = events.iter().map(|e| e.spec_label.as_str()).collect();
    assert_eq!(labels, vec!["a", "b", "c"]);
}

#[test]
fn action_event_by_idx_walks_the_same_order() {
    let mut store = store();
    let run_id = store.create_run("r", "2026-01-01T00:00:00Z").unwrap();
    for (dt, label) in [(2.0, "second"), (1.0, "first")] {
        store
            .insert_action_event(
                run_id, dt, "spec-change", "t", label, 0.0, 0.0, None, None, None,
            )
            .unwrap();
    }
    assert_eq!(
        store.get_action_event_by_idx(run_id, 0).unwrap().unwrap().spec_label,
        "first"
    );
    assert_eq!(
        store.get_action_event_by_idx(run_id, 1).unwrap().unwrap().spec_label,
        "second"
    );
    assert!(store.get_action_event_by_idx(run_id, 2).unwrap().is_none());
}

#[test]
fn window_query_is_inclusive_on_both_ends() {
    let mut store = store();
    let run_id = store.create_run("r", "2026-01-01T00:00:00Z").unwrap();
    let signal_id = store.insert_signal_catalog(run_id, "segment-0", None, None).unwrap();
    for dt in [0.0, 1.0, 2.0, 3.0] {
        store
            .insert_signal_sample(run_id, signal_id, dt, &serde_json::json!({"Z": dt}))
            .unwrap();
    }
    let rows = store.list_signal_samples_in_window(run_id, 1.0, 2.0).unwrap();
    let dts: Vec<f64> = rows.iter().map(|r| r.dt_s).collect();
    assert_eq!(dts, vec![1.0, 2.0]);
    assert!(rows.iter().all(|r| r.signal_label == "segment-0"));
}

#[test]
fn window_query_does_not_cross_runs() {
    let mut store = store();
    let run_a = store.create_run("a", "t").unwrap();
    let run_b = store.create_run("b", "t").unwrap();
    let catalog_a = store.insert_signal_catalog(run_a, "segment-0", None, None).unwrap();
    let catalog_b = store.insert_signal_catalog(run_b, "segment-0", None, None).unwrap();
    store.insert_signal_sample(run_a, catalog_a, 1.0, &serde_json::json!(1)).unwrap();
    store.insert_signal_sample(run_b, catalog_b, 1.0, &serde_json::json!(2)).unwrap();

    let rows = store.list_signal_samples_in_window(run_a, 0.0, 10.0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run_id, run_a);
}

// ===== JSON text =============================================================

#[test]
fn json_text_is_ascii_safe() {
    assert_eq!(ascii_json(&serde_json::json!({"Z": 1.5})), r#"{"Z":1.5}"#);
    assert_eq!(ascii_json(&serde_json::json!("µm")), "\"\\u00b5m\"");
    // Astral characters escape as surrogate pairs.
    assert_eq!(ascii_json(&serde_json::json!("𝜇")), "\"\\ud835\\udf07\"");
}

#[test]
fn stored_values_json_round_trips() {
    let mut store = store();
    let run_id = store.create_run("r", "t").unwrap();
    let signal_id = store.insert_signal_catalog(run_id, "segment-0", None, None).unwrap();
    let values = serde_json::json!({"Z (µm)": 1.23, "ok": true});
    store.insert_signal_sample(run_id, signal_id, 0.0, &values).unwrap();

    let rows = store.list_signal_samples_in_window(run_id, 0.0, 0.0).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&rows[0].values_json).unwrap();
    assert_eq!(parsed, values);
    assert!(rows[0].values_json.is_ascii());
}
