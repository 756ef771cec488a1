// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trajectory monitor: a drift-aware periodic sampler.
//!
//! Each tick reads the configured signal and spec parameters through the
//! instrument, persists one signal row and one spec row as an atomic pair,
//! and reifies spec changes between consecutive ticks as action events.
//! Sample `n` is scheduled at `t0 + n * interval` on the monotonic clock,
//! so poll latency delays at most the next tick and never accumulates.
//!
//! Poller failures are recorded as monitor error rows and the loop moves
//! on; store-level invariant failures (foreign keys, schema) are structural
//! and surface.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::instrument::{poll_labels, Instrument};
use crate::manifest::Manifest;
use crate::store::TrajectoryStore;

/// Granularity of the interruptible wait inside the default sleeper.
const SLEEP_SLICE_S: f64 = 0.02;

/// Monitor run configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorConfig {
    pub run_name: String,
    pub interval_s: f64,
    pub rotate_entries: u32,
    pub action_window_s: f64,
    pub signal_labels: Vec<String>,
    pub spec_labels: Vec<String>,
    pub db_directory: String,
    pub db_name: String,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_s <= 0.0 {
            return Err(BridgeError::invalid_argument("interval_s must be positive"));
        }
        if self.rotate_entries < 1 {
            return Err(BridgeError::invalid_argument("rotate_entries must be at least 1"));
        }
        if self.action_window_s < 0.0 {
            return Err(BridgeError::invalid_argument("action_window_s must be non-negative"));
        }
        if self.signal_labels.is_empty() {
            return Err(BridgeError::invalid_argument(
                "signal_labels must contain at least one label",
            ));
        }
        if self.spec_labels.is_empty() {
            return Err(BridgeError::invalid_argument(
                "spec_labels must contain at least one label",
            ));
        }
        Ok(())
    }

    pub fn require_runnable(&self) -> Result<()> {
        if self.run_name.trim().is_empty() {
            return Err(BridgeError::invalid_argument(
                "run_name must be non-empty before starting a monitor run",
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.db_directory).join(&self.db_name)
    }
}

/// Resolve monitor labels against the manifest.
///
/// Every label must map to a readable parameter; unknown labels fail here,
/// before any run row is created.
pub fn resolve_labels(manifest: &Manifest, labels: &[String]) -> Result<Vec<(String, String)>> {
    labels
        .iter()
        .map(|label| {
            let spec = manifest.parameter_by_label(label)?;
            Ok((label.clone(), spec.name.clone()))
        })
        .collect()
}

type Poller<'a> = Box<dyn FnMut() -> Result<IndexMap<String, serde_json::Value>> + 'a>;

/// The tick loop. Owns the store handle for the duration of a run.
pub struct MonitorRunner<'a> {
    store: &'a mut TrajectoryStore,
    run_id: i64,
    run_start_utc: String,
    interval_s: f64,
    rotate_entries: u32,
    action_window_s: f64,
    poll_signals: Poller<'a>,
    poll_specs: Poller<'a>,
    monotonic_time_s: Box<dyn Fn() -> f64 + 'a>,
    sleep_s: Box<dyn Fn(f64) + 'a>,
    cancel: CancellationToken,

    sample_idx: u64,
    run_start_monotonic_s: Option<f64>,
    signal_catalog_ids: HashMap<u64, i64>,
    spec_catalog_ids: HashMap<u64, i64>,
    previous_specs: Option<IndexMap<String, serde_json::Value>>,
}

impl<'a> MonitorRunner<'a> {
    pub fn new(
        store: &'a mut TrajectoryStore,
        run_id: i64,
        run_start_utc: impl Into<String>,
        config: &MonitorConfig,
        poll_signals: Poller<'a>,
        poll_specs: Poller<'a>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            run_id,
            run_start_utc: run_start_utc.into(),
            interval_s: config.interval_s,
            rotate_entries: config.rotate_entries,
            action_window_s: config.action_window_s,
            poll_signals,
            poll_specs,
            monotonic_time_s: default_monotonic_clock(),
            sleep_s: Box::new(|secs| std::thread::sleep(std::time::Duration::from_secs_f64(secs))),
            cancel: CancellationToken::new(),
            sample_idx: 0,
            run_start_monotonic_s: None,
            signal_catalog_ids: HashMap::new(),
            spec_catalog_ids: HashMap::new(),
            previous_specs: None,
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Fn() -> f64 + 'a>) -> Self {
        self.monotonic_time_s = clock;
        self
    }

    #[must_use]
    pub fn with_sleep(mut self, sleep: Box<dyn Fn(f64) + 'a>) -> Self {
        self.sleep_s = sleep;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn sample_idx(&self) -> u64 {
        self.sample_idx
    }

    /// Run exactly `count` ticks, or fewer when cancelled between ticks.
    /// Returns the number of completed iterations.
    pub fn run_iterations(&mut self, count: u64) -> Result<u64> {
        let mut completed = 0;
        for _ in 0..count {
            if self.cancel.is_cancelled() {
                break;
            }
            self.wait_until_scheduled(self.sample_idx);
            if self.cancel.is_cancelled() {
                // Interrupted during the wait: skip the tick entirely so no
                // partial sample is written.
                break;
            }
            self.tick()?;
            self.sample_idx += 1;
            completed += 1;
        }
        Ok(completed)
    }

    /// One sample: catalog rows, dt, polls, atomic pair insert, spec diff.
    fn tick(&mut self) -> Result<()> {
        let segment_id = self.sample_idx / u64::from(self.rotate_entries);
        let signal_id = self.signal_catalog_id(segment_id)?;
        let spec_id = self.spec_catalog_id(segment_id)?;
        let dt_s = self.elapsed_seconds();

        let polled = (self.poll_signals)().and_then(|signals| {
            (self.poll_specs)().map(|specs| (signals, specs))
        });
        let (signal_values, spec_values) = match polled {
            Ok(values) => values,
            Err(err) => {
                // Abort the tick before the pair insert; record and move on.
                warn!(dt_s, err = %err, "monitor poll failed");
                self.store.insert_monitor_error(
                    Some(self.run_id),
                    Some(dt_s),
                    err.kind().as_str(),
                    &err.to_string(),
                    Some(&serde_json::json!({ "sample_idx": self.sample_idx })),
                )?;
                return Ok(());
            }
        };

        self.store.insert_sample_pair(
            self.run_id,
            signal_id,
            spec_id,
            dt_s,
            &map_to_json(&signal_values),
            &map_to_json(&spec_values),
        )?;

        self.record_spec_change_events(dt_s, &spec_values)?;
        self.previous_specs = Some(spec_values);
        Ok(())
    }

    /// Emit one action event per label whose spec value changed since the
    /// previous tick. The first tick only seeds the snapshot.
    fn record_spec_change_events(
        &mut self,
        dt_s: f64,
        spec_values: &IndexMap<String, serde_json::Value>,
    ) -> Result<()> {
        let Some(previous) = &self.previous_specs else {
            return Ok(());
        };

        let mut labels: Vec<&String> = previous.keys().chain(spec_values.keys()).collect();
        labels.sort();
        labels.dedup();

        let detected_at_utc =
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let window_start = dt_s - self.action_window_s;
        let window_end = dt_s + self.action_window_s;

        for label in labels {
            let old_value = previous.get(label);
            let new_value = spec_values.get(label);
            if old_value == new_value {
                continue;
            }
            let delta_value = compute_delta(old_value, new_value);
            info!(spec_label = %label, dt_s, delta = ?delta_value, "spec change detected");
            self.store.insert_action_event(
                self.run_id,
                dt_s,
                "spec-change",
                &detected_at_utc,
                label,
                window_start,
                window_end,
                delta_value,
                old_value,
                new_value,
            )?;
        }
        Ok(())
    }

    fn wait_until_scheduled(&mut self, sample_idx: u64) {
        let t0 = *self
            .run_start_monotonic_s
            .get_or_insert_with(|| (self.monotonic_time_s)());
        let scheduled = t0 + sample_idx as f64 * self.interval_s;
        let mut remaining = scheduled - (self.monotonic_time_s)();
        while remaining > 0.0 {
            if self.cancel.is_cancelled() {
                return;
            }
            (self.sleep_s)(remaining.min(SLEEP_SLICE_S));
            remaining = scheduled - (self.monotonic_time_s)();
        }
    }

    fn elapsed_seconds(&mut self) -> f64 {
        let now = (self.monotonic_time_s)();
        let t0 = *self.run_start_monotonic_s.get_or_insert(now);
        (now - t0).max(0.0)
    }

    fn signal_catalog_id(&mut self, segment_id: u64) -> Result<i64> {
        if let Some(id) = self.signal_catalog_ids.get(&segment_id) {
            return Ok(*id);
        }
        let metadata = self.segment_metadata(segment_id);
        let id = self.store.insert_signal_catalog(
            self.run_id,
            &format!("segment-{segment_id}"),
            None,
            Some(&metadata),
        )?;
        self.signal_catalog_ids.insert(segment_id, id);
        Ok(id)
    }

    fn spec_catalog_id(&mut self, segment_id: u64) -> Result<i64> {
        if let Some(id) = self.spec_catalog_ids.get(&segment_id) {
            return Ok(*id);
        }
        let metadata = self.segment_metadata(segment_id);
        let id = self.store.insert_spec_catalog(
            self.run_id,
            &format!("segment-{segment_id}"),
            None,
            Some(&metadata),
        )?;
        self.spec_catalog_ids.insert(segment_id, id);
        Ok(id)
    }

    fn segment_metadata(&self, segment_id: u64) -> serde_json::Value {
        serde_json::json!({
            "segment_id": segment_id,
            "run_start_utc": self.run_start_utc,
            "interval_s": self.interval_s,
        })
    }
}

/// Summary returned by [`run_monitor`].
#[derive(Debug, Clone, Serialize)]
pub struct MonitorRunSummary {
    pub run_id: i64,
    pub run_name: String,
    pub started_at_utc: String,
    pub completed_iterations: u64,
    pub db_path: String,
}

/// Orchestrate a full bounded monitor run against an instrument.
///
/// Labels are resolved before the run row is created, so a typo in the
/// configuration never leaves an empty run behind.
pub fn run_monitor(
    instrument: &Instrument,
    config: &MonitorConfig,
    iterations: u64,
    cancel: CancellationToken,
) -> Result<MonitorRunSummary> {
    config.validate()?;
    config.require_runnable()?;
    let signal_params = resolve_labels(instrument.manifest(), &config.signal_labels)?;
    let spec_params = resolve_labels(instrument.manifest(), &config.spec_labels)?;

    let mut store = TrajectoryStore::open(config.db_path())?;
    store.initialize_schema()?;
    let started_at_utc =
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let run_id = store.create_run(&config.run_name, &started_at_utc)?;
    info!(run_id, run_name = %config.run_name, iterations, "monitor run starting");

    let completed = {
        let mut runner = MonitorRunner::new(
            &mut store,
            run_id,
            started_at_utc.clone(),
            config,
            Box::new(|| poll_labels(instrument, &signal_params)),
            Box::new(|| poll_labels(instrument, &spec_params)),
        )?
        .with_cancel(cancel);
        runner.run_iterations(iterations)?
    };

    info!(run_id, completed, "monitor run finished");
    Ok(MonitorRunSummary {
        run_id,
        run_name: config.run_name.clone(),
        started_at_utc,
        completed_iterations: completed,
        db_path: store.path().display().to_string(),
    })
}

fn default_monotonic_clock<'a>() -> Box<dyn Fn() -> f64 + 'a> {
    let epoch = std::time::Instant::now();
    Box::new(move || epoch.elapsed().as_secs_f64())
}

fn map_to_json(map: &IndexMap<String, serde_json::Value>) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn compute_delta(
    old_value: Option<&serde_json::Value>,
    new_value: Option<&serde_json::Value>,
) -> Option<f64> {
    let old_value = old_value?;
    let new_value = new_value?;
    if old_value.is_boolean() || new_value.is_boolean() {
        return None;
    }
    Some(new_value.as_f64()? - old_value.as_f64()?)
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
