// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Guarded write policy: a pure planner and executor for numeric writes.
//!
//! The policy decides whether a single-step or ramp request may be applied
//! under per-channel limits (bounds, max step, slew rate, cooldown) and
//! turns accepted requests into a [`WritePlan`]: an ordered sequence of
//! intermediate targets ending exactly at the requested value. Execution
//! invokes a caller-supplied sender between sleep points; dry-run plans are
//! honoured at the boundary and never touch the sender.
//!
//! Violations are inputs being wrong, not transient faults: they are never
//! retried, and every message names the channel, the measured delta and the
//! breached limit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{BridgeError, Result};
use crate::manifest::{Manifest, SafetySpec};

/// Monotonic clock in seconds, injectable for tests.
pub type MonotonicClock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Sleep function used between ramp steps, injectable for tests.
pub type SleepFn = dyn Fn(f64);

/// Per-channel write limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelLimit {
    pub min: f64,
    pub max: f64,
    pub max_step: f64,
    pub max_slew_per_s: Option<f64>,
    pub cooldown_s: f64,
    pub ramp_interval_s: f64,
}

impl ChannelLimit {
    /// Build a limit from a manifest safety block.
    ///
    /// Bounds fall back to the parameter's validator range; the ramp
    /// interval falls back to the manifest default. Returns `None` when the
    /// block carries no usable bounds (read-only parameters may omit them).
    pub fn from_safety(
        safety: &SafetySpec,
        validator_min: Option<f64>,
        validator_max: Option<f64>,
        default_interval_s: Option<f64>,
    ) -> Option<ChannelLimit> {
        let min = safety.min.or(validator_min)?;
        let max = safety.max.or(validator_max)?;
        let max_step = safety.max_step?;
        Some(ChannelLimit {
            min,
            max,
            max_step,
            max_slew_per_s: safety.max_slew_per_s,
            cooldown_s: safety.cooldown_s,
            ramp_interval_s: safety
                .ramp_interval_s
                .or(default_interval_s)
                .unwrap_or(DEFAULT_RAMP_INTERVAL_S),
        })
    }
}

pub const DEFAULT_RAMP_INTERVAL_S: f64 = 0.05;

/// An immutable, validated write plan.
///
/// `steps` is the ordered sequence of intermediate targets; the last step
/// equals `target_value` exactly (floating-point drift is repaired at plan
/// time, not during execution).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WritePlan {
    pub channel: String,
    pub current_value: f64,
    pub target_value: f64,
    pub steps: Vec<f64>,
    pub interval_s: f64,
    pub dry_run: bool,
    pub reason: Option<String>,
}

impl WritePlan {
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn final_value(&self) -> f64 {
        self.steps.last().copied().unwrap_or(self.current_value)
    }
}

/// Outcome of executing a [`WritePlan`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteExecutionReport {
    pub channel: String,
    pub dry_run: bool,
    pub attempted_steps: usize,
    pub applied_steps: usize,
    pub initial_value: f64,
    pub target_value: f64,
    pub final_value: f64,
}

/// The policy engine. One instance per bridge; the last-write table lives
/// here, not in process globals.
pub struct WritePolicy {
    allow_writes: bool,
    dry_run: bool,
    limits: BTreeMap<String, ChannelLimit>,
    last_write_at: Mutex<HashMap<String, f64>>,
    clock: MonotonicClock,
}

impl WritePolicy {
    pub fn new(allow_writes: bool, dry_run: bool, limits: BTreeMap<String, ChannelLimit>) -> Self {
        let epoch = Instant::now();
        Self {
            allow_writes,
            dry_run,
            limits,
            last_write_at: Mutex::new(HashMap::new()),
            clock: Arc::new(move || epoch.elapsed().as_secs_f64()),
        }
    }

    /// Build limits from every manifest parameter that carries a usable
    /// safety block. Read-only parameters may contribute limits too; the
    /// scan-frame aggregate plans against channels that have no write
    /// command of their own.
    pub fn from_manifest(allow_writes: bool, dry_run: bool, manifest: &Manifest) -> Self {
        let mut limits = BTreeMap::new();
        for (name, spec) in &manifest.parameters {
            let Some(safety) = &spec.safety else {
                continue;
            };
            let vals = spec.vals.as_ref();
            let limit = ChannelLimit::from_safety(
                safety,
                vals.and_then(|v| v.min),
                vals.and_then(|v| v.max),
                manifest.defaults.ramp_default_interval_s,
            );
            if let Some(limit) = limit {
                limits.insert(name.clone(), limit);
            }
        }
        Self::new(allow_writes, dry_run, limits)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn allow_writes(&self) -> bool {
        self.allow_writes
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn limit(&self, channel: &str) -> Result<&ChannelLimit> {
        self.limits.get(channel).ok_or_else(|| {
            BridgeError::policy(format!("no channel limit configured for '{channel}'"))
        })
    }

    pub fn ensure_writes_enabled(&self) -> Result<()> {
        if self.allow_writes {
            Ok(())
        } else {
            Err(BridgeError::policy("writes are disabled by policy (allow_writes=false)"))
        }
    }

    /// Plan a write that moves the channel in exactly one controller
    /// command.
    ///
    /// Rejects the request when writes are disabled, the target is out of
    /// bounds, the delta exceeds `max_step` (or the slew budget for one
    /// interval), or the channel is still inside its cooldown window.
    pub fn plan_single_step(
        &self,
        channel: &str,
        current: f64,
        target: f64,
        interval_s: Option<f64>,
    ) -> Result<WritePlan> {
        self.ensure_writes_enabled()?;
        let limit = self.limit(channel)?;
        let interval_s = interval_s.unwrap_or(limit.ramp_interval_s);

        self.check_bounds(channel, limit, target)?;
        self.check_cooldown(channel, limit)?;

        let delta = (target - current).abs();
        if delta > limit.max_step {
            return Err(BridgeError::policy(format!(
                "channel '{channel}' step {delta} exceeds max_step {}",
                limit.max_step
            )));
        }
        if let Some(slew) = limit.max_slew_per_s {
            let budget = slew * interval_s;
            if delta > budget {
                return Err(BridgeError::policy(format!(
                    "channel '{channel}' step {delta} exceeds slew budget {budget} \
                     (max_slew_per_s {slew} over {interval_s} s)"
                )));
            }
        }

        Ok(WritePlan {
            channel: channel.to_owned(),
            current_value: current,
            target_value: target,
            steps: vec![target],
            interval_s,
            dry_run: self.dry_run,
            reason: None,
        })
    }

    /// Plan a monotone staircase from `start` to `end` with `step_value`
    /// magnitude per step, clamped by `max_step` and the slew budget for
    /// one interval; whichever is most restrictive controls the step
    /// count. If `current != start`, a `current -> start` pre-segment is
    /// prepended, subdivided under the same per-step cap. The terminal step
    /// equals `end` exactly.
    pub fn plan_ramp(
        &self,
        channel: &str,
        current: f64,
        start: f64,
        end: f64,
        step_value: f64,
        interval_s: Option<f64>,
    ) -> Result<WritePlan> {
        self.ensure_writes_enabled()?;
        let limit = self.limit(channel)?;
        let interval_s = interval_s.unwrap_or(limit.ramp_interval_s);

        if step_value <= 0.0 {
            return Err(BridgeError::policy(format!(
                "channel '{channel}' ramp step_value {step_value} must be positive"
            )));
        }
        self.check_bounds(channel, limit, start)?;
        self.check_bounds(channel, limit, end)?;
        self.check_cooldown(channel, limit)?;

        let mut per_step = step_value.min(limit.max_step);
        if let Some(slew) = limit.max_slew_per_s {
            if interval_s <= 0.0 {
                return Err(BridgeError::policy(format!(
                    "channel '{channel}' ramp interval must be positive when \
                     max_slew_per_s is configured"
                )));
            }
            per_step = per_step.min(slew * interval_s);
        }

        let mut steps = Vec::new();
        if current != start {
            staircase(&mut steps, current, start, per_step);
        }
        staircase(&mut steps, start, end, per_step);
        if steps.is_empty() {
            steps.push(end);
        }

        Ok(WritePlan {
            channel: channel.to_owned(),
            current_value: current,
            target_value: end,
            steps,
            interval_s,
            dry_run: self.dry_run,
            reason: None,
        })
    }

    /// Execute a plan against a side-effect sender.
    ///
    /// Dry-run plans return a synthesized report with `applied_steps == 0`
    /// and never invoke the sender. Live plans invoke the sender once per
    /// step, sleeping `interval_s` between steps (not after the last), then
    /// stamp the channel's last-write time for cooldown enforcement.
    pub fn execute(
        &self,
        plan: &WritePlan,
        send_step: &mut dyn FnMut(f64) -> Result<()>,
        sleep: &SleepFn,
    ) -> Result<WriteExecutionReport> {
        let attempted_steps = plan.step_count();

        if plan.dry_run {
            return Ok(WriteExecutionReport {
                channel: plan.channel.clone(),
                dry_run: true,
                attempted_steps,
                applied_steps: 0,
                initial_value: plan.current_value,
                target_value: plan.target_value,
                final_value: plan.final_value(),
            });
        }

        let mut applied_steps = 0;
        for (index, step) in plan.steps.iter().enumerate() {
            send_step(*step)?;
            applied_steps += 1;
            if index < attempted_steps - 1 && plan.interval_s > 0.0 {
                sleep(plan.interval_s);
            }
        }

        self.record_write(&plan.channel, None);

        Ok(WriteExecutionReport {
            channel: plan.channel.clone(),
            dry_run: false,
            attempted_steps,
            applied_steps,
            initial_value: plan.current_value,
            target_value: plan.target_value,
            final_value: plan.final_value(),
        })
    }

    /// Stamp a channel's last-write time.
    ///
    /// Public so aggregate writers (e.g. the scan-frame staircase, which
    /// applies five channels in one controller command) can mark every
    /// affected channel after the fact.
    pub fn record_write(&self, channel: &str, at_s: Option<f64>) {
        let at = at_s.unwrap_or_else(|| (self.clock)());
        self.last_write_at.lock().insert(channel.to_owned(), at);
    }

    pub fn now_s(&self) -> f64 {
        (self.clock)()
    }

    fn check_bounds(&self, channel: &str, limit: &ChannelLimit, value: f64) -> Result<()> {
        if value < limit.min || value > limit.max {
            return Err(BridgeError::policy(format!(
                "channel '{channel}' target {value} is outside bounds [{}, {}]",
                limit.min, limit.max
            )));
        }
        Ok(())
    }

    /// Cooldown is inclusive: elapsed time exactly equal to `cooldown_s`
    /// still blocks. `cooldown_s == 0` never blocks.
    fn check_cooldown(&self, channel: &str, limit: &ChannelLimit) -> Result<()> {
        if limit.cooldown_s <= 0.0 {
            return Ok(());
        }
        let last = self.last_write_at.lock().get(channel).copied();
        let Some(last) = last else {
            return Ok(());
        };
        let elapsed = (self.clock)() - last;
        if elapsed <= limit.cooldown_s {
            let remaining = limit.cooldown_s - elapsed;
            return Err(BridgeError::policy(format!(
                "channel '{channel}' is in cooldown for another {remaining:.3} s \
                 (cooldown_s {})",
                limit.cooldown_s
            )));
        }
        Ok(())
    }
}

/// Append a uniform staircase from `from` (exclusive) to `to` (inclusive),
/// each increment at most `per_step` in magnitude, landing on `to` exactly.
fn staircase(steps: &mut Vec<f64>, from: f64, to: f64, per_step: f64) {
    let delta = to - from;
    if delta == 0.0 {
        return;
    }
    let count = (delta.abs() / per_step).ceil().max(1.0) as usize;
    let increment = delta / count as f64;
    for index in 1..=count {
        steps.push(from + increment * index as f64);
    }
    if let Some(last) = steps.last_mut() {
        *last = to;
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
