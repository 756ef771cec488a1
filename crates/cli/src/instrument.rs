// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instrument facade: one manifest snapshot bound to one transport and one
//! write policy.
//!
//! Every manifest-declared parameter gets `get`, plan/execute single-step
//! write and plan/execute ramp; manifest-declared actions execute through
//! their safety mode. Write attempts are recorded in an append-only audit
//! log, and an optional [`EventSink`] receives `command_result`,
//! `state_transition` and `write_audit` events as they happen.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::manifest::{ActionSafetyMode, Manifest, ParameterSpec, WriteCommandSpec};
use crate::policy::{WriteExecutionReport, WritePlan, WritePolicy};
use crate::transport::registry::normalize_key;
use crate::transport::{CommandResponse, Health, TransportClient};
use crate::value::{ScalarValue, WireValue};

/// Receiver for instrument events. The journal implements this; tests use
/// an in-memory collector.
pub trait EventSink: Send + Sync {
    fn emit(&self, event_type: &str, payload: serde_json::Value);
}

/// Outcome bucket of one guarded write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Applied,
    DryRun,
    Blocked,
    Failed,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::DryRun => "dry_run",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }
}

/// One append-only audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct WriteAuditEntry {
    pub timestamp_utc: String,
    pub operation: String,
    pub status: WriteStatus,
    pub dry_run: bool,
    pub detail: String,
    pub metadata: serde_json::Value,
}

/// Result of [`Instrument::execute_action`].
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action: String,
    pub command: String,
    pub safety_mode: &'static str,
    pub args: serde_json::Value,
    /// True when only the coercion/validation pass ran.
    pub planned_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CommandResponse>,
}

/// Scan frame as five scalars, matching the `Scan_FrameGet` payload order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScanFrameState {
    pub center_x_m: f64,
    pub center_y_m: f64,
    pub width_m: f64,
    pub height_m: f64,
    pub angle_deg: f64,
}

/// Policy channels backing the five scan frame scalars.
const FRAME_CHANNELS: [(&str, fn(&ScanFrameState) -> f64); 5] = [
    ("scan_frame_center_x_m", |f| f.center_x_m),
    ("scan_frame_center_y_m", |f| f.center_y_m),
    ("scan_frame_width_m", |f| f.width_m),
    ("scan_frame_height_m", |f| f.height_m),
    ("scan_frame_angle_deg", |f| f.angle_deg),
];

impl ScanFrameState {
    pub fn from_payload(payload: &[WireValue]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(BridgeError::protocol("scan frame payload must have five values"));
        }
        Ok(Self {
            center_x_m: payload[0].as_f64()?,
            center_y_m: payload[1].as_f64()?,
            width_m: payload[2].as_f64()?,
            height_m: payload[3].as_f64()?,
            angle_deg: payload[4].as_f64()?,
        })
    }

    pub fn as_command_args(&self) -> IndexMap<String, ScalarValue> {
        IndexMap::from([
            ("Center_X_m".to_owned(), ScalarValue::Float(self.center_x_m)),
            ("Center_Y_m".to_owned(), ScalarValue::Float(self.center_y_m)),
            ("Width_m".to_owned(), ScalarValue::Float(self.width_m)),
            ("Height_m".to_owned(), ScalarValue::Float(self.height_m)),
            ("Angle_deg".to_owned(), ScalarValue::Float(self.angle_deg)),
        ])
    }
}

/// Multi-channel staircase plan for the scan frame aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct ScanFrameWritePlan {
    pub current_frame: ScanFrameState,
    pub target_frame: ScanFrameState,
    pub steps: Vec<ScanFrameState>,
    pub interval_s: f64,
    pub dry_run: bool,
    pub component_plans: IndexMap<String, WritePlan>,
}

impl ScanFrameWritePlan {
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanFrameWriteReport {
    pub dry_run: bool,
    pub attempted_steps: usize,
    pub applied_steps: usize,
    pub initial_frame: ScanFrameState,
    pub target_frame: ScanFrameState,
    pub final_frame: ScanFrameState,
}

pub struct Instrument {
    manifest: Manifest,
    transport: TransportClient,
    policy: WritePolicy,
    last_state: Mutex<HashMap<String, serde_json::Value>>,
    audit: Mutex<Vec<WriteAuditEntry>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Instrument {
    pub fn new(manifest: Manifest, transport: TransportClient, policy: WritePolicy) -> Self {
        Self {
            manifest,
            transport,
            policy,
            last_state: Mutex::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    pub fn health(&self) -> Health {
        self.transport.health()
    }

    pub fn version(&self) -> String {
        self.transport.version()
    }

    /// Sorted command names, optionally filtered by case-insensitive
    /// substring.
    pub fn available_commands(&self, filter: Option<&str>) -> Vec<String> {
        let names = self.transport.available_commands();
        let Some(token) = filter.map(str::trim).filter(|t| !t.is_empty()) else {
            return names;
        };
        let token = token.to_lowercase();
        names.into_iter().filter(|name| name.to_lowercase().contains(&token)).collect()
    }

    /// Issue an arbitrary declared command. Escape hatch for operators;
    /// goes through the same tracing as every other call.
    pub fn call_command(
        &self,
        command: &str,
        args: &IndexMap<String, ScalarValue>,
    ) -> Result<CommandResponse> {
        self.call_traced(command, args)
    }

    pub fn close(&self) {
        self.transport.close();
    }

    // ===== Reads =============================================================

    /// Read one parameter, coerced to its declared value type.
    pub fn get(&self, name: &str) -> Result<ScalarValue> {
        let spec = self.manifest.parameter(name)?;
        let Some(get_cmd) = &spec.get_cmd else {
            return Err(BridgeError::NotReadable(format!(
                "parameter '{name}' has no read command"
            )));
        };
        let response = self.call_traced(&get_cmd.command, &get_cmd.args)?;
        let raw = extract_payload_value(&response, &get_cmd.command, get_cmd.payload_index)?;
        let value = raw.coerce_scalar(spec.value_type)?;
        self.record_state_transition(name, state_snapshot(&value));
        Ok(value)
    }

    // ===== Guarded writes ====================================================

    /// Plan a one-command write for a parameter. Reads the current value
    /// through the transport, then delegates to the policy.
    pub fn plan_single_step(
        &self,
        name: &str,
        target: f64,
        interval_s: Option<f64>,
    ) -> Result<WritePlan> {
        let spec = self.writable_spec(name)?;
        self.validate_write_target(spec, target)?;
        let current = self.read_current(spec)?;
        self.policy.plan_single_step(name, current, target, interval_s)
    }

    /// Plan, then execute, a single-step write, with audit.
    pub fn set_single_step(
        &self,
        name: &str,
        target: f64,
        interval_s: Option<f64>,
    ) -> Result<WriteExecutionReport> {
        let operation = format!("{name}_set");
        let plan = self.audit_planning(&operation, || {
            self.plan_single_step(name, target, interval_s)
        })?;
        self.execute_audited(&operation, name, &plan)
    }

    /// Plan a ramp (staircase) for a parameter. Refused when the manifest
    /// disables ramping for it.
    pub fn plan_ramp(
        &self,
        name: &str,
        start: f64,
        end: f64,
        step_value: f64,
        interval_s: Option<f64>,
    ) -> Result<WritePlan> {
        let spec = self.writable_spec(name)?;
        if let Some(safety) = &spec.safety {
            if !safety.ramp_enabled {
                return Err(BridgeError::policy(format!(
                    "ramping is disabled for channel '{name}' (ramp_enabled=false)"
                )));
            }
        }
        self.validate_write_target(spec, end)?;
        let interval_s = interval_s.or_else(|| self.manifest.ramp_interval_s(spec));
        let current = self.read_current(spec)?;
        self.policy.plan_ramp(name, current, start, end, step_value, interval_s)
    }

    /// Plan, then execute, a ramp, with audit.
    pub fn ramp(
        &self,
        name: &str,
        start: f64,
        end: f64,
        step_value: f64,
        interval_s: Option<f64>,
    ) -> Result<WriteExecutionReport> {
        let operation = format!("{name}_ramp");
        let plan = self.audit_planning(&operation, || {
            self.plan_ramp(name, start, end, step_value, interval_s)
        })?;
        self.execute_audited(&operation, name, &plan)
    }

    // ===== Actions ===========================================================

    /// Execute (or, with `plan_only`, just validate) a declared action.
    ///
    /// `blocked` actions are always refused; `guarded` actions require the
    /// policy write-enable; `alwaysAllowed` actions pass through.
    pub fn execute_action(
        &self,
        name: &str,
        args: &IndexMap<String, ScalarValue>,
        plan_only: bool,
    ) -> Result<ActionOutcome> {
        let action = self.manifest.action(name)?;
        let cmd = &action.action_cmd;
        let merged = merge_action_args(name, cmd, args)?;
        let mode = action.safety_mode();

        let args_json = serde_json::Value::Object(
            merged.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
        );

        if plan_only {
            return Ok(ActionOutcome {
                action: name.to_owned(),
                command: cmd.command.clone(),
                safety_mode: mode.as_str(),
                args: args_json,
                planned_only: true,
                response: None,
            });
        }

        match mode {
            ActionSafetyMode::Blocked => {
                return Err(BridgeError::policy(format!(
                    "action '{name}' is blocked by its manifest safety mode"
                )));
            }
            ActionSafetyMode::Guarded => self.policy.ensure_writes_enabled()?,
            ActionSafetyMode::AlwaysAllowed => {}
        }

        let response = self.call_traced(&cmd.command, &merged)?;
        Ok(ActionOutcome {
            action: name.to_owned(),
            command: cmd.command.clone(),
            safety_mode: mode.as_str(),
            args: args_json,
            planned_only: false,
            response: Some(response),
        })
    }

    // ===== Scan control ======================================================

    pub fn start_scan(&self, direction_up: bool) -> Result<()> {
        let args = IndexMap::from([
            ("Scan_action".to_owned(), ScalarValue::Int(0)),
            ("Scan_direction".to_owned(), ScalarValue::Int(i64::from(direction_up))),
        ]);
        self.call_traced("Scan_Action", &args)?;
        Ok(())
    }

    pub fn stop_scan(&self, direction_up: bool) -> Result<()> {
        let args = IndexMap::from([
            ("Scan_action".to_owned(), ScalarValue::Int(1)),
            ("Scan_direction".to_owned(), ScalarValue::Int(i64::from(direction_up))),
        ]);
        self.call_traced("Scan_Action", &args)?;
        Ok(())
    }

    /// Block until the scan finishes or the controller-side timeout fires.
    /// Returns `(timed_out, data_file_path)`.
    pub fn wait_end_of_scan(&self, timeout_ms: i64) -> Result<(bool, String)> {
        let args = IndexMap::from([("Timeout_ms".to_owned(), ScalarValue::Int(timeout_ms))]);
        let response = self.call_traced("Scan_WaitEndOfScan", &args)?;
        if response.payload.len() < 3 {
            return Err(BridgeError::protocol(
                "Scan_WaitEndOfScan must return [timeout_status, path_size, path]",
            ));
        }
        let timed_out = match &response.payload[0] {
            WireValue::Int(v) => *v != 0,
            WireValue::Float(v) => *v != 0.0,
            other => {
                return Err(BridgeError::protocol(format!(
                    "Scan_WaitEndOfScan timeout_status is not numeric: {other:?}"
                )))
            }
        };
        let file_path = match &response.payload[2] {
            WireValue::Str(path) => path.clone(),
            _ => String::new(),
        };
        Ok((timed_out, file_path))
    }

    // ===== Scan frame aggregate ==============================================

    pub fn read_scan_frame(&self) -> Result<ScanFrameState> {
        let response = self.call_traced("Scan_FrameGet", &IndexMap::new())?;
        ScanFrameState::from_payload(&response.payload)
    }

    /// Plan a staircase move of the whole scan frame.
    ///
    /// Each of the five scalars is planned as an independent ramp under its
    /// own channel limit; the frame staircase interpolates all five
    /// together using the largest component step count and the slowest
    /// component interval.
    pub fn plan_scan_frame(&self, target: ScanFrameState) -> Result<ScanFrameWritePlan> {
        let current = self.read_scan_frame()?;
        let mut component_plans = IndexMap::new();
        for (channel, field) in FRAME_CHANNELS {
            let step_value = self.policy.limit(channel)?.max_step;
            let plan = self.policy.plan_ramp(
                channel,
                field(&current),
                field(&current),
                field(&target),
                step_value,
                None,
            )?;
            component_plans.insert(channel.to_owned(), plan);
        }

        let step_count =
            component_plans.values().map(WritePlan::step_count).max().unwrap_or(1);
        let interval_s = component_plans
            .values()
            .map(|plan| plan.interval_s)
            .fold(0.0_f64, f64::max);
        let dry_run = component_plans.values().any(|plan| plan.dry_run);
        let steps = interpolate_frames(&current, &target, step_count);

        Ok(ScanFrameWritePlan {
            current_frame: current,
            target_frame: target,
            steps,
            interval_s,
            dry_run,
            component_plans,
        })
    }

    /// Plan, then apply, a scan frame move via `Scan_FrameSet`, marking all
    /// five channels through the policy's last-write table with one shared
    /// timestamp. The channels stay independent; there is no cross-channel
    /// atomicity.
    pub fn set_scan_frame(&self, target: ScanFrameState) -> Result<ScanFrameWriteReport> {
        let operation = "scan_frame_set";
        let plan = self.audit_planning(operation, || self.plan_scan_frame(target))?;

        let attempted_steps = plan.step_count();
        if plan.dry_run {
            let report = ScanFrameWriteReport {
                dry_run: true,
                attempted_steps,
                applied_steps: 0,
                initial_frame: plan.current_frame,
                target_frame: plan.target_frame,
                final_frame: plan.steps.last().copied().unwrap_or(plan.current_frame),
            };
            self.append_audit(
                operation,
                WriteStatus::DryRun,
                true,
                "scan frame write was planned but not applied",
                serde_json::json!({
                    "attempted_steps": attempted_steps,
                    "applied_steps": 0,
                    "target_frame": plan.target_frame,
                }),
            );
            return Ok(report);
        }

        let mut applied_steps = 0;
        for (index, step) in plan.steps.iter().enumerate() {
            if let Err(err) = self.call_traced("Scan_FrameSet", &step.as_command_args()) {
                self.append_audit(
                    operation,
                    WriteStatus::Failed,
                    false,
                    &err.to_string(),
                    serde_json::json!({
                        "attempted_steps": attempted_steps,
                        "applied_steps": applied_steps,
                    }),
                );
                return Err(err);
            }
            applied_steps += 1;
            if index < attempted_steps - 1 && plan.interval_s > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(plan.interval_s));
            }
        }

        let write_stamp = self.policy.now_s();
        for channel in plan.component_plans.keys() {
            self.policy.record_write(channel, Some(write_stamp));
        }

        let final_frame = self.read_scan_frame()?;
        let report = ScanFrameWriteReport {
            dry_run: false,
            attempted_steps,
            applied_steps,
            initial_frame: plan.current_frame,
            target_frame: plan.target_frame,
            final_frame,
        };
        self.append_audit(
            operation,
            WriteStatus::Applied,
            false,
            "scan frame write applied",
            serde_json::json!({
                "attempted_steps": attempted_steps,
                "applied_steps": applied_steps,
                "target_frame": plan.target_frame,
                "final_frame": final_frame,
            }),
        );
        Ok(report)
    }

    // ===== Audit / events ====================================================

    pub fn audit_log(&self) -> Vec<WriteAuditEntry> {
        self.audit.lock().clone()
    }

    fn audit_planning<T>(&self, operation: &str, planner: impl FnOnce() -> Result<T>) -> Result<T> {
        planner().map_err(|err| {
            self.append_audit(
                operation,
                WriteStatus::Blocked,
                self.policy.dry_run(),
                &err.to_string(),
                serde_json::json!({}),
            );
            err
        })
    }

    fn execute_audited(
        &self,
        operation: &str,
        name: &str,
        plan: &WritePlan,
    ) -> Result<WriteExecutionReport> {
        let spec = self.writable_spec(name)?;
        let Some(set_cmd) = &spec.set_cmd else {
            return Err(BridgeError::NotWritable(format!(
                "parameter '{name}' has no write command"
            )));
        };
        let value_type = spec.value_type;
        let applied = Cell::new(0usize);

        let result = {
            let mut send_step = |step: f64| -> Result<()> {
                let args = write_args(set_cmd, value_type, step)?;
                self.call_traced(&set_cmd.command, &args)?;
                applied.set(applied.get() + 1);
                Ok(())
            };
            self.policy.execute(plan, &mut send_step, &|secs| {
                std::thread::sleep(Duration::from_secs_f64(secs));
            })
        };

        match result {
            Ok(report) => {
                let status =
                    if report.dry_run { WriteStatus::DryRun } else { WriteStatus::Applied };
                self.append_audit(
                    operation,
                    status,
                    report.dry_run,
                    "scalar write completed",
                    serde_json::json!({
                        "attempted_steps": report.attempted_steps,
                        "applied_steps": report.applied_steps,
                        "target_value": report.target_value,
                        "final_value": report.final_value,
                    }),
                );
                Ok(report)
            }
            Err(err) => {
                self.append_audit(
                    operation,
                    WriteStatus::Failed,
                    false,
                    &err.to_string(),
                    serde_json::json!({
                        "attempted_steps": plan.step_count(),
                        "applied_steps": applied.get(),
                        "target_value": plan.target_value,
                    }),
                );
                Err(err)
            }
        }
    }

    fn append_audit(
        &self,
        operation: &str,
        status: WriteStatus,
        dry_run: bool,
        detail: &str,
        metadata: serde_json::Value,
    ) {
        let entry = WriteAuditEntry {
            timestamp_utc: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            operation: operation.to_owned(),
            status,
            dry_run,
            detail: detail.to_owned(),
            metadata: metadata.clone(),
        };
        self.audit.lock().push(entry);
        self.emit_event(
            "write_audit",
            serde_json::json!({
                "operation": operation,
                "status": status.as_str(),
                "dry_run": dry_run,
                "detail": detail,
                "metadata": metadata,
            }),
        );
    }

    fn record_state_transition(&self, state_key: &str, value: serde_json::Value) {
        let mut last_state = self.last_state.lock();
        if last_state.get(state_key) == Some(&value) {
            return;
        }
        let old = last_state.insert(state_key.to_owned(), value.clone());
        drop(last_state);
        debug!(state_key, new = %value, "state transition");
        self.emit_event(
            "state_transition",
            serde_json::json!({
                "state_key": state_key,
                "old": old,
                "new": value,
            }),
        );
    }

    fn emit_event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(sink) = &self.sink {
            sink.emit(event_type, payload);
        }
    }

    // ===== Internal helpers ==================================================

    fn writable_spec(&self, name: &str) -> Result<&ParameterSpec> {
        let spec = self.manifest.parameter(name)?;
        if !spec.writable() {
            return Err(BridgeError::NotWritable(format!(
                "parameter '{name}' has no write command"
            )));
        }
        Ok(spec)
    }

    /// Validate a numeric write target against the parameter's validator.
    fn validate_write_target(&self, spec: &ParameterSpec, target: f64) -> Result<()> {
        let Some(vals) = &spec.vals else {
            return Ok(());
        };
        let candidate = ScalarValue::Float(target).coerce(spec.value_type)?;
        vals.check(&spec.name, &candidate)
    }

    /// Read the current value of a parameter as f64 for planning.
    fn read_current(&self, spec: &ParameterSpec) -> Result<f64> {
        let Some(get_cmd) = &spec.get_cmd else {
            return Err(BridgeError::NotReadable(format!(
                "parameter '{}' has no read command; cannot plan a relative write",
                spec.name
            )));
        };
        let response = self.call_traced(&get_cmd.command, &get_cmd.args)?;
        let raw = extract_payload_value(&response, &get_cmd.command, get_cmd.payload_index)?;
        raw.as_f64()
    }

    /// One transport call with latency tracing and a `command_result`
    /// event on both outcomes.
    fn call_traced(
        &self,
        command: &str,
        args: &IndexMap<String, ScalarValue>,
    ) -> Result<CommandResponse> {
        let call_start = Instant::now();
        let args_digest = args_hash(args);
        match self.transport.call(command, args) {
            Ok(response) => {
                self.emit_event(
                    "command_result",
                    serde_json::json!({
                        "command": command,
                        "status": "ok",
                        "latency_ms": call_start.elapsed().as_secs_f64() * 1000.0,
                        "args_hash": args_digest,
                    }),
                );
                Ok(response)
            }
            Err(err) => {
                self.emit_event(
                    "command_result",
                    serde_json::json!({
                        "command": command,
                        "status": "error",
                        "latency_ms": call_start.elapsed().as_secs_f64() * 1000.0,
                        "args_hash": args_digest,
                        "error": err.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }
}

/// Build the wire arguments for one write step: the value argument plus
/// the command's fixed arguments.
fn write_args(
    set_cmd: &WriteCommandSpec,
    value_type: crate::value::ScalarType,
    step: f64,
) -> Result<IndexMap<String, ScalarValue>> {
    let mut args = IndexMap::new();
    args.insert(set_cmd.value_arg.clone(), ScalarValue::Float(step).coerce(value_type)?);
    for (name, value) in &set_cmd.args {
        args.insert(name.clone(), value.clone());
    }
    Ok(args)
}

/// Merge caller arguments over an action's fixed arguments, coercing each
/// to its declared wire type. Caller keys match exactly or via the
/// normalized fallback.
fn merge_action_args(
    action: &str,
    cmd: &crate::manifest::ActionCommandSpec,
    args: &IndexMap<String, ScalarValue>,
) -> Result<IndexMap<String, ScalarValue>> {
    let declared = cmd.declared_args();
    let mut merged: IndexMap<String, ScalarValue> = IndexMap::new();
    for name in &declared {
        if let Some(value) = cmd.args.get(name) {
            merged.insert(name.clone(), value.coerce(cmd.arg_type(name))?);
        }
    }

    for (key, value) in args {
        let resolved = declared
            .iter()
            .find(|name| *name == key)
            .or_else(|| {
                let wanted = normalize_key(key);
                declared.iter().find(|name| normalize_key(name) == wanted)
            })
            .ok_or_else(|| {
                BridgeError::invalid_argument(format!(
                    "unexpected argument '{key}' for action '{action}'; allowed: {}",
                    declared.join(", ")
                ))
            })?;
        let coerced = value.coerce(cmd.arg_type(resolved)).map_err(|e| {
            BridgeError::invalid_argument(format!(
                "argument '{resolved}' for action '{action}': {e}"
            ))
        })?;
        merged.insert(resolved.clone(), coerced);
    }

    for field in &cmd.arg_fields {
        if field.required && !merged.contains_key(&field.name) {
            return Err(BridgeError::invalid_argument(format!(
                "missing required argument '{}' for action '{action}'",
                field.name
            )));
        }
    }

    Ok(merged)
}

/// Interpolate the five frame scalars together over `step_count` steps,
/// landing on `target` exactly.
fn interpolate_frames(
    current: &ScanFrameState,
    target: &ScanFrameState,
    step_count: usize,
) -> Vec<ScanFrameState> {
    if step_count == 0 {
        return vec![*target];
    }
    let mut steps = Vec::with_capacity(step_count);
    for index in 1..=step_count {
        let fraction = index as f64 / step_count as f64;
        steps.push(ScanFrameState {
            center_x_m: current.center_x_m + (target.center_x_m - current.center_x_m) * fraction,
            center_y_m: current.center_y_m + (target.center_y_m - current.center_y_m) * fraction,
            width_m: current.width_m + (target.width_m - current.width_m) * fraction,
            height_m: current.height_m + (target.height_m - current.height_m) * fraction,
            angle_deg: current.angle_deg + (target.angle_deg - current.angle_deg) * fraction,
        });
    }
    if let Some(last) = steps.last_mut() {
        *last = *target;
    }
    steps
}

/// Extract the payload element a read command points at.
fn extract_payload_value(
    response: &CommandResponse,
    command: &str,
    payload_index: i64,
) -> Result<WireValue> {
    if payload_index == 0 {
        if let Some(value) = &response.value {
            return Ok(value.clone());
        }
    }
    let index = usize::try_from(payload_index)
        .map_err(|_| BridgeError::protocol(format!("negative payload index for '{command}'")))?;
    response.payload.get(index).cloned().ok_or_else(|| {
        BridgeError::protocol(format!(
            "command '{command}' payload index {payload_index} is out of range \
             (payload has {} elements)",
            response.payload.len()
        ))
    })
}

/// JSON snapshot used for duplicate suppression. Floats are rounded so
/// controller read noise below 1e-12 does not spam transition events.
fn state_snapshot(value: &ScalarValue) -> serde_json::Value {
    match value {
        ScalarValue::Float(v) => {
            let rounded = (v * 1e12).round() / 1e12;
            serde_json::Value::from(rounded)
        }
        other => other.to_json(),
    }
}

/// Short digest of an argument map, for event payloads. Keeps raw values
/// out of the journal.
fn args_hash(args: &IndexMap<String, ScalarValue>) -> String {
    let mut sorted: Vec<(&String, &ScalarValue)> = args.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut hasher = Sha256::new();
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.render().as_bytes());
        hasher.update(b";");
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Poll a set of labelled parameters into a label -> JSON value map.
/// This is the closure body behind the monitor's signal and spec pollers.
pub fn poll_labels(
    instrument: &Instrument,
    labels: &[(String, String)],
) -> Result<IndexMap<String, serde_json::Value>> {
    let mut values = IndexMap::new();
    for (label, parameter) in labels {
        let value = instrument.get(parameter)?;
        values.insert(label.clone(), value.to_json());
    }
    Ok(values)
}

#[cfg(test)]
#[path = "instrument_tests.rs"]
mod tests;
