// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test fixtures: a scriptable in-memory controller backend and a
//! small manifest covering the common shapes (readable, writable, ramped,
//! cooled-down and aggregate parameters plus guarded/blocked actions).
//!
//! Compiled into the library so both unit tests and the end-to-end specs
//! crate can drive the real transport client against scripted sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};
use crate::manifest::{load_manifest, Manifest};
use crate::transport::registry::CommandRegistry;
use crate::transport::{
    ConnectionSettings, ResponseEnvelope, Session, SessionFactory, TransportClient,
};
use crate::value::{ScalarValue, WireValue};

pub const SAMPLE_MANIFEST_YAML: &str = r#"
version: 1
defaults:
  snapshot_value: true
  ramp_default_interval_s: 0.05
parameters:
  bias_v:
    label: Bias
    unit: V
    value_type: float
    get_cmd:
      command: Bias_Get
    set_cmd:
      command: Bias_Set
      value_arg: Bias_value_V
    vals:
      kind: numbers
      min: -10.0
      max: 10.0
    safety:
      min: -5.0
      max: 5.0
      max_step: 0.1
  current_a:
    label: Current
    unit: A
    value_type: float
    get_cmd:
      command: Current_Get
  zctrl_setpoint_a:
    label: Z Setpoint
    unit: A
    value_type: float
    get_cmd:
      command: ZCtrl_SetpntGet
    set_cmd:
      command: ZCtrl_SetpntSet
      value_arg: Z_Controller_setpoint
    safety:
      min: 0.0
      max: 2.0e-9
      max_step: 1.0e-10
      max_slew_per_s: 1.0e-9
      cooldown_s: 1.0
      ramp_interval_s: 0.1
  zctrl_on:
    label: Z Controller Enabled
    value_type: bool
    get_cmd:
      command: ZCtrl_OnOffGet
  scan_status_code:
    label: Scan Status Code
    value_type: int
    get_cmd:
      command: Scan_StatusGet
  scan_frame_center_x_m:
    label: Scan Frame Center X
    unit: m
    get_cmd:
      command: Scan_FrameGet
      payload_index: 0
    safety:
      min: -1.0e-6
      max: 1.0e-6
      max_step: 1.0e-7
  scan_frame_center_y_m:
    label: Scan Frame Center Y
    unit: m
    get_cmd:
      command: Scan_FrameGet
      payload_index: 1
    safety:
      min: -1.0e-6
      max: 1.0e-6
      max_step: 1.0e-7
  scan_frame_width_m:
    label: Scan Frame Width
    unit: m
    get_cmd:
      command: Scan_FrameGet
      payload_index: 2
    safety:
      min: 1.0e-9
      max: 2.0e-6
      max_step: 2.0e-7
  scan_frame_height_m:
    label: Scan Frame Height
    unit: m
    get_cmd:
      command: Scan_FrameGet
      payload_index: 3
    safety:
      min: 1.0e-9
      max: 2.0e-6
      max_step: 2.0e-7
  scan_frame_angle_deg:
    label: Scan Frame Angle
    unit: deg
    get_cmd:
      command: Scan_FrameGet
      payload_index: 4
    safety:
      min: -180.0
      max: 180.0
      max_step: 15.0
actions:
  scan_frame_set:
    action_cmd:
      command: Scan_FrameSet
      arg_types:
        Center_X_m: float
        Center_Y_m: float
        Width_m: float
        Height_m: float
        Angle_deg: float
    safety:
      mode: guarded
  scan_start:
    action_cmd:
      command: Scan_Action
      args:
        Scan_action: 0
        Scan_direction: 0
      arg_types:
        Scan_action: int
        Scan_direction: int
    safety:
      mode: guarded
  scan_wait:
    action_cmd:
      command: Scan_WaitEndOfScan
      arg_types:
        Timeout_ms: int
      arg_fields:
        - name: Timeout_ms
          type: int
          required: true
    safety:
      mode: alwaysAllowed
  motor_burst:
    action_cmd:
      command: Motor_StartMove
      arg_types:
        Direction: int
        Steps: int
    safety:
      mode: blocked
"#;

#[allow(clippy::unwrap_used)]
pub fn sample_manifest() -> Manifest {
    load_manifest(SAMPLE_MANIFEST_YAML).unwrap()
}

/// One scripted reply for a command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Success envelope with this payload.
    Payload(Vec<WireValue>),
    /// Envelope carrying a controller error string.
    Refuse(String),
    /// Session-level failure (connection, timeout, ...).
    Fail(BridgeError),
}

#[derive(Default)]
struct Script {
    /// One-shot replies, consumed in order before the defaults.
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    /// Repeating replies.
    defaults: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(String, Vec<(String, ScalarValue)>)>>,
    /// Ports that refuse the TCP connect itself.
    dead_ports: Mutex<Vec<u16>>,
    opened: AtomicU32,
}

/// Handle shared between the test and the fake backend.
#[derive(Clone, Default)]
pub struct FakeController {
    script: Arc<Script>,
}

impl FakeController {
    pub fn new() -> Self {
        let controller = Self::default();
        // Every controller answers the connect probe unless a test
        // overrides it.
        controller.on("Bias_Get", Reply::Payload(vec![WireValue::Float(0.0)]));
        controller
    }

    /// Set the repeating reply for a command.
    pub fn on(&self, command: &str, reply: Reply) {
        self.script.defaults.lock().insert(command.to_owned(), reply);
    }

    /// Queue a one-shot reply, consumed before the repeating one.
    pub fn push(&self, command: &str, reply: Reply) {
        self.script.queued.lock().entry(command.to_owned()).or_default().push_back(reply);
    }

    pub fn on_value(&self, command: &str, value: WireValue) {
        self.on(command, Reply::Payload(vec![value]));
    }

    pub fn refuse_port(&self, port: u16) {
        self.script.dead_ports.lock().push(port);
    }

    /// `(command, args)` pairs in call order, including connect probes.
    pub fn calls(&self) -> Vec<(String, Vec<(String, ScalarValue)>)> {
        self.script.calls.lock().clone()
    }

    pub fn calls_for(&self, command: &str) -> Vec<Vec<(String, ScalarValue)>> {
        self.calls()
            .into_iter()
            .filter(|(cmd, _)| cmd == command)
            .map(|(_, args)| args)
            .collect()
    }

    pub fn sessions_opened(&self) -> u32 {
        self.script.opened.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> FakeBackend {
        FakeBackend { script: Arc::clone(&self.script) }
    }
}

pub struct FakeBackend {
    script: Arc<Script>,
}

impl SessionFactory for FakeBackend {
    fn open(&self, host: &str, port: u16, _timeout: Duration) -> Result<Box<dyn Session>> {
        if self.script.dead_ports.lock().contains(&port) {
            return Err(BridgeError::connection(format!(
                "failed to open socket to {host}:{port}: connection refused"
            )));
        }
        self.script.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakeSession {
            script: Arc::clone(&self.script),
            endpoint: format!("{host}:{port}"),
        }))
    }

    fn backend_name(&self) -> &str {
        "fake"
    }

    fn version_string(&self) -> String {
        "fake/0".to_owned()
    }
}

struct FakeSession {
    script: Arc<Script>,
    endpoint: String,
}

impl Session for FakeSession {
    fn call(&mut self, command: &str, args: &[(String, ScalarValue)]) -> Result<ResponseEnvelope> {
        self.script.calls.lock().push((command.to_owned(), args.to_vec()));
        let queued = self.script.queued.lock().get_mut(command).and_then(VecDeque::pop_front);
        let reply = match queued {
            Some(reply) => reply,
            None => self
                .script
                .defaults
                .lock()
                .get(command)
                .cloned()
                .unwrap_or_else(|| Reply::Refuse(format!("unknown command {command}"))),
        };
        match reply {
            Reply::Payload(payload) => Ok(ResponseEnvelope { error: String::new(), payload }),
            Reply::Refuse(message) => {
                Ok(ResponseEnvelope { error: message, payload: Vec::new() })
            }
            Reply::Fail(err) => Err(err),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn close(&mut self) {}
}

pub fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        host: "127.0.0.1".to_owned(),
        ports: vec![6501],
        timeout_s: 0.5,
        retry_count: 1,
    }
}

/// Build a transport client over the fake backend and the sample manifest.
pub fn fake_transport(controller: &FakeController) -> TransportClient {
    fake_transport_with(controller, test_settings())
}

#[allow(clippy::unwrap_used)]
pub fn fake_transport_with(
    controller: &FakeController,
    settings: ConnectionSettings,
) -> TransportClient {
    let registry = CommandRegistry::from_manifest(&sample_manifest());
    TransportClient::new(settings, registry, Box::new(controller.backend())).unwrap()
}
