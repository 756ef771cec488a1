// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport session manager.
//!
//! One mutex-serialized session to one controller. The client walks the
//! candidate port list on connect, validates each socket with a probe
//! command before adopting it, and transparently reconnects-and-retries
//! network-layer failures so callers observe a single success or the final
//! failure. Controller refusals, argument problems and structural errors
//! are never retried.
//!
//! The [`Session`]/[`SessionFactory`] traits are the adapter seam: the
//! in-tree [`wire::TcpSessionFactory`] speaks the framed byte protocol,
//! and a vendor wire library can be plugged in behind the same traits.

pub mod registry;
pub mod wire;

use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::value::{ScalarValue, WireValue};

use registry::CommandRegistry;

/// Default probe command issued on every freshly opened socket.
pub const DEFAULT_PROBE_COMMAND: &str = "Bias_Get";

/// Pause between connect attempts against the same port.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Raw response envelope as decoded from the wire: controller error text
/// (empty means success) plus the payload list.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub error: String,
    pub payload: Vec<WireValue>,
}

/// The caller-facing response: command echo, resolved method name, ordered
/// payload, and the first payload element when it is the only one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub command: String,
    pub method: String,
    pub payload: Vec<WireValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<WireValue>,
}

/// Transport health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub connected: bool,
    pub endpoint: Option<String>,
    pub last_latency_ms: Option<f64>,
    pub details: serde_json::Value,
}

/// A live protocol session. Implementations are owned exclusively by the
/// [`TransportClient`]; no handle escapes its mutex.
pub trait Session: Send {
    fn call(&mut self, command: &str, args: &[(String, ScalarValue)]) -> Result<ResponseEnvelope>;
    fn endpoint(&self) -> &str;
    fn close(&mut self);
}

/// Opens sessions to one `(host, port)` endpoint.
pub trait SessionFactory: Send + Sync {
    fn open(&self, host: &str, port: u16, timeout: Duration) -> Result<Box<dyn Session>>;
    fn backend_name(&self) -> &str;
    fn version_string(&self) -> String;
}

/// Connection settings for the transport client.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub ports: Vec<u16>,
    pub timeout_s: f64,
    pub retry_count: u32,
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::invalid_argument("host cannot be empty"));
        }
        if self.ports.is_empty() {
            return Err(BridgeError::invalid_argument("at least one port is required"));
        }
        if self.timeout_s <= 0.0 {
            return Err(BridgeError::invalid_argument("timeout must be positive"));
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

struct ClientState {
    session: Option<Box<dyn Session>>,
    active_port: Option<u16>,
    last_latency_ms: Option<f64>,
    last_error: Option<String>,
}

/// Single-connection, mutex-serialized transport client.
pub struct TransportClient {
    settings: ConnectionSettings,
    registry: CommandRegistry,
    probe_command: String,
    factory: Box<dyn SessionFactory>,
    state: Mutex<ClientState>,
}

impl TransportClient {
    pub fn new(
        settings: ConnectionSettings,
        registry: CommandRegistry,
        factory: Box<dyn SessionFactory>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            registry,
            probe_command: DEFAULT_PROBE_COMMAND.to_owned(),
            factory,
            state: Mutex::new(ClientState {
                session: None,
                active_port: None,
                last_latency_ms: None,
                last_error: None,
            }),
        })
    }

    #[must_use]
    pub fn with_probe_command(mut self, command: impl Into<String>) -> Self {
        self.probe_command = command.into();
        self
    }

    /// `host:port` of the active session, if connected.
    pub fn endpoint(&self) -> Option<String> {
        let state = self.state.lock();
        state.active_port.map(|port| format!("{}:{port}", self.settings.host))
    }

    /// Establish a session, walking the candidate ports in order.
    ///
    /// Each port gets `retry_count + 1` attempts; a freshly opened socket
    /// is only adopted after the probe command succeeds on it. No-op when
    /// already connected.
    pub fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.session.is_some() {
            return Ok(());
        }
        self.connect_locked(&mut state)
    }

    /// Drop the active session. Idempotent; safe from any state.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Some(mut session) = state.session.take() {
            session.close();
        }
        state.active_port = None;
    }

    /// Issue one command with a typed argument map.
    ///
    /// Connects implicitly from the disconnected state. Network-layer
    /// failures (`ConnectionError`, `TimeoutError`) trigger a reconnect and
    /// a retry, up to `retry_count + 1` attempts in total; every other
    /// error surfaces on the first failure.
    pub fn call(
        &self,
        command: &str,
        args: &IndexMap<String, ScalarValue>,
    ) -> Result<CommandResponse> {
        let normalized = self.registry.normalize_args(command, args)?;
        let resolved = self.registry.resolve(command)?.name.clone();

        let mut state = self.state.lock();
        if state.session.is_none() {
            self.connect_locked(&mut state)?;
        }

        let attempts = self.settings.retry_count + 1;
        for attempt in 1..=attempts {
            let call_start = Instant::now();
            let outcome = match state.session.as_mut() {
                Some(session) => session.call(&resolved, &normalized),
                None => Err(BridgeError::connection("session lost before call")),
            };
            match outcome {
                Ok(envelope) => {
                    state.last_latency_ms = Some(call_start.elapsed().as_secs_f64() * 1000.0);
                    let result = finish_response(command, &resolved, envelope);
                    state.last_error = match &result {
                        Ok(_) => None,
                        Err(err) => Some(err.to_string()),
                    };
                    return result;
                }
                Err(err) if err.is_retryable() => {
                    state.last_error = Some(err.to_string());
                    warn!(command, attempt, err = %err, "transport call failed");
                    if attempt >= attempts {
                        return Err(err);
                    }
                    if let Some(mut session) = state.session.take() {
                        session.close();
                    }
                    state.active_port = None;
                    self.connect_locked(&mut state)?;
                }
                Err(err) => {
                    state.last_error = Some(err.to_string());
                    return Err(err);
                }
            }
        }

        Err(BridgeError::connection("command retry loop exited unexpectedly"))
    }

    /// Sorted unique command names declared in the manifest.
    pub fn available_commands(&self) -> Vec<String> {
        self.registry.command_names()
    }

    /// Human-readable backend tag.
    pub fn version(&self) -> String {
        self.factory.version_string()
    }

    pub fn health(&self) -> Health {
        let state = self.state.lock();
        let endpoint =
            state.active_port.map(|port| format!("{}:{port}", self.settings.host));
        Health {
            connected: state.session.is_some(),
            endpoint,
            last_latency_ms: state.last_latency_ms,
            details: serde_json::json!({
                "backend": self.factory.backend_name(),
                "host": self.settings.host,
                "candidate_ports": self.settings.ports,
                "active_port": state.active_port,
                "retry_count": self.settings.retry_count,
                "timeout_s": self.settings.timeout_s,
                "last_error": state.last_error,
            }),
        }
    }

    fn connect_locked(&self, state: &mut ClientState) -> Result<()> {
        let attempts_per_port = self.settings.retry_count + 1;
        let timeout = self.settings.timeout();
        let mut failures: Vec<String> = Vec::new();

        let probe_args = self
            .registry
            .normalize_args(&self.probe_command, &IndexMap::new())
            .unwrap_or_default();

        for &port in &self.settings.ports {
            for attempt in 1..=attempts_per_port {
                let attempt_start = Instant::now();
                match self.try_port(port, timeout, &probe_args) {
                    Ok(session) => {
                        let latency_ms = attempt_start.elapsed().as_secs_f64() * 1000.0;
                        info!(
                            endpoint = session.endpoint(),
                            latency_ms,
                            "controller session established"
                        );
                        state.session = Some(session);
                        state.active_port = Some(port);
                        state.last_latency_ms = Some(latency_ms);
                        state.last_error = None;
                        return Ok(());
                    }
                    Err(err) => {
                        state.last_error = Some(err.to_string());
                        if !probe_failure_moves_on(&err) {
                            return Err(err);
                        }
                        debug!(
                            host = %self.settings.host,
                            port,
                            attempt,
                            err = %err,
                            "connect attempt failed"
                        );
                        failures.push(format!(
                            "{}:{port} attempt {attempt}: {err}",
                            self.settings.host
                        ));
                        if attempt < attempts_per_port {
                            thread::sleep(RETRY_PAUSE);
                        }
                    }
                }
            }
        }

        let summary = if failures.is_empty() {
            "no attempts were made".to_owned()
        } else {
            let tail = failures.len().saturating_sub(5);
            failures[tail..].join(" | ")
        };
        Err(BridgeError::connection(format!(
            "failed to connect to {} on ports {:?}; last failures: {summary}",
            self.settings.host, self.settings.ports
        )))
    }

    /// Open a socket to one port and validate it with the probe command.
    fn try_port(
        &self,
        port: u16,
        timeout: Duration,
        probe_args: &[(String, ScalarValue)],
    ) -> Result<Box<dyn Session>> {
        let mut session = self.factory.open(&self.settings.host, port, timeout)?;
        match session.call(&self.probe_command, probe_args) {
            Ok(envelope) if envelope.error.is_empty() => Ok(session),
            Ok(envelope) => {
                session.close();
                Err(BridgeError::Controller {
                    command: self.probe_command.clone(),
                    message: envelope.error,
                })
            }
            Err(err) => {
                session.close();
                Err(err)
            }
        }
    }
}

/// Probe failures that reject the socket and move on to the next attempt.
///
/// A controller that refuses or garbles the probe is structural; those
/// errors propagate instead.
fn probe_failure_moves_on(err: &BridgeError) -> bool {
    matches!(
        err,
        BridgeError::Connection(_) | BridgeError::Timeout(_) | BridgeError::CommandUnavailable(_)
    )
}

fn finish_response(
    command: &str,
    method: &str,
    envelope: ResponseEnvelope,
) -> Result<CommandResponse> {
    if !envelope.error.is_empty() {
        return Err(BridgeError::Controller {
            command: command.to_owned(),
            message: envelope.error,
        });
    }
    let value = if envelope.payload.len() == 1 {
        envelope.payload.first().cloned()
    } else {
        None
    };
    Ok(CommandResponse {
        command: command.to_owned(),
        method: method.to_owned(),
        payload: envelope.payload,
        value,
    })
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
