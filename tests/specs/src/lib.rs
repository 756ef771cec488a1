// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end bridge scenarios.
//!
//! Runs a scripted controller behind a real TCP listener speaking the
//! framed wire protocol, so the full stack (registry normalization,
//! codec, session mutex, reconnect-and-retry) is exercised over actual
//! sockets.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use spmbridge::instrument::Instrument;
use spmbridge::manifest::Manifest;
use spmbridge::policy::WritePolicy;
use spmbridge::test_support::{sample_manifest, SAMPLE_MANIFEST_YAML};
use spmbridge::transport::registry::CommandRegistry;
use spmbridge::transport::wire::{
    decode_request, encode_response, read_frame, write_frame, TcpSessionFactory,
};
use spmbridge::transport::{ConnectionSettings, TransportClient};
use spmbridge::value::{ScalarValue, WireValue};

/// What the scripted controller does with one command.
pub enum Handle {
    /// Success envelope with this payload.
    Reply(Vec<WireValue>),
    /// Envelope carrying a controller error string.
    Refuse(String),
    /// Drop the TCP connection without answering.
    Hangup,
}

type Handler = Box<dyn FnMut(&[(String, ScalarValue)]) -> Handle + Send>;

#[derive(Default)]
struct ControllerState {
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<(String, Vec<(String, ScalarValue)>)>>,
    connections: AtomicU32,
}

/// A scripted controller served over a real TCP listener.
pub struct WireController {
    port: u16,
    state: Arc<ControllerState>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl WireController {
    /// Bind an ephemeral port and start serving. Commands without a
    /// handler are refused with an `unknown command` controller error; the
    /// connect probe (`Bias_Get`) answers 0.0 by default.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(ControllerState::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        // Every controller answers the connect probe unless a test
        // replaces the handler.
        state
            .handlers
            .lock()
            .insert("Bias_Get".to_owned(), Box::new(|_| Handle::Reply(vec![WireValue::Float(0.0)])));

        let accept_state = Arc::clone(&state);
        let accept_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Ok(stream) = stream else { break };
                accept_state.connections.fetch_add(1, Ordering::Relaxed);
                let conn_state = Arc::clone(&accept_state);
                std::thread::spawn(move || serve_connection(stream, &conn_state));
            }
        });

        Self { port, state, shutdown, accept_thread: Some(handle) }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Install (or replace) the handler for one command.
    pub fn handle(
        &self,
        command: &str,
        handler: impl FnMut(&[(String, ScalarValue)]) -> Handle + Send + 'static,
    ) {
        self.state.handlers.lock().insert(command.to_owned(), Box::new(handler));
    }

    /// Fixed success payload for a command.
    pub fn reply(&self, command: &str, payload: Vec<WireValue>) {
        self.handle(command, move |_args| Handle::Reply(payload.clone()));
    }

    pub fn calls_for(&self, command: &str) -> Vec<Vec<(String, ScalarValue)>> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|(cmd, _)| cmd == command)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::Relaxed)
    }
}

impl Drop for WireController {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Poke the listener so the accept loop observes the flag.
        let _ = std::net::TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection(mut stream: std::net::TcpStream, state: &ControllerState) {
    loop {
        let Ok(body) = read_frame(&mut stream) else {
            return;
        };
        let Ok((command, args)) = decode_request(&body) else {
            return;
        };
        state.calls.lock().push((command.clone(), args.clone()));

        let outcome = match state.handlers.lock().get_mut(&command) {
            Some(handler) => handler(&args),
            None => Handle::Refuse(format!("unknown command {command}")),
        };
        let (error, payload) = match outcome {
            Handle::Reply(payload) => (String::new(), payload),
            Handle::Refuse(message) => (message, Vec::new()),
            Handle::Hangup => return,
        };
        let Ok(response) = encode_response(&error, &payload) else {
            return;
        };
        if write_frame(&mut stream, &response).is_err() {
            return;
        }
    }
}

/// Connection settings pointing at a started controller.
pub fn settings_for(ports: Vec<u16>) -> ConnectionSettings {
    ConnectionSettings {
        host: "127.0.0.1".to_owned(),
        ports,
        timeout_s: 2.0,
        retry_count: 1,
    }
}

/// Transport over real TCP against the sample manifest.
pub fn tcp_transport(ports: Vec<u16>) -> TransportClient {
    let registry = CommandRegistry::from_manifest(&sample_manifest());
    TransportClient::new(settings_for(ports), registry, Box::new(TcpSessionFactory))
        .expect("transport")
}

/// Full instrument over real TCP.
pub fn tcp_instrument(port: u16, allow_writes: bool, dry_run: bool) -> Instrument {
    let manifest = sample_manifest();
    let policy = WritePolicy::from_manifest(allow_writes, dry_run, &manifest);
    Instrument::new(manifest, tcp_transport(vec![port]), policy)
}

/// The manifest used across the specs, re-exported for assertions.
pub fn manifest() -> Manifest {
    sample_manifest()
}

pub fn manifest_yaml() -> &'static str {
    SAMPLE_MANIFEST_YAML
}
