// SPDX-License-Identifier: BUSL-1.1
// Copyright 2026 Alfred Jean LLC

//! Unified error taxonomy shared across the transport, policy, instrument,
//! monitor and store layers.
//!
//! Each kind maps to one process exit bucket at the CLI boundary. The
//! buckets are part of the external contract: scripts driving the bridge
//! dispatch on them.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// A write request breached a channel limit (bounds, step, slew,
    /// cooldown, ramp disabled, writes disabled). Never retried.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Unknown argument key, missing required key, or failed coercion.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named parameter is not declared in the manifest.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// The parameter has no read command.
    #[error("parameter not readable: {0}")]
    NotReadable(String),

    /// The parameter has no write command.
    #[error("parameter not writable: {0}")]
    NotWritable(String),

    /// No such wire command. Structural; never retried.
    #[error("command unavailable: {0}")]
    CommandUnavailable(String),

    /// The controller accepted the command and refused it.
    #[error("controller error for command '{command}': {message}")]
    Controller { command: String, message: String },

    /// Malformed frame, out-of-range payload index, or a non-list payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level failure. Retried once inside the transport.
    #[error("connection error: {0}")]
    Connection(String),

    /// Socket operation exceeded the configured timeout. Retried once
    /// inside the transport.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Manifest document violates the schema. `path` names the offending
    /// node, e.g. `parameters.bias_v.safety.max_step`.
    #[error("schema error at {path}: {message}")]
    Schema { path: String, message: String },

    /// Store invariant failure (foreign key, uniqueness, schema mismatch).
    #[error("store error: {0}")]
    Store(String),
}

/// Machine-readable error kind, used for exit codes, monitor error rows
/// and JSON error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PolicyViolation,
    InvalidArgument,
    UnknownParameter,
    NotReadable,
    NotWritable,
    CommandUnavailable,
    ControllerError,
    ProtocolError,
    ConnectionError,
    TimeoutError,
    SchemaError,
    StoreError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnknownParameter => "UNKNOWN_PARAMETER",
            Self::NotReadable => "NOT_READABLE",
            Self::NotWritable => "NOT_WRITABLE",
            Self::CommandUnavailable => "COMMAND_UNAVAILABLE",
            Self::ControllerError => "CONTROLLER_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::SchemaError => "SCHEMA_ERROR",
            Self::StoreError => "STORE_ERROR",
        }
    }

    /// Process exit bucket for thin driver shims.
    ///
    /// 0 = ok, 2 = invalid input, 3 = policy violation, 4 = command
    /// unavailable, 5 = connection failure, 1 = everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PolicyViolation => 3,
            Self::InvalidArgument
            | Self::UnknownParameter
            | Self::NotReadable
            | Self::NotWritable
            | Self::SchemaError => 2,
            Self::CommandUnavailable => 4,
            Self::ConnectionError | Self::TimeoutError => 5,
            Self::ControllerError | Self::ProtocolError | Self::StoreError => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PolicyViolation(_) => ErrorKind::PolicyViolation,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::UnknownParameter(_) => ErrorKind::UnknownParameter,
            Self::NotReadable(_) => ErrorKind::NotReadable,
            Self::NotWritable(_) => ErrorKind::NotWritable,
            Self::CommandUnavailable(_) => ErrorKind::CommandUnavailable,
            Self::Controller { .. } => ErrorKind::ControllerError,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::Connection(_) => ErrorKind::ConnectionError,
            Self::Timeout(_) => ErrorKind::TimeoutError,
            Self::Schema { .. } => ErrorKind::SchemaError,
            Self::Store(_) => ErrorKind::StoreError,
        }
    }

    /// True for the network-layer kinds the transport retries after a
    /// reconnect. Everything else surfaces on the first failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema { path: path.into(), message: message.into() }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
