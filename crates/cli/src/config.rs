// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::error::Result;
use crate::probe::parse_ports;
use crate::transport::ConnectionSettings;

/// Control and observation bridge for a scanning-probe microscope
/// controller.
#[derive(Debug, Clone, Parser)]
#[command(name = "spmbridge", version, about)]
pub struct Config {
    /// Controller host.
    #[arg(long, env = "SPMBRIDGE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Candidate TCP ports: comma-separated, ranges allowed (6501-6504).
    #[arg(long, env = "SPMBRIDGE_PORTS", default_value = "3364,6501-6504")]
    pub ports: String,

    /// Per-attempt socket timeout in seconds.
    #[arg(long, env = "SPMBRIDGE_TIMEOUT_S", default_value = "2.0")]
    pub timeout_s: f64,

    /// Extra attempts per port and per command on network failures.
    #[arg(long, env = "SPMBRIDGE_RETRY_COUNT", default_value = "1")]
    pub retry_count: u32,

    /// Parameter/action manifest file.
    #[arg(long, env = "SPMBRIDGE_MANIFEST", default_value = "config/parameters.yaml")]
    pub manifest: PathBuf,

    /// Enable live writes. Off by default: every write is refused.
    #[arg(long, env = "SPMBRIDGE_ALLOW_WRITES")]
    pub allow_writes: bool,

    /// Plan writes without sending them (true|false).
    #[arg(
        long,
        env = "SPMBRIDGE_DRY_RUN",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub dry_run: bool,

    /// Journal directory for instrument events; empty disables the journal.
    #[arg(long, env = "SPMBRIDGE_JOURNAL_DIR", default_value = "")]
    pub journal_dir: String,

    /// Log format (json or text).
    #[arg(long, env = "SPMBRIDGE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SPMBRIDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate and resolve the connection settings.
    pub fn connection(&self) -> Result<ConnectionSettings> {
        let settings = ConnectionSettings {
            host: self.host.trim().to_owned(),
            ports: parse_ports(&self.ports)?,
            timeout_s: self.timeout_s,
            retry_count: self.retry_count,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
