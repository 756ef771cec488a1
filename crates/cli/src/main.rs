// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thin CLI shim over the bridge library.
//!
//! Every subcommand prints one JSON document to stdout and exits with the
//! error-kind bucket: 0 ok, 2 invalid input, 3 policy violation, 4 command
//! unavailable, 5 connection failure, 1 everything else.

use std::sync::Arc;

use clap::Parser;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::error;

use spmbridge::config::Config;
use spmbridge::error::{BridgeError, Result};
use spmbridge::instrument::{Instrument, ScanFrameState};
use spmbridge::journal::Journal;
use spmbridge::manifest::load_manifest;
use spmbridge::monitor::{run_monitor, MonitorConfig};
use spmbridge::policy::WritePolicy;
use spmbridge::probe::{format_report_text, parse_ports, probe_host_ports};
use spmbridge::transport::registry::CommandRegistry;
use spmbridge::transport::{wire::TcpSessionFactory, TransportClient};
use spmbridge::value::ScalarValue;

#[derive(Parser)]
#[command(
    name = "spmbridge",
    version,
    about = "Control and observation bridge for a scanning-probe microscope controller."
)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Read one manifest parameter.
    Get { name: String },
    /// Guarded single-step write.
    Set {
        name: String,
        target: f64,
        #[arg(long)]
        interval_s: Option<f64>,
    },
    /// Guarded staircase ramp.
    Ramp {
        name: String,
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
        #[arg(long)]
        step: f64,
        #[arg(long)]
        interval_s: Option<f64>,
    },
    /// Execute a manifest action. Arguments as key=value pairs.
    Action {
        name: String,
        #[arg(long)]
        plan_only: bool,
        args: Vec<String>,
    },
    /// Move the scan frame under guard: cx cy width height angle.
    FrameSet {
        center_x_m: f64,
        center_y_m: f64,
        width_m: f64,
        height_m: f64,
        angle_deg: f64,
    },
    /// List declared wire commands.
    Commands {
        #[arg(long)]
        r#match: Option<String>,
    },
    /// Transport health snapshot.
    Health,
    /// Probe candidate TCP ports without opening a session.
    Probe {
        #[arg(long)]
        attempts: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Run the trajectory monitor for a bounded number of iterations.
    MonitorRun {
        #[arg(long)]
        run_name: String,
        #[arg(long)]
        iterations: u64,
        #[arg(long, default_value = "1.0")]
        interval_s: f64,
        #[arg(long, default_value = "500")]
        rotate_entries: u32,
        #[arg(long, default_value = "2.5")]
        action_window_s: f64,
        /// Signal labels, repeatable.
        #[arg(long = "signal")]
        signals: Vec<String>,
        /// Spec labels, repeatable.
        #[arg(long = "spec")]
        specs: Vec<String>,
        #[arg(long, default_value = "artifacts/trajectory")]
        db_directory: String,
        #[arg(long, default_value = "trajectory.sqlite3")]
        db_name: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_format, &cli.config.log_level);

    match run(cli) {
        Ok(output) => {
            println!("{output}");
            std::process::exit(0);
        }
        Err(err) => {
            error!(kind = %err.kind(), "{err}");
            println!("{}", error_json(&err));
            std::process::exit(err.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<String> {
    match cli.subcommand {
        Commands::Probe { attempts, json } => {
            let ports = parse_ports(&cli.config.ports)?;
            let report = probe_host_ports(
                &cli.config.host,
                &ports,
                cli.config.timeout_s,
                attempts.unwrap_or(1),
            )?;
            if json {
                to_json(&report)
            } else {
                Ok(format_report_text(&report))
            }
        }
        ref subcommand => {
            let instrument = build_instrument(&cli.config)?;
            let output = dispatch(&instrument, subcommand);
            instrument.close();
            output
        }
    }
}

fn dispatch(instrument: &Instrument, command: &Commands) -> Result<String> {
    match command {
        Commands::Get { name } => {
            let value = instrument.get(name)?;
            to_json(&serde_json::json!({ "parameter": name, "value": value.to_json() }))
        }
        Commands::Set { name, target, interval_s } => {
            let report = instrument.set_single_step(name, *target, *interval_s)?;
            to_json(&report)
        }
        Commands::Ramp { name, start, end, step, interval_s } => {
            let report = instrument.ramp(name, *start, *end, *step, *interval_s)?;
            to_json(&report)
        }
        Commands::Action { name, plan_only, args } => {
            let args = parse_key_value_args(args)?;
            let outcome = instrument.execute_action(name, &args, *plan_only)?;
            to_json(&outcome)
        }
        Commands::FrameSet { center_x_m, center_y_m, width_m, height_m, angle_deg } => {
            let report = instrument.set_scan_frame(ScanFrameState {
                center_x_m: *center_x_m,
                center_y_m: *center_y_m,
                width_m: *width_m,
                height_m: *height_m,
                angle_deg: *angle_deg,
            })?;
            to_json(&report)
        }
        Commands::Commands { r#match } => {
            to_json(&instrument.available_commands(r#match.as_deref()))
        }
        Commands::Health => to_json(&instrument.health()),
        Commands::MonitorRun {
            run_name,
            iterations,
            interval_s,
            rotate_entries,
            action_window_s,
            signals,
            specs,
            db_directory,
            db_name,
        } => {
            let config = MonitorConfig {
                run_name: run_name.clone(),
                interval_s: *interval_s,
                rotate_entries: *rotate_entries,
                action_window_s: *action_window_s,
                signal_labels: signals.clone(),
                spec_labels: specs.clone(),
                db_directory: db_directory.clone(),
                db_name: db_name.clone(),
            };
            let summary =
                run_monitor(instrument, &config, *iterations, CancellationToken::new())?;
            to_json(&summary)
        }
        Commands::Probe { .. } => {
            Err(BridgeError::invalid_argument("probe does not use a session"))
        }
    }
}

fn build_instrument(config: &Config) -> Result<Instrument> {
    let manifest_text = std::fs::read_to_string(&config.manifest).map_err(|e| {
        BridgeError::invalid_argument(format!(
            "cannot read manifest {}: {e}",
            config.manifest.display()
        ))
    })?;
    let manifest = load_manifest(&manifest_text)?;
    let registry = CommandRegistry::from_manifest(&manifest);
    let transport =
        TransportClient::new(config.connection()?, registry, Box::new(TcpSessionFactory))?;
    let policy = WritePolicy::from_manifest(config.allow_writes, config.dry_run, &manifest);

    let mut instrument = Instrument::new(manifest, transport, policy);
    if !config.journal_dir.trim().is_empty() {
        let journal = Journal::start(config.journal_dir.trim(), 2048, 5000)?;
        instrument = instrument.with_event_sink(Arc::new(journal));
    }
    Ok(instrument)
}

fn parse_key_value_args(args: &[String]) -> Result<IndexMap<String, ScalarValue>> {
    let mut parsed = IndexMap::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(BridgeError::invalid_argument(format!(
                "expected key=value, got '{arg}'"
            )));
        };
        parsed.insert(key.trim().to_owned(), ScalarValue::Str(value.trim().to_owned()));
    }
    Ok(parsed)
}

fn to_json(value: &impl serde::Serialize) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| BridgeError::protocol(format!("cannot serialize output: {e}")))
}

fn error_json(err: &BridgeError) -> String {
    serde_json::json!({
        "error": {
            "type": err.kind().as_str(),
            "message": err.to_string(),
        }
    })
    .to_string()
}

/// Initialize tracing. Uses `try_init` so it's safe to call multiple times
/// (e.g. from tests).
fn init_tracing(format: &str, level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("spmbridge={level}")));

    let _ = match format {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
}
