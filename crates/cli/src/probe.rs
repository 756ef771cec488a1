// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TCP port probe: figure out which candidate ports a controller answers
//! on before committing to a session.
//!
//! Pure connect probing: latency per attempt, candidate selection and a
//! recommended port. The command-level validation of a freshly opened
//! socket lives in the transport's connect path, not here.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{BridgeError, Result};

/// Probe outcome for one port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortProbeResult {
    pub host: String,
    pub port: u16,
    pub attempts: u32,
    pub success_count: u32,
    pub median_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub last_error: Option<String>,
}

impl PortProbeResult {
    pub fn open(&self) -> bool {
        self.success_count > 0
    }
}

/// Full probe report over a candidate port list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub host: String,
    pub ports: Vec<u16>,
    pub timeout_s: f64,
    pub attempts: u32,
    pub generated_utc: String,
    pub results: Vec<PortProbeResult>,
    pub candidate_ports: Vec<u16>,
    pub recommended_port: Option<u16>,
}

/// Parse a port list: comma-separated tokens, each a single port or an
/// inclusive `start-end` range. The result is sorted and deduplicated.
pub fn parse_ports(value: &str) -> Result<Vec<u16>> {
    let tokens: Vec<&str> = value.split(',').map(str::trim).filter(|t| !t.is_empty()).collect();
    if tokens.is_empty() {
        return Err(BridgeError::invalid_argument("at least one TCP port must be provided"));
    }

    let mut ports = Vec::new();
    for token in tokens {
        match token.split_once('-') {
            None => ports.push(parse_port(token)?),
            Some((left, right)) => {
                let start = parse_port(left.trim())?;
                let end = parse_port(right.trim())?;
                if start > end {
                    return Err(BridgeError::invalid_argument(format!(
                        "invalid TCP port range: {token}"
                    )));
                }
                ports.extend(start..=end);
            }
        }
    }

    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

fn parse_port(token: &str) -> Result<u16> {
    let port: u32 = token
        .parse()
        .map_err(|_| BridgeError::invalid_argument(format!("invalid TCP port: {token}")))?;
    if port == 0 || port > 65535 {
        return Err(BridgeError::invalid_argument(format!("invalid TCP port: {port}")));
    }
    Ok(port as u16)
}

/// Probe every candidate port `attempts` times and rank the results.
pub fn probe_host_ports(
    host: &str,
    ports: &[u16],
    timeout_s: f64,
    attempts: u32,
) -> Result<ProbeReport> {
    let host = host.trim();
    if host.is_empty() {
        return Err(BridgeError::invalid_argument("host cannot be empty"));
    }
    if timeout_s <= 0.0 {
        return Err(BridgeError::invalid_argument("timeout must be positive"));
    }
    if attempts < 1 {
        return Err(BridgeError::invalid_argument("attempts must be at least 1"));
    }
    if ports.is_empty() {
        return Err(BridgeError::invalid_argument("at least one TCP port must be provided"));
    }

    let timeout = Duration::from_secs_f64(timeout_s);
    let results: Vec<PortProbeResult> =
        ports.iter().map(|&port| probe_single_port(host, port, timeout, attempts)).collect();

    let candidate_ports: Vec<u16> =
        results.iter().filter(|r| r.open()).map(|r| r.port).collect();
    let recommended_port = select_recommended_port(&results, &candidate_ports);

    Ok(ProbeReport {
        host: host.to_owned(),
        ports: ports.to_vec(),
        timeout_s,
        attempts,
        generated_utc: chrono::Utc::now()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        results,
        candidate_ports,
        recommended_port,
    })
}

/// Rank candidates by fewest failures, then median latency, then port
/// number.
pub fn select_recommended_port(
    results: &[PortProbeResult],
    candidate_ports: &[u16],
) -> Option<u16> {
    candidate_ports.iter().copied().min_by(|a, b| {
        let ka = recommendation_key(results, *a);
        let kb = recommendation_key(results, *b);
        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn recommendation_key(results: &[PortProbeResult], port: u16) -> (u32, f64, u16) {
    match results.iter().find(|r| r.port == port) {
        Some(result) => (
            result.attempts - result.success_count,
            result.median_latency_ms.unwrap_or(f64::INFINITY),
            port,
        ),
        None => (u32::MAX, f64::INFINITY, port),
    }
}

fn probe_single_port(host: &str, port: u16, timeout: Duration, attempts: u32) -> PortProbeResult {
    let mut latencies_ms: Vec<f64> = Vec::new();
    let mut last_error = None;

    for _ in 0..attempts {
        let start = Instant::now();
        match connect_once(host, port, timeout) {
            Ok(()) => {
                latencies_ms.push(start.elapsed().as_secs_f64() * 1000.0);
                last_error = None;
            }
            Err(e) => last_error = Some(e),
        }
    }

    latencies_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median_latency_ms = median(&latencies_ms);
    let min_latency_ms = latencies_ms.first().copied();
    let max_latency_ms = latencies_ms.last().copied();

    PortProbeResult {
        host: host.to_owned(),
        port,
        attempts,
        success_count: latencies_ms.len() as u32,
        median_latency_ms,
        min_latency_ms,
        max_latency_ms,
        last_error,
    }
}

fn connect_once(host: &str, port: u16, timeout: Duration) -> std::result::Result<(), String> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("resolve: {e}"))?
        .next()
        .ok_or_else(|| format!("no address resolved for {host}:{port}"))?;
    TcpStream::connect_timeout(&addr, timeout).map(drop).map_err(|e| e.to_string())
}

fn median(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Fixed-width text rendering for the CLI.
pub fn format_report_text(report: &ProbeReport) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Probe target      : {}", report.host));
    lines.push(format!(
        "Ports tested      : {}",
        report.ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
    ));
    lines.push(format!("Timeout (s)       : {}", report.timeout_s));
    lines.push(format!("Attempts per port : {}", report.attempts));
    lines.push(format!("Generated (UTC)   : {}", report.generated_utc));
    lines.push("-".to_owned());
    lines.push("PORT  STATE   OK/TRY  LAT(ms)  DETAIL".to_owned());

    for result in &report.results {
        let state = if result.open() { "OPEN" } else { "CLOSED" };
        let ratio = format!("{}/{}", result.success_count, result.attempts);
        let latency = result
            .median_latency_ms
            .map_or_else(|| "-".to_owned(), |ms| format!("{ms:.2}"));
        let detail = result.last_error.as_deref().unwrap_or("tcp-connect-ok");
        lines.push(format!(
            "{:<5} {state:<7} {ratio:<7} {latency:>7}  {detail}",
            result.port
        ));
    }

    lines.push("-".to_owned());
    lines.push(format!(
        "Candidate ports   : {}",
        if report.candidate_ports.is_empty() {
            "none".to_owned()
        } else {
            report.candidate_ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
        }
    ));
    lines.push(format!(
        "Recommended port  : {}",
        report.recommended_port.map_or_else(|| "none".to_owned(), |p| p.to_string())
    ));
    lines.join("\n")
}

#[cfg(test)]
#[path = "probe_tests.rs"]
mod tests;
