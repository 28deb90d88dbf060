//! Ping probe implementation using the system `ping` command.
//!
//! Runs a multi-packet ping and reports the loss and round-trip statistics.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Map, Value};

use super::{run_command, ConnectionStatus, Measurement, ProbeError, COMMAND_GRACE};
use crate::catalog::ProbeParams;

/// Statistics parsed from a ping run. Round-trip times are in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStats {
    pub packets_transmitted: u32,
    pub packets_received: u32,
    pub packet_loss: f64,
    pub min_rtt: f64,
    pub avg_rtt: f64,
    pub max_rtt: f64,
    pub mdev: f64,
}

impl PingStats {
    /// Result recorded when ping produced nothing usable.
    pub fn failed(count: u32) -> Self {
        Self {
            packets_transmitted: count,
            packets_received: 0,
            packet_loss: 100.0,
            min_rtt: 0.0,
            avg_rtt: 0.0,
            max_rtt: 0.0,
            mdev: 0.0,
        }
    }

    pub fn into_measurement(self) -> Measurement {
        let status = if self.packets_received > 0 {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };

        let mut metrics = Map::new();
        metrics.insert("packets_tx".into(), json!(self.packets_transmitted));
        metrics.insert("packets_rx".into(), json!(self.packets_received));
        metrics.insert("loss_percent".into(), json!(self.packet_loss));
        for (key, value) in [
            ("min_rtt", self.min_rtt),
            ("avg_rtt", self.avg_rtt),
            ("max_rtt", self.max_rtt),
            ("mdev", self.mdev),
        ] {
            // Zero means "no sample" in ping's summary, show it as a dash.
            let value = if value > 0.0 { json!(value) } else { Value::String("-".into()) };
            metrics.insert(key.into(), value);
        }

        Measurement::new(status, metrics)
    }
}

/// Run a ping probe against the given address.
pub async fn run_ping_probe(
    program: &str,
    address: &str,
    params: &ProbeParams,
) -> Result<Measurement, ProbeError> {
    let count = params.packet_count.max(1);
    let args = vec![
        "-c".to_string(),
        count.to_string(),
        "-W".to_string(),
        params.timeout_secs.max(1).to_string(),
        address.to_string(),
    ];

    // ping sends one packet per second and waits up to -W for the last reply
    let budget = Duration::from_secs(u64::from(count) + params.timeout_secs) + COMMAND_GRACE;
    let output = run_command(program, &args, budget).await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stats = match parse_ping_output(&stdout) {
        Some(stats) => stats,
        None if output.status.success() => {
            return Err(ProbeError::Command(format!(
                "failed to parse ping output: {}",
                stdout
            )));
        }
        None => {
            tracing::debug!(
                "ping {} exited with {}: {}",
                address,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            PingStats::failed(count)
        }
    };

    Ok(stats.into_measurement())
}

/// Parse the summary block of ping output.
///
/// Returns `None` when the packet counter line is missing.
pub fn parse_ping_output(output: &str) -> Option<PingStats> {
    // Linux: "3 packets transmitted, 3 received, 0% packet loss, time 2003ms"
    // macOS: "3 packets transmitted, 3 packets received, 0.0% packet loss"
    static COUNTS: OnceLock<Regex> = OnceLock::new();
    let counts = COUNTS.get_or_init(|| {
        Regex::new(
            r"(?P<tx>\d+) packets transmitted, (?P<rx>\d+) (?:packets )?received,.*?(?P<loss>[0-9.]+)% packet loss",
        )
        .unwrap()
    });

    // Linux "rtt min/avg/max/mdev" and macOS "round-trip min/avg/max/stddev"
    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt = RTT.get_or_init(|| {
        Regex::new(
            r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)/([0-9.]+)",
        )
        .unwrap()
    });

    let caps = counts.captures(output)?;
    let mut stats = PingStats {
        packets_transmitted: caps["tx"].parse().ok()?,
        packets_received: caps["rx"].parse().ok()?,
        packet_loss: caps["loss"].parse().ok()?,
        min_rtt: 0.0,
        avg_rtt: 0.0,
        max_rtt: 0.0,
        mdev: 0.0,
    };

    if let Some(caps) = rtt.captures(output) {
        let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok()).unwrap_or(0.0);
        stats.min_rtt = field(1);
        stats.avg_rtt = field(2);
        stats.max_rtt = field(3);
        stats.mdev = field(4);
    }

    Some(stats)
}
