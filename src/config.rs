//! Configuration module for meshcheck.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::report::ReportFormat;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 5000)
    pub http_port: u16,
    /// Root directory for report files (default: "reports")
    pub reports_dir: PathBuf,
    /// Directory for run logs (default: "logs")
    pub logs_dir: PathBuf,
    /// JSON device list; the built-in deployment is used when unset
    pub roster_path: Option<PathBuf>,
    pub ping_cmd: String,
    pub coap_cmd: String,
    /// Border router CLI queried for the mesh topology
    pub topology_cmd: String,
    pub topology_timeout: Duration,
    /// Formats written for every finished run (default: txt,json)
    pub report_formats: Vec<ReportFormat>,
    /// Recheck interval of a paused run (default: 500ms)
    pub pause_poll: Duration,
    /// Only one run at a time across all test types (default: false)
    pub exclusive_runs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 5000,
            reports_dir: PathBuf::from("reports"),
            logs_dir: PathBuf::from("logs"),
            roster_path: None,
            ping_cmd: "ping".to_string(),
            coap_cmd: "coap-client-notls".to_string(),
            topology_cmd: "wsbrd_cli".to_string(),
            topology_timeout: Duration::from_secs(30),
            report_formats: vec![ReportFormat::Txt, ReportFormat::Json],
            pause_poll: Duration::from_millis(500),
            exclusive_runs: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MESHCHECK_HTTP_PORT`: HTTP port (default: 5000)
    /// - `MESHCHECK_REPORTS_DIR`: report root (default: "reports")
    /// - `MESHCHECK_LOGS_DIR`: run log directory (default: "logs")
    /// - `MESHCHECK_ROSTER_PATH`: JSON roster file (default: built-in roster)
    /// - `MESHCHECK_PING_CMD`: ping executable (default: "ping")
    /// - `MESHCHECK_COAP_CMD`: CoAP client executable (default: "coap-client-notls")
    /// - `MESHCHECK_TOPOLOGY_CMD`: border router CLI (default: "wsbrd_cli")
    /// - `MESHCHECK_TOPOLOGY_TIMEOUT`: seconds (default: 30)
    /// - `MESHCHECK_REPORT_FORMATS`: comma separated list of txt, json, csv (default: "txt,json")
    /// - `MESHCHECK_PAUSE_POLL_MS`: milliseconds (default: 500)
    /// - `MESHCHECK_EXCLUSIVE_RUNS`: true/false (default: false)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let var = |name: &str| lookup(&format!("MESHCHECK_{}", name));

        if let Some(port) = var("HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }
        if let Some(dir) = var("REPORTS_DIR") {
            cfg.reports_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("LOGS_DIR") {
            cfg.logs_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("ROSTER_PATH").filter(|s| !s.is_empty()) {
            cfg.roster_path = Some(PathBuf::from(path));
        }
        if let Some(cmd) = var("PING_CMD") {
            cfg.ping_cmd = cmd;
        }
        if let Some(cmd) = var("COAP_CMD") {
            cfg.coap_cmd = cmd;
        }
        if let Some(cmd) = var("TOPOLOGY_CMD") {
            cfg.topology_cmd = cmd;
        }
        if let Some(secs) = var("TOPOLOGY_TIMEOUT").and_then(|s| s.parse().ok()) {
            cfg.topology_timeout = Duration::from_secs(secs);
        }
        if let Some(list) = var("REPORT_FORMATS") {
            match ReportFormat::parse_list(&list) {
                Ok(formats) if !formats.is_empty() => cfg.report_formats = formats,
                Ok(_) => tracing::warn!("MESHCHECK_REPORT_FORMATS is empty, keeping defaults"),
                Err(e) => tracing::warn!("Ignoring MESHCHECK_REPORT_FORMATS: {}", e),
            }
        }
        if let Some(ms) = var("PAUSE_POLL_MS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.pause_poll = Duration::from_millis(ms.max(1));
        }
        if let Some(flag) = var("EXCLUSIVE_RUNS") {
            cfg.exclusive_runs = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}
