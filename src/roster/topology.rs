//! Mesh topology from the border router's `wsbrd_cli status` output.
//!
//! The status dump starts with `key: value` properties, then the key groups
//! (`GAK[0]`, `GTK[1]`, `LGTK[0]`, ...), then the routing tree: the border router on its
//! own line followed by one line per node, indented below its parent.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv6Addr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use super::normalize_address;

/// Topology error types.
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("failed to run {0}: {1}")]
    Command(String, String),
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("cannot parse topology: {0}")]
    Parse(String),
}

/// Parsed routing tree of the mesh.
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    pub fetched_at: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
    pub root: String,
    /// (parent, child) pairs in output order.
    pub edges: Vec<(String, String)>,
    /// Normalized address -> hops from the border router.
    pub hop_counts: HashMap<String, u32>,
}

impl Topology {
    pub fn hop_count(&self, address: &str) -> Option<u32> {
        self.hop_counts.get(&normalize_address(address)).copied()
    }

    /// Number of nodes below the border router.
    pub fn device_count(&self) -> usize {
        self.hop_counts.len().saturating_sub(1)
    }
}

/// Parse a `wsbrd_cli status` dump.
pub fn parse_topology(output: &str) -> Result<Topology, TopologyError> {
    static PROPERTY: OnceLock<Regex> = OnceLock::new();
    let property = PROPERTY.get_or_init(|| Regex::new(r"^(\w+):\s+(.*)$").unwrap());

    static KEY_GROUP: OnceLock<Regex> = OnceLock::new();
    let key_group = KEY_GROUP.get_or_init(|| Regex::new(r"^\s*(?:GAK|GTK|LGAK|LGTK)\[\d+\]:").unwrap());

    let lines: Vec<&str> = output.lines().collect();
    let tree_start = lines
        .iter()
        .rposition(|line| key_group.is_match(line))
        .map(|i| i + 1)
        .ok_or_else(|| TopologyError::Parse("no key group lines found".to_string()))?;

    let mut properties = BTreeMap::new();
    for line in &lines[..tree_start] {
        if key_group.is_match(line) {
            continue;
        }
        if let Some(caps) = property.captures(line.trim()) {
            properties.insert(caps[1].to_string(), caps[2].trim().to_string());
        }
    }

    let mut nodes = lines[tree_start..]
        .iter()
        .filter_map(|line| find_address(line));

    let (_, root) = nodes
        .next()
        .ok_or_else(|| TopologyError::Parse("no border router in tree".to_string()))?;

    let mut hop_counts = HashMap::new();
    hop_counts.insert(normalize_address(&root), 0);

    // Ancestors of the current line, with the column their address starts at.
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut edges = Vec::new();

    for (column, addr) in nodes {
        while stack.last().is_some_and(|(c, _)| *c >= column) {
            stack.pop();
        }
        let parent = stack.last().map(|(_, a)| a.clone()).unwrap_or_else(|| root.clone());
        let hops = stack.len() as u32 + 1;

        hop_counts.entry(normalize_address(&addr)).or_insert(hops);
        edges.push((parent, addr.clone()));
        stack.push((column, addr));
    }

    Ok(Topology {
        fetched_at: Utc::now(),
        properties,
        root,
        edges,
        hop_counts,
    })
}

/// Locate the IPv6 address on a tree line, returning its column and text.
fn find_address(line: &str) -> Option<(usize, String)> {
    let mut offset = 0;
    for token in line.split_whitespace() {
        let column = offset + line[offset..].find(token)?;
        offset = column + token.len();

        let candidate = token.trim_matches(|c: char| !(c.is_ascii_hexdigit() || c == ':'));
        if candidate.contains(':') && candidate.parse::<Ipv6Addr>().is_ok() {
            return Some((column, candidate.to_string()));
        }
    }
    None
}

/// Fetches the topology by running the border router CLI.
#[derive(Debug, Clone)]
pub struct TopologySource {
    command: String,
    timeout: Duration,
}

impl TopologySource {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    /// Raw `status` output.
    pub async fn status_output(&self) -> Result<String, TopologyError> {
        let run = Command::new(&self.command)
            .arg("status")
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| TopologyError::Timeout(self.command.clone(), self.timeout))?
            .map_err(|e| TopologyError::Command(self.command.clone(), e.to_string()))?;

        if !output.status.success() {
            return Err(TopologyError::Command(
                self.command.clone(),
                format!(
                    "exit status {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn fetch(&self) -> Result<Topology, TopologyError> {
        let output = self.status_output().await?;
        let topology = parse_topology(&output)?;
        tracing::info!(
            "Topology: {} nodes below border router {}",
            topology.device_count(),
            topology.root
        );
        Ok(topology)
    }
}
