//! Device roster and mesh topology.

mod topology;

pub use topology::*;

use crate::catalog::TestType;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

/// Hop count used when a device is not in the topology.
pub const UNKNOWN_HOP_COUNT: i32 = -1;

/// Roster error types.
#[derive(Error, Debug)]
pub enum RosterError {
    #[error("failed to read roster file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid roster file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate device address in roster: {0}")]
    DuplicateAddress(String),
    #[error("roster is empty")]
    Empty,
}

/// A device being probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    pub label: String,
    pub hop_count: i32,
}

impl Device {
    pub fn new(label: &str, address: &str) -> Self {
        Self {
            address: address.to_string(),
            label: label.to_string(),
            hop_count: UNKNOWN_HOP_COUNT,
        }
    }
}

/// Canonical form of an address for comparisons.
///
/// IPv6 addresses are written in many equivalent ways (`FD12:3456::B635` vs
/// `fd12:3456:0:0::b635`), so parse them when possible.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim().trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

/// The ordered device list of one run.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub devices: Vec<Device>,
    /// Whether hop counts come from a live topology fetch.
    pub topology_known: bool,
}

impl Roster {
    pub fn position(&self, address: &str) -> Option<usize> {
        let wanted = normalize_address(address);
        self.devices
            .iter()
            .position(|d| normalize_address(&d.address) == wanted)
    }
}

/// Supplies the device list for a test type.
#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn roster(&self, test_type: TestType) -> Result<Roster, RosterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct RosterEntry {
    label: String,
    address: String,
}

/// Static device list decorated with live hop counts.
pub struct MeshRoster {
    devices: Vec<Device>,
    topology: Option<TopologySource>,
}

impl MeshRoster {
    pub fn new(devices: Vec<Device>, topology: Option<TopologySource>) -> Result<Self, RosterError> {
        if devices.is_empty() {
            return Err(RosterError::Empty);
        }

        let mut seen = HashSet::new();
        for device in &devices {
            if !seen.insert(normalize_address(&device.address)) {
                return Err(RosterError::DuplicateAddress(device.address.clone()));
            }
        }

        Ok(Self { devices, topology })
    }

    /// Load a roster from a JSON file of `{"label": .., "address": ..}` objects.
    pub fn load_devices<P: AsRef<Path>>(path: P) -> Result<Vec<Device>, RosterError> {
        let data = std::fs::read_to_string(path)?;
        let entries: Vec<RosterEntry> = serde_json::from_str(&data)?;
        Ok(entries
            .iter()
            .map(|e| Device::new(&e.label, &e.address))
            .collect())
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

#[async_trait]
impl RosterProvider for MeshRoster {
    async fn roster(&self, _test_type: TestType) -> Result<Roster, RosterError> {
        let topology = match &self.topology {
            Some(source) => match source.fetch().await {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!("Topology unavailable, hop counts unknown: {}", e);
                    None
                }
            },
            None => None,
        };

        let devices = self
            .devices
            .iter()
            .map(|d| Device {
                hop_count: topology
                    .as_ref()
                    .and_then(|t| t.hop_count(&d.address))
                    .map(|h| h as i32)
                    .unwrap_or(UNKNOWN_HOP_COUNT),
                ..d.clone()
            })
            .collect();

        Ok(Roster {
            devices,
            topology_known: topology.is_some(),
        })
    }
}

/// The FAN 1.1 FSK field deployment.
pub fn default_devices() -> Vec<Device> {
    [
        ("WN-L031-30", "FD12:3456::B635:22FF:FE98:2537"),
        ("WN-L032-30", "FD12:3456::B635:22FF:FE98:2523"),
        ("WN-L033-30", "FD12:3456::B635:22FF:FE98:252B"),
        ("WN-L034-30", "FD12:3456::62A4:23FF:FE37:A3B3"),
        ("WN-L035-30", "FD12:3456::B635:22FF:FE98:285B"),
        ("WN-L036-30", "FD12:3456::62A4:23FF:FE37:A3A1"),
        ("WN-L037-30", "FD12:3456::B635:22FF:FE98:2539"),
        ("WN-OF04-34", "FD12:3456::B635:22FF:FE98:285C"),
        ("WN-L050-30", "FD12:3456::92FD:9FFF:FEEE:9DF7"),
        ("WN-L051-30", "FD12:3456::B635:22FF:FE98:285D"),
        ("WN-L038-30", "FD12:3456::B635:22FF:FE98:253F"),
        ("WN-L039-30", "FD12:3456::62A4:23FF:FE37:A3A8"),
        ("WN-L040-30", "FD12:3456::B635:22FF:FE98:2541"),
        ("WN-L041-30", "FD12:3456::B635:22FF:FE98:2529"),
        ("WN-L042-30", "FD12:3456::62A4:23FF:FE37:A3AC"),
        ("WN-L043-30", "FD12:3456::62A4:23FF:FE37:A39F"),
        ("WN-L044-30", "FD12:3456::B635:22FF:FE98:2534"),
        ("WN-L045-30", "FD12:3456::B635:22FF:FE98:2524"),
        ("WN-L047-30", "FD12:3456::92FD:9FFF:FEEE:9D40"),
        ("WN-L048-30", "FD12:3456::B635:22FF:FE98:29A6"),
        ("WN-L052-30", "FD12:3456::62A4:23FF:FE37:A3AD"),
        ("WN-L053-30", "FD12:3456::B635:22FF:FE98:252C"),
        ("WN-L054-30", "FD12:3456::B635:22FF:FE98:251E"),
        ("WN-VA24-30", "FD12:3456::B635:22FF:FE98:253E"),
        ("WN-VA64-30", "FD12:3456::B635:22FF:FE98:285E"),
        ("WN-VC44-30", "FD12:3456::62A4:23FF:FE37:A3A9"),
        ("WN-NI04-34", "FD12:3456::62A4:23FF:FE37:A3AB"),
        ("WN-L059-34", "FD12:3456::B635:22FF:FE98:29A5"),
    ]
    .iter()
    .map(|(label, address)| Device::new(label, address))
    .collect()
}
