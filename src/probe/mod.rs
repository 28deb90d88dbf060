//! Probe module for device diagnostics.
//!
//! Supports ping and the four CoAP statistics queries.

mod coap;
mod ping;

pub use coap::*;
pub use ping::*;

use crate::catalog::{ProbeParams, TestType};
use crate::roster::Device;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Extra time granted to an external tool on top of its own timeout flag.
const COMMAND_GRACE: Duration = Duration::from_secs(5);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("required tool not found: {0}")]
    ToolMissing(String),
}

impl ProbeError {
    /// A systemic fault affects every device, so the run cannot continue.
    pub fn is_systemic(&self) -> bool {
        matches!(self, ProbeError::ToolMissing(_))
    }
}

/// Derived connection status of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Skipped,
    #[default]
    Unknown,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Skipped => "Skipped",
            ConnectionStatus::Unknown => "Unknown",
        }
    }
}

/// Outcome of one successful probe invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub status: ConnectionStatus,
    pub metrics: Map<String, Value>,
}

impl Measurement {
    pub fn new(status: ConnectionStatus, metrics: Map<String, Value>) -> Self {
        Self { status, metrics }
    }
}

/// Performs a single measurement against a single device.
///
/// Implementations hold no per-device connection state: the batch loop and a retest call
/// it the same way. The adapter, not the caller, bounds how long a probe may take.
#[async_trait]
pub trait ProbeAdapter: Send + Sync {
    async fn probe(
        &self,
        test_type: TestType,
        device: &Device,
        params: &ProbeParams,
    ) -> Result<Measurement, ProbeError>;
}

/// Names of the external tools used by [`CommandProbe`].
#[derive(Debug, Clone)]
pub struct ProbeCommands {
    pub ping: String,
    pub coap_client: String,
}

impl Default for ProbeCommands {
    fn default() -> Self {
        Self {
            ping: "ping".to_string(),
            coap_client: "coap-client-notls".to_string(),
        }
    }
}

/// Probe adapter backed by the `ping` and `coap-client` command line tools.
#[derive(Debug, Clone, Default)]
pub struct CommandProbe {
    commands: ProbeCommands,
}

impl CommandProbe {
    pub fn new(commands: ProbeCommands) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl ProbeAdapter for CommandProbe {
    async fn probe(
        &self,
        test_type: TestType,
        device: &Device,
        params: &ProbeParams,
    ) -> Result<Measurement, ProbeError> {
        match test_type {
            TestType::Ping => run_ping_probe(&self.commands.ping, &device.address, params).await,
            TestType::Rssi | TestType::Rpl | TestType::Disconnections | TestType::Availability => {
                run_coap_probe(&self.commands.coap_client, test_type, &device.address, params).await
            }
        }
    }
}

/// Run an external command, killing it if it outlives `budget`.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    budget: Duration,
) -> Result<Output, ProbeError> {
    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProbeError::ToolMissing(program.to_string())
            } else {
                ProbeError::Command(format!("failed to execute {}: {}", program, e))
            }
        })?;

    match tokio::time::timeout(budget, child.wait_with_output()).await {
        Ok(output) => output.map_err(|e| ProbeError::Command(format!("{} failed: {}", program, e))),
        Err(_) => Err(ProbeError::Timeout(budget)),
    }
}
