//! Test catalog: the five diagnostic test types and their parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A diagnostic test type. Each has its own run slot in the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Ping,
    #[serde(alias = "rssl")]
    Rssi,
    Rpl,
    Disconnections,
    Availability,
}

impl TestType {
    pub const ALL: [TestType; 5] = [
        TestType::Ping,
        TestType::Rssi,
        TestType::Rpl,
        TestType::Disconnections,
        TestType::Availability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Ping => "ping",
            TestType::Rssi => "rssi",
            TestType::Rpl => "rpl",
            TestType::Disconnections => "disconnections",
            TestType::Availability => "availability",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TestType::Ping => "Ping Test",
            TestType::Rssi => "RSSI Test",
            TestType::Rpl => "RPL Rank Test",
            TestType::Disconnections => "Disconnections Test",
            TestType::Availability => "Availability Test",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TestType::Ping => "Test device connectivity using ICMP ping",
            TestType::Rssi => "Test signal strength (RSL In/Out) via CoAP",
            TestType::Rpl => "Test RPL rank information via CoAP",
            TestType::Disconnections => "Check disconnected totals via CoAP",
            TestType::Availability => "Check device availability via CoAP",
        }
    }

    /// Verb used in the one-line run summary ("devices reachable").
    pub fn success_verb(&self) -> &'static str {
        match self {
            TestType::Ping => "reachable",
            TestType::Availability => "available",
            _ => "responded",
        }
    }

    fn default_timeout_secs(&self) -> u64 {
        match self {
            TestType::Ping => 10,
            TestType::Rssi | TestType::Rpl => 100,
            TestType::Disconnections | TestType::Availability => 120,
        }
    }

    /// Parameter schema rendered by the dashboard.
    pub fn param_specs(&self) -> Vec<ParamSpec> {
        let timeout = ParamSpec {
            name: "timeout",
            label: "Timeout (seconds)",
            kind: "number",
            default: self.default_timeout_secs(),
            min: TIMEOUT_RANGE.0,
            max: TIMEOUT_RANGE.1,
        };

        match self {
            TestType::Ping => vec![
                ParamSpec {
                    name: "packet_count",
                    label: "Packet Count",
                    kind: "number",
                    default: 1,
                    min: PACKET_COUNT_RANGE.0 as u64,
                    max: PACKET_COUNT_RANGE.1 as u64,
                },
                timeout,
            ],
            _ => vec![timeout],
        }
    }

    /// Metric columns shown in reports, as (metrics key, column header).
    pub fn metric_columns(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            TestType::Ping => &[
                ("packets_tx", "Packets TX"),
                ("packets_rx", "Packets RX"),
                ("loss_percent", "Loss (%)"),
                ("min_rtt", "Min RTT (ms)"),
                ("max_rtt", "Max RTT (ms)"),
                ("avg_rtt", "Avg RTT (ms)"),
                ("mdev", "Mdev (ms)"),
            ],
            TestType::Rssi => &[("rsl_in", "RSL In (dBm)"), ("rsl_out", "RSL Out (dBm)")],
            TestType::Rpl => &[("rpl_rank", "RPL Rank")],
            TestType::Disconnections => &[("disconnected_total", "Disconnected Total")],
            TestType::Availability => &[("availability_percent", "Availability (%)")],
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ping" => Ok(TestType::Ping),
            "rssi" | "rssl" => Ok(TestType::Rssi),
            "rpl" => Ok(TestType::Rpl),
            "disconnections" => Ok(TestType::Disconnections),
            "availability" => Ok(TestType::Availability),
            other => Err(format!("Invalid test type: {}", other)),
        }
    }
}

const TIMEOUT_RANGE: (u64, u64) = (1, 300);
const PACKET_COUNT_RANGE: (u32, u32) = (1, 1000);

/// One entry of a test type's parameter schema.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub label: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub default: u64,
    pub min: u64,
    pub max: u64,
}

/// Catalog entry served to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct TestInfo {
    pub test_type: TestType,
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ParamSpec>,
}

pub fn catalog() -> Vec<TestInfo> {
    TestType::ALL
        .iter()
        .map(|t| TestInfo {
            test_type: *t,
            name: t.display_name(),
            description: t.description(),
            parameters: t.param_specs(),
        })
        .collect()
}

/// Parameters as submitted by a client. Anything missing takes the test type's default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamsRequest {
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub packet_count: Option<u32>,
    #[serde(default)]
    pub skip_unreachable: Option<bool>,
}

/// The frozen parameter snapshot of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeParams {
    pub timeout_secs: u64,
    pub packet_count: u32,
    pub skip_unreachable: bool,
}

impl ProbeParams {
    pub fn defaults(test_type: TestType) -> Self {
        Self {
            timeout_secs: test_type.default_timeout_secs(),
            packet_count: 1,
            skip_unreachable: false,
        }
    }

    /// Merge a client request over the defaults and validate the result.
    pub fn resolve(test_type: TestType, req: &ParamsRequest) -> Result<Self, String> {
        let defaults = Self::defaults(test_type);
        let params = Self {
            timeout_secs: req.timeout.unwrap_or(defaults.timeout_secs),
            packet_count: req.packet_count.unwrap_or(defaults.packet_count),
            skip_unreachable: req.skip_unreachable.unwrap_or(defaults.skip_unreachable),
        };
        params.validate(test_type)?;
        Ok(params)
    }

    pub fn validate(&self, test_type: TestType) -> Result<(), String> {
        let (min, max) = TIMEOUT_RANGE;
        if self.timeout_secs < min || self.timeout_secs > max {
            return Err(format!(
                "timeout must be between {} and {} seconds, got {}",
                min, max, self.timeout_secs
            ));
        }

        if test_type == TestType::Ping {
            let (min, max) = PACKET_COUNT_RANGE;
            if self.packet_count < min || self.packet_count > max {
                return Err(format!(
                    "packet_count must be between {} and {}, got {}",
                    min, max, self.packet_count
                ));
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
