//! CoAP statistics probes run through `coap-client`.
//!
//! The mesh nodes expose their radio statistics as CoAP resources. RSL and RPL rank come
//! back as a JSON document from `/om2m`; the disconnection and availability counters are
//! plain text resources under `/statistics/app`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use super::{run_command, ConnectionStatus, Measurement, ProbeError, COMMAND_GRACE};
use crate::catalog::{ProbeParams, TestType};

const COAP_PORT: u16 = 5683;

fn resource_path(test_type: TestType) -> &'static str {
    match test_type {
        TestType::Disconnections => "statistics/app/disconnected_total",
        TestType::Availability => "statistics/app/availability",
        _ => "om2m",
    }
}

/// Build the coap-client argument list for a test type.
pub fn coap_args(test_type: TestType, address: &str, timeout_secs: u64) -> Vec<String> {
    let mut args = vec!["-m".to_string(), "post".to_string()];
    // The availability resource only answers confirmable requests.
    if test_type != TestType::Availability {
        args.push("-N".to_string());
    }
    args.extend([
        "-B".to_string(),
        timeout_secs.to_string(),
        "-t".to_string(),
        "text".to_string(),
        format!("coap://[{}]:{}/{}", address, COAP_PORT, resource_path(test_type)),
    ]);
    args
}

/// Query one CoAP statistics resource and interpret the answer.
pub async fn run_coap_probe(
    program: &str,
    test_type: TestType,
    address: &str,
    params: &ProbeParams,
) -> Result<Measurement, ProbeError> {
    let args = coap_args(test_type, address, params.timeout_secs);
    let output = run_command(program, &args, params.timeout() + COMMAND_GRACE).await?;

    if !output.status.success() {
        return Err(ProbeError::Command(format!(
            "coap request to {} exited with {}: {}",
            address,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let body = String::from_utf8_lossy(&output.stdout);
    parse_coap_response(test_type, &body)
}

/// Turn a coap-client response body into a measurement.
pub fn parse_coap_response(test_type: TestType, body: &str) -> Result<Measurement, ProbeError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ProbeError::Network("empty CoAP response".to_string()));
    }

    match test_type {
        TestType::Rssi => {
            let doc = parse_json(body)?;
            let rsl_in = present(&doc, "rsl_in");
            let rsl_out = present(&doc, "rsl_out");
            let both = rsl_in.is_some() && rsl_out.is_some();

            let mut metrics = Map::new();
            metrics.insert("rsl_in".into(), rsl_in.unwrap_or_else(dash));
            metrics.insert("rsl_out".into(), rsl_out.unwrap_or_else(dash));
            metrics.insert(
                "signal_quality".into(),
                json!(if both { "Good" } else { "Poor" }),
            );

            let status = if both {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
            Ok(Measurement::new(status, metrics))
        }
        TestType::Rpl => {
            let doc = parse_json(body)?;
            let rank = present(&doc, "rpl_rank");
            let status = if rank.is_some() {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };

            let mut metrics = Map::new();
            metrics.insert("rpl_rank".into(), rank.unwrap_or_else(dash));
            Ok(Measurement::new(status, metrics))
        }
        TestType::Disconnections => {
            reject_error_body(body)?;
            let mut metrics = Map::new();
            metrics.insert("disconnected_total".into(), json!(body));
            Ok(Measurement::new(ConnectionStatus::Connected, metrics))
        }
        TestType::Availability => {
            reject_error_body(body)?;
            let percent = availability_percent(body);
            let status = if percent > 0.0 {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };

            let mut metrics = Map::new();
            metrics.insert("availability".into(), json!(body));
            metrics.insert("availability_percent".into(), json!(percent));
            Ok(Measurement::new(status, metrics))
        }
        TestType::Ping => Err(ProbeError::Config(
            "ping is not a CoAP test".to_string(),
        )),
    }
}

fn parse_json(body: &str) -> Result<Value, ProbeError> {
    serde_json::from_str(body)
        .map_err(|e| ProbeError::Command(format!("invalid JSON from device: {}", e)))
}

fn present(doc: &Value, key: &str) -> Option<Value> {
    doc.get(key).filter(|v| !v.is_null()).cloned()
}

fn dash() -> Value {
    Value::String("-".to_string())
}

fn reject_error_body(body: &str) -> Result<(), ProbeError> {
    if body.to_ascii_uppercase().contains("ERR") {
        return Err(ProbeError::Network(format!("device returned an error: {}", body)));
    }
    Ok(())
}

/// First number in the body; a body without one counts as fully available.
fn availability_percent(body: &str) -> f64 {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| Regex::new(r"([0-9]+\.?[0-9]*)").unwrap());

    re.captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(100.0)
}
