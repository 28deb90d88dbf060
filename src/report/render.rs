//! Rendering reports into txt, json and csv bytes.

use serde_json::Value;

use super::{Report, ReportError, ReportFormat};
use crate::catalog::TestType;
use crate::run::ProbeResult;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn render(report: &Report, format: ReportFormat) -> Result<Vec<u8>, ReportError> {
    match format {
        ReportFormat::Txt => Ok(render_txt(report).into_bytes()),
        ReportFormat::Json => Ok(serde_json::to_vec_pretty(report)?),
        ReportFormat::Csv => render_csv(report),
    }
}

/// Column headers for a test type's result table.
pub fn table_headers(test_type: TestType) -> Vec<&'static str> {
    let mut headers = vec!["Sr No.", "IP Address", "Device Label", "Hop Count"];
    headers.extend(test_type.metric_columns().iter().map(|(_, header)| *header));
    headers.push("Connection Status");
    headers
}

/// One table row, in the same order as [`table_headers`].
pub fn table_row(test_type: TestType, result: &ProbeResult) -> Vec<String> {
    let mut row = vec![
        result.sequence.to_string(),
        result.address.clone(),
        if result.label.is_empty() { "Unknown".to_string() } else { result.label.clone() },
        result.hop_count.to_string(),
    ];
    for (key, _) in test_type.metric_columns() {
        row.push(cell(result.metrics.get(*key)));
    }
    row.push(result.status.as_str().to_string());
    row
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn render_txt(report: &Report) -> String {
    let rule = "=".repeat(50);
    let mut out = String::new();

    out.push_str("Wi-SUN Network Test Report\n");
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("Test Type: {}\n", report.test_type.as_str().to_uppercase()));
    if let Some(started) = report.started_at {
        out.push_str(&format!("Started: {}\n", started.format(TIMESTAMP_FORMAT)));
    }
    out.push_str(&format!("Generated: {}\n", report.generated_at.format(TIMESTAMP_FORMAT)));
    out.push_str(&rule);
    out.push_str("\n\n");

    out.push_str("Test Results\n");
    out.push_str(&"=".repeat(120));
    out.push('\n');

    let headers = table_headers(report.test_type);
    let rows: Vec<Vec<String>> = report
        .results
        .iter()
        .map(|r| table_row(report.test_type, r))
        .collect();

    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|c| c.chars().count())
                .fold(h.chars().count(), usize::max)
                + 2
        })
        .collect();

    let border = format!(
        "+{}+\n",
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("+")
    );
    let line = |cells: &[String]| {
        let mut s = String::from("|");
        for (cell, width) in cells.iter().zip(&widths) {
            s.push_str(&format!(" {:<w$}|", cell, w = width - 1));
        }
        s.push('\n');
        s
    };

    out.push_str(&border);
    out.push_str(&line(&headers.iter().map(|h| h.to_string()).collect::<Vec<_>>()));
    out.push_str(&border);
    for row in &rows {
        out.push_str(&line(row));
    }
    out.push_str(&border);

    if !report.summary_text.is_empty() {
        out.push('\n');
        out.push_str(&report.summary_text);
        out.push('\n');
    }
    out
}

fn render_csv(report: &Report) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table_headers(report.test_type))?;
    for result in &report.results {
        writer.write_record(table_row(report.test_type, result))?;
    }
    writer
        .into_inner()
        .map_err(|e| ReportError::Io(e.into_error()))
}
