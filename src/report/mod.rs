//! Report persistence: flat files, one per finished run and format.

mod render;
mod store;

pub use render::*;
pub use store::*;

use crate::catalog::TestType;
use crate::run::{ProbeResult, Summary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Report error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no {format} report found for {test_type}")]
    NotFound { test_type: TestType, format: ReportFormat },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Txt,
    Json,
    Csv,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Txt => "txt",
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Txt => "text/plain; charset=utf-8",
            ReportFormat::Json => "application/json",
            ReportFormat::Csv => "text/csv",
        }
    }

    /// Parse a comma separated list such as `txt,json`.
    pub fn parse_list(s: &str) -> Result<Vec<ReportFormat>, String> {
        let mut formats = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let format = part.parse()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "txt" | "text" => Ok(ReportFormat::Txt),
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            other => Err(format!("Unsupported report format: {}", other)),
        }
    }
}

/// Where a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportSource {
    Run { run_id: u64 },
    Regenerated,
}

/// Everything a report file is rendered from.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub test_type: TestType,
    pub source: ReportSource,
    pub generated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Summary,
    pub summary_text: String,
    pub results: Vec<ProbeResult>,
}

/// A persisted report file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLocation {
    pub format: ReportFormat,
    pub path: PathBuf,
}

/// Persists rendered reports and finds the newest one.
pub trait ReportStore: Send + Sync {
    fn write(&self, report: &Report, format: ReportFormat) -> Result<PathBuf, ReportError>;

    fn latest(&self, test_type: TestType, format: ReportFormat) -> Result<PathBuf, ReportError>;
}
