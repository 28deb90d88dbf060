//! In-memory state of one test type's current or most recent run.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RunError;
use crate::catalog::{ProbeParams, TestType};
use crate::probe::{ConnectionStatus, Measurement, ProbeError};
use crate::report::{Report, ReportLocation, ReportSource};
use crate::roster::{normalize_address, Device, Roster, UNKNOWN_HOP_COUNT};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Errored,
}

impl RunStatus {
    /// The batch loop owns the run.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Completed | RunStatus::Errored)
    }
}

/// Devices processed so far out of the roster size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (self.current * 100 / self.total) as u32
    }
}

fn unknown_hop_count() -> i32 {
    UNKNOWN_HOP_COUNT
}

/// Outcome of probing one device within a run.
///
/// Also the shape of a row submitted back by the dashboard, so everything except the
/// address is optional on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Roster position, 1-based. Stable across retests.
    #[serde(default)]
    pub sequence: u32,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "unknown_hop_count")]
    pub hop_count: i32,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub measured_at: Option<DateTime<Utc>>,
}

impl ProbeResult {
    fn for_device(device: &Device, status: ConnectionStatus, metrics: Map<String, Value>) -> Self {
        Self {
            sequence: 0,
            address: device.address.clone(),
            label: device.label.clone(),
            hop_count: device.hop_count,
            status,
            metrics,
            measured_at: Some(Utc::now()),
        }
    }

    pub fn measured(device: &Device, measurement: Measurement) -> Self {
        Self::for_device(device, measurement.status, measurement.metrics)
    }

    /// A probe that failed for this device only.
    pub fn failed(device: &Device, error: &ProbeError) -> Self {
        let mut metrics = Map::new();
        metrics.insert("error".into(), Value::String(error.to_string()));
        Self::for_device(device, ConnectionStatus::Disconnected, metrics)
    }

    pub fn skipped(device: &Device) -> Self {
        let mut metrics = Map::new();
        metrics.insert("note".into(), Value::String("not in mesh topology".into()));
        Self::for_device(device, ConnectionStatus::Skipped, metrics)
    }
}

/// Counts derived from a result set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Summary {
    pub success: usize,
    pub fail: usize,
    pub skipped: usize,
    pub total: usize,
    /// Percent of non-skipped devices that succeeded.
    pub success_rate: f64,
    pub elapsed_secs: f64,
}

impl Summary {
    pub fn derive<'a, I>(
        results: I,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a ProbeResult>,
    {
        let mut summary = Summary::default();
        for result in results {
            summary.total += 1;
            match result.status {
                ConnectionStatus::Connected => summary.success += 1,
                ConnectionStatus::Skipped => summary.skipped += 1,
                ConnectionStatus::Disconnected | ConnectionStatus::Unknown => summary.fail += 1,
            }
        }

        let attempted = summary.total - summary.skipped;
        if attempted > 0 {
            summary.success_rate = summary.success as f64 * 100.0 / attempted as f64;
        }

        if let Some(start) = started_at {
            let end = finished_at.unwrap_or(now);
            summary.elapsed_secs = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
        }

        summary
    }

    /// One-line summary, e.g. `SUMMARY: 2/3 devices reachable (66.7% success rate) - Duration: 4s`.
    pub fn text(&self, test_type: TestType) -> String {
        let mut text = format!(
            "SUMMARY: {}/{} devices {} ({:.1}% success rate)",
            self.success,
            self.total - self.skipped,
            test_type.success_verb(),
            self.success_rate
        );
        if self.skipped > 0 {
            text.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.elapsed_secs > 0.0 {
            text.push_str(&format!(" - Duration: {}", format_duration(self.elapsed_secs)));
        }
        text
    }
}

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let (minutes, seconds) = (secs / 60, secs % 60);
    if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Serializable view of a run for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub test_type: TestType,
    pub run_id: Option<u64>,
    pub status: RunStatus,
    pub progress: Progress,
    pub percent: u32,
    pub summary: Summary,
    pub summary_text: String,
    pub parameters: Option<ProbeParams>,
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub reports: Vec<ReportLocation>,
    pub results: Vec<ProbeResult>,
}

impl RunSnapshot {
    pub fn idle(test_type: TestType) -> Self {
        Self {
            test_type,
            run_id: None,
            status: RunStatus::Idle,
            progress: Progress::default(),
            percent: 0,
            summary: Summary::default(),
            summary_text: String::new(),
            parameters: None,
            pause_requested: false,
            cancel_requested: false,
            started_at: None,
            finished_at: None,
            error: None,
            reports: Vec::new(),
            results: Vec::new(),
        }
    }
}

/// One test type's run: status, flags, and the accumulated results.
///
/// Results are only ever written through [`RunState::upsert_result`] and the summary is
/// only ever written by [`RunState::recompute_summary`].
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: u64,
    test_type: TestType,
    status: RunStatus,
    progress: Progress,
    parameters: ProbeParams,
    cancel_requested: bool,
    pause_requested: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    reports: Vec<ReportLocation>,
    roster: Roster,
    results: BTreeMap<u32, ProbeResult>,
    sequences: HashMap<String, u32>,
    summary: Summary,
}

impl RunState {
    /// A fresh, running run over `roster`.
    pub fn new(run_id: u64, test_type: TestType, parameters: ProbeParams, roster: Roster) -> Self {
        let total = roster.devices.len();
        Self {
            run_id,
            test_type,
            status: RunStatus::Running,
            progress: Progress { current: 0, total },
            parameters,
            cancel_requested: false,
            pause_requested: false,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            reports: Vec::new(),
            roster,
            results: BTreeMap::new(),
            sequences: HashMap::new(),
            summary: Summary::default(),
        }
    }

    /// A run that failed before its loop could start.
    pub fn errored(run_id: u64, test_type: TestType, parameters: ProbeParams, message: String) -> Self {
        let mut state = Self::new(run_id, test_type, parameters, Roster::default());
        state.finish(RunStatus::Errored, Some(message));
        state
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn test_type(&self) -> TestType {
        self.test_type
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn parameters(&self) -> &ProbeParams {
        &self.parameters
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn summary(&self) -> Summary {
        self.summary
    }

    pub fn summary_text(&self) -> String {
        self.summary.text(self.test_type)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn reports(&self) -> &[ReportLocation] {
        &self.reports
    }

    /// Results in roster order.
    pub fn results(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.values()
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    pub fn device(&self, address: &str) -> Option<&Device> {
        self.roster
            .position(address)
            .map(|i| &self.roster.devices[i])
    }

    /// Insert or replace the result for a device.
    ///
    /// A replaced entry keeps its sequence number; a new one gets its roster position, which
    /// in the batch loop is simply the next number.
    pub fn upsert_result(&mut self, mut result: ProbeResult) -> Result<&ProbeResult, RunError> {
        let position = self
            .roster
            .position(&result.address)
            .ok_or_else(|| RunError::UnknownDevice(result.address.clone()))?;

        let key = normalize_address(&result.address);
        let sequence = match self.sequences.get(&key) {
            Some(seq) => *seq,
            None => position as u32 + 1,
        };

        result.sequence = sequence;
        self.sequences.insert(key, sequence);
        self.results.insert(sequence, result);
        self.recompute_summary();

        Ok(&self.results[&sequence])
    }

    /// Record one batch-loop result and advance progress.
    pub(crate) fn record_progress(&mut self, result: ProbeResult) -> Result<ProbeResult, RunError> {
        let stored = self.upsert_result(result)?.clone();
        self.progress.current = (self.progress.current + 1).min(self.progress.total);
        Ok(stored)
    }

    pub fn recompute_summary(&mut self) {
        self.summary = self.summary_at(Utc::now());
    }

    /// The summary as of `now`. Pure: depends only on results and timestamps.
    pub fn summary_at(&self, now: DateTime<Utc>) -> Summary {
        Summary::derive(self.results.values(), Some(self.started_at), self.finished_at, now)
    }

    pub(crate) fn request_pause(&mut self) -> Result<(), RunError> {
        if !self.status.is_active() {
            return Err(RunError::NotRunning(self.test_type));
        }
        if self.pause_requested {
            return Err(self.invalid("pause"));
        }
        self.pause_requested = true;
        Ok(())
    }

    pub(crate) fn request_resume(&mut self) -> Result<(), RunError> {
        if !self.status.is_active() {
            return Err(RunError::NotRunning(self.test_type));
        }
        if !self.pause_requested {
            return Err(self.invalid("resume"));
        }
        self.pause_requested = false;
        Ok(())
    }

    pub(crate) fn request_stop(&mut self) -> Result<(), RunError> {
        if !self.status.is_active() {
            return Err(RunError::NotRunning(self.test_type));
        }
        self.cancel_requested = true;
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> RunError {
        RunError::InvalidTransition {
            test_type: self.test_type,
            status: self.status,
            action,
        }
    }

    /// Running -> Paused. Returns true on the transition edge.
    pub(crate) fn enter_paused(&mut self) -> bool {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Paused;
            return true;
        }
        false
    }

    /// Paused -> Running. Returns true on the transition edge.
    pub(crate) fn leave_paused(&mut self) -> bool {
        if self.status == RunStatus::Paused {
            self.status = RunStatus::Running;
            return true;
        }
        false
    }

    pub(crate) fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.pause_requested = false;
        self.finished_at = Some(Utc::now());
        self.recompute_summary();
    }

    pub(crate) fn set_reports(&mut self, reports: Vec<ReportLocation>) {
        self.reports = reports;
    }

    /// Whether this run has results that never reached the report store.
    pub(crate) fn needs_persisting(&self) -> bool {
        self.status.is_terminal() && self.reports.is_empty() && !self.results.is_empty()
    }

    pub fn to_report(&self) -> Report {
        Report {
            test_type: self.test_type,
            source: ReportSource::Run { run_id: self.run_id },
            generated_at: Utc::now(),
            started_at: Some(self.started_at),
            finished_at: self.finished_at,
            summary: self.summary,
            summary_text: self.summary_text(),
            results: self.results.values().cloned().collect(),
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let summary = if self.status.is_active() {
            self.summary_at(Utc::now())
        } else {
            self.summary
        };

        RunSnapshot {
            test_type: self.test_type,
            run_id: Some(self.run_id),
            status: self.status,
            progress: self.progress,
            percent: self.progress.percent(),
            summary,
            summary_text: summary.text(self.test_type),
            parameters: Some(self.parameters),
            pause_requested: self.pause_requested,
            cancel_requested: self.cancel_requested,
            started_at: Some(self.started_at),
            finished_at: self.finished_at,
            error: self.error.clone(),
            reports: self.reports.clone(),
            results: self.results.values().cloned().collect(),
        }
    }
}
