//! Run notifications and the broadcast bus that fans them out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::{ProbeResult, Progress, Summary};
use crate::catalog::{ProbeParams, TestType};
use crate::report::ReportLocation;

/// Capacity of the event channel. Observers that fall further behind than this
/// miss events and are told how many they lagged.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Final state of a run, carried by the terminal events.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub test_type: TestType,
    pub run_id: u64,
    pub progress: Progress,
    pub summary: Summary,
    pub summary_text: String,
    pub results: Vec<ProbeResult>,
    pub reports: Vec<ReportLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything observers hear about runs. Serialized with an `event` tag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        test_type: TestType,
        run_id: u64,
        total: usize,
        parameters: ProbeParams,
        topology_known: bool,
        started_at: DateTime<Utc>,
    },
    Progress {
        test_type: TestType,
        run_id: u64,
        current: usize,
        total: usize,
        percent: u32,
        result: ProbeResult,
        summary: Summary,
    },
    Paused {
        test_type: TestType,
        run_id: u64,
        progress: Progress,
    },
    Resumed {
        test_type: TestType,
        run_id: u64,
        progress: Progress,
    },
    Stopped(RunOutcome),
    Completed(RunOutcome),
    Error(RunOutcome),
    DeviceRetestResult {
        test_type: TestType,
        run_id: Option<u64>,
        result: ProbeResult,
        summary: Option<Summary>,
        summary_text: Option<String>,
    },
    DeviceRetestError {
        test_type: TestType,
        address: String,
        message: String,
    },
    ReportRegenerated {
        test_type: TestType,
        reports: Vec<ReportLocation>,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "started",
            RunEvent::Progress { .. } => "progress",
            RunEvent::Paused { .. } => "paused",
            RunEvent::Resumed { .. } => "resumed",
            RunEvent::Stopped(_) => "stopped",
            RunEvent::Completed(_) => "completed",
            RunEvent::Error(_) => "error",
            RunEvent::DeviceRetestResult { .. } => "device_retest_result",
            RunEvent::DeviceRetestError { .. } => "device_retest_error",
            RunEvent::ReportRegenerated { .. } => "report_regenerated",
        }
    }

    pub fn test_type(&self) -> TestType {
        match self {
            RunEvent::Started { test_type, .. }
            | RunEvent::Progress { test_type, .. }
            | RunEvent::Paused { test_type, .. }
            | RunEvent::Resumed { test_type, .. }
            | RunEvent::DeviceRetestResult { test_type, .. }
            | RunEvent::DeviceRetestError { test_type, .. }
            | RunEvent::ReportRegenerated { test_type, .. } => *test_type,
            RunEvent::Stopped(o) | RunEvent::Completed(o) | RunEvent::Error(o) => o.test_type,
        }
    }

    /// Batch run the event belongs to, if any.
    pub fn run_id(&self) -> Option<u64> {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::Progress { run_id, .. }
            | RunEvent::Paused { run_id, .. }
            | RunEvent::Resumed { run_id, .. } => Some(*run_id),
            RunEvent::Stopped(o) | RunEvent::Completed(o) | RunEvent::Error(o) => Some(o.run_id),
            RunEvent::DeviceRetestResult { run_id, .. } => *run_id,
            RunEvent::DeviceRetestError { .. } | RunEvent::ReportRegenerated { .. } => None,
        }
    }

    /// The last event of a batch run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Stopped(_) | RunEvent::Completed(_) | RunEvent::Error(_))
    }
}

/// Delivers run events to observers.
///
/// Delivery is at-most-once; an observer that is not subscribed when an event is
/// published never sees it.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: RunEvent);
}

/// In-process notifier over a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for EventBus {
    fn publish(&self, event: RunEvent) {
        tracing::debug!("event {} for {}", event.name(), event.test_type());
        // No observers is fine.
        let _ = self.tx.send(event);
    }
}
