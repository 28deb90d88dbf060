//! Live test runs: state, control, and the events they emit.

mod controller;
mod events;
mod log;
mod state;

pub use controller::*;
pub use events::*;
pub use log::*;
pub use state::*;

use crate::catalog::TestType;
use crate::probe::ProbeError;
use crate::report::ReportError;
use crate::roster::RosterError;

use thiserror::Error;

/// Run control error types.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("{0} test is already running")]
    AlreadyRunning(TestType),
    #[error("no {0} test is running")]
    NotRunning(TestType),
    #[error("cannot {action} {test_type} test while it is {status:?}")]
    InvalidTransition {
        test_type: TestType,
        status: RunStatus,
        action: &'static str,
    },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("cannot retest a device while the {0} batch is running")]
    RetestConflict(TestType),
    #[error("device {0} is not in the roster")]
    UnknownDevice(String),
    #[error("no results to write")]
    EmptyResults,
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Report(#[from] ReportError),
}
