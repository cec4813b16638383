//! Typed errors for the issue worker.
//!
//! Every failure a job can hit maps onto one of the classifications in
//! [`ErrorKind`] via [`WorkerError::kind`]. Messages carried by these errors
//! must already be free of credentials; callers that wrap subprocess or API
//! output run it through [`crate::credential::Credential::redact`] first.

use std::path::PathBuf;

use issue_worker_common::{ErrorKind, EventType, InvalidTransition, JobPhase};
use thiserror::Error;

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Git conflict on {branch}: {message}")]
    GitConflict { branch: String, message: String },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Event '{event}' rejected while job is {phase}")]
    EventRejected { event: EventType, phase: JobPhase },

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("State file {path} could not be written: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    /// Classification recorded on the job when this error ends a run.
    ///
    /// Rejected events never end a run; they report as configuration errors
    /// because the caller asked for something the current state forbids.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Configuration(_) | WorkerError::EventRejected { .. } => {
                ErrorKind::Configuration
            }
            WorkerError::State { .. } | WorkerError::Transition(_) => ErrorKind::Configuration,
            WorkerError::Git(_) | WorkerError::GitConflict { .. } => ErrorKind::Git,
            WorkerError::Agent(_) => ErrorKind::Agent,
            WorkerError::Publish(_) | WorkerError::Api { .. } => ErrorKind::Publish,
            WorkerError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled(_))
    }

    pub(crate) fn git(context: &str, err: git2::Error) -> Self {
        WorkerError::Git(format!("{}: {}", context, err.message()))
    }
}
