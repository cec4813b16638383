//! Shared domain types for the issue worker.
//!
//! These types cross three boundaries: the supervisor's in-memory state, the
//! snapshot persisted under `state/state.json`, and the JSON bodies served by
//! the HTTP transport. None of them carry the access token.

pub mod event;
pub mod job;

pub use event::{EventAck, EventPayload, EventType, WorkerEvent};
pub use job::{
    AgentOutcome, AgentRunInfo, AgentStatus, ErrorKind, InvalidTransition, JobError, JobIdentity,
    JobPhase, JobRecord, JobSnapshot, JobStatus, MAX_TRANSITIONS, PhaseTransition, ReviewRef,
    SNAPSHOT_VERSION,
};
