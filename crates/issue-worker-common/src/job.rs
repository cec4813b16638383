use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Persisted snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Transition history kept per job. Oldest entries are dropped first.
pub const MAX_TRANSITIONS: usize = 64;

/// What a job works on. Stable across reruns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    /// Repository in `owner/name` form.
    pub repo: String,
    pub issue_number: u64,
    pub base_branch: String,
}

impl JobIdentity {
    /// Build an identity, rejecting values that cannot name a real repository,
    /// issue or branch.
    pub fn new(
        repo: impl Into<String>,
        issue_number: u64,
        base_branch: impl Into<String>,
    ) -> Result<Self, String> {
        let repo = repo.into().trim().to_string();
        let base_branch = base_branch.into().trim().to_string();

        let mut parts = repo.split('/');
        let valid_repo = match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) => is_repo_segment(owner) && is_repo_segment(name),
            _ => false,
        };
        if !valid_repo {
            return Err(format!("repository must be in owner/name form, got '{}'", repo));
        }
        if issue_number == 0 {
            return Err("issue number must be a positive integer".to_string());
        }
        if !is_branch_name(&base_branch) {
            return Err(format!("invalid base branch '{}'", base_branch));
        }

        Ok(Self {
            repo,
            issue_number,
            base_branch,
        })
    }

    pub fn owner(&self) -> &str {
        self.repo.split('/').next().unwrap_or_default()
    }

    /// The branch every run of this job commits to. The base is part of the
    /// name so jobs for the same issue against different bases never share a
    /// branch.
    pub fn work_branch(&self) -> String {
        format!("agent/issue-{}-{}", self.issue_number, self.base_slug())
    }

    /// Directory name used for the job's working tree.
    pub fn workspace_slug(&self) -> String {
        format!(
            "{}-issue-{}-{}",
            self.repo.replace('/', "-"),
            self.issue_number,
            self.base_slug()
        )
    }

    fn base_slug(&self) -> String {
        self.base_branch
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
            .collect()
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} (base {})", self.repo, self.issue_number, self.base_branch)
    }
}

fn is_repo_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('-')
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_branch_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Preparing,
    AgentRunning,
    Publishing,
    RequestingReview,
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::Preparing => "preparing",
            JobPhase::AgentRunning => "agent_running",
            JobPhase::Publishing => "publishing",
            JobPhase::RequestingReview => "requesting_review",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Failed | JobPhase::Cancelled
        )
    }

    /// True while a background run owns the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobPhase::Preparing
                | JobPhase::AgentRunning
                | JobPhase::Publishing
                | JobPhase::RequestingReview
        )
    }

    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        match (self, next) {
            (Idle, Preparing) => true,
            (Preparing, AgentRunning) => true,
            (AgentRunning, Publishing) => true,
            (Publishing, RequestingReview) => true,
            (RequestingReview, Completed) => true,
            (from, Failed | Cancelled) if from.is_active() => true,
            (Completed | Failed | Cancelled, Preparing) => true,
            _ => false,
        }
    }

    /// Failure classification for a run interrupted while in this phase.
    pub fn interrupted_kind(&self) -> ErrorKind {
        match self {
            JobPhase::AgentRunning => ErrorKind::Agent,
            JobPhase::RequestingReview => ErrorKind::Publish,
            _ => ErrorKind::Git,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobPhase::Idle),
            "preparing" => Ok(JobPhase::Preparing),
            "agent_running" => Ok(JobPhase::AgentRunning),
            "publishing" => Ok(JobPhase::Publishing),
            "requesting_review" => Ok(JobPhase::RequestingReview),
            "completed" => Ok(JobPhase::Completed),
            "failed" => Ok(JobPhase::Failed),
            "cancelled" => Ok(JobPhase::Cancelled),
            other => Err(format!("unknown job phase: {}", other)),
        }
    }
}

/// Illegal phase change requested by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobPhase,
    pub to: JobPhase,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ConfigurationError")]
    Configuration,
    #[serde(rename = "GitError")]
    Git,
    #[serde(rename = "AgentError")]
    Agent,
    #[serde(rename = "PublishError")]
    Publish,
    #[serde(rename = "CancelledError")]
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Git => "GitError",
            ErrorKind::Agent => "AgentError",
            ErrorKind::Publish => "PublishError",
            ErrorKind::Cancelled => "CancelledError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent failure, already scrubbed of secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Succeeded => "succeeded",
            AgentStatus::Failed => "failed",
            AgentStatus::TimedOut => "timed_out",
            AgentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An agent run that has started and not yet produced an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRunInfo {
    pub run_id: Uuid,
    pub run_number: u32,
    pub started_at: DateTime<Utc>,
    pub log_ref: PathBuf,
}

/// Result of one agent run. `detail` is a short description written by the
/// worker, never captured subprocess output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub run_id: Uuid,
    pub run_number: u32,
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    pub log_ref: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub detail: String,
}

/// Pull request opened for the work branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRef {
    pub number: u64,
    pub url: String,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: JobPhase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub identity: JobIdentity,
    pub work_branch: String,
    pub phase: JobPhase,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub current_run: Option<AgentRunInfo>,
    #[serde(default)]
    pub last_outcome: Option<AgentOutcome>,
    #[serde(default)]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub review: Option<ReviewRef>,
    #[serde(default)]
    pub head_sha: Option<String>,
    /// Newest issue comment included in a completed run's task.
    #[serde(default)]
    pub last_seen_comment_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub transitions: Vec<PhaseTransition>,
}

impl JobRecord {
    pub fn new(identity: JobIdentity, now: DateTime<Utc>) -> Self {
        let work_branch = identity.work_branch();
        Self {
            identity,
            work_branch,
            phase: JobPhase::Idle,
            run_count: 0,
            current_run: None,
            last_outcome: None,
            last_error: None,
            review: None,
            head_sha: None,
            last_seen_comment_id: None,
            created_at: now,
            updated_at: now,
            transitions: vec![PhaseTransition {
                phase: JobPhase::Idle,
                at: now,
            }],
        }
    }

    pub fn transition(&mut self, next: JobPhase, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.updated_at = at;
        self.transitions.push(PhaseTransition { phase: next, at });
        if self.transitions.len() > MAX_TRANSITIONS {
            let excess = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..excess);
        }
        Ok(())
    }

    /// Move to a terminal failure state and record why.
    pub fn fail(
        &mut self,
        phase: JobPhase,
        kind: ErrorKind,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(phase, at)?;
        self.current_run = None;
        self.last_error = Some(JobError {
            kind,
            message: message.into(),
            at,
        });
        Ok(())
    }

    /// A job found mid-run at startup has no live process behind it; mark it
    /// Failed. Returns true when the record changed.
    pub fn recover_after_restart(&mut self, now: DateTime<Utc>) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        let interrupted = self.phase;
        let message = format!("worker restarted while job was {}", interrupted);
        // Active phases can always move to Failed.
        let _ = self.fail(JobPhase::Failed, interrupted.interrupted_kind(), message, now);
        true
    }
}

/// On-disk representation of the supervisor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub version: u32,
    pub job: Option<JobRecord>,
    pub saved_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            job: None,
            saved_at: now,
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub job: Option<JobRecord>,
}

impl JobStatus {
    pub fn from_record(record: Option<&JobRecord>) -> Self {
        Self {
            phase: record.map(|r| r.phase).unwrap_or(JobPhase::Idle),
            job: record.cloned(),
        }
    }
}
