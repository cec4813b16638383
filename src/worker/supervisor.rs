//! The job state machine.
//!
//! One [`JobSupervisor`] owns at most one job. Events are serialized through
//! the `events` mutex; the background run only touches the job record via
//! [`JobSupervisor::apply`], which refuses writes from a run that `stop` has
//! already retired (tracked by a generation counter).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use issue_worker_common::{
    AgentRunInfo, AgentStatus, ErrorKind, EventAck, EventPayload, EventType, JobError,
    JobIdentity, JobPhase, JobRecord, JobStatus, ReviewRef, WorkerEvent,
};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::JobDefaults;
use crate::credential::{Credential, scrub};
use crate::errors::{WorkerError, WorkerResult};
use crate::worker::agent::{AgentRequest, AgentRunner};
use crate::worker::github::CodeHost;
use crate::worker::publisher::BranchPublisher;
use crate::worker::review::{ReviewContent, ReviewRequester, commit_message};
use crate::worker::state::{InstanceLock, StateStore, write_json_atomic};
use crate::worker::task::{newest_comment_id, render_task};
use crate::worker::verify::Verifier;
use crate::worker::workspace::{CommitResult, WorkspaceOps};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub runs_dir: PathBuf,
    pub result_file: PathBuf,
    pub agent_timeout: Duration,
    /// How long `stop` waits for the run to wind down before abandoning it.
    pub stop_timeout: Duration,
    pub defaults: JobDefaults,
    pub report_to_issue: bool,
}

/// Everything a run calls out to.
pub struct Collaborators {
    pub workspace: Arc<dyn WorkspaceOps>,
    pub agent: Arc<dyn AgentRunner>,
    pub publisher: Arc<dyn BranchPublisher>,
    pub host: Arc<dyn CodeHost>,
    pub verifier: Verifier,
    pub redactor: Option<Credential>,
}

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: StateStore,
    settings: SupervisorSettings,
    parts: Collaborators,
    review: ReviewRequester,
    job: RwLock<Option<JobRecord>>,
    events: Mutex<Option<ActiveRun>>,
    generation: AtomicU64,
    phase_tx: watch::Sender<JobPhase>,
    _lock: Option<InstanceLock>,
}

#[derive(Clone)]
pub struct JobSupervisor {
    inner: Arc<Inner>,
}

/// Contents of `out/result.json`.
#[derive(Serialize)]
struct JobResult<'a> {
    repo: &'a str,
    issue_number: u64,
    base_branch: &'a str,
    work_branch: &'a str,
    phase: JobPhase,
    run_count: u32,
    review: Option<&'a ReviewRef>,
    head_sha: Option<&'a str>,
    last_error: Option<&'a JobError>,
    written_at: DateTime<Utc>,
}

impl JobSupervisor {
    /// Load the persisted job, failing any run a previous process left
    /// mid-flight.
    pub fn open(
        store: StateStore,
        settings: SupervisorSettings,
        parts: Collaborators,
        lock: Option<InstanceLock>,
    ) -> WorkerResult<Self> {
        let job = store.load_recovered()?;
        let phase = job.as_ref().map(|j| j.phase).unwrap_or(JobPhase::Idle);
        let (phase_tx, _) = watch::channel(phase);
        let review = ReviewRequester::new(Arc::clone(&parts.host));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                settings,
                parts,
                review,
                job: RwLock::new(job),
                events: Mutex::new(None),
                generation: AtomicU64::new(0),
                phase_tx,
                _lock: lock,
            }),
        })
    }

    pub fn status(&self) -> JobStatus {
        let job = self.inner.job.read().unwrap_or_else(PoisonError::into_inner);
        JobStatus::from_record(job.as_ref())
    }

    pub fn phase(&self) -> JobPhase {
        self.inner
            .job
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|j| j.phase)
            .unwrap_or(JobPhase::Idle)
    }

    /// Log of the running agent, or of the most recent run.
    pub fn log_path(&self) -> Option<PathBuf> {
        let job = self.inner.job.read().unwrap_or_else(PoisonError::into_inner);
        let job = job.as_ref()?;
        job.current_run
            .as_ref()
            .map(|run| run.log_ref.clone())
            .or_else(|| job.last_outcome.as_ref().map(|o| o.log_ref.clone()))
    }

    pub async fn handle(&self, event: WorkerEvent) -> WorkerResult<EventAck> {
        match event.event_type {
            EventType::Start => self.start(event.payload).await,
            EventType::Rerun => self.rerun().await,
            EventType::Stop => self.stop().await,
            EventType::Cleanup => self.cleanup().await,
        }
    }

    pub async fn start(&self, payload: EventPayload) -> WorkerResult<EventAck> {
        let mut events = self.inner.events.lock().await;
        let phase = self.phase();
        if phase != JobPhase::Idle {
            return Err(WorkerError::EventRejected {
                event: EventType::Start,
                phase,
            });
        }

        let identity = self.resolve_identity(payload)?;
        let mut record = JobRecord::new(identity, Utc::now());
        record.transition(JobPhase::Preparing, Utc::now())?;
        info!(job = %record.identity, branch = %record.work_branch, "starting job");
        self.launch(&mut events, record, EventType::Start)
    }

    pub async fn rerun(&self) -> WorkerResult<EventAck> {
        let mut events = self.inner.events.lock().await;
        let phase = self.phase();
        if !phase.is_terminal() {
            return Err(WorkerError::EventRejected {
                event: EventType::Rerun,
                phase,
            });
        }
        if let Some(previous) = events.take() {
            let _ = previous.handle.await;
        }

        let mut record = {
            let job = self.inner.job.read().unwrap_or_else(PoisonError::into_inner);
            match job.as_ref() {
                Some(record) => record.clone(),
                None => {
                    return Err(WorkerError::EventRejected {
                        event: EventType::Rerun,
                        phase: JobPhase::Idle,
                    });
                }
            }
        };
        record.transition(JobPhase::Preparing, Utc::now())?;
        record.last_error = None;
        info!(job = %record.identity, run = record.run_count + 1, "rerunning job");
        self.launch(&mut events, record, EventType::Rerun)
    }

    /// Cancel the active run. The job is `Cancelled` as soon as this
    /// returns; the run itself gets `stop_timeout` to wind down.
    pub async fn stop(&self) -> WorkerResult<EventAck> {
        let mut events = self.inner.events.lock().await;

        // Retire the run's generation before cancelling it.
        let (record, interrupted) = {
            let mut job = self.inner.job.write().unwrap_or_else(PoisonError::into_inner);
            let phase = job.as_ref().map(|j| j.phase).unwrap_or(JobPhase::Idle);
            let Some(record) = job.as_mut().filter(|j| j.phase.is_active()) else {
                return Ok(ack(
                    EventType::Stop,
                    false,
                    phase,
                    format!("no active job (phase {})", phase),
                ));
            };
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            record.fail(JobPhase::Cancelled, ErrorKind::Cancelled, "stopped on request", Utc::now())?;
            self.inner.phase_tx.send_replace(record.phase);
            (record.clone(), phase)
        };
        let run = events.take();
        if let Some(run) = &run {
            run.cancel.cancel();
        }
        warn!(job = %record.identity, %interrupted, "job stopped");
        self.inner.store.save(Some(&record))?;
        self.write_result(&record);

        if let Some(run) = run {
            let mut handle = run.handle;
            if tokio::time::timeout(self.inner.settings.stop_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    timeout_secs = self.inner.settings.stop_timeout.as_secs(),
                    "run did not wind down in time, abandoning it"
                );
                handle.abort();
            }
        }

        Ok(ack(EventType::Stop, true, JobPhase::Cancelled, "job cancelled"))
    }

    /// Remove the working tree of a finished job and return to `Idle`.
    pub async fn cleanup(&self) -> WorkerResult<EventAck> {
        let mut events = self.inner.events.lock().await;
        let phase = self.phase();
        if phase.is_active() {
            return Err(WorkerError::EventRejected {
                event: EventType::Cleanup,
                phase,
            });
        }
        let identity = {
            let job = self.inner.job.read().unwrap_or_else(PoisonError::into_inner);
            job.as_ref().map(|j| j.identity.clone())
        };
        let Some(identity) = identity else {
            return Ok(ack(EventType::Cleanup, false, phase, "nothing to clean up"));
        };
        if let Some(previous) = events.take() {
            let _ = previous.handle.await;
        }

        self.inner.parts.workspace.remove(&identity).await?;
        {
            let mut job = self.inner.job.write().unwrap_or_else(PoisonError::into_inner);
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            *job = None;
            self.inner.phase_tx.send_replace(JobPhase::Idle);
        }
        self.inner.store.save(None)?;
        info!(job = %identity, "workspace removed, worker idle");
        Ok(ack(EventType::Cleanup, true, JobPhase::Idle, "workspace removed"))
    }

    /// Resolves once no run is active, after the run's bookkeeping is done.
    pub async fn wait_for_terminal(&self) -> JobStatus {
        let mut rx = self.inner.phase_tx.subscribe();
        loop {
            if !rx.borrow_and_update().is_active() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        let finished = self.inner.events.lock().await.take();
        if let Some(run) = finished {
            let _ = run.handle.await;
        }
        self.status()
    }

    /// Stop any active run so no agent outlives the process.
    pub async fn shutdown(&self) {
        if self.phase().is_active() {
            info!("stopping active job for shutdown");
            if let Err(e) = self.stop().await {
                error!(error = %e, "failed to stop job during shutdown");
            }
        }
    }

    fn resolve_identity(&self, payload: EventPayload) -> WorkerResult<JobIdentity> {
        let defaults = &self.inner.settings.defaults;
        let repo = payload
            .repo
            .filter(|r| !r.trim().is_empty())
            .or_else(|| defaults.repo.clone())
            .ok_or_else(|| WorkerError::Configuration("start requires a repo".to_string()))?;
        let issue_number = payload
            .issue_number
            .or(defaults.issue_number)
            .ok_or_else(|| {
                WorkerError::Configuration("start requires an issue number".to_string())
            })?;
        let base_branch = payload
            .base_branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| defaults.base_branch.clone());
        JobIdentity::new(repo, issue_number, base_branch).map_err(WorkerError::Configuration)
    }

    fn launch(
        &self,
        events: &mut Option<ActiveRun>,
        record: JobRecord,
        event: EventType,
    ) -> WorkerResult<EventAck> {
        self.inner.store.save(Some(&record))?;
        let generation = {
            let mut job = self.inner.job.write().unwrap_or_else(PoisonError::into_inner);
            *job = Some(record);
            self.inner.phase_tx.send_replace(JobPhase::Preparing);
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            this.drive(generation, token).await;
        });
        *events = Some(ActiveRun { cancel, handle });
        Ok(ack(event, true, JobPhase::Preparing, "job accepted"))
    }

    async fn drive(&self, generation: u64, cancel: CancellationToken) {
        let outcome = self.execute(generation, &cancel).await;
        if let Err(err) = outcome {
            self.record_failure(generation, err);
        }
        self.finish(generation).await;
    }

    async fn execute(&self, generation: u64, cancel: &CancellationToken) -> WorkerResult<()> {
        let parts = &self.inner.parts;
        let settings = &self.inner.settings;
        let (identity, work_branch, last_seen, known_review) = {
            let job = self.inner.job.read().unwrap_or_else(PoisonError::into_inner);
            let record = job
                .as_ref()
                .ok_or_else(|| WorkerError::Cancelled("job was cleared".to_string()))?;
            (
                record.identity.clone(),
                record.work_branch.clone(),
                record.last_seen_comment_id,
                record.review.as_ref().map(|r| r.number),
            )
        };

        // Preparing
        let issue = cancellable(cancel, parts.host.get_issue(&identity.repo, identity.issue_number)).await?;
        let comments = cancellable(
            cancel,
            parts.host.list_issue_comments(&identity.repo, identity.issue_number),
        )
        .await?;
        let task = render_task(&identity, &work_branch, &issue, &comments, last_seen);
        let newest_comment = newest_comment_id(&comments, last_seen);
        let workspace = parts.workspace.prepare(&identity, &work_branch, cancel).await?;

        // AgentRunning
        let run_id = Uuid::new_v4();
        let run_dir = settings.runs_dir.join(run_id.to_string());
        let log_ref = run_dir.join("agent.log");
        let run_number = self.apply(generation, |record| {
            record.transition(JobPhase::AgentRunning, Utc::now())?;
            record.run_count += 1;
            record.current_run = Some(AgentRunInfo {
                run_id,
                run_number: record.run_count,
                started_at: Utc::now(),
                log_ref: log_ref.clone(),
            });
            Ok(record.run_count)
        })?;
        let request = AgentRequest {
            run_id,
            run_number,
            workspace: workspace.clone(),
            run_dir,
            task,
            timeout: settings.agent_timeout,
        };
        info!(job = %identity, run = run_number, log = %log_ref.display(), "agent started");
        let outcome = parts.agent.run(&request, cancel.clone()).await;
        let (status, detail) = (outcome.status, outcome.detail.clone());
        self.apply(generation, |record| {
            record.last_outcome = Some(outcome);
            Ok(())
        })?;
        match status {
            AgentStatus::Succeeded => {}
            AgentStatus::Failed | AgentStatus::TimedOut => return Err(WorkerError::Agent(detail)),
            AgentStatus::Cancelled => return Err(WorkerError::Cancelled(detail)),
        }
        let verified = parts
            .verifier
            .run(&workspace, &request.log_path(), cancel)
            .await?;

        // Publishing
        self.apply(generation, |record| {
            record.transition(JobPhase::Publishing, Utc::now())?;
            record.current_run = None;
            Ok(())
        })?;
        let commit = parts
            .workspace
            .commit_all(&workspace, &commit_message(&issue))
            .await?;
        if let CommitResult::Committed { sha } = &commit {
            info!(job = %identity, %sha, "committed agent changes");
        }
        if commit == CommitResult::NothingToCommit
            && parts
                .workspace
                .commits_ahead(&workspace, &identity.base_branch)
                .await?
                == 0
        {
            return Err(WorkerError::Agent(
                "agent produced no changes to publish".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled("stopped before push".to_string()));
        }
        let pushed = parts.publisher.push(&workspace, &work_branch, cancel).await?;
        let head = parts.workspace.head_sha(&workspace).await?;
        info!(job = %identity, branch = %work_branch, result = ?pushed, head = %head, "branch published");

        // RequestingReview
        self.apply(generation, |record| {
            record.transition(JobPhase::RequestingReview, Utc::now())?;
            record.head_sha = Some(head);
            Ok(())
        })?;
        let content = ReviewContent::render(&identity, &issue, &verified);
        let review = cancellable(
            cancel,
            self.inner
                .review
                .ensure_ready(&identity, &work_branch, &content, known_review),
        )
        .await?;
        info!(job = %identity, pull = review.number, url = %review.url, "pull request ready");

        self.apply(generation, |record| {
            record.transition(JobPhase::Completed, Utc::now())?;
            record.review = Some(review);
            record.last_seen_comment_id = newest_comment;
            Ok(())
        })
    }

    /// Mutate and persist the job record on behalf of run `generation`.
    fn apply<T>(
        &self,
        generation: u64,
        change: impl FnOnce(&mut JobRecord) -> WorkerResult<T>,
    ) -> WorkerResult<T> {
        let mut job = self.inner.job.write().unwrap_or_else(PoisonError::into_inner);
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return Err(WorkerError::Cancelled("job was stopped".to_string()));
        }
        let record = job
            .as_mut()
            .ok_or_else(|| WorkerError::Cancelled("job was cleared".to_string()))?;
        let value = change(record)?;
        record.updated_at = Utc::now();
        self.inner.phase_tx.send_replace(record.phase);
        self.inner.store.save(Some(record))?;
        Ok(value)
    }

    fn record_failure(&self, generation: u64, err: WorkerError) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(error = %err, "run ended after being stopped");
            return;
        }
        let kind = err.kind();
        let terminal = if kind == ErrorKind::Cancelled {
            JobPhase::Cancelled
        } else {
            JobPhase::Failed
        };
        let message = scrub(self.inner.parts.redactor.as_ref(), &err.to_string());
        let result = self.apply(generation, |record| {
            let interrupted = record.phase;
            record.fail(terminal, kind, message.clone(), Utc::now())?;
            error!(job = %record.identity, phase = %interrupted, %kind, error = %message, "job failed");
            Ok(())
        });
        if let Err(e) = result {
            error!(error = %e, "failed to record job failure");
        }
    }

    /// Result file and issue comment for a run that reached a terminal phase.
    async fn finish(&self, generation: u64) {
        let record = {
            let job = self.inner.job.read().unwrap_or_else(PoisonError::into_inner);
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match job.as_ref() {
                Some(record) if record.phase.is_terminal() => record.clone(),
                _ => return,
            }
        };
        self.write_result(&record);

        if !self.inner.settings.report_to_issue {
            return;
        }
        if let Some(body) = issue_report(&record) {
            let posted = self
                .inner
                .parts
                .host
                .create_issue_comment(&record.identity.repo, record.identity.issue_number, &body)
                .await;
            if let Err(e) = posted {
                warn!(job = %record.identity, error = %e, "could not comment on issue");
            }
        }
    }

    fn write_result(&self, record: &JobRecord) {
        let result = JobResult {
            repo: &record.identity.repo,
            issue_number: record.identity.issue_number,
            base_branch: &record.identity.base_branch,
            work_branch: &record.work_branch,
            phase: record.phase,
            run_count: record.run_count,
            review: record.review.as_ref(),
            head_sha: record.head_sha.as_deref(),
            last_error: record.last_error.as_ref(),
            written_at: Utc::now(),
        };
        if let Err(e) = write_json_atomic(&self.inner.settings.result_file, &result) {
            warn!(error = %e, "could not write result file");
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = WorkerResult<T>>,
) -> WorkerResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkerError::Cancelled("stop requested".to_string())),
        result = work => result,
    }
}

fn ack(event: EventType, accepted: bool, phase: JobPhase, message: impl Into<String>) -> EventAck {
    EventAck {
        event,
        accepted,
        phase,
        message: message.into(),
    }
}

fn issue_report(record: &JobRecord) -> Option<String> {
    match record.phase {
        JobPhase::Completed => record.review.as_ref().map(|review| {
            format!(
                "Pull request #{} is ready for review: {}\n\nBranch `{}`, run {}.",
                review.number, review.url, record.work_branch, record.run_count
            )
        }),
        JobPhase::Failed => record.last_error.as_ref().map(|err| {
            format!(
                "Run {} on branch `{}` failed ({}): {}\n\nSend a rerun event to try again.",
                record.run_count, record.work_branch, err.kind, err.message
            )
        }),
        _ => None,
    }
}
