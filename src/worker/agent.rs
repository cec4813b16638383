//! Runs the external coding agent as a supervised subprocess.
//!
//! The agent gets its own process group so that stop and timeout reach every
//! process it spawned: SIGTERM first, then SIGKILL once the grace period runs
//! out. Stdout and stderr are streamed line by line, scrubbed, into an
//! append-only log file per run. That file is the only place agent output is
//! kept; outcomes carry a reference to it rather than its contents.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use issue_worker_common::{AgentOutcome, AgentStatus};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credential::{Credential, scrub};
use crate::errors::{WorkerError, WorkerResult};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for output readers once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment variable pointing the agent at its task description.
pub const TASK_FILE_ENV: &str = "WORKER_TASK_FILE";

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: Uuid,
    pub run_number: u32,
    pub workspace: PathBuf,
    /// Per-run directory outside the workspace for the task file and log.
    pub run_dir: PathBuf,
    pub task: String,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join("agent.log")
    }

    pub fn task_path(&self) -> PathBuf {
        self.run_dir.join("task.md")
    }
}

/// Runs one agent invocation to completion. Failures to even start the agent
/// are reported as a `Failed` outcome, never as an error.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: &AgentRequest, cancel: CancellationToken) -> AgentOutcome;
}

pub struct ProcessAgentRunner {
    command: Vec<String>,
    env: Vec<(String, String)>,
    home: Option<PathBuf>,
    grace: Duration,
    heartbeat: Duration,
    redactor: Option<Credential>,
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessAgentRunner {
    pub fn new(command: Vec<String>, grace: Duration) -> Self {
        Self {
            command,
            env: Vec::new(),
            home: None,
            grace,
            heartbeat: HEARTBEAT_INTERVAL,
            redactor: None,
        }
    }

    /// The agent starts from an empty environment plus these variables.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Give the agent a private HOME so provider state stays out of the
    /// workspace.
    pub fn with_home(mut self, home: PathBuf) -> Self {
        self.home = Some(home);
        self
    }

    pub fn with_redactor(mut self, credential: Credential) -> Self {
        self.redactor = Some(credential);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    fn build_command(&self, request: &AgentRequest) -> WorkerResult<(String, Command)> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| WorkerError::Configuration("agent command is empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workspace)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(TASK_FILE_ENV, request.task_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(home) = &self.home {
            cmd.env("HOME", home);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        Ok((program.clone(), cmd))
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> WorkerResult<(AgentStatus, Option<i32>, String)> {
        tokio::fs::create_dir_all(&request.run_dir)
            .await
            .map_err(|e| agent_io("create run directory", &request.run_dir, e))?;
        let task_path = request.task_path();
        tokio::fs::write(&task_path, &request.task)
            .await
            .map_err(|e| agent_io("write task file", &task_path, e))?;
        if let Some(home) = &self.home {
            tokio::fs::create_dir_all(home)
                .await
                .map_err(|e| agent_io("create agent home", home, e))?;
        }

        let log_path = request.log_path();
        let (tx, writer) = spawn_log_writer(&log_path).await?;

        let (program, mut cmd) = self.build_command(request)?;
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                drop(tx);
                let _ = writer.await;
                return Err(WorkerError::Agent(format!(
                    "failed to start agent '{}': {}",
                    program, e
                )));
            }
        };
        let pid = child.id();
        info!(run = request.run_number, pid, log = %log_path.display(), "agent started");

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(stdout, tx.clone(), self.redactor.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(stderr, tx.clone(), self.redactor.clone())));
        }

        let ending = self.supervise(&mut child, request, cancel).await;
        let result = match ending {
            Ending::Exited(Ok(status)) => {
                // Background processes left behind by the agent.
                signal_group(pid, Signal::Kill);
                if status.success() {
                    (AgentStatus::Succeeded, Some(0), "agent exited successfully".to_string())
                } else {
                    (
                        AgentStatus::Failed,
                        status.code(),
                        format!(
                            "agent {}; output is in {}",
                            describe_exit(status),
                            log_path.display()
                        ),
                    )
                }
            }
            Ending::Exited(Err(e)) => {
                warn!(error = %e, "lost track of agent process");
                terminate(&mut child, pid, self.grace).await;
                (AgentStatus::Failed, None, format!("waiting on agent failed: {}", e))
            }
            Ending::TimedOut => {
                warn!(run = request.run_number, timeout_secs = request.timeout.as_secs(), "agent timed out");
                let status = terminate(&mut child, pid, self.grace).await;
                (
                    AgentStatus::TimedOut,
                    status.and_then(|s| s.code()),
                    format!(
                        "agent exceeded its {}s timeout and was stopped",
                        request.timeout.as_secs()
                    ),
                )
            }
            Ending::Cancelled => {
                info!(run = request.run_number, "stopping agent");
                let status = terminate(&mut child, pid, self.grace).await;
                (
                    AgentStatus::Cancelled,
                    status.and_then(|s| s.code()),
                    "agent stopped on request".to_string(),
                )
            }
        };

        let _ = tx.send(format!("[issue-worker] {}", result.2));
        drop(tx);
        for pump in pumps {
            let abort = pump.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
                debug!("agent output reader did not finish; abandoning it");
                abort.abort();
            }
        }
        if let Err(e) = writer.await {
            warn!(error = %e, "agent log writer panicked");
        }
        Ok(result)
    }

    async fn supervise(
        &self,
        child: &mut Child,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Ending {
        let started = Instant::now();
        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval_at(started + self.heartbeat, self.heartbeat);

        loop {
            tokio::select! {
                status = child.wait() => return Ending::Exited(status),
                _ = &mut deadline => return Ending::TimedOut,
                _ = cancel.cancelled() => return Ending::Cancelled,
                _ = heartbeat.tick() => {
                    info!(
                        run = request.run_number,
                        elapsed_secs = started.elapsed().as_secs(),
                        "agent still running"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, request: &AgentRequest, cancel: CancellationToken) -> AgentOutcome {
        let started_at = Utc::now();
        let (status, exit_code, detail) = match self.execute(request, &cancel).await {
            Ok(result) => result,
            Err(e) => (AgentStatus::Failed, None, scrub(self.redactor.as_ref(), &e.to_string())),
        };
        info!(run = request.run_number, %status, ?exit_code, "agent finished");
        AgentOutcome {
            run_id: request.run_id,
            run_number: request.run_number,
            status,
            exit_code,
            log_ref: request.log_path(),
            started_at,
            finished_at: Utc::now(),
            detail,
        }
    }
}

fn agent_io(action: &str, path: &Path, err: std::io::Error) -> WorkerError {
    WorkerError::Agent(format!("cannot {} {}: {}", action, path.display(), err))
}

async fn spawn_log_writer(
    path: &Path,
) -> WorkerResult<(mpsc::UnboundedSender<String>, JoinHandle<()>)> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| agent_io("open log", path, e))?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let mut batch = line;
            batch.push('\n');
            while let Ok(more) = rx.try_recv() {
                batch.push_str(&more);
                batch.push('\n');
            }
            if let Err(e) = file.write_all(batch.as_bytes()).await {
                warn!(error = %e, "failed to write agent log");
                break;
            }
            let _ = file.flush().await;
        }
    });
    Ok((tx, handle))
}

/// Forward lines until EOF. Invalid UTF-8 is replaced rather than ending the
/// read, which would otherwise leave the agent blocked on a full pipe.
async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>, redactor: Option<Credential>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if tx.send(scrub(redactor.as_ref(), line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "agent output stream closed");
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) only takes integers. The agent was spawned with
    // process_group(0), so its pid is also its group id.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signo) };
    if rc != 0 {
        debug!(pid, ?signal, error = %std::io::Error::last_os_error(), "process group signal not delivered");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// SIGTERM the group, wait up to `grace`, then SIGKILL whatever is left.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> Option<ExitStatus> {
    signal_group(pid, Signal::Term);
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(error = %e, "failed waiting for agent after SIGTERM");
            None
        }
        Err(_) => {
            warn!(grace_secs = grace.as_secs_f32(), "agent ignored SIGTERM, killing");
            None
        }
    };
    signal_group(pid, Signal::Kill);
    match status {
        Some(status) => Some(status),
        None => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was killed by signal {}", signal);
        }
    }
    "exited abnormally".to_string()
}

/// Last `max_lines` lines of a log file.
pub async fn read_log_tail(path: &Path, max_lines: usize) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    Ok(lines[start..].join("\n"))
}
