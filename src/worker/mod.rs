//! The per-issue job worker.
//!
//! | Module       | Role                                                      |
//! |--------------|-----------------------------------------------------------|
//! | `git`        | git CLI invocations with per-call credential headers      |
//! | `workspace`  | clone, branch, reset and commit the job's working tree    |
//! | `publisher`  | push the work branch, one rebase retry on divergence      |
//! | `agent`      | run and supervise the coding agent subprocess             |
//! | `verify`     | operator commands run after a successful agent run        |
//! | `preflight`  | token, repository and agent checks before serving         |
//! | `task`       | render the task handed to the agent                       |
//! | `github`     | REST and GraphQL client for issues and pull requests      |
//! | `review`     | find-or-create the pull request and mark it ready         |
//! | `state`      | durable snapshot and instance lock                        |
//! | `supervisor` | the job state machine                                     |
//! | `server`     | HTTP transport for events and status                      |

pub mod agent;
pub mod git;
pub mod github;
pub mod preflight;
pub mod publisher;
pub mod review;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod verify;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::errors::WorkerResult;

use agent::ProcessAgentRunner;
use git::GitRunner;
use github::GitHubClient;
use preflight::StartupCheck;
use publisher::GitPublisher;
use state::{InstanceLock, StateStore};
use supervisor::{Collaborators, JobSupervisor, SupervisorSettings};
use verify::Verifier;
use workspace::WorkspaceManager;

/// Extra time `stop` allows past the agent's grace period.
const STOP_MARGIN: Duration = Duration::from_secs(5);

/// Verify the token, the default repository and the agent command before
/// any job is accepted.
pub async fn check_startup(config: &WorkerConfig) -> WorkerResult<()> {
    let host = GitHubClient::new(&config.github_api_url, config.credential.clone())?;
    let git = GitRunner::new(&config.git_remote_base, Some(config.credential.clone()));
    StartupCheck {
        host: &host,
        git: &git,
        agent_command: &config.agent.command,
        agent_env: &config.agent.env,
        repo: config.defaults.repo.as_deref(),
    }
    .run()
    .await
}

/// Wire the production collaborators together and load the persisted job.
pub fn assemble(config: &WorkerConfig, lock: Option<InstanceLock>) -> WorkerResult<JobSupervisor> {
    config.paths.ensure_directories()?;
    let credential = config.credential.clone();

    let git = GitRunner::new(&config.git_remote_base, Some(credential.clone()));
    let workspace = WorkspaceManager::new(
        config.paths.repos_dir.clone(),
        git.clone(),
        config.git_author.clone(),
    );
    let publisher = GitPublisher::new(git.with_identity(config.git_author.clone()));
    let agent = ProcessAgentRunner::new(config.agent.command.clone(), config.agent.grace)
        .with_env(config.agent.env.clone())
        .with_home(config.paths.agent_home.clone())
        .with_redactor(credential.clone());

    let mut verify_env = config.agent.env.clone();
    verify_env.push((
        "HOME".to_string(),
        config.paths.agent_home.display().to_string(),
    ));
    let verifier = Verifier::new(config.verify_commands.clone(), verify_env)
        .with_redactor(credential.clone());
    let host = GitHubClient::new(&config.github_api_url, credential.clone())?;

    let settings = SupervisorSettings {
        runs_dir: config.paths.runs_dir.clone(),
        result_file: config.paths.result_file.clone(),
        agent_timeout: config.agent.timeout,
        stop_timeout: config.agent.grace + STOP_MARGIN,
        defaults: config.defaults.clone(),
        report_to_issue: config.report_to_issue,
    };
    let parts = Collaborators {
        workspace: Arc::new(workspace),
        agent: Arc::new(agent),
        publisher: Arc::new(publisher),
        host: Arc::new(host),
        verifier,
        redactor: Some(credential),
    };
    JobSupervisor::open(
        StateStore::new(&config.paths.state_file),
        settings,
        parts,
        lock,
    )
}
