use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Args};

use crate::credential::Credential;
use crate::errors::{WorkerError, WorkerResult};

/// Environment forwarded to the agent subprocess when set. The agent starts
/// from an otherwise empty environment, so the GitHub token never reaches it.
pub const AGENT_ENV_PASSTHROUGH: &[&str] = &[
    "LLM_MODEL",
    "LLM_API_KEY",
    "LLM_BASE_URL",
    "OPENAI_API_KEY",
    "OPENAI_BASE_URL",
    "OPENAI_MODEL",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "PATH",
    "LANG",
    "TZ",
    "TMPDIR",
    "USER",
    "SHELL",
    "TERM",
];

/// Settings read from flags, the environment and an optional `.env` file.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Root directory for workspaces, state, logs and run artifacts
    #[arg(long, env = "WORK_ROOT", default_value = "work", global = true)]
    pub work_root: PathBuf,

    /// Token used for pushes and GitHub API calls
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    pub github_token: Option<String>,

    /// Alternate token variable, used when GITHUB_TOKEN is unset
    #[arg(long, env = "ENGINEER_PAT_KEY", hide_env_values = true, global = true)]
    pub engineer_pat_key: Option<String>,

    #[arg(
        long,
        env = "GITHUB_API_URL",
        default_value = "https://api.github.com",
        global = true
    )]
    pub github_api_url: String,

    /// Base URL repositories are cloned from (`<base>/<owner>/<name>.git`)
    #[arg(
        long,
        env = "GIT_REMOTE_BASE",
        default_value = "https://github.com",
        global = true
    )]
    pub git_remote_base: String,

    /// Agent program and arguments, split on whitespace
    #[arg(long, env = "AGENT_COMMAND", global = true)]
    pub agent_command: Option<String>,

    #[arg(long, env = "AGENT_TIMEOUT_SECS", default_value_t = 3600, global = true)]
    pub agent_timeout_secs: u64,

    /// Seconds between SIGTERM and a forced kill when stopping the agent
    #[arg(long, env = "AGENT_GRACE_SECS", default_value_t = 10, global = true)]
    pub agent_grace_secs: u64,

    #[arg(
        long,
        env = "GIT_AUTHOR_NAME",
        default_value = "issue-worker-bot",
        global = true
    )]
    pub git_author_name: String,

    #[arg(
        long,
        env = "GIT_AUTHOR_EMAIL",
        default_value = "issue-worker-bot@users.noreply.github.com",
        global = true
    )]
    pub git_author_email: String,

    /// Commands run in the workspace after the agent; newline or `;;` separated
    #[arg(long, env = "VERIFY_COMMANDS", global = true)]
    pub verify_commands: Option<String>,

    /// Default repository (owner/name) for start events without one
    #[arg(long, env = "REPO", global = true)]
    pub repo: Option<String>,

    /// Default issue number for start events without one
    #[arg(long, env = "ISSUE_NUMBER", global = true)]
    pub issue_number: Option<u64>,

    #[arg(long, env = "BASE_BRANCH", default_value = "main", global = true)]
    pub base_branch: String,

    /// Post a comment on the issue when a job completes or fails
    #[arg(
        long,
        env = "REPORT_TO_ISSUE",
        default_value_t = true,
        action = ArgAction::Set,
        global = true
    )]
    pub report_to_issue: bool,
}

/// Layout of the work root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPaths {
    pub root: PathBuf,
    pub repos_dir: PathBuf,
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub agent_home: PathBuf,
    pub logs_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub out_dir: PathBuf,
    pub result_file: PathBuf,
}

impl WorkPaths {
    pub fn new(root: &Path) -> WorkerResult<Self> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| {
                    WorkerError::Configuration(format!("cannot resolve working directory: {}", e))
                })?
                .join(root)
        };
        let state_dir = root.join("state");
        let out_dir = root.join("out");
        Ok(Self {
            repos_dir: root.join("repos"),
            state_file: state_dir.join("state.json"),
            lock_file: state_dir.join("instance.lock"),
            agent_home: state_dir.join("agent_home"),
            state_dir,
            logs_dir: root.join("logs"),
            runs_dir: root.join("runs"),
            result_file: out_dir.join("result.json"),
            out_dir,
            root,
        })
    }

    pub fn ensure_directories(&self) -> WorkerResult<()> {
        for dir in [
            &self.repos_dir,
            &self.state_dir,
            &self.agent_home,
            &self.logs_dir,
            &self.runs_dir,
            &self.out_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                WorkerError::Configuration(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitAuthor {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub grace: Duration,
    pub env: Vec<(String, String)>,
}

/// Fallbacks used to fill a `start` event's payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobDefaults {
    pub repo: Option<String>,
    pub issue_number: Option<u64>,
    pub base_branch: String,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub paths: WorkPaths,
    pub credential: Credential,
    pub github_api_url: String,
    pub git_remote_base: String,
    pub agent: AgentSettings,
    pub git_author: GitAuthor,
    pub verify_commands: Vec<String>,
    pub defaults: JobDefaults,
    pub report_to_issue: bool,
}

impl WorkerConfig {
    /// Validate everything a job needs before any job is accepted.
    pub fn from_args(args: &ConfigArgs) -> WorkerResult<Self> {
        let credential = Credential::from_sources(
            args.github_token.as_deref(),
            args.engineer_pat_key.as_deref(),
        )?;
        let command = parse_agent_command(args.agent_command.as_deref())?;
        if args.agent_timeout_secs == 0 {
            return Err(WorkerError::Configuration(
                "AGENT_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }
        let base_branch = args.base_branch.trim().to_string();
        if base_branch.is_empty() {
            return Err(WorkerError::Configuration(
                "BASE_BRANCH must not be empty".to_string(),
            ));
        }

        Ok(Self {
            paths: WorkPaths::new(&args.work_root)?,
            credential,
            github_api_url: validate_url("GITHUB_API_URL", &args.github_api_url)?,
            git_remote_base: validate_url("GIT_REMOTE_BASE", &args.git_remote_base)?,
            agent: AgentSettings {
                command,
                timeout: Duration::from_secs(args.agent_timeout_secs),
                grace: Duration::from_secs(args.agent_grace_secs),
                env: passthrough_env(),
            },
            git_author: GitAuthor {
                name: args.git_author_name.clone(),
                email: args.git_author_email.clone(),
            },
            verify_commands: parse_verify_commands(args.verify_commands.as_deref()),
            defaults: JobDefaults {
                repo: args.repo.clone().filter(|r| !r.trim().is_empty()),
                issue_number: args.issue_number,
                base_branch,
            },
            report_to_issue: args.report_to_issue,
        })
    }
}

pub fn parse_agent_command(raw: Option<&str>) -> WorkerResult<Vec<String>> {
    let parts: Vec<String> = raw
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        return Err(WorkerError::Configuration(
            "AGENT_COMMAND is required".to_string(),
        ));
    }
    Ok(parts)
}

pub fn parse_verify_commands(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(['\n', '\r'])
        .flat_map(|line| line.split(";;"))
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
        .map(str::to_string)
        .collect()
}

/// Trailing slashes are dropped so URLs can be joined with `/`.
fn validate_url(name: &str, value: &str) -> WorkerResult<String> {
    let value = value.trim().trim_end_matches('/');
    let scheme_ok = ["https://", "http://", "file://"]
        .iter()
        .any(|scheme| value.starts_with(scheme));
    if !scheme_ok {
        return Err(WorkerError::Configuration(format!(
            "{} must be an http(s) or file URL, got '{}'",
            name, value
        )));
    }
    let authority = value.split("://").nth(1).unwrap_or_default();
    if authority.split('/').next().unwrap_or_default().contains('@') {
        return Err(WorkerError::Configuration(format!(
            "{} must not embed credentials",
            name
        )));
    }
    Ok(value.to_string())
}

fn passthrough_env() -> Vec<(String, String)> {
    AGENT_ENV_PASSTHROUGH
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}
