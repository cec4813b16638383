//! Checks run once before the worker accepts jobs.
//!
//! Independent checks all run, so the operator sees every problem in a single
//! `ConfigurationError`. The repository checks need a working token and a
//! configured default repository.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{WorkerError, WorkerResult};
use crate::worker::git::{Access, GitRunner, failure_message};
use crate::worker::github::CodeHost;

pub struct StartupCheck<'a> {
    pub host: &'a dyn CodeHost,
    pub git: &'a GitRunner,
    pub agent_command: &'a [String],
    /// Environment the agent will see; `PATH` here resolves the program.
    pub agent_env: &'a [(String, String)],
    pub repo: Option<&'a str>,
}

impl StartupCheck<'_> {
    pub async fn run(&self) -> WorkerResult<()> {
        let mut problems = Vec::new();

        match self.host.authenticated_user().await {
            Ok(user) => {
                info!(login = %user.login, "GitHub token accepted");
                if let Some(repo) = self.repo {
                    let access = match self.check_repository(repo).await {
                        Ok(()) => self.check_git_remote(repo).await,
                        Err(problem) => Err(problem),
                    };
                    if let Err(problem) = access {
                        problems.push(problem);
                    }
                }
            }
            Err(e) => problems.push(token_problem(&e)),
        }
        if let Err(problem) = check_agent_program(self.agent_command, self.agent_env) {
            problems.push(problem);
        }
        if let Err(problem) = check_llm_settings(self.agent_env) {
            problems.push(problem);
        }

        if problems.is_empty() {
            return Ok(());
        }
        let listed: Vec<String> = problems.iter().map(|p| format!("  - {}", p)).collect();
        Err(WorkerError::Configuration(format!(
            "startup checks failed:\n{}",
            listed.join("\n")
        )))
    }

    async fn check_repository(&self, repo: &str) -> Result<(), String> {
        match self.host.get_repository(repo).await {
            Ok(found) if found.permissions.as_ref().is_some_and(|p| p.push) => Ok(()),
            Ok(_) => Err(format!("GitHub token does not have push permission to {}", repo)),
            Err(WorkerError::Api { status: 401, .. }) => {
                Err(format!("GitHub token is invalid or expired for {}", repo))
            }
            Err(WorkerError::Api { status: 403 | 404, .. }) => Err(format!(
                "GitHub token cannot access {} or lacks permissions",
                repo
            )),
            Err(e) => Err(format!("cannot check permissions on {}: {}", repo, e)),
        }
    }

    async fn check_git_remote(&self, repo: &str) -> Result<(), String> {
        let url = self.git.remote_url(repo);
        let args = ["ls-remote", "--heads", url.as_str()];
        let output = self
            .git
            .run(None, &args, Access::Remote, &CancellationToken::new())
            .await
            .map_err(|e| format!("git cannot reach {}: {}", repo, e))?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr.to_lowercase();
        if stderr.contains("authentication failed") || stderr.contains("invalid credentials") {
            Err(format!("GitHub token authentication failed for git over HTTPS ({})", repo))
        } else if stderr.contains("permission denied") || stderr.contains("error: 403") {
            Err(format!("GitHub token lacks permission for git over HTTPS ({})", repo))
        } else {
            Err(format!(
                "git remote check failed for {}: {}",
                repo,
                failure_message(&args, &output)
            ))
        }
    }
}

fn token_problem(err: &WorkerError) -> String {
    match err {
        WorkerError::Api { status: 401, .. } => {
            "GitHub token is invalid or expired; check GITHUB_TOKEN (or ENGINEER_PAT_KEY)".to_string()
        }
        WorkerError::Api { status: 403, .. } => {
            "GitHub token lacks required permissions; it needs the 'repo' scope".to_string()
        }
        other => format!("GitHub token check failed: {}", other),
    }
}

fn check_agent_program(command: &[String], env: &[(String, String)]) -> Result<(), String> {
    let Some(program) = command.first() else {
        return Err("AGENT_COMMAND is empty".to_string());
    };
    match resolve_program(program, env_value(env, "PATH")) {
        Some(path) => {
            debug!(program = %path.display(), "agent program resolved");
            Ok(())
        }
        None => Err(format!(
            "agent program '{}' was not found or is not executable",
            program
        )),
    }
}

/// Locate `program` the way a spawn with the given `PATH` would.
pub fn resolve_program(program: &str, path_var: Option<&str>) -> Option<PathBuf> {
    if program.contains('/') {
        let candidate = PathBuf::from(program);
        return is_executable(&candidate).then_some(candidate);
    }
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Model settings are optional since the agent may bring its own
/// configuration; when present they must be complete.
fn check_llm_settings(env: &[(String, String)]) -> Result<(), String> {
    let (provider, model) = match (env_value(env, "LLM_MODEL"), env_value(env, "OPENAI_MODEL")) {
        (Some(model), _) => match model.split_once('/') {
            Some((provider, name)) if !provider.is_empty() && !name.is_empty() => {
                (provider.to_lowercase(), model)
            }
            _ => {
                return Err(format!(
                    "LLM_MODEL must look like provider/model (e.g. openai/gpt-4o), got '{}'",
                    model
                ));
            }
        },
        (None, Some(model)) => ("openai".to_string(), model),
        (None, None) => return Ok(()),
    };

    let has = |keys: &[&str]| keys.iter().any(|key| env_value(env, key).is_some());
    match provider.as_str() {
        "openai" if !has(&["OPENAI_API_KEY", "LLM_API_KEY"]) => Err(format!(
            "model '{}' needs OPENAI_API_KEY (or LLM_API_KEY)",
            model
        )),
        "gemini" if !has(&["GEMINI_API_KEY", "GOOGLE_API_KEY", "LLM_API_KEY"]) => Err(format!(
            "model '{}' needs GEMINI_API_KEY or GOOGLE_API_KEY",
            model
        )),
        "anthropic" if !has(&["ANTHROPIC_API_KEY", "LLM_API_KEY"]) => Err(format!(
            "model '{}' needs ANTHROPIC_API_KEY (or LLM_API_KEY)",
            model
        )),
        _ => Ok(()),
    }
}

fn env_value<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::review::test_support::FakeHost;
    use crate::worker::workspace::test_support::RemoteFixture;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn system_path() -> Vec<(String, String)> {
        env(&[("PATH", std::env::var("PATH").unwrap().as_str())])
    }

    fn command(program: &str) -> Vec<String> {
        vec![program.to_string(), "--task".to_string()]
    }

    #[tokio::test]
    async fn passes_with_valid_token_repo_and_agent() {
        let fixture = RemoteFixture::new();
        let host = FakeHost::new();
        let git = GitRunner::new(&fixture.remote_base(), None);
        let agent = command("sh");
        let agent_env = system_path();
        StartupCheck {
            host: &host,
            git: &git,
            agent_command: &agent,
            agent_env: &agent_env,
            repo: Some(fixture.repo.as_str()),
        }
        .run()
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn collects_every_problem() {
        let fixture = RemoteFixture::new();
        let host = FakeHost::new();
        host.state.lock().unwrap().auth_status = Some(401);
        let git = GitRunner::new(&fixture.remote_base(), None);
        let agent = command("no-such-agent-binary");
        let mut agent_env = system_path();
        agent_env.extend(env(&[("LLM_MODEL", "gpt-4o")]));

        let err = StartupCheck {
            host: &host,
            git: &git,
            agent_command: &agent,
            agent_env: &agent_env,
            repo: Some(fixture.repo.as_str()),
        }
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, WorkerError::Configuration(_)));
        let message = err.to_string();
        assert!(message.contains("invalid or expired"), "{}", message);
        assert!(message.contains("no-such-agent-binary"), "{}", message);
        assert!(message.contains("provider/model"), "{}", message);
        assert_eq!(message.matches("\n  - ").count(), 3, "{}", message);
    }

    #[tokio::test]
    async fn read_only_repository_is_reported() {
        let fixture = RemoteFixture::new();
        let host = FakeHost::new();
        host.state.lock().unwrap().read_only = true;
        let git = GitRunner::new(&fixture.remote_base(), None);
        let agent = command("sh");
        let agent_env = system_path();
        let err = StartupCheck {
            host: &host,
            git: &git,
            agent_command: &agent,
            agent_env: &agent_env,
            repo: Some(fixture.repo.as_str()),
        }
        .run()
        .await
        .unwrap_err();
        assert!(err.to_string().contains("push permission"), "{}", err);
    }

    #[tokio::test]
    async fn unreachable_git_remote_is_reported() {
        let fixture = RemoteFixture::new();
        let host = FakeHost::new();
        let git = GitRunner::new(&fixture.remote_base(), None);
        let agent = command("sh");
        let agent_env = system_path();
        let err = StartupCheck {
            host: &host,
            git: &git,
            agent_command: &agent,
            agent_env: &agent_env,
            repo: Some("acme/missing"),
        }
        .run()
        .await
        .unwrap_err();
        assert!(err.to_string().contains("git remote check failed for acme/missing"), "{}", err);
    }

    #[tokio::test]
    async fn repository_checks_skipped_without_default_repo() {
        let host = FakeHost::new();
        host.state.lock().unwrap().read_only = true;
        let git = GitRunner::new("file:///nonexistent", None);
        let agent = command("sh");
        let agent_env = system_path();
        StartupCheck {
            host: &host,
            git: &git,
            agent_command: &agent,
            agent_env: &agent_env,
            repo: None,
        }
        .run()
        .await
        .unwrap();
    }

    #[test]
    fn program_resolution_follows_path_and_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("notes.txt");
        std::fs::write(&plain, "not a program").unwrap();
        let path_var = std::env::var("PATH").unwrap();

        assert!(resolve_program("sh", Some(&path_var)).is_some());
        assert!(resolve_program("sh", None).is_none());
        assert!(resolve_program("no-such-agent-binary", Some(&path_var)).is_none());
        assert!(resolve_program(plain.to_str().unwrap(), None).is_none());
        assert_eq!(resolve_program("/bin/sh", None), Some(PathBuf::from("/bin/sh")));
    }

    #[test]
    fn model_settings_need_matching_key() {
        assert!(check_llm_settings(&[]).is_ok());
        assert!(check_llm_settings(&env(&[("OPENAI_MODEL", "gpt-4o")])).is_err());
        assert!(check_llm_settings(&env(&[
            ("OPENAI_MODEL", "gpt-4o"),
            ("OPENAI_API_KEY", "sk-test")
        ]))
        .is_ok());
        assert!(check_llm_settings(&env(&[
            ("LLM_MODEL", "gemini/gemini-1.5-pro"),
            ("GOOGLE_API_KEY", "g-test")
        ]))
        .is_ok());
        let err = check_llm_settings(&env(&[("LLM_MODEL", "anthropic/claude")])).unwrap_err();
        assert!(err.contains("ANTHROPIC_API_KEY"));
        assert!(check_llm_settings(&env(&[("LLM_MODEL", "ollama/llama3")])).is_ok());
    }
}
