//! Post-agent verification commands.
//!
//! Each command runs through `sh -c` in the workspace. Output goes to the
//! run's log file only; a failing command fails the run as an agent error
//! because the agent's change did not pass.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::credential::{Credential, scrub};
use crate::errors::{WorkerError, WorkerResult};

pub struct Verifier {
    commands: Vec<String>,
    env: Vec<(String, String)>,
    redactor: Option<Credential>,
}

impl Verifier {
    pub fn new(commands: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self {
            commands,
            env,
            redactor: None,
        }
    }

    pub fn with_redactor(mut self, credential: Credential) -> Self {
        self.redactor = Some(credential);
        self
    }

    /// Run every command in order, stopping at the first failure. Returns the
    /// commands that passed.
    pub async fn run(
        &self,
        workspace: &Path,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> WorkerResult<Vec<String>> {
        let mut passed = Vec::new();
        for command in &self.commands {
            info!(command = %command, "running verification");
            let child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(workspace)
                .env_clear()
                .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| WorkerError::Agent(format!("cannot run verification '{}': {}", command, e)))?;

            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(WorkerError::Cancelled("verification interrupted".to_string()));
                }
                output = child.wait_with_output() => output
                    .map_err(|e| WorkerError::Agent(format!("verification '{}' failed to run: {}", command, e)))?,
            };

            let mut transcript = format!("$ {}\n", command);
            transcript.push_str(&String::from_utf8_lossy(&output.stdout));
            transcript.push_str(&String::from_utf8_lossy(&output.stderr));
            append_log(log_path, &scrub(self.redactor.as_ref(), &transcript)).await;

            if !output.status.success() {
                let code = output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                return Err(WorkerError::Agent(format!(
                    "verification '{}' exited with {}; output is in {}",
                    command,
                    code,
                    log_path.display()
                )));
            }
            passed.push(command.clone());
        }
        Ok(passed)
    }
}

async fn append_log(path: &Path, text: &str) {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    match file {
        Ok(mut file) => {
            if let Err(e) = file.write_all(text.as_bytes()).await {
                tracing::warn!(error = %e, "cannot append verification output");
            }
        }
        Err(e) => tracing::warn!(error = %e, path = %path.display(), "cannot open run log"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Vec<(String, String)> {
        vec![(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        )]
    }

    #[tokio::test]
    async fn all_passing_commands_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("agent.log");
        let verifier = Verifier::new(vec!["true".to_string(), "echo checked".to_string()], env());
        let passed = verifier
            .run(dir.path(), &log, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(passed, vec!["true", "echo checked"]);
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("$ echo checked\nchecked"));
    }

    #[tokio::test]
    async fn failure_stops_and_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("agent.log");
        let verifier = Verifier::new(
            vec!["echo nope >&2; exit 2".to_string(), "touch never".to_string()],
            env(),
        );
        let err = verifier
            .run(dir.path(), &log, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Agent(_)));
        assert!(err.to_string().contains("exited with 2"));
        assert!(!err.to_string().contains("nope"));
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn no_commands_is_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(Vec::new(), env());
        let passed = verifier
            .run(dir.path(), &dir.path().join("log"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(passed.is_empty());
    }
}
