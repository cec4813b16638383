//! Async wrapper around the `git` CLI.
//!
//! Network operations get the access token as a one-shot
//! `http.<remote>/.extraheader` entry passed through `GIT_CONFIG_*`
//! environment variables. Nothing is written to the repository config and the
//! token never appears in argv.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::GitAuthor;
use crate::credential::{Credential, scrub};
use crate::errors::{WorkerError, WorkerResult};

/// Maximum stderr characters carried into an error message.
const STDERR_EXCERPT: usize = 1200;

/// Whether a git invocation talks to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Combined output, used for pattern checks that git splits across streams.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

#[derive(Debug, Clone)]
pub struct GitRunner {
    remote_base: String,
    credential: Option<Credential>,
    identity: Option<GitAuthor>,
}

impl GitRunner {
    pub fn new(remote_base: &str, credential: Option<Credential>) -> Self {
        Self {
            remote_base: remote_base.trim_end_matches('/').to_string(),
            credential,
            identity: None,
        }
    }

    /// Committer identity for commands that write commits (rebase).
    pub fn with_identity(mut self, identity: GitAuthor) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Clone URL without any userinfo.
    pub fn remote_url(&self, repo: &str) -> String {
        format!("{}/{}.git", self.remote_base, repo)
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    fn command(&self, dir: Option<&Path>, args: &[&str], access: Access) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        if let Some(identity) = &self.identity {
            cmd.env("GIT_AUTHOR_NAME", &identity.name)
                .env("GIT_AUTHOR_EMAIL", &identity.email)
                .env("GIT_COMMITTER_NAME", &identity.name)
                .env("GIT_COMMITTER_EMAIL", &identity.email);
        }
        if let (Access::Remote, Some(credential)) = (access, &self.credential) {
            cmd.env("GIT_CONFIG_COUNT", "1")
                .env(
                    "GIT_CONFIG_KEY_0",
                    format!("http.{}/.extraheader", self.remote_base),
                )
                .env(
                    "GIT_CONFIG_VALUE_0",
                    format!("Authorization: {}", credential.auth_header()),
                );
        }
        cmd
    }

    /// Run git and return its output whatever the exit status.
    pub async fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        access: Access,
        cancel: &CancellationToken,
    ) -> WorkerResult<GitOutput> {
        debug!(args = %args.join(" "), "git");
        let child = self
            .command(dir, args, access)
            .spawn()
            .map_err(|e| WorkerError::Git(format!("failed to start git: {}", e)))?;

        // Dropping the wait future kills the child (kill_on_drop).
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(WorkerError::Cancelled(format!("git {} interrupted", subcommand(args))));
            }
            output = child.wait_with_output() => output
                .map_err(|e| WorkerError::Git(format!("git {} failed to run: {}", subcommand(args), e)))?,
        };

        let credential = self.credential.as_ref();
        Ok(GitOutput {
            code: output.status.code(),
            stdout: scrub(credential, &String::from_utf8_lossy(&output.stdout)),
            stderr: scrub(credential, &String::from_utf8_lossy(&output.stderr)),
        })
    }

    /// Run git and turn a non-zero exit into [`WorkerError::Git`].
    pub async fn run_checked(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        access: Access,
        cancel: &CancellationToken,
    ) -> WorkerResult<GitOutput> {
        let output = self.run(dir, args, access, cancel).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(WorkerError::Git(failure_message(args, &output)))
        }
    }
}

fn subcommand<'a>(args: &[&'a str]) -> &'a str {
    args.first().copied().unwrap_or("")
}

pub(crate) fn failure_message(args: &[&str], output: &GitOutput) -> String {
    let stderr = output.stderr.trim();
    let excerpt: String = if stderr.chars().count() > STDERR_EXCERPT {
        let skip = stderr.chars().count() - STDERR_EXCERPT;
        stderr.chars().skip(skip).collect()
    } else {
        stderr.to_string()
    };
    let code = output
        .code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let mut message = format!("git {} exited with {}: {}", subcommand(args), code, excerpt);
    if is_auth_failure(stderr) {
        message.push_str(
            " (the access token was rejected or lacks write access to this repository)",
        );
    }
    message
}

fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("403")
        || lower.contains("authentication failed")
        || lower.contains("permission to")
        || lower.contains("could not read username")
}
