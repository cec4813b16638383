//! Pushes the work branch to origin.
//!
//! Pushing is idempotent: a push with nothing new is reported as
//! [`PushResult::UpToDate`]. A non-fast-forward rejection gets exactly one
//! fetch-and-rebase retry before it is reported as a conflict.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{WorkerError, WorkerResult};
use crate::worker::git::{Access, GitOutput, GitRunner, failure_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Pushed,
    UpToDate,
    /// Origin had commits we lacked; they were rebased under ours first.
    PushedAfterRebase,
}

#[async_trait]
pub trait BranchPublisher: Send + Sync {
    async fn push(
        &self,
        path: &Path,
        branch: &str,
        cancel: &CancellationToken,
    ) -> WorkerResult<PushResult>;
}

enum Attempt {
    Done(PushResult),
    Rejected(String),
}

pub struct GitPublisher {
    git: GitRunner,
}

impl GitPublisher {
    pub fn new(git: GitRunner) -> Self {
        Self { git }
    }

    async fn try_push(
        &self,
        path: &Path,
        branch: &str,
        cancel: &CancellationToken,
    ) -> WorkerResult<Attempt> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        let args = ["push", "--porcelain", "-u", "origin", refspec.as_str()];
        let output = self
            .git
            .run(Some(path), &args, Access::Remote, cancel)
            .await?;

        if output.success() {
            return Ok(Attempt::Done(parse_push_result(&output)));
        }
        if is_non_fast_forward(&output) {
            return Ok(Attempt::Rejected(failure_message(&args, &output)));
        }
        Err(WorkerError::Git(failure_message(&args, &output)))
    }

    async fn rebase_onto_remote(
        &self,
        path: &Path,
        branch: &str,
        cancel: &CancellationToken,
    ) -> WorkerResult<()> {
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
        self.git
            .run_checked(Some(path), &["fetch", "origin", &refspec], Access::Remote, cancel)
            .await?;

        let upstream = format!("origin/{}", branch);
        let rebase = self
            .git
            .run(Some(path), &["rebase", &upstream], Access::Local, cancel)
            .await?;
        if rebase.success() {
            return Ok(());
        }
        if let Err(e) = self
            .git
            .run(Some(path), &["rebase", "--abort"], Access::Local, cancel)
            .await
        {
            warn!(error = %e, "rebase --abort failed");
        }
        Err(WorkerError::GitConflict {
            branch: branch.to_string(),
            message: format!("local commits do not rebase cleanly onto {}", upstream),
        })
    }
}

#[async_trait]
impl BranchPublisher for GitPublisher {
    async fn push(
        &self,
        path: &Path,
        branch: &str,
        cancel: &CancellationToken,
    ) -> WorkerResult<PushResult> {
        let message = match self.try_push(path, branch, cancel).await? {
            Attempt::Done(result) => {
                info!(branch, ?result, "push finished");
                return Ok(result);
            }
            Attempt::Rejected(message) => message,
        };

        info!(branch, "push rejected as non-fast-forward, rebasing onto origin");
        warn!(detail = %message, "first push attempt rejected");
        self.rebase_onto_remote(path, branch, cancel).await?;

        match self.try_push(path, branch, cancel).await? {
            Attempt::Done(_) => {
                info!(branch, "push finished after rebase");
                Ok(PushResult::PushedAfterRebase)
            }
            Attempt::Rejected(message) => Err(WorkerError::GitConflict {
                branch: branch.to_string(),
                message: format!("push still rejected after rebase: {}", message),
            }),
        }
    }
}

/// `--porcelain` prints one line per ref; `=` marks a ref that was already
/// up to date.
fn parse_push_result(output: &GitOutput) -> PushResult {
    let up_to_date = output
        .stdout
        .lines()
        .filter(|line| line.contains("refs/heads/"))
        .any(|line| line.starts_with('='));
    if up_to_date {
        PushResult::UpToDate
    } else {
        PushResult::Pushed
    }
}

fn is_non_fast_forward(output: &GitOutput) -> bool {
    let text = output.combined();
    text.contains("non-fast-forward") || text.contains("[rejected]") || text.contains("fetch first")
}
