//! Per-job working tree: clone, branch preparation and local commits.
//!
//! Clone/fetch/checkout/rebase go through the git CLI so they share the
//! header-based authentication in [`GitRunner`]. Index and commit work uses
//! git2 directly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};
use issue_worker_common::JobIdentity;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GitAuthor;
use crate::errors::{WorkerError, WorkerResult};
use crate::worker::git::{Access, GitRunner, failure_message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Committed { sha: String },
    NothingToCommit,
}

#[async_trait]
pub trait WorkspaceOps: Send + Sync {
    /// Ensure a clean checkout of `work_branch` rebased onto the base branch.
    async fn prepare(
        &self,
        job: &JobIdentity,
        work_branch: &str,
        cancel: &CancellationToken,
    ) -> WorkerResult<PathBuf>;

    /// Stage every change (respecting ignore rules) and commit it.
    async fn commit_all(&self, path: &Path, message: &str) -> WorkerResult<CommitResult>;

    /// Commits on HEAD that are not on `origin/<base_branch>`.
    async fn commits_ahead(&self, path: &Path, base_branch: &str) -> WorkerResult<usize>;

    async fn head_sha(&self, path: &Path) -> WorkerResult<String>;

    /// Delete the working tree. Missing trees are not an error.
    async fn remove(&self, job: &JobIdentity) -> WorkerResult<()>;
}

pub fn workspace_dir(repos_dir: &Path, job: &JobIdentity) -> PathBuf {
    repos_dir.join(job.workspace_slug())
}

fn partial_dir(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

pub struct WorkspaceManager {
    repos_dir: PathBuf,
    git: GitRunner,
    author: GitAuthor,
}

impl WorkspaceManager {
    pub fn new(repos_dir: PathBuf, git: GitRunner, author: GitAuthor) -> Self {
        Self {
            repos_dir,
            git: git.with_identity(author.clone()),
            author,
        }
    }

    /// Clone into a sibling `.partial` directory and move it into place only
    /// once the clone finished, so an interrupted clone leaves nothing behind.
    async fn clone_into(
        &self,
        job: &JobIdentity,
        path: &Path,
        cancel: &CancellationToken,
    ) -> WorkerResult<()> {
        let partial = partial_dir(path);
        remove_tree(&partial).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                WorkerError::Git(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let url = self.git.remote_url(&job.repo);
        let partial_str = partial.to_string_lossy().to_string();
        info!(repo = %job.repo, base = %job.base_branch, "cloning repository");
        let result = self
            .git
            .run_checked(
                None,
                &[
                    "clone",
                    "--no-tags",
                    "--branch",
                    &job.base_branch,
                    "--",
                    &url,
                    &partial_str,
                ],
                Access::Remote,
                cancel,
            )
            .await;

        if let Err(err) = result {
            if let Err(cleanup) = remove_tree(&partial).await {
                warn!(error = %cleanup, "failed to remove partial clone");
            }
            return Err(err);
        }

        tokio::fs::rename(&partial, path).await.map_err(|e| {
            WorkerError::Git(format!("cannot move clone into {}: {}", path.display(), e))
        })
    }

    async fn branch_exists_locally(&self, path: &Path, branch: &str, cancel: &CancellationToken) -> WorkerResult<bool> {
        let refname = format!("refs/heads/{}", branch);
        let out = self
            .git
            .run(
                Some(path),
                &["rev-parse", "--verify", "--quiet", &refname],
                Access::Local,
                cancel,
            )
            .await?;
        Ok(out.success())
    }

    /// Fetch the work branch if origin has it. Returns whether it exists.
    async fn fetch_remote_branch(&self, path: &Path, branch: &str, cancel: &CancellationToken) -> WorkerResult<bool> {
        let listing = self
            .git
            .run_checked(
                Some(path),
                &["ls-remote", "--heads", "origin", branch],
                Access::Remote,
                cancel,
            )
            .await?;
        if listing.stdout.trim().is_empty() {
            return Ok(false);
        }
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
        self.git
            .run_checked(Some(path), &["fetch", "origin", &refspec], Access::Remote, cancel)
            .await?;
        Ok(true)
    }

    /// Pick up commits pushed from elsewhere when the local branch is behind.
    /// A diverged branch is left as is; the push reconciles it.
    async fn fast_forward(
        &self,
        path: &Path,
        upstream: &str,
        cancel: &CancellationToken,
    ) -> WorkerResult<bool> {
        let args = ["merge", "--ff-only", upstream];
        let output = self.git.run(Some(path), &args, Access::Local, cancel).await?;
        if !output.success() {
            warn!(
                upstream,
                detail = %failure_message(&args, &output),
                "work branch cannot fast-forward, keeping local commits"
            );
        }
        Ok(output.success())
    }
}

#[async_trait]
impl WorkspaceOps for WorkspaceManager {
    async fn prepare(
        &self,
        job: &JobIdentity,
        work_branch: &str,
        cancel: &CancellationToken,
    ) -> WorkerResult<PathBuf> {
        let path = workspace_dir(&self.repos_dir, job);
        if !path.join(".git").exists() {
            self.clone_into(job, &path, cancel).await?;
        } else {
            debug!(path = %path.display(), "reusing existing workspace");
        }
        verify_no_stored_credential(&path)?;

        let git = &self.git;
        let dir = Some(path.as_path());
        let base = job.base_branch.as_str();
        let origin_base = format!("origin/{}", base);

        // Leftovers from an interrupted run.
        let _ = git.run(dir, &["rebase", "--abort"], Access::Local, cancel).await?;
        git.run_checked(dir, &["reset", "--hard"], Access::Local, cancel)
            .await?;
        git.run_checked(dir, &["clean", "-fd"], Access::Local, cancel)
            .await?;

        let base_refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", base);
        git.run_checked(dir, &["fetch", "origin", &base_refspec], Access::Remote, cancel)
            .await?;

        let remote_exists = self.fetch_remote_branch(&path, work_branch, cancel).await?;
        let local_exists = self.branch_exists_locally(&path, work_branch, cancel).await?;
        let origin_work = format!("origin/{}", work_branch);

        if local_exists {
            git.run_checked(dir, &["checkout", work_branch], Access::Local, cancel)
                .await?;
            if remote_exists {
                self.fast_forward(&path, &origin_work, cancel).await?;
            }
        } else if remote_exists {
            git.run_checked(
                dir,
                &["checkout", "-b", work_branch, &origin_work],
                Access::Local,
                cancel,
            )
            .await?;
        } else {
            git.run_checked(
                dir,
                &["checkout", "-b", work_branch, &origin_base],
                Access::Local,
                cancel,
            )
            .await?;
        }

        let rebase = git
            .run(dir, &["rebase", &origin_base], Access::Local, cancel)
            .await?;
        if !rebase.success() {
            let _ = git.run(dir, &["rebase", "--abort"], Access::Local, cancel).await;
            return Err(WorkerError::GitConflict {
                branch: work_branch.to_string(),
                message: format!("cannot rebase onto {}; resolve the conflict on the branch and rerun", origin_base),
            });
        }

        let checked_out = current_branch(&path)?;
        if checked_out != work_branch {
            return Err(WorkerError::Git(format!(
                "expected {} to be checked out, found {}",
                work_branch, checked_out
            )));
        }
        info!(branch = %work_branch, path = %path.display(), "workspace ready");
        Ok(path)
    }

    async fn commit_all(&self, path: &Path, message: &str) -> WorkerResult<CommitResult> {
        let path = path.to_path_buf();
        let message = message.to_string();
        let author = self.author.clone();
        tokio::task::spawn_blocking(move || commit_all_blocking(&path, &message, &author))
            .await
            .map_err(|e| WorkerError::Git(format!("commit task failed: {}", e)))?
    }

    async fn commits_ahead(&self, path: &Path, base_branch: &str) -> WorkerResult<usize> {
        let path = path.to_path_buf();
        let base_ref = format!("refs/remotes/origin/{}", base_branch);
        tokio::task::spawn_blocking(move || -> WorkerResult<usize> {
            let repo = open_repo(&path)?;
            let head = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| WorkerError::git("cannot resolve HEAD", e))?;
            let base = repo
                .refname_to_id(&base_ref)
                .map_err(|e| WorkerError::git("cannot resolve base branch", e))?;
            let (ahead, _behind) = repo
                .graph_ahead_behind(head.id(), base)
                .map_err(|e| WorkerError::git("cannot compare with base branch", e))?;
            Ok(ahead)
        })
        .await
        .map_err(|e| WorkerError::Git(format!("ahead/behind task failed: {}", e)))?
    }

    async fn head_sha(&self, path: &Path) -> WorkerResult<String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> WorkerResult<String> {
            let repo = open_repo(&path)?;
            let oid = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| WorkerError::git("cannot resolve HEAD", e))?
                .id();
            Ok(oid.to_string())
        })
        .await
        .map_err(|e| WorkerError::Git(format!("head lookup task failed: {}", e)))?
    }

    async fn remove(&self, job: &JobIdentity) -> WorkerResult<()> {
        let path = workspace_dir(&self.repos_dir, job);
        remove_tree(&path).await?;
        remove_tree(&partial_dir(&path)).await
    }
}

fn open_repo(path: &Path) -> WorkerResult<Repository> {
    Repository::open(path).map_err(|e| WorkerError::git("cannot open workspace", e))
}

fn current_branch(path: &Path) -> WorkerResult<String> {
    let repo = open_repo(path)?;
    let head = repo
        .head()
        .map_err(|e| WorkerError::git("cannot resolve HEAD", e))?;
    Ok(head.shorthand().unwrap_or("HEAD").to_string())
}

fn commit_all_blocking(path: &Path, message: &str, author: &GitAuthor) -> WorkerResult<CommitResult> {
    let repo = open_repo(path)?;
    let mut index = repo
        .index()
        .map_err(|e| WorkerError::git("cannot open index", e))?;
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .map_err(|e| WorkerError::git("cannot stage changes", e))?;
    // add_all does not stage deletions.
    index
        .update_all(["*"].iter(), None)
        .map_err(|e| WorkerError::git("cannot stage deletions", e))?;
    index
        .write()
        .map_err(|e| WorkerError::git("cannot write index", e))?;

    let tree_id = index
        .write_tree()
        .map_err(|e| WorkerError::git("cannot write tree", e))?;
    let parent = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|e| WorkerError::git("cannot resolve HEAD", e))?;
    if parent.tree_id() == tree_id {
        return Ok(CommitResult::NothingToCommit);
    }

    let tree = repo
        .find_tree(tree_id)
        .map_err(|e| WorkerError::git("cannot load tree", e))?;
    let sig = Signature::now(&author.name, &author.email)
        .map_err(|e| WorkerError::git("invalid commit author", e))?;
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
        .map_err(|e| WorkerError::git("cannot create commit", e))?;
    Ok(CommitResult::Committed {
        sha: oid.to_string(),
    })
}

/// Refuse to work in a clone whose config carries a token, either in the
/// remote URL or as a persisted extra header.
fn verify_no_stored_credential(path: &Path) -> WorkerResult<()> {
    let repo = open_repo(path)?;
    let remote = repo
        .find_remote("origin")
        .map_err(|e| WorkerError::git("workspace has no origin remote", e))?;
    let url = remote.url().unwrap_or_default();
    let authority = url.split("://").nth(1).unwrap_or_default();
    if authority.split('/').next().unwrap_or_default().contains('@') {
        return Err(WorkerError::Git(
            "origin URL embeds credentials; remove the workspace and start again".to_string(),
        ));
    }

    let config = repo
        .config()
        .and_then(|c| c.open_level(git2::ConfigLevel::Local))
        .map_err(|e| WorkerError::git("cannot read workspace config", e))?;
    let mut found = false;
    let mut entries = config
        .entries(Some(r"^http\..*extraheader$"))
        .map_err(|e| WorkerError::git("cannot read workspace config", e))?;
    while let Some(entry) = entries.next() {
        if entry.is_ok() {
            found = true;
        }
    }
    if found {
        return Err(WorkerError::Git(
            "workspace config stores an HTTP extra header; remove the workspace and start again"
                .to_string(),
        ));
    }
    Ok(())
}

async fn remove_tree(path: &Path) -> WorkerResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkerError::Git(format!(
            "cannot remove {}: {}",
            path.display(),
            e
        ))),
    }
}
