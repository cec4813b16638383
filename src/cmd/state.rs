//! Commands that read or reset the persisted job: `status` and `cleanup`.

use anyhow::Result;

use issue_worker::config::{GitAuthor, WorkPaths};
use issue_worker::logging;
use issue_worker::worker::git::GitRunner;
use issue_worker::worker::state::{InstanceLock, StateStore};
use issue_worker::worker::workspace::{WorkspaceManager, WorkspaceOps};
use issue_worker_common::JobStatus;
use tracing::info;

use super::super::Cli;

pub fn cmd_status(cli: &Cli) -> Result<()> {
    let _guard = logging::init(cli.log_format, cli.verbose, None)?;
    let paths = WorkPaths::new(&cli.config.work_root)?;
    let store = StateStore::new(&paths.state_file);

    let job = if !paths.state_file.exists() {
        None
    } else {
        // Only the lock holder rewrites state. A running worker already
        // reports its live phase.
        match InstanceLock::try_acquire(&paths.lock_file)? {
            Some(_lock) => store.load_recovered()?,
            None => store.load()?.job,
        }
    };

    let status = JobStatus::from_record(job.as_ref());
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

pub async fn cmd_cleanup(cli: &Cli) -> Result<()> {
    let _guard = logging::init(cli.log_format, cli.verbose, None)?;
    let paths = WorkPaths::new(&cli.config.work_root)?;
    let _lock = InstanceLock::acquire(&paths.lock_file)?;
    let store = StateStore::new(&paths.state_file);

    let Some(job) = store.load_recovered()? else {
        println!("Nothing to clean up.");
        return Ok(());
    };

    let workspace = WorkspaceManager::new(
        paths.repos_dir.clone(),
        GitRunner::new(&cli.config.git_remote_base, None),
        GitAuthor {
            name: cli.config.git_author_name.clone(),
            email: cli.config.git_author_email.clone(),
        },
    );
    workspace.remove(&job.identity).await?;
    store.save(None)?;

    info!(job = %job.identity, "workspace removed");
    println!("Removed workspace for {}.", job.identity);
    Ok(())
}
