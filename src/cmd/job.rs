//! Commands that run jobs: `issue-worker serve` and `issue-worker run`.

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};

use issue_worker::config::{JobDefaults, WorkPaths, WorkerConfig};
use issue_worker::logging;
use issue_worker::worker::{self, server, state::InstanceLock};
use issue_worker_common::{EventPayload, JobIdentity, JobPhase};
use tracing::{error, info};

use super::super::Cli;

/// Validate settings and take the instance lock. Logging goes to stderr and
/// `<work_root>/logs/worker.log`.
fn prepare(cli: &Cli) -> Result<(WorkerConfig, InstanceLock, Option<tracing_appender::non_blocking::WorkerGuard>)> {
    let paths = WorkPaths::new(&cli.config.work_root)?;
    let guard = logging::init(cli.log_format, cli.verbose, Some(&paths.logs_dir))?;

    let config = match WorkerConfig::from_args(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e.into());
        }
    };
    let lock = InstanceLock::acquire(&config.paths.lock_file)?;
    Ok((config, lock, guard))
}

async fn check_startup(config: &WorkerConfig) -> Result<()> {
    if let Err(e) = worker::check_startup(config).await {
        error!(error = %e, "startup checks failed");
        return Err(e.into());
    }
    Ok(())
}

pub async fn cmd_serve(cli: &Cli, host: IpAddr, port: u16) -> Result<()> {
    let (config, lock, _guard) = prepare(cli)?;
    check_startup(&config).await?;
    let supervisor = worker::assemble(&config, Some(lock)).context("Failed to start worker")?;
    info!(
        work_root = %config.paths.root.display(),
        phase = %supervisor.phase(),
        "worker ready"
    );
    server::serve(supervisor, SocketAddr::new(host, port)).await
}

pub async fn cmd_run(cli: &Cli) -> Result<()> {
    let (config, lock, _guard) = prepare(cli)?;
    check_startup(&config).await?;
    let supervisor = worker::assemble(&config, Some(lock)).context("Failed to start worker")?;

    // A finished job for the same issue is picked up again with a rerun.
    let finished = supervisor.status().job.filter(|j| j.phase.is_terminal());
    let ack = match finished {
        Some(job) if same_issue(&job.identity, &config.defaults) => supervisor.rerun().await?,
        Some(job) => anyhow::bail!(
            "work root holds a finished job for {}; run `issue-worker cleanup` first",
            job.identity
        ),
        None => supervisor.start(EventPayload::default()).await?,
    };
    info!(event = %ack.event, "job accepted");

    let interrupted = tokio::select! {
        status = supervisor.wait_for_terminal() => Some(status),
        _ = tokio::signal::ctrl_c() => None,
    };
    let status = match interrupted {
        Some(status) => status,
        None => {
            info!("interrupted, stopping job");
            supervisor.stop().await?;
            supervisor.status()
        }
    };

    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.phase != JobPhase::Completed {
        let reason = status
            .job
            .and_then(|j| j.last_error)
            .map(|e| format!("{}: {}", e.kind, e.message))
            .unwrap_or_default();
        anyhow::bail!("job ended {} {}", status.phase, reason);
    }
    Ok(())
}

fn same_issue(identity: &JobIdentity, defaults: &JobDefaults) -> bool {
    defaults.repo.as_deref().is_none_or(|repo| repo == identity.repo)
        && defaults.issue_number.is_none_or(|n| n == identity.issue_number)
}
