use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::IpAddr;

use issue_worker::config::ConfigArgs;
use issue_worker::logging::LogFormat;

mod cmd;

#[derive(Parser)]
#[command(name = "issue-worker")]
#[command(version, about = "Run a coding agent against one GitHub issue and open a pull request")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Format of log lines written to stderr
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Accept lifecycle events over HTTP
    Serve {
        #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        #[arg(long, env = "LISTEN_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Run one job in the foreground using --repo, --issue-number and --base-branch
    Run,
    /// Print the persisted job state as JSON
    Status,
    /// Remove the working tree of a finished job and return to idle
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { host, port } => cmd::cmd_serve(&cli, *host, *port).await?,
        Commands::Run => cmd::cmd_run(&cli).await?,
        Commands::Status => cmd::cmd_status(&cli)?,
        Commands::Cleanup => cmd::cmd_cleanup(&cli).await?,
    }

    Ok(())
}
