mod cli;
mod config;
mod error;
mod lease;
mod pipeline;
mod runner;
mod stages;
mod state_machine;
mod store;
#[cfg(test)]
mod testutil;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::BuildbotConfig;
use pipeline::Pipeline;
use store::FileStore;
use ui::JobView;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose {
        "buildbot=debug"
    } else {
        "buildbot=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => BuildbotConfig::load_from(path)?,
        None => BuildbotConfig::load()?,
    };
    let store = FileStore::open(&config.jobs_dir, config.poll_interval())
        .with_context(|| format!("failed to open job store {}", config.jobs_dir.display()))?;

    match cli.command {
        Command::Run => run(Arc::new(store), Arc::new(config)).await,
        Command::Submit { archive, name } => {
            let name = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let job = store
                .submit(&name, &archive)
                .with_context(|| format!("failed to submit {}", archive.display()))?;
            println!("{}", job.name);
            Ok(())
        }
        Command::Status { name } => {
            let jobs = match name {
                Some(name) => vec![store.get(&name)?],
                None => store.list(),
            };
            JobView::default().print_status(&jobs);
            Ok(())
        }
        Command::Log { name } => {
            JobView::default().print_log(&store.get(&name)?);
            Ok(())
        }
    }
}

async fn run(store: Arc<FileStore>, config: Arc<BuildbotConfig>) -> Result<()> {
    tracing::info!(jobs_dir = %config.jobs_dir.display(), "starting pipeline");
    let handle = Pipeline::new(store, config).start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    tracing::info!("interrupt received, finishing in-flight jobs");

    let processed = handle.shutdown().await;
    tracing::info!(processed, "pipeline stopped");
    Ok(())
}
