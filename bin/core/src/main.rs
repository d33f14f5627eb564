use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use queue::JobQueue;

mod config;
mod error;
mod helpers;
mod jobs;
mod manager;
mod reconciler;
mod register;
mod state;
mod syncher;
mod tasks;
mod vault;

use config::CoreConfig;
use jobs::JobManager;
use state::AppState;

#[derive(Parser, Debug)]
#[command(
  name = "pulp-manager-core",
  about = "Manages repo syncs and schedules across a pulp fleet"
)]
struct Args {
  /// Path to the TOML config file. Falls back to the
  /// PULP_MANAGER_CONFIG_PATH environment variable.
  #[arg(long)]
  config: Option<PathBuf>,

  /// Install the cron schedules and exit without running a worker.
  #[arg(long)]
  setup_schedules_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let args = Args::parse();

  let config = CoreConfig::load(args.config.as_ref())?;
  logger::init(&config.logging)?;

  let state = AppState::init(config).await?;

  let job_manager = JobManager::new(
    state.db.clone(),
    state.queue.clone() as Arc<dyn JobQueue>,
    state.config.clone(),
  );
  job_manager.setup_schedules().await?;
  if args.setup_schedules_only {
    return Ok(());
  }

  jobs::scheduler::spawn_scheduler_loops(state.clone());
  jobs::worker::run_worker(state).await
}
