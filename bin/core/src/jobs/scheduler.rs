use std::{sync::Arc, time::Duration};

use chrono::Utc;
use queue::JobQueue;

use crate::{jobs::JobManager, state::AppState};

const DUE_ENTRY_TICK: Duration = Duration::from_secs(30);
const SCHEDULE_INSTALL_INTERVAL: Duration =
  Duration::from_secs(3_600);

pub fn spawn_scheduler_loops(state: AppState) {
  tokio::spawn(schedule_install_loop(state.clone()));
  tokio::spawn(due_entry_loop(state));
}

/// Periodic remove-then-recreate of the cron entries, so config
/// changes to servers and repo groups take effect without a
/// restart.
async fn schedule_install_loop(state: AppState) {
  let manager = JobManager::new(
    state.db.clone(),
    state.queue.clone() as Arc<dyn JobQueue>,
    state.config.clone(),
  );
  loop {
    if let Err(e) = manager.setup_schedules().await {
      tracing::error!("failed to install schedules: {e:#}");
    }
    tokio::time::sleep(SCHEDULE_INSTALL_INTERVAL).await;
  }
}

/// Enqueues due cron entries and advances them to their next
/// occurrence.
async fn due_entry_loop(state: AppState) {
  loop {
    let now = Utc::now();
    match state.queue.due_schedules(&now).await {
      Ok(due) => {
        for entry in due {
          tracing::info!(
            "enqueuing scheduled job {} ({})",
            entry.job.func,
            entry.id
          );
          if let Err(e) =
            state.queue.enqueue(entry.job.clone()).await
          {
            tracing::error!(
              "failed to enqueue scheduled job {}: {e:#}",
              entry.id
            );
          }
          if let Err(e) = state.queue.reschedule(&entry).await {
            tracing::error!(
              "failed to reschedule entry {}: {e:#}",
              entry.id
            );
          }
        }
      }
      Err(e) => {
        tracing::error!("failed to read due schedules: {e:#}");
      }
    }
    tokio::time::sleep(DUE_ENTRY_TICK).await;
  }
}
