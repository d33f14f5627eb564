use std::{sync::Arc, time::Duration};

use database::{TaskRepository, TaskState};
use futures_util::StreamExt;
use queue::{Job, JobQueue};
use tokio::sync::broadcast;

use crate::{
  error::Error,
  jobs::JobManager,
  state::AppState,
  tasks::{self, TaskContext},
};

const POP_TIMEOUT_SECS: f64 = 5.0;

enum Outcome {
  Finished,
  Failed(Error),
  TimedOut,
  Stopped,
}

/// One job at a time, picked off the shared queue. Jobs for the
/// same server may run in sibling processes; coordination happens
/// through the task store and pulp's own task serialization.
pub async fn run_worker(state: AppState) -> anyhow::Result<()> {
  let worker_name = std::env::var("HOSTNAME")
    .unwrap_or_else(|_| "pulp-manager-worker".into());
  tracing::info!("worker {worker_name} starting");

  let (stop_tx, _) = broadcast::channel::<String>(16);
  tokio::spawn(stop_listener(state.clone(), stop_tx.clone()));

  let job_manager = JobManager::new(
    state.db.clone(),
    state.queue.clone() as Arc<dyn JobQueue>,
    state.config.clone(),
  );

  loop {
    let job = match state.queue.pop_job(POP_TIMEOUT_SECS).await {
      Ok(Some(job)) => job,
      Ok(None) => continue,
      Err(e) => {
        tracing::error!("failed to pop job from queue: {e:#}");
        tokio::time::sleep(Duration::from_secs(1)).await;
        continue;
      }
    };
    handle_job(&state, &job_manager, &stop_tx, &worker_name, job)
      .await;
  }
}

/// Relays stop signals from the queue's pub/sub channel to the job
/// runner.
async fn stop_listener(
  state: AppState,
  stop_tx: broadcast::Sender<String>,
) {
  loop {
    let mut pubsub = match state.queue.subscribe_stops().await {
      Ok(pubsub) => pubsub,
      Err(e) => {
        tracing::error!(
          "failed to subscribe to stop channel: {e:#}"
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        continue;
      }
    };
    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
      match message.get_payload::<String>() {
        Ok(job_id) => {
          let _ = stop_tx.send(job_id);
        }
        Err(e) => {
          tracing::warn!("undecodable stop signal: {e:#}");
        }
      }
    }
    tracing::warn!("stop channel closed, resubscribing");
  }
}

/// Whether the bound task was canceled before the job started; such
/// jobs are dropped without running.
async fn task_already_canceled(
  state: &AppState,
  job: &Job,
) -> bool {
  let Some(task_id) = job.task_id() else {
    return false;
  };
  let Ok(mut conn) = state.db.conn().await else {
    return false;
  };
  matches!(
    TaskRepository::get_by_id(&mut conn, task_id).await,
    Ok(Some(task)) if task.state == TaskState::Canceled
  )
}

async fn handle_job(
  state: &AppState,
  job_manager: &JobManager,
  stop_tx: &broadcast::Sender<String>,
  worker_name: &str,
  job: Job,
) {
  tracing::info!("picked up job {} ({})", job.id, job.spec.func);

  if task_already_canceled(state, &job).await {
    tracing::info!(
      "job {} skipped, its task was canceled while queued",
      job.id
    );
    if let Err(e) = state.queue.finish_job(&job.id).await {
      tracing::warn!("failed to finish skipped job: {e:#}");
    }
    return;
  }

  let ctx = TaskContext {
    db: state.db.clone(),
    config: state.config.clone(),
    worker_name: worker_name.to_string(),
    job_id: job.id.clone(),
  };

  let mut stop_rx = stop_tx.subscribe();
  let deadline = job.spec.timeout.map(|secs| {
    tokio::time::Instant::now()
      + Duration::from_secs(secs.max(0) as u64)
  });

  let job_future = tasks::dispatch(ctx, job.clone());
  tokio::pin!(job_future);

  let outcome = loop {
    tokio::select! {
      result = &mut job_future => {
        break match result {
          Ok(()) => Outcome::Finished,
          Err(e) => Outcome::Failed(e),
        };
      }
      stopped = stop_rx.recv() => {
        if let Ok(stopped_id) = stopped {
          if stopped_id == job.id {
            break Outcome::Stopped;
          }
        }
      }
      _ = sleep_until_deadline(deadline) => {
        break Outcome::TimedOut;
      }
    }
  };

  match outcome {
    Outcome::Finished => {
      tracing::info!("job {} finished", job.id);
      if let Err(e) = state.queue.finish_job(&job.id).await {
        tracing::warn!("failed to finish job {}: {e:#}", job.id);
      }
    }
    Outcome::Failed(error) => {
      let detail = error.detail();
      tracing::error!("job {} failed: {detail}", job.id);
      if let Err(e) =
        state.queue.fail_job(&job.id, &detail).await
      {
        tracing::warn!("failed to fail job {}: {e:#}", job.id);
      }
      job_manager.fail_task_callback(&job, &detail).await;
    }
    Outcome::TimedOut => {
      let detail = format!(
        "job exceeded its runtime cap of {:?} seconds",
        job.spec.timeout
      );
      tracing::error!("job {} timed out", job.id);
      if let Err(e) =
        state.queue.fail_job(&job.id, &detail).await
      {
        tracing::warn!("failed to fail job {}: {e:#}", job.id);
      }
      job_manager.fail_task_callback(&job, &detail).await;
    }
    Outcome::Stopped => {
      tracing::info!("job {} stopped by request", job.id);
      if let Err(e) = state
        .queue
        .fail_job(&job.id, "stop signal received")
        .await
      {
        tracing::warn!("failed to record stopped job: {e:#}");
      }
    }
  }
}

async fn sleep_until_deadline(
  deadline: Option<tokio::time::Instant>,
) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}
