use std::sync::Arc;

use chrono::Utc;
use database::{
  DbClient, NewTask, Task, TaskError, TaskPatch, TaskRepository,
  TaskState, TaskType,
};
use queue::Job;
use serde_json::Value;

use crate::{
  config::CoreConfig,
  error::{Error, Result},
};

mod registration;
mod removal;
mod remove_content;
mod snapshot;
mod sync;

/// What a worker function gets handed along with its kwargs.
#[derive(Clone)]
pub struct TaskContext {
  pub db: DbClient,
  pub config: Arc<CoreConfig>,
  pub worker_name: String,
  pub job_id: String,
}

/// Routes a popped job to its registered worker function.
pub async fn dispatch(ctx: TaskContext, job: Job) -> Result<()> {
  match job.spec.func.as_str() {
    "sync_repos" => sync::sync_repos(ctx, &job.spec.kwargs).await,
    "register_repos" => {
      registration::register_repos(ctx, &job.spec.kwargs).await
    }
    "remove_repo_content" => {
      remove_content::remove_repo_content(ctx, &job.spec.kwargs)
        .await
    }
    "snapshot_repos" => {
      snapshot::snapshot_repos(ctx, &job.spec.kwargs).await
    }
    "remove_repos" => {
      removal::remove_repos(ctx, &job.spec.kwargs).await
    }
    other => Err(Error::InvalidArgument(format!(
      "unknown worker function {other}"
    ))),
  }
}

/// Loads the Task the job was enqueued for (or creates one for
/// scheduled runs that carry no task_id) and marks it running under
/// this worker. Returns `None` when the task was canceled while
/// queued.
pub(crate) async fn claim_task(
  ctx: &TaskContext,
  kwargs: &Value,
  name: String,
  task_type: TaskType,
) -> Result<Option<Task>> {
  let mut conn = ctx.db.conn().await?;

  let task = match kwargs.get("task_id").and_then(Value::as_i64) {
    Some(task_id) => {
      let task = TaskRepository::get_by_id(&mut conn, task_id)
        .await?
        .ok_or_else(|| {
          Error::NotFound(format!("task with id {task_id}"))
        })?;
      if task.state == TaskState::Canceled {
        return Ok(None);
      }
      task
    }
    None => {
      TaskRepository::add(
        &mut conn,
        &NewTask {
          date_queued: Some(Utc::now()),
          task_args: Some(kwargs.clone()),
          ..NewTask::new(name, task_type, TaskState::Queued)
        },
      )
      .await?
    }
  };

  TaskRepository::update(
    &mut conn,
    task.id,
    &TaskPatch {
      state: Some(TaskState::Running),
      date_started: Some(Utc::now()),
      worker_name: Some(ctx.worker_name.clone()),
      worker_job_id: Some(ctx.job_id.clone()),
      ..Default::default()
    },
  )
  .await?;

  Ok(TaskRepository::get_by_id(&mut conn, task.id).await?)
}

/// Records a failure on the task unless something else already
/// drove it terminal.
pub(crate) async fn fail_task_if_active(
  db: &DbClient,
  task_id: i64,
  msg: &str,
  detail: &str,
) {
  let result: Result<()> = async {
    let mut conn = db.conn().await?;
    let Some(task) =
      TaskRepository::get_by_id(&mut conn, task_id).await?
    else {
      return Ok(());
    };
    if task.state.is_terminal() {
      return Ok(());
    }
    TaskRepository::update(
      &mut conn,
      task_id,
      &TaskPatch {
        state: Some(TaskState::Failed),
        date_finished: Some(Utc::now()),
        error: Some(TaskError::value(msg, detail)),
        ..Default::default()
      },
    )
    .await?;
    Ok(())
  }
  .await;
  if let Err(e) = result {
    tracing::error!(
      "failed to record failure of task {task_id}: {e:#}"
    );
  }
}

pub(crate) async fn complete_task(
  db: &DbClient,
  task_id: i64,
) -> Result<()> {
  let mut conn = db.conn().await?;
  TaskRepository::update(
    &mut conn,
    task_id,
    &TaskPatch {
      state: Some(TaskState::Completed),
      date_finished: Some(Utc::now()),
      ..Default::default()
    },
  )
  .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn context(db: DbClient) -> TaskContext {
    TaskContext {
      db,
      config: Arc::new(CoreConfig::default()),
      worker_name: "worker01".into(),
      job_id: "job-abc".into(),
    }
  }

  #[tokio::test]
  async fn claim_existing_task_marks_it_running() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();
    let task = TaskRepository::add(
      &mut conn,
      &NewTask::new(
        "repo sync pulp01",
        TaskType::RepoGroupSync,
        TaskState::Queued,
      ),
    )
    .await
    .unwrap();
    drop(conn);

    let claimed = claim_task(
      &context(db.clone()),
      &serde_json::json!({"task_id": task.id}),
      "unused".into(),
      TaskType::RepoGroupSync,
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.state, TaskState::Running);
    assert_eq!(claimed.worker_name.as_deref(), Some("worker01"));
    assert_eq!(claimed.worker_job_id.as_deref(), Some("job-abc"));
    assert!(claimed.date_started.is_some());
  }

  #[tokio::test]
  async fn claim_skips_canceled_task() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();
    let task = TaskRepository::add(
      &mut conn,
      &NewTask::new(
        "repo sync pulp01",
        TaskType::RepoGroupSync,
        TaskState::Canceled,
      ),
    )
    .await
    .unwrap();
    drop(conn);

    let claimed = claim_task(
      &context(db),
      &serde_json::json!({"task_id": task.id}),
      "unused".into(),
      TaskType::RepoGroupSync,
    )
    .await
    .unwrap();
    assert!(claimed.is_none());
  }

  #[tokio::test]
  async fn claim_creates_task_for_scheduled_runs() {
    let db = DbClient::connect_memory().await.unwrap();
    let claimed = claim_task(
      &context(db.clone()),
      &serde_json::json!({"pulp_server": "pulp01"}),
      "repo sync pulp01".into(),
      TaskType::RepoGroupSync,
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(claimed.state, TaskState::Running);
    assert_eq!(claimed.name, "repo sync pulp01");
    assert_eq!(
      claimed
        .task_args
        .as_ref()
        .unwrap()
        .get("pulp_server")
        .and_then(Value::as_str),
      Some("pulp01")
    );
  }
}
