use std::sync::Arc;

use chrono::Utc;
use database::{
  DbClient, FilterQuery, NewTask, PulpServer,
  PulpServerRepoGroupRepository, PulpServerRepository, Task,
  TaskError, TaskPatch, TaskRepository, TaskState, TaskType,
};
use queue::{Job, JobQueue, JobSpec, JobStatus};
use serde_json::{Value, json};

use crate::{
  config::CoreConfig,
  error::{Error, Result},
};

pub mod scheduler;
pub mod worker;

pub const REPO_GROUP_SYNC_META: &str = "REPO_GROUP_SYNC_SCHEDULED";
pub const REPO_REGISTRATION_META: &str =
  "REPO_REGISTRATION_SCHEDULED";

/// How long finished worker job records stick around.
pub const RESULT_TTL_SECS: i64 = 172_800;

/// Installs cron schedules, enqueues ad-hoc work bound to Task
/// records, and owns cancellation.
pub struct JobManager {
  db: DbClient,
  queue: Arc<dyn JobQueue>,
  config: Arc<CoreConfig>,
}

impl JobManager {
  pub fn new(
    db: DbClient,
    queue: Arc<dyn JobQueue>,
    config: Arc<CoreConfig>,
  ) -> Self {
    Self { db, queue, config }
  }

  /// Drops this server's installed entries of the given managed
  /// type. Other servers' entries are untouched.
  async fn remove_schedules_for(
    &self,
    server_name: &str,
    job_type: &str,
  ) -> Result<()> {
    for entry in self.queue.schedules().await? {
      if entry.job.meta_str("job_type") == Some(job_type)
        && entry.job.meta_str("pulp_server") == Some(server_name)
      {
        self.queue.remove_schedule(&entry.id).await?;
      }
    }
    Ok(())
  }

  async fn setup_repo_group_schedules(
    &self,
    pulp_server: &PulpServer,
  ) -> Result<()> {
    tracing::info!(
      "setting up scheduled repo groups for {}",
      pulp_server.name
    );
    self
      .remove_schedules_for(&pulp_server.name, REPO_GROUP_SYNC_META)
      .await?;

    let mut conn = self.db.conn().await?;
    let groups = PulpServerRepoGroupRepository::for_server(
      &mut conn,
      pulp_server.id,
    )
    .await?;

    for group in groups {
      let Some(schedule) = &group.schedule else {
        continue;
      };
      tracing::info!(
        "scheduling repo group {} at {schedule} for {}",
        group.name,
        pulp_server.name
      );

      let pulp_master_name = match group.pulp_master_id {
        Some(master_id) => {
          PulpServerRepository::get_by_id(&mut conn, master_id)
            .await?
            .map(|master| master.name)
        }
        None => None,
      };
      let sync_options: Option<Value> =
        group.sync_options.clone().map(|options| options.0);

      self
        .queue
        .add_schedule(
          schedule,
          JobSpec {
            func: "sync_repos".into(),
            kwargs: json!({
              "pulp_server": pulp_server.name,
              "max_concurrent_syncs": group.max_concurrent_syncs,
              "regex_include": group.regex_include,
              "regex_exclude": group.regex_exclude,
              "source_pulp_server_name": pulp_master_name,
              "sync_options": sync_options,
            }),
            meta: json!({
              "job_type": REPO_GROUP_SYNC_META,
              "pulp_server": pulp_server.name,
              "repo_group_id": group.id,
              "repo_group_name": group.name,
              "max_concurrent_syncs": group.max_concurrent_syncs,
              "regex_include": group.regex_include,
              "regex_exclude": group.regex_exclude,
              "source_pulp_server_name": pulp_master_name,
            }),
            timeout: Some(group.max_runtime),
            result_ttl: RESULT_TTL_SECS,
          },
        )
        .await?;
    }
    Ok(())
  }

  async fn setup_registration_schedule(
    &self,
    pulp_server: &PulpServer,
  ) -> Result<()> {
    tracing::info!(
      "setting up scheduled repo registration for {}",
      pulp_server.name
    );
    self
      .remove_schedules_for(&pulp_server.name, REPO_REGISTRATION_META)
      .await?;

    let Some(schedule) =
      &pulp_server.repo_config_registration_schedule
    else {
      return Ok(());
    };
    let local_config_dir =
      self.config.pulp.local_repo_config_dir.as_ref().map(
        |dir| dir.to_string_lossy().to_string(),
      );

    self
      .queue
      .add_schedule(
        schedule,
        JobSpec {
          func: "register_repos".into(),
          kwargs: json!({
            "pulp_server": pulp_server.name,
            "regex_include":
              pulp_server.repo_config_registration_regex_include,
            "regex_exclude":
              pulp_server.repo_config_registration_regex_exclude,
            "local_repo_config_dir": local_config_dir,
          }),
          meta: json!({
            "job_type": REPO_REGISTRATION_META,
            "pulp_server": pulp_server.name,
            "regex_include":
              pulp_server.repo_config_registration_regex_include,
            "regex_exclude":
              pulp_server.repo_config_registration_regex_exclude,
            "local_repo_config_dir": local_config_dir,
          }),
          timeout: pulp_server.repo_config_registration_max_runtime,
          result_ttl: RESULT_TTL_SECS,
        },
      )
      .await?;
    Ok(())
  }

  /// Remove-then-recreate of the cron entries of every server.
  /// Single-writer per server; the schedule loop itself runs as a
  /// singleton job.
  pub async fn setup_schedules(&self) -> Result<()> {
    let mut conn = self.db.conn().await?;
    let servers =
      PulpServerRepository::filter(&mut conn, &FilterQuery::new())
        .await?;
    drop(conn);

    for pulp_server in servers {
      self.setup_repo_group_schedules(&pulp_server).await?;
      if pulp_server.repo_config_registration_schedule.is_some() {
        self.setup_registration_schedule(&pulp_server).await?;
      }
    }
    Ok(())
  }

  /// Creates the Task record, then enqueues the worker job. A
  /// failed enqueue marks the Task failed and is not re-raised; the
  /// Task row is the durable record either way.
  async fn queue_task(
    &self,
    new_task: NewTask,
    mut spec: JobSpec,
  ) -> Result<Task> {
    let mut conn = self.db.conn().await?;
    let task = TaskRepository::add(&mut conn, &new_task).await?;

    spec.kwargs["task_id"] = json!(task.id);
    spec.meta["task_id"] = json!(task.id);

    match self.queue.enqueue(spec).await {
      Ok(job) => {
        TaskRepository::update(
          &mut conn,
          task.id,
          &TaskPatch {
            worker_job_id: Some(job.id),
            ..Default::default()
          },
        )
        .await?;
      }
      Err(e) => {
        tracing::error!(
          "error occurred enqueuing {} job: {e:#}",
          task.name
        );
        TaskRepository::update(
          &mut conn,
          task.id,
          &TaskPatch {
            state: Some(TaskState::Failed),
            date_finished: Some(Utc::now()),
            error: Some(TaskError::value(
              format!("error occurred enqueuing {}", task.name),
              format!("{e:#}"),
            )),
            ..Default::default()
          },
        )
        .await?;
      }
    }

    TaskRepository::get_by_id(&mut conn, task.id)
      .await?
      .ok_or_else(|| {
        Error::NotFound(format!("task {}", task.id))
      })
  }

  pub async fn queue_sync_repo_task(
    &self,
    pulp_server: &str,
    max_runtime: i64,
    max_concurrent_syncs: i64,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
    source_pulp_server_name: Option<&str>,
    sync_options: Option<Value>,
  ) -> Result<Task> {
    let mut new_task = NewTask::new(
      format!("repo sync {pulp_server}"),
      TaskType::RepoGroupSync,
      TaskState::Queued,
    );
    new_task.date_queued = Some(Utc::now());
    new_task.task_args = Some(json!({
      "name": pulp_server,
      "regex_include": regex_include,
      "regex_exclude": regex_exclude,
      "max_runtime": max_runtime,
      "max_concurrent_syncs": max_concurrent_syncs,
      "source_pulp_server_name": source_pulp_server_name,
      "sync_options": sync_options,
    }));

    self
      .queue_task(
        new_task,
        JobSpec {
          func: "sync_repos".into(),
          kwargs: json!({
            "pulp_server": pulp_server,
            "max_concurrent_syncs": max_concurrent_syncs,
            "regex_include": regex_include,
            "regex_exclude": regex_exclude,
            "source_pulp_server_name": source_pulp_server_name,
            "sync_options": sync_options,
          }),
          meta: json!({
            "job_type": "ADHOC_REPO_SYNC",
            "pulp_server": pulp_server,
          }),
          timeout: Some(max_runtime),
          result_ttl: RESULT_TTL_SECS,
        },
      )
      .await
  }

  pub async fn queue_remove_content_task(
    &self,
    pulp_server_name: &str,
    repo_name: &str,
    content_href: &str,
    max_runtime: i64,
    force_publish: bool,
  ) -> Result<Task> {
    let mut new_task = NewTask::new(
      format!("remove repo content {pulp_server_name}"),
      TaskType::RemoveRepoContent,
      TaskState::Queued,
    );
    new_task.date_queued = Some(Utc::now());
    new_task.task_args = Some(json!({
      "max_runtime": max_runtime,
      "pulp_server_name": pulp_server_name,
      "repo_name": repo_name,
      "content_href": content_href,
      "force_publish": force_publish,
    }));

    self
      .queue_task(
        new_task,
        JobSpec {
          func: "remove_repo_content".into(),
          kwargs: json!({
            "pulp_server_name": pulp_server_name,
            "repo_name": repo_name,
            "content_href": content_href,
            "force_publish": force_publish,
          }),
          meta: json!({
            "job_type": "ADHOC_REMOVE_REPO_CONTENT",
            "pulp_server": pulp_server_name,
          }),
          timeout: Some(max_runtime),
          result_ttl: RESULT_TTL_SECS,
        },
      )
      .await
  }

  pub async fn queue_snapshot_task(
    &self,
    pulp_server: &str,
    max_runtime: i64,
    snapshot_prefix: &str,
    allow_snapshot_reuse: bool,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
  ) -> Result<Task> {
    // Snapshots are always namespaced under snap-.
    let snapshot_prefix = if snapshot_prefix.starts_with("snap-") {
      snapshot_prefix.to_string()
    } else {
      format!("snap-{snapshot_prefix}")
    };

    let mut new_task = NewTask::new(
      format!("snapshot repos {pulp_server}"),
      TaskType::RepoSnapshot,
      TaskState::Queued,
    );
    new_task.date_queued = Some(Utc::now());
    new_task.task_args = Some(json!({
      "max_runtime": max_runtime,
      "snapshot_prefix": snapshot_prefix,
      "allow_snapshot_reuse": allow_snapshot_reuse,
      "regex_include": regex_include,
      "regex_exclude": regex_exclude,
    }));

    self
      .queue_task(
        new_task,
        JobSpec {
          func: "snapshot_repos".into(),
          kwargs: json!({
            "pulp_server": pulp_server,
            "snapshot_prefix": snapshot_prefix,
            "allow_snapshot_reuse": allow_snapshot_reuse,
            "regex_include": regex_include,
            "regex_exclude": regex_exclude,
          }),
          meta: json!({
            "job_type": "ADHOC_REPO_SNAPSHOT",
            "pulp_server": pulp_server,
          }),
          timeout: Some(max_runtime),
          result_ttl: RESULT_TTL_SECS,
        },
      )
      .await
  }

  pub async fn queue_removal_task(
    &self,
    pulp_server: &str,
    max_runtime: i64,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
    dry_run: bool,
  ) -> Result<Task> {
    let mut new_task = NewTask::new(
      format!("remove repos {pulp_server}"),
      TaskType::RepoRemoval,
      TaskState::Queued,
    );
    new_task.date_queued = Some(Utc::now());
    new_task.task_args = Some(json!({
      "max_runtime": max_runtime,
      "regex_include": regex_include,
      "regex_exclude": regex_exclude,
      "dry_run": dry_run,
    }));

    self
      .queue_task(
        new_task,
        JobSpec {
          func: "remove_repos".into(),
          kwargs: json!({
            "pulp_server": pulp_server,
            "regex_include": regex_include,
            "regex_exclude": regex_exclude,
            "dry_run": dry_run,
          }),
          meta: json!({
            "job_type": "ADHOC_REPO_REMOVAL",
            "pulp_server": pulp_server,
          }),
          timeout: Some(max_runtime),
          result_ttl: RESULT_TTL_SECS,
        },
      )
      .await
  }

  /// Cancels a Task: canceled is the only reachable target, only
  /// from a non-terminal state. A bound worker job is canceled when
  /// still queued, stop-signaled when already running.
  pub async fn change_task_state(
    &self,
    task_id: i64,
    state: &str,
  ) -> Result<Task> {
    let mut conn = self.db.conn().await?;
    let task = TaskRepository::get_by_id(&mut conn, task_id)
      .await?
      .ok_or_else(|| {
        Error::NotFound(format!("task with id {task_id}"))
      })?;

    if state != "canceled" {
      return Err(Error::InvalidState(
        "canceled is the only valid state to move a task to"
          .into(),
      ));
    }
    if task.state.is_terminal() {
      return Err(Error::InvalidState(format!(
        "task cannot be moved to {state} when it is in {}",
        task.state
      )));
    }

    if let Some(job_id) = &task.worker_job_id {
      match self.queue.job(job_id).await? {
        Some(job) if job.status == JobStatus::Queued => {
          self.queue.cancel_job(job_id).await?;
        }
        Some(job) if job.status == JobStatus::Started => {
          self.queue.send_stop(job_id).await?;
        }
        _ => {}
      }
    }

    TaskRepository::update(
      &mut conn,
      task.id,
      &TaskPatch {
        state: Some(TaskState::Canceled),
        date_finished: Some(Utc::now()),
        ..Default::default()
      },
    )
    .await?;

    TaskRepository::get_by_id(&mut conn, task.id)
      .await?
      .ok_or_else(|| {
        Error::NotFound(format!("task with id {task_id}"))
      })
  }

  /// Marks the Task of a crashed worker job failed. Called by the
  /// worker runtime; never raises.
  pub async fn fail_task_callback(&self, job: &Job, detail: &str) {
    let result: Result<()> = async {
      let Some(task_id) = job.task_id() else {
        return Ok(());
      };
      let mut conn = self.db.conn().await?;
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
        task.id,
        &TaskPatch {
          state: Some(TaskState::Failed),
          date_finished: Some(Utc::now()),
          error: Some(TaskError::value(
            "task ran into unexpected error",
            detail,
          )),
          ..Default::default()
        },
      )
      .await?;
      Ok(())
    }
    .await;

    if let Err(e) = result {
      tracing::error!("fail_task_callback failed: {e:#}");
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use async_trait::async_trait;
  use database::NewPulpServer;
  use queue::{QueueError, ScheduleEntry};
  use std::{
    collections::HashMap,
    sync::{
      Mutex,
      atomic::{AtomicBool, Ordering},
    },
  };

  /// In-memory queue standing in for redis in tests.
  #[derive(Default)]
  pub struct MemoryQueue {
    pub jobs: Mutex<HashMap<String, Job>>,
    pub schedules: Mutex<Vec<ScheduleEntry>>,
    pub stops: Mutex<Vec<String>>,
    pub fail_enqueue: AtomicBool,
  }

  impl MemoryQueue {
    pub fn set_job_status(&self, id: &str, status: JobStatus) {
      let mut jobs = self.jobs.lock().unwrap();
      if let Some(job) = jobs.get_mut(id) {
        job.status = status;
      }
    }
  }

  #[async_trait]
  impl JobQueue for MemoryQueue {
    async fn enqueue(
      &self,
      spec: JobSpec,
    ) -> std::result::Result<Job, QueueError> {
      if self.fail_enqueue.load(Ordering::SeqCst) {
        return Err(QueueError::JobNotFound(
          "redis unavailable".into(),
        ));
      }
      let job = Job {
        id: uuid::Uuid::new_v4().to_string(),
        spec,
        status: JobStatus::Queued,
        enqueued_at: Utc::now(),
        started_at: None,
        ended_at: None,
        exc_info: None,
      };
      self
        .jobs
        .lock()
        .unwrap()
        .insert(job.id.clone(), job.clone());
      Ok(job)
    }

    async fn job(
      &self,
      id: &str,
    ) -> std::result::Result<Option<Job>, QueueError> {
      Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn cancel_job(
      &self,
      id: &str,
    ) -> std::result::Result<(), QueueError> {
      self.set_job_status(id, JobStatus::Canceled);
      Ok(())
    }

    async fn send_stop(
      &self,
      id: &str,
    ) -> std::result::Result<(), QueueError> {
      self.stops.lock().unwrap().push(id.to_string());
      Ok(())
    }

    async fn schedules(
      &self,
    ) -> std::result::Result<Vec<ScheduleEntry>, QueueError> {
      Ok(self.schedules.lock().unwrap().clone())
    }

    async fn remove_schedule(
      &self,
      id: &str,
    ) -> std::result::Result<(), QueueError> {
      self
        .schedules
        .lock()
        .unwrap()
        .retain(|entry| entry.id != id);
      Ok(())
    }

    async fn add_schedule(
      &self,
      cron: &str,
      spec: JobSpec,
    ) -> std::result::Result<ScheduleEntry, QueueError> {
      let entry = ScheduleEntry {
        id: uuid::Uuid::new_v4().to_string(),
        cron: cron.to_string(),
        job: spec,
        next_run: queue::next_occurrence(cron, &Utc::now())?,
      };
      self.schedules.lock().unwrap().push(entry.clone());
      Ok(entry)
    }
  }

  pub async fn manager_fixture()
  -> (DbClient, Arc<MemoryQueue>, JobManager) {
    let db = DbClient::connect_memory().await.unwrap();
    let queue = Arc::new(MemoryQueue::default());
    let manager = JobManager::new(
      db.clone(),
      queue.clone(),
      Arc::new(CoreConfig::default()),
    );
    (db, queue, manager)
  }

  #[tokio::test]
  async fn adhoc_sync_creates_task_then_job() {
    let (db, queue, manager) = manager_fixture().await;

    let task = manager
      .queue_sync_repo_task(
        "pulp01.domain.local",
        21_600,
        4,
        Some("rpm"),
        None,
        None,
        None,
      )
      .await
      .unwrap();

    assert_eq!(task.state, TaskState::Queued);
    assert_eq!(task.task_type, TaskType::RepoGroupSync);
    let job_id = task.worker_job_id.expect("job bound to task");
    let jobs = queue.jobs.lock().unwrap();
    let job = jobs.get(&job_id).unwrap();
    assert_eq!(job.spec.func, "sync_repos");
    assert_eq!(job.task_id(), Some(task.id));
    assert_eq!(job.spec.timeout, Some(21_600));
    drop(jobs);

    // Task row persisted independently of the queue.
    let mut conn = db.conn().await.unwrap();
    let stored = TaskRepository::get_by_id(&mut conn, task.id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stored.state, TaskState::Queued);
  }

  #[tokio::test]
  async fn enqueue_failure_marks_task_failed_without_raising() {
    let (_db, queue, manager) = manager_fixture().await;
    queue.fail_enqueue.store(true, Ordering::SeqCst);

    let task = manager
      .queue_removal_task(
        "pulp01.domain.local",
        3_600,
        None,
        None,
        true,
      )
      .await
      .unwrap();

    assert_eq!(task.state, TaskState::Failed);
    assert!(task.date_finished.is_some());
    assert!(task.error.is_some());
  }

  #[tokio::test]
  async fn schedules_replaced_only_for_matching_server_and_type() {
    let (db, queue, manager) = manager_fixture().await;
    let mut conn = db.conn().await.unwrap();
    let server = PulpServerRepository::add(
      &mut conn,
      &NewPulpServer {
        name: "pulp01.domain.local".into(),
        page_size: 100,
        repo_config_registration_schedule: Some("0 4 * * *".into()),
        ..Default::default()
      },
    )
    .await
    .unwrap();
    database::PulpServerRepoGroupRepository::add(
      &mut conn,
      &database::NewPulpServerRepoGroup {
        pulp_server_id: server.id,
        name: "rpm-repos".into(),
        schedule: Some("0 2 * * *".into()),
        max_concurrent_syncs: 4,
        max_runtime: 21_600,
        regex_include: Some("^ext-".into()),
        ..Default::default()
      },
    )
    .await
    .unwrap();
    drop(conn);

    // Another server's entry must survive reinstall.
    queue
      .add_schedule(
        "0 1 * * *",
        JobSpec {
          func: "sync_repos".into(),
          kwargs: json!({}),
          meta: json!({
            "job_type": REPO_GROUP_SYNC_META,
            "pulp_server": "pulp02.domain.local",
          }),
          timeout: None,
          result_ttl: RESULT_TTL_SECS,
        },
      )
      .await
      .unwrap();

    manager.setup_schedules().await.unwrap();
    manager.setup_schedules().await.unwrap();

    let schedules = queue.schedules.lock().unwrap();
    let for_server: Vec<_> = schedules
      .iter()
      .filter(|entry| {
        entry.job.meta_str("pulp_server")
          == Some("pulp01.domain.local")
      })
      .collect();
    // One sync group entry + one registration entry, not
    // duplicated by the second install.
    assert_eq!(for_server.len(), 2);
    assert!(for_server.iter().any(|entry| {
      entry.job.meta_str("job_type") == Some(REPO_GROUP_SYNC_META)
        && entry.cron == "0 2 * * *"
    }));
    assert!(for_server.iter().any(|entry| {
      entry.job.meta_str("job_type")
        == Some(REPO_REGISTRATION_META)
        && entry.cron == "0 4 * * *"
    }));
    assert!(schedules.iter().any(|entry| {
      entry.job.meta_str("pulp_server")
        == Some("pulp02.domain.local")
    }));
  }

  #[tokio::test]
  async fn cancel_running_task_sends_stop_signal() {
    let (db, queue, manager) = manager_fixture().await;

    let task = manager
      .queue_sync_repo_task(
        "pulp01.domain.local",
        3_600,
        2,
        None,
        None,
        None,
        None,
      )
      .await
      .unwrap();
    let job_id = task.worker_job_id.clone().unwrap();

    // Simulate the worker having picked the job up.
    queue.set_job_status(&job_id, JobStatus::Started);
    {
      let mut conn = db.conn().await.unwrap();
      TaskRepository::update(
        &mut conn,
        task.id,
        &TaskPatch {
          state: Some(TaskState::Running),
          date_started: Some(Utc::now()),
          ..Default::default()
        },
      )
      .await
      .unwrap();
    }

    let canceled = manager
      .change_task_state(task.id, "canceled")
      .await
      .unwrap();
    assert_eq!(canceled.state, TaskState::Canceled);
    assert!(canceled.date_finished.is_some());
    assert_eq!(queue.stops.lock().unwrap().as_slice(), [job_id]);

    // A second cancel is rejected and leaves the state alone.
    let err = manager
      .change_task_state(task.id, "canceled")
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    let mut conn = db.conn().await.unwrap();
    let stored = TaskRepository::get_by_id(&mut conn, task.id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stored.state, TaskState::Canceled);
  }

  #[tokio::test]
  async fn cancel_queued_task_cancels_job() {
    let (_db, queue, manager) = manager_fixture().await;

    let task = manager
      .queue_snapshot_task(
        "pulp01.domain.local",
        3_600,
        "2024-06",
        false,
        None,
        None,
      )
      .await
      .unwrap();
    let job_id = task.worker_job_id.clone().unwrap();

    let canceled = manager
      .change_task_state(task.id, "canceled")
      .await
      .unwrap();
    assert_eq!(canceled.state, TaskState::Canceled);
    let jobs = queue.jobs.lock().unwrap();
    assert_eq!(jobs.get(&job_id).unwrap().status, JobStatus::Canceled);
  }

  #[tokio::test]
  async fn cancel_validates_target_state_and_existence() {
    let (_db, _queue, manager) = manager_fixture().await;

    let err = manager
      .change_task_state(9_999, "canceled")
      .await
      .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let task = manager
      .queue_removal_task(
        "pulp01.domain.local",
        600,
        None,
        None,
        true,
      )
      .await
      .unwrap();
    let err = manager
      .change_task_state(task.id, "completed")
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
  }

  #[tokio::test]
  async fn snapshot_prefix_is_namespaced() {
    let (_db, queue, manager) = manager_fixture().await;
    let task = manager
      .queue_snapshot_task(
        "pulp01.domain.local",
        3_600,
        "2024-06",
        true,
        None,
        None,
      )
      .await
      .unwrap();
    assert_eq!(
      task
        .task_args
        .as_ref()
        .unwrap()
        .get("snapshot_prefix")
        .and_then(Value::as_str),
      Some("snap-2024-06")
    );
    let jobs = queue.jobs.lock().unwrap();
    let job = jobs.values().next().unwrap();
    assert_eq!(
      job.spec.kwargs.get("snapshot_prefix").and_then(Value::as_str),
      Some("snap-2024-06")
    );
  }

  #[tokio::test]
  async fn failure_callback_records_error_and_never_raises() {
    let (db, queue, manager) = manager_fixture().await;

    let task = manager
      .queue_sync_repo_task(
        "pulp01.domain.local",
        3_600,
        2,
        None,
        None,
        None,
        None,
      )
      .await
      .unwrap();
    let job_id = task.worker_job_id.clone().unwrap();
    let job =
      queue.jobs.lock().unwrap().get(&job_id).cloned().unwrap();

    manager
      .fail_task_callback(&job, "worker crashed: boom")
      .await;

    let mut conn = db.conn().await.unwrap();
    let stored = TaskRepository::get_by_id(&mut conn, task.id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stored.state, TaskState::Failed);
    assert!(stored.date_finished.is_some());
    let error = stored.error.unwrap();
    assert_eq!(
      error.get("msg").and_then(Value::as_str),
      Some("task ran into unexpected error")
    );

    // Terminal tasks are left alone on a late callback.
    manager.fail_task_callback(&job, "late crash").await;
    let again = TaskRepository::get_by_id(&mut conn, task.id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(
      again.error.unwrap().get("detail").and_then(Value::as_str),
      Some("worker crashed: boom")
    );
  }
}
