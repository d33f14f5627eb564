use std::{collections::VecDeque, sync::Arc};

use chrono::Utc;
use database::{
  DbClient, NewTask, NewTaskStage, PulpServer, PulpServerPatch,
  PulpServerRepoDetail, PulpServerRepoPatch,
  PulpServerRepoRepository, PulpServerRepoTaskRepository,
  PulpServerRepository, RepoHealthStatus, Task, TaskError,
  TaskPatch, TaskStage, TaskStageRepository, TaskRepository,
  TaskState, TaskType,
};
use pulp_client::{
  Publication, Pulp3Client, PulpTaskState, Repository,
  get_all_publications, get_remote, get_repo, get_repo_version,
  get_task, kind_from_href, modify_repo, new_publication,
  sync_repo,
};
use regex::Regex;
use serde_json::{Value, json};

use crate::{
  config::CoreConfig,
  error::{Error, Result},
  helpers::{
    is_internal_url, name_matches, new_pulp_client, poll_interval,
  },
  reconciler::PulpReconciler,
};

pub const STAGE_SYNC_REPO: &str = "sync repo";
pub const STAGE_REMOVE_BANNED: &str = "remove banned packages";
pub const STAGE_PUBLISH: &str = "publish repo";

/// Where a polled child task goes next, decided purely from the
/// current stage name and the pulp task's terminal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStep {
  /// Pulp task still waiting/running.
  Wait,
  /// Pulp task failed or was canceled.
  FailTask,
  /// Sync finished and produced a new repository version.
  AfterSync,
  /// Sync finished without creating resources; nothing to publish.
  CompleteWithoutPublish,
  /// Banned-package removal finished; publication comes next.
  AfterBannedRemoval,
  /// Publication finished; the chain is complete.
  CompleteTask,
}

fn classify_progress(
  stage_name: &str,
  state: PulpTaskState,
  created_resources_empty: bool,
) -> SyncStep {
  match state {
    PulpTaskState::Waiting | PulpTaskState::Running => {
      SyncStep::Wait
    }
    PulpTaskState::Failed | PulpTaskState::Canceled => {
      SyncStep::FailTask
    }
    PulpTaskState::Completed => match stage_name {
      STAGE_SYNC_REPO if created_resources_empty => {
        SyncStep::CompleteWithoutPublish
      }
      STAGE_SYNC_REPO => SyncStep::AfterSync,
      STAGE_REMOVE_BANNED => SyncStep::AfterBannedRemoval,
      _ => SyncStep::CompleteTask,
    },
  }
}

/// Health over the last five sync outcomes, newest first. The most
/// recent run wins green; four or more failures go red; anything in
/// between is amber.
fn health_from_window(
  states: &[TaskState],
) -> Option<RepoHealthStatus> {
  let newest = states.first()?;
  if *newest == TaskState::Completed {
    return Some(RepoHealthStatus::Green);
  }
  let failed = states
    .iter()
    .filter(|state| **state == TaskState::Failed)
    .count();
  if failed >= 4 {
    Some(RepoHealthStatus::Red)
  } else {
    Some(RepoHealthStatus::Amber)
  }
}

/// Worst status across the server's repos; green only if all green.
fn rollup_health(
  healths: impl IntoIterator<Item = Option<RepoHealthStatus>>,
) -> Option<RepoHealthStatus> {
  healths.into_iter().flatten().max()
}

/// Repos eligible for sync: a remote feed is set and the name
/// passes the include/exclude filters (exclude wins).
fn select_repos_to_sync(
  repos: Vec<PulpServerRepoDetail>,
  regex_include: Option<&str>,
  regex_exclude: Option<&str>,
) -> Result<Vec<PulpServerRepoDetail>> {
  let mut selected = Vec::new();
  for repo in repos {
    if repo.remote_feed.is_none() {
      continue;
    }
    if name_matches(&repo.repo_name, regex_include, regex_exclude)?
    {
      selected.push(repo);
    }
  }
  Ok(selected)
}

fn stage_task_href(stage: &TaskStage) -> Option<String> {
  stage
    .detail
    .as_ref()
    .and_then(|detail| detail.get("task_href"))
    .and_then(Value::as_str)
    .map(str::to_string)
}

fn task_arg<'a>(task: &'a Task, key: &str) -> Option<&'a str> {
  task
    .task_args
    .as_ref()
    .and_then(|args| args.get(key))
    .and_then(Value::as_str)
}

/// Drives the bounded-parallel per-repo sync state machines for one
/// pulp server and derives the health signals afterwards.
pub struct RepoSyncher {
  db: DbClient,
  config: Arc<CoreConfig>,
  pulp_server: PulpServer,
  client: Pulp3Client,
}

impl RepoSyncher {
  pub async fn new(
    db: DbClient,
    config: Arc<CoreConfig>,
    name: &str,
  ) -> Result<Self> {
    let mut conn = db.conn().await?;
    let pulp_server =
      PulpServerRepository::get_by_name(&mut conn, name)
        .await?
        .ok_or_else(|| {
          Error::NotFound(format!("pulp server {name}"))
        })?;
    drop(conn);
    let client = new_pulp_client(&pulp_server, &config).await?;
    Ok(Self {
      db,
      config,
      pulp_server,
      client,
    })
  }

  async fn get_repos_to_sync(
    &self,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
  ) -> Result<Vec<PulpServerRepoDetail>> {
    let mut conn = self.db.conn().await?;
    let repos = PulpServerRepoRepository::for_server(
      &mut conn,
      self.pulp_server.id,
    )
    .await?;
    select_repos_to_sync(repos, regex_include, regex_exclude)
  }

  /// One child task per repo to sync, bulk inserted and bound to
  /// its repo for health windowing.
  async fn generate_tasks(
    &self,
    repos: &[PulpServerRepoDetail],
    parent_task_id: i64,
  ) -> Result<Vec<Task>> {
    let rows: Vec<NewTask> = repos
      .iter()
      .map(|repo| {
        let mut task = NewTask::new(
          format!(
            "sync {} {}",
            self.pulp_server.name, repo.repo_name
          ),
          TaskType::RepoSync,
          TaskState::Queued,
        );
        task.parent_task_id = Some(parent_task_id);
        task.date_queued = Some(Utc::now());
        task.task_args = Some(json!({
          "pulp_server_repo_id": repo.id,
          "repo_name": repo.repo_name,
          "repo_href": repo.repo_href,
          "remote_href": repo.remote_href,
        }));
        task
      })
      .collect();

    let mut tx = self.db.begin().await?;
    let tasks = TaskRepository::bulk_add(&mut tx, &rows).await?;
    let bindings: Vec<(i64, i64)> = repos
      .iter()
      .zip(tasks.iter())
      .map(|(repo, task)| (repo.id, task.id))
      .collect();
    PulpServerRepoTaskRepository::bulk_add(&mut tx, &bindings)
      .await?;
    tx.commit().await?;
    Ok(tasks)
  }

  /// Kicks off the pulp-side sync for one child task and records
  /// the "sync repo" stage with the pulp task handle.
  async fn start_sync(
    &self,
    task: &Task,
    sync_options: Option<&Value>,
  ) -> Result<TaskStage> {
    let repo_href = task_arg(task, "repo_href").ok_or_else(|| {
      Error::InvalidState(format!(
        "task {} has no repo_href argument",
        task.id
      ))
    })?;

    let mut conn = self.db.conn().await?;
    TaskRepository::update(
      &mut conn,
      task.id,
      &TaskPatch {
        state: Some(TaskState::Running),
        date_started: Some(Utc::now()),
        ..Default::default()
      },
    )
    .await?;

    let pulp_task =
      sync_repo(&self.client, repo_href, None, sync_options)
        .await?;

    let stage = TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: task.id,
        name: STAGE_SYNC_REPO.into(),
        detail: Some(json!({"task_href": pulp_task.pulp_href})),
      },
    )
    .await?;
    Ok(stage)
  }

  async fn mark_task_failed(
    &self,
    task_id: i64,
    stage: Option<&TaskStage>,
    msg: &str,
    detail: &str,
  ) {
    let error = TaskError::value(msg, detail);
    let result: Result<()> = async {
      let mut conn = self.db.conn().await?;
      if let Some(stage) = stage {
        TaskStageRepository::set_error(&mut conn, stage.id, &error)
          .await?;
      }
      TaskRepository::update(
        &mut conn,
        task_id,
        &TaskPatch {
          state: Some(TaskState::Failed),
          date_finished: Some(Utc::now()),
          error: Some(error.clone()),
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

  async fn mark_task_completed(&self, task_id: i64) -> Result<()> {
    let mut conn = self.db.conn().await?;
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

  /// Single poll of one child task's outstanding pulp task. Returns
  /// true when the child no longer needs tracking.
  async fn progress_sync(
    &self,
    task: &Task,
    stage: &TaskStage,
  ) -> bool {
    let Some(task_href) = stage_task_href(stage) else {
      self
        .mark_task_failed(
          task.id,
          Some(stage),
          "task stage is missing its pulp task handle",
          &format!("stage {} has no task_href detail", stage.id),
        )
        .await;
      return true;
    };

    let pulp_task = match get_task(&self.client, &task_href).await
    {
      Ok(pulp_task) => pulp_task,
      Err(e) => {
        self
          .mark_task_failed(
            task.id,
            Some(stage),
            "failed to retrieve pulp task",
            &format!("{e:#}"),
          )
          .await;
        return true;
      }
    };

    match classify_progress(
      &stage.name,
      pulp_task.state,
      pulp_task.created_resources.is_empty(),
    ) {
      SyncStep::Wait => false,
      SyncStep::FailTask => {
        self
          .mark_task_failed(
            task.id,
            Some(stage),
            &format!(
              "pulp task entered {} state",
              pulp_task.state
            ),
            &format!(
              "pulp task {task_href} finished {}",
              pulp_task.state
            ),
          )
          .await;
        true
      }
      SyncStep::CompleteWithoutPublish => {
        if let Err(e) = self.mark_task_completed(task.id).await {
          tracing::error!(
            "failed to complete task {}: {e:#}",
            task.id
          );
        }
        true
      }
      SyncStep::AfterSync => {
        match self.advance_after_sync(task).await {
          Ok(done) => done,
          Err(e) => {
            tracing::error!(
              "failed to advance sync of task {}: {e:#}",
              task.id
            );
            self
              .mark_task_failed(
                task.id,
                Some(stage),
                "failed to start post-sync stage",
                &e.detail(),
              )
              .await;
            true
          }
        }
      }
      SyncStep::AfterBannedRemoval => {
        match self.start_publication(task).await {
          Ok(_) => false,
          Err(e) => {
            tracing::error!(
              "failed to start publication for task {}: {e:#}",
              task.id
            );
            self
              .mark_task_failed(
                task.id,
                Some(stage),
                "failed to start publication",
                &e.detail(),
              )
              .await;
            true
          }
        }
      }
      SyncStep::CompleteTask => {
        if let Err(e) = self.mark_task_completed(task.id).await {
          tracing::error!(
            "failed to complete task {}: {e:#}",
            task.id
          );
        }
        true
      }
    }
  }

  /// The sync created a new repository version: banned packages are
  /// pruned first when applicable, then the version is published
  /// unless a publication already exists for it.
  async fn advance_after_sync(&self, task: &Task) -> Result<bool> {
    if self.start_remove_banned_packages(task).await? {
      return Ok(false);
    }
    if self.publication_exists(task).await? {
      self.mark_task_completed(task.id).await?;
      return Ok(true);
    }
    self.start_publication(task).await?;
    Ok(false)
  }

  async fn repo_for_task(
    &self,
    task: &Task,
  ) -> Result<Repository> {
    let repo_href = task_arg(task, "repo_href").ok_or_else(|| {
      Error::InvalidState(format!(
        "task {} has no repo_href argument",
        task.id
      ))
    })?;
    Ok(get_repo(&self.client, repo_href).await?)
  }

  /// Collects hrefs of packages in the latest repo version whose
  /// name matches the banned-package regex.
  async fn find_packages_to_remove(
    &self,
    repo: &Repository,
  ) -> Result<Vec<String>> {
    let Some(banned_regex) =
      self.config.pulp.banned_package_regex.as_deref()
    else {
      return Ok(Vec::new());
    };
    let banned = Regex::new(banned_regex).map_err(|e| {
      Error::InvalidArgument(format!(
        "invalid banned_package_regex: {e}"
      ))
    })?;

    let Some(latest) = repo.latest_version_href.as_deref() else {
      return Ok(Vec::new());
    };
    let version = get_repo_version(&self.client, latest).await?;

    let name_field = repo
      .pulp_href
      .as_deref()
      .and_then(kind_from_href)
      .map(|kind| kind.package_name_field())
      .unwrap_or("name");

    let mut to_remove = Vec::new();
    for (content_type, entry) in &version.content_summary.present {
      if !content_type.ends_with(".package") {
        continue;
      }
      let packages =
        self.client.get_page_results(&entry.href, &[]).await?;
      for package in packages {
        let Some(package_name) =
          package.get(name_field).and_then(Value::as_str)
        else {
          continue;
        };
        if banned.is_match(package_name) {
          if let Some(href) =
            package.get("pulp_href").and_then(Value::as_str)
          {
            to_remove.push(href.to_string());
          }
        }
      }
    }
    Ok(to_remove)
  }

  /// Starts a modify-repo removing banned packages from the fresh
  /// repository version. Repos fed from internal domains are
  /// trusted and never scanned. Returns whether a removal stage was
  /// started.
  async fn start_remove_banned_packages(
    &self,
    task: &Task,
  ) -> Result<bool> {
    let repo = self.repo_for_task(task).await?;

    let remote_href = repo
      .remote
      .clone()
      .or_else(|| task_arg(task, "remote_href").map(Into::into));
    let Some(remote_href) = remote_href else {
      return Ok(false);
    };
    let remote = get_remote(&self.client, &remote_href).await?;
    if is_internal_url(&remote.url, &self.config) {
      return Ok(false);
    }

    let to_remove = self.find_packages_to_remove(&repo).await?;
    if to_remove.is_empty() {
      return Ok(false);
    }

    let repo_href = repo.pulp_href.as_deref().ok_or_else(|| {
      Error::InvalidState(format!(
        "repository {} has no pulp_href",
        repo.name
      ))
    })?;
    let latest =
      repo.latest_version_href.as_deref().ok_or_else(|| {
        Error::InvalidState(format!(
          "repository {} has no latest version",
          repo.name
        ))
      })?;

    tracing::info!(
      "removing {} banned packages from {}",
      to_remove.len(),
      repo.name
    );
    let pulp_task = modify_repo(
      &self.client,
      repo_href,
      latest,
      &[],
      &to_remove,
    )
    .await?;

    let mut conn = self.db.conn().await?;
    TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: task.id,
        name: STAGE_REMOVE_BANNED.into(),
        detail: Some(json!({"task_href": pulp_task.pulp_href})),
      },
    )
    .await?;
    Ok(true)
  }

  /// Whether the latest repo version already has a publication, in
  /// which case publishing again is wasted work.
  async fn publication_exists(&self, task: &Task) -> Result<bool> {
    let repo = self.repo_for_task(task).await?;
    let Some(latest) = repo.latest_version_href.as_deref() else {
      return Ok(false);
    };
    let Some(kind) =
      repo.pulp_href.as_deref().and_then(kind_from_href)
    else {
      return Ok(false);
    };
    let publications = get_all_publications(
      &self.client,
      kind,
      &[("repository_version", latest.to_string())],
    )
    .await?;
    Ok(!publications.is_empty())
  }

  async fn start_publication(
    &self,
    task: &Task,
  ) -> Result<TaskStage> {
    let repo = self.repo_for_task(task).await?;
    let repo_href = repo.pulp_href.as_deref().ok_or_else(|| {
      Error::InvalidState(format!(
        "repository {} has no pulp_href",
        repo.name
      ))
    })?;
    let kind = kind_from_href(repo_href).ok_or_else(|| {
      Error::InvalidState(format!(
        "could not determine content kind of {repo_href}"
      ))
    })?;
    let latest =
      repo.latest_version_href.as_deref().ok_or_else(|| {
        Error::InvalidState(format!(
          "repository {} has no latest version",
          repo.name
        ))
      })?;

    // Flat deb repos (remote distributions ending "/") publish
    // simple instead of structured.
    let mut deb_flat = false;
    if kind == pulp_client::RepoKind::Deb {
      if let Some(remote_href) = repo
        .remote
        .clone()
        .or_else(|| task_arg(task, "remote_href").map(Into::into))
      {
        let remote =
          get_remote(&self.client, &remote_href).await?;
        deb_flat = remote
          .distributions
          .as_deref()
          .map(|distributions| {
            distributions
              .split_whitespace()
              .any(|distribution| distribution.ends_with('/'))
          })
          .unwrap_or(false);
      }
    }

    let publication =
      Publication::for_kind(kind, latest, deb_flat);
    let pulp_task =
      new_publication(&self.client, kind, &publication).await?;

    let mut conn = self.db.conn().await?;
    let stage = TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: task.id,
        name: STAGE_PUBLISH.into(),
        detail: Some(json!({"task_href": pulp_task.pulp_href})),
      },
    )
    .await?;
    Ok(stage)
  }

  /// Human readable progress on the parent's current stage.
  async fn update_overall_sync_status(
    &self,
    parent_task: &Task,
    in_progress: usize,
    completed: usize,
    failed: usize,
    total: usize,
  ) {
    let result: Result<()> = async {
      let mut conn = self.db.conn().await?;
      let Some(stage) = TaskStageRepository::current_for_task(
        &mut conn,
        parent_task.id,
      )
      .await?
      else {
        return Ok(());
      };
      let mut detail = stage
        .detail
        .as_ref()
        .map(|detail| detail.0.clone())
        .unwrap_or_else(|| json!({}));
      detail["message"] = json!(format!(
        "{in_progress} syncing, {completed} completed, \
         {failed} failed of {total} repos"
      ));
      TaskStageRepository::update_detail(
        &mut conn, stage.id, &detail,
      )
      .await?;
      Ok(())
    }
    .await;
    if let Err(e) = result {
      tracing::warn!(
        "failed to update overall sync status: {e:#}"
      );
    }
  }

  async fn parent_canceled(&self, parent_task: &Task) -> bool {
    let result: Result<bool> = async {
      let mut conn = self.db.conn().await?;
      let current =
        TaskRepository::get_by_id(&mut conn, parent_task.id)
          .await?;
      Ok(
        current
          .map(|task| task.state == TaskState::Canceled)
          .unwrap_or(false),
      )
    }
    .await;
    result.unwrap_or(false)
  }

  /// The fan-out loop: keeps at most `max_concurrent_syncs` child
  /// tasks in flight, advancing each by one poll per iteration.
  async fn do_sync_repos(
    &self,
    parent_task: &Task,
    tasks: Vec<Task>,
    max_concurrent_syncs: usize,
    sync_options: Option<&Value>,
  ) -> Result<()> {
    let total = tasks.len();
    let mut pending: VecDeque<Task> = tasks.into();
    let mut in_flight: Vec<(Task, TaskStage)> = Vec::new();
    let mut completed = 0usize;
    let mut failed = 0usize;
    let max_concurrent_syncs = max_concurrent_syncs.max(1);

    loop {
      if self.parent_canceled(parent_task).await {
        tracing::info!(
          "parent task {} canceled, stopping sync loop",
          parent_task.id
        );
        break;
      }

      while in_flight.len() < max_concurrent_syncs {
        let Some(task) = pending.pop_front() else {
          break;
        };
        match self.start_sync(&task, sync_options).await {
          Ok(stage) => in_flight.push((task, stage)),
          Err(e) => {
            tracing::warn!(
              "failed to start sync for task {}: {e:#}",
              task.id
            );
            self
              .mark_task_failed(
                task.id,
                None,
                "failed to start repo sync",
                &e.detail(),
              )
              .await;
            failed += 1;
          }
        }
      }

      let mut still_in_flight = Vec::new();
      for (task, stage) in in_flight {
        if self.progress_sync(&task, &stage).await {
          let mut conn = self.db.conn().await?;
          let state =
            TaskRepository::get_by_id(&mut conn, task.id)
              .await?
              .map(|task| task.state);
          if state == Some(TaskState::Completed) {
            completed += 1;
          } else {
            failed += 1;
          }
        } else {
          // The stage may have advanced; track the latest one.
          let mut conn = self.db.conn().await?;
          let stage = TaskStageRepository::current_for_task(
            &mut conn, task.id,
          )
          .await?
          .unwrap_or(stage);
          still_in_flight.push((task, stage));
        }
      }
      in_flight = still_in_flight;

      self
        .update_overall_sync_status(
          parent_task,
          in_flight.len(),
          completed,
          failed,
          total,
        )
        .await;

      if in_flight.is_empty() && pending.is_empty() {
        break;
      }
      tokio::time::sleep(poll_interval(&self.config)).await;
    }
    Ok(())
  }

  /// Reconcile under the parent task; failures are recorded on the
  /// parent and re-raised.
  async fn reconcile_repos(&self, parent_task: &Task) -> Result<()> {
    let result = async {
      let reconciler = PulpReconciler::new(
        self.db.clone(),
        self.config.clone(),
        &self.pulp_server.name,
      )
      .await?;
      reconciler.reconcile().await
    }
    .await;

    if let Err(e) = &result {
      self
        .mark_task_failed(
          parent_task.id,
          None,
          &format!(
            "failed to reconcile repos for {}",
            self.pulp_server.name
          ),
          &e.detail(),
        )
        .await;
    }
    result.map(|_| ())
  }

  /// Recomputes the rolling health of each repo just synced.
  async fn calculate_repo_health(
    &self,
    repos: &[PulpServerRepoDetail],
  ) {
    for repo in repos {
      let result: Result<()> = async {
        let mut conn = self.db.conn().await?;
        let window = PulpServerRepoTaskRepository::recent_tasks(
          &mut conn, repo.id, 5,
        )
        .await?;
        let states: Vec<TaskState> =
          window.iter().map(|task| task.state).collect();
        let Some(health) = health_from_window(&states) else {
          return Ok(());
        };
        PulpServerRepoRepository::update(
          &mut conn,
          repo.id,
          &PulpServerRepoPatch {
            repo_sync_health: Some(health),
            repo_sync_health_date: Some(Utc::now()),
            ..Default::default()
          },
        )
        .await?;
        Ok(())
      }
      .await;
      if let Err(e) = result {
        tracing::error!(
          "failed to calculate repo health for {}: {e:#}",
          repo.repo_name
        );
      }
    }
  }

  /// Server rollup: worst repo status wins.
  async fn calculate_health_rollup(&self) {
    let result: Result<()> = async {
      let mut conn = self.db.conn().await?;
      let repos = PulpServerRepoRepository::for_server(
        &mut conn,
        self.pulp_server.id,
      )
      .await?;
      let Some(rollup) = rollup_health(
        repos.iter().map(|repo| repo.repo_sync_health),
      ) else {
        return Ok(());
      };
      PulpServerRepository::update(
        &mut conn,
        self.pulp_server.id,
        &PulpServerPatch {
          repo_sync_health_rollup: Some(rollup),
          repo_sync_health_rollup_date: Some(Utc::now()),
        },
      )
      .await?;
      Ok(())
    }
    .await;
    if let Err(e) = result {
      tracing::error!(
        "failed to calculate health rollup for {}: {e:#}",
        self.pulp_server.name
      );
    }
  }

  async fn run_sync(
    &self,
    parent_task: &Task,
    max_concurrent_syncs: usize,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
    sync_options: Option<&Value>,
  ) -> Result<()> {
    let mut conn = self.db.conn().await?;
    TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: parent_task.id,
        name: "reconcile repos".into(),
        detail: None,
      },
    )
    .await?;
    drop(conn);

    self.reconcile_repos(parent_task).await?;

    let repos = self
      .get_repos_to_sync(regex_include, regex_exclude)
      .await?;
    tracing::info!(
      "{} repos to sync on {}",
      repos.len(),
      self.pulp_server.name
    );

    let tasks =
      self.generate_tasks(&repos, parent_task.id).await?;

    let mut conn = self.db.conn().await?;
    TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: parent_task.id,
        name: "sync repos".into(),
        detail: Some(json!({})),
      },
    )
    .await?;
    drop(conn);

    self
      .do_sync_repos(
        parent_task,
        tasks,
        max_concurrent_syncs,
        sync_options,
      )
      .await?;

    self.calculate_repo_health(&repos).await;
    self.calculate_health_rollup().await;
    Ok(())
  }

  /// Entry point for the worker task function: the full per-server
  /// pipeline under an existing parent task.
  pub async fn sync_repos(
    &self,
    parent_task: &Task,
    max_concurrent_syncs: usize,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
    sync_options: Option<&Value>,
  ) -> Result<()> {
    let result = self
      .run_sync(
        parent_task,
        max_concurrent_syncs,
        regex_include,
        regex_exclude,
        sync_options,
      )
      .await;

    match &result {
      Ok(()) => {
        if !self.parent_canceled(parent_task).await {
          self.mark_task_completed(parent_task.id).await?;
        }
      }
      Err(e) => {
        self
          .mark_task_failed(
            parent_task.id,
            None,
            &format!(
              "unexpected error syncing repos on {}",
              self.pulp_server.name
            ),
            &e.detail(),
          )
          .await;
      }
    }
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use database::{
    NewPulpServer, NewPulpServerRepo, NewRepo, RepoRepository,
    RepoType,
  };

  fn detail_row(
    id: i64,
    name: &str,
    remote_feed: Option<&str>,
  ) -> PulpServerRepoDetail {
    PulpServerRepoDetail {
      id,
      pulp_server_id: 1,
      repo_id: id,
      repo_href: Some(format!("/r/{id}")),
      remote_href: None,
      remote_feed: remote_feed.map(Into::into),
      distribution_href: None,
      repo_sync_health: None,
      repo_sync_health_date: None,
      repo_name: name.into(),
      repo_type: RepoType::Rpm,
    }
  }

  fn feed_repos() -> Vec<PulpServerRepoDetail> {
    vec![
      detail_row(1, "rpm-repo1", Some("https://a/")),
      detail_row(2, "rpm-repo-ex", Some("https://b/")),
      detail_row(3, "deb-repo1", Some("https://c/")),
      detail_row(4, "deb-repo-ex", Some("https://d/")),
      detail_row(5, "no-feed-repo", None),
    ]
  }

  #[test]
  fn selects_repos_with_feeds() {
    let selected =
      select_repos_to_sync(feed_repos(), None, None).unwrap();
    let names: Vec<_> =
      selected.iter().map(|repo| repo.repo_name.as_str()).collect();
    assert_eq!(
      names,
      vec!["rpm-repo1", "rpm-repo-ex", "deb-repo1", "deb-repo-ex"]
    );
  }

  #[test]
  fn include_and_exclude_filters_compose() {
    let selected =
      select_repos_to_sync(feed_repos(), Some("rpm-repo"), None)
        .unwrap();
    assert_eq!(selected.len(), 2);

    let selected =
      select_repos_to_sync(feed_repos(), None, Some("-ex"))
        .unwrap();
    let names: Vec<_> =
      selected.iter().map(|repo| repo.repo_name.as_str()).collect();
    assert_eq!(names, vec!["rpm-repo1", "deb-repo1"]);

    // Exclude wins when both match.
    let selected =
      select_repos_to_sync(feed_repos(), Some("rpm"), Some("-ex"))
        .unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].repo_name, "rpm-repo1");
  }

  #[test]
  fn progress_classification_matrix() {
    use PulpTaskState::*;
    // Still running, any stage.
    assert_eq!(
      classify_progress(STAGE_PUBLISH, Running, true),
      SyncStep::Wait
    );
    assert_eq!(
      classify_progress(STAGE_SYNC_REPO, Waiting, true),
      SyncStep::Wait
    );
    // Terminal failure wins regardless of stage.
    assert_eq!(
      classify_progress(STAGE_SYNC_REPO, Failed, false),
      SyncStep::FailTask
    );
    assert_eq!(
      classify_progress(STAGE_PUBLISH, Canceled, true),
      SyncStep::FailTask
    );
    // Sync with no new resources never publishes.
    assert_eq!(
      classify_progress(STAGE_SYNC_REPO, Completed, true),
      SyncStep::CompleteWithoutPublish
    );
    assert_eq!(
      classify_progress(STAGE_SYNC_REPO, Completed, false),
      SyncStep::AfterSync
    );
    assert_eq!(
      classify_progress(STAGE_REMOVE_BANNED, Completed, false),
      SyncStep::AfterBannedRemoval
    );
    assert_eq!(
      classify_progress(STAGE_PUBLISH, Completed, true),
      SyncStep::CompleteTask
    );
  }

  #[test]
  fn health_window_policy() {
    use TaskState::*;
    // Newest first. Last run green means green.
    assert_eq!(
      health_from_window(&[
        Completed, Failed, Failed, Failed, Completed
      ]),
      Some(RepoHealthStatus::Green)
    );
    // Four failures in the window is red.
    assert_eq!(
      health_from_window(&[
        Failed, Failed, Failed, Failed, Completed
      ]),
      Some(RepoHealthStatus::Red)
    );
    // Latest failed but under four failures: amber.
    assert_eq!(
      health_from_window(&[
        Failed, Completed, Failed, Failed, Completed
      ]),
      Some(RepoHealthStatus::Amber)
    );
    assert_eq!(health_from_window(&[]), None);
  }

  #[test]
  fn rollup_takes_worst_status() {
    use RepoHealthStatus::*;
    assert_eq!(
      rollup_health([Some(Green), Some(Amber), Some(Green)]),
      Some(Amber)
    );
    assert_eq!(
      rollup_health([Some(Green), Some(Red), Some(Amber)]),
      Some(Red)
    );
    assert_eq!(
      rollup_health([Some(Green), None, Some(Green)]),
      Some(Green)
    );
    assert_eq!(rollup_health([None, None]), None);
  }

  async fn syncher_fixture() -> (DbClient, RepoSyncher) {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();
    PulpServerRepository::add(
      &mut conn,
      &NewPulpServer {
        name: "pulp01.domain.local".into(),
        page_size: 100,
        ..Default::default()
      },
    )
    .await
    .unwrap();
    drop(conn);
    let syncher = RepoSyncher::new(
      db.clone(),
      Arc::new(CoreConfig::default()),
      "pulp01.domain.local",
    )
    .await
    .unwrap();
    (db, syncher)
  }

  #[tokio::test]
  async fn generate_tasks_binds_each_repo() {
    let (db, syncher) = syncher_fixture().await;
    let mut conn = db.conn().await.unwrap();

    let mut repos = Vec::new();
    for name in ["rpm-repo1", "deb-repo1"] {
      let repo = RepoRepository::add(
        &mut conn,
        &NewRepo {
          name: name.into(),
          repo_type: RepoType::Rpm,
        },
      )
      .await
      .unwrap();
      let bound = PulpServerRepoRepository::add(
        &mut conn,
        &NewPulpServerRepo {
          pulp_server_id: syncher.pulp_server.id,
          repo_id: repo.id,
          repo_href: Some(format!("/r/{}", repo.id)),
          remote_feed: Some("https://mirror/".into()),
          ..Default::default()
        },
      )
      .await
      .unwrap();
      repos.push(bound);
    }
    let details = PulpServerRepoRepository::for_server(
      &mut conn,
      syncher.pulp_server.id,
    )
    .await
    .unwrap();
    drop(conn);

    let parent = {
      let mut conn = db.conn().await.unwrap();
      TaskRepository::add(
        &mut conn,
        &NewTask::new(
          "sync repos",
          TaskType::RepoGroupSync,
          TaskState::Running,
        ),
      )
      .await
      .unwrap()
    };

    let tasks = syncher
      .generate_tasks(&details, parent.id)
      .await
      .unwrap();
    assert_eq!(tasks.len(), details.len());
    for (repo, task) in details.iter().zip(&tasks) {
      assert_eq!(task.parent_task_id, Some(parent.id));
      assert_eq!(task.state, TaskState::Queued);
      assert_eq!(
        task
          .task_args
          .as_ref()
          .unwrap()
          .get("pulp_server_repo_id")
          .and_then(Value::as_i64),
        Some(repo.id)
      );
    }

    let mut conn = db.conn().await.unwrap();
    for (repo, task) in details.iter().zip(&tasks) {
      let window = PulpServerRepoTaskRepository::recent_tasks(
        &mut conn, repo.id, 5,
      )
      .await
      .unwrap();
      assert_eq!(window.len(), 1);
      assert_eq!(window[0].id, task.id);
    }
  }

  #[tokio::test]
  async fn repo_health_written_from_window() {
    let (db, syncher) = syncher_fixture().await;
    let mut conn = db.conn().await.unwrap();

    let repo = RepoRepository::add(
      &mut conn,
      &NewRepo {
        name: "rpm-repo1".into(),
        repo_type: RepoType::Rpm,
      },
    )
    .await
    .unwrap();
    let bound = PulpServerRepoRepository::add(
      &mut conn,
      &NewPulpServerRepo {
        pulp_server_id: syncher.pulp_server.id,
        repo_id: repo.id,
        remote_feed: Some("https://mirror/".into()),
        ..Default::default()
      },
    )
    .await
    .unwrap();

    // Oldest to newest: four failures then a success.
    let states = [
      TaskState::Failed,
      TaskState::Failed,
      TaskState::Failed,
      TaskState::Failed,
      TaskState::Completed,
    ];
    let mut bindings = Vec::new();
    for (i, state) in states.into_iter().enumerate() {
      let task = TaskRepository::add(
        &mut conn,
        &NewTask::new(
          format!("sync {i}"),
          TaskType::RepoSync,
          state,
        ),
      )
      .await
      .unwrap();
      bindings.push((bound.id, task.id));
    }
    PulpServerRepoTaskRepository::bulk_add(&mut conn, &bindings)
      .await
      .unwrap();

    let details = PulpServerRepoRepository::for_server(
      &mut conn,
      syncher.pulp_server.id,
    )
    .await
    .unwrap();
    drop(conn);

    syncher.calculate_repo_health(&details).await;
    syncher.calculate_health_rollup().await;

    let mut conn = db.conn().await.unwrap();
    let updated =
      PulpServerRepoRepository::get_by_id(&mut conn, bound.id)
        .await
        .unwrap()
        .unwrap();
    // Newest run completed, so the repo is green.
    assert_eq!(
      updated.repo_sync_health,
      Some(RepoHealthStatus::Green)
    );
    assert!(updated.repo_sync_health_date.is_some());

    let server = PulpServerRepository::get_by_id(
      &mut conn,
      syncher.pulp_server.id,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
      server.repo_sync_health_rollup,
      Some(RepoHealthStatus::Green)
    );
  }
}
