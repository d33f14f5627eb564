use std::str::FromStr;

use chrono::Utc;
use serde_json::Value;
use sqlx::{
  QueryBuilder, Sqlite, SqliteConnection, types::Json,
};

use crate::{
  entities::*,
  error::DatabaseError,
  filter::{FilterQuery, SortOrder},
  repository::{TableRepository, TableSpec},
};

fn enum_value<E>(value: &str) -> Result<i64, DatabaseError>
where
  E: FromStr + Into<i64>,
{
  E::from_str(value)
    .map(Into::into)
    .map_err(|_| {
      DatabaseError::Filter(format!("unknown enum value {value}"))
    })
}

impl From<TaskState> for i64 {
  fn from(value: TaskState) -> Self {
    value as i64
  }
}

impl From<TaskType> for i64 {
  fn from(value: TaskType) -> Self {
    value as i64
  }
}

impl From<RepoHealthStatus> for i64 {
  fn from(value: RepoHealthStatus) -> Self {
    value as i64
  }
}

impl From<RepoType> for i64 {
  fn from(value: RepoType) -> Self {
    value as i64
  }
}

// =============
//  PULP SERVER
// =============

pub struct PulpServerSpec;

impl TableSpec for PulpServerSpec {
  type Entity = PulpServer;
  type Joined = PulpServer;
  const TABLE: &'static str = "pulp_server";
  const COLUMNS: &'static [&'static str] = &[
    "id",
    "name",
    "username",
    "page_size",
    "repo_config_registration_schedule",
    "repo_config_registration_regex_include",
    "repo_config_registration_regex_exclude",
    "repo_sync_health_rollup",
    "repo_sync_health_rollup_date",
  ];

  fn translate_enum(
    field: &str,
    value: &str,
  ) -> Result<Option<i64>, DatabaseError> {
    if field == "repo_sync_health_rollup" {
      return enum_value::<RepoHealthStatus>(value).map(Some);
    }
    Ok(None)
  }
}

pub type PulpServerRepository = TableRepository<PulpServerSpec>;

impl PulpServerRepository {
  pub async fn get_by_name(
    conn: &mut SqliteConnection,
    name: &str,
  ) -> Result<Option<PulpServer>, DatabaseError> {
    Self::first(conn, &FilterQuery::new().eq("name", name)).await
  }

  pub async fn add(
    conn: &mut SqliteConnection,
    new: &NewPulpServer,
  ) -> Result<PulpServer, DatabaseError> {
    let server = sqlx::query_as::<_, PulpServer>(
      "INSERT INTO pulp_server (name, username, \
       vault_service_account_mount, page_size, \
       repo_config_registration_schedule, \
       repo_config_registration_regex_include, \
       repo_config_registration_regex_exclude, \
       repo_config_registration_max_runtime) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.username)
    .bind(&new.vault_service_account_mount)
    .bind(if new.page_size > 0 { new.page_size } else { 100 })
    .bind(&new.repo_config_registration_schedule)
    .bind(&new.repo_config_registration_regex_include)
    .bind(&new.repo_config_registration_regex_exclude)
    .bind(new.repo_config_registration_max_runtime)
    .fetch_one(&mut *conn)
    .await?;
    Ok(server)
  }

  pub async fn update(
    conn: &mut SqliteConnection,
    id: i64,
    patch: &PulpServerPatch,
  ) -> Result<(), DatabaseError> {
    let mut qb =
      QueryBuilder::<Sqlite>::new("UPDATE pulp_server SET ");
    let mut fields = qb.separated(", ");
    let mut any = false;
    if let Some(rollup) = patch.repo_sync_health_rollup {
      fields.push("repo_sync_health_rollup = ");
      fields.push_bind_unseparated(rollup);
      any = true;
    }
    if let Some(date) = patch.repo_sync_health_rollup_date {
      fields.push("repo_sync_health_rollup_date = ");
      fields.push_bind_unseparated(date);
      any = true;
    }
    if !any {
      return Ok(());
    }
    qb.push(" WHERE id = ");
    qb.push_bind(id);
    qb.build().execute(&mut *conn).await?;
    Ok(())
  }
}

// ======
//  REPO
// ======

pub struct RepoSpec;

impl TableSpec for RepoSpec {
  type Entity = Repo;
  type Joined = Repo;
  const TABLE: &'static str = "repo";
  const COLUMNS: &'static [&'static str] =
    &["id", "name", "repo_type"];

  fn translate_enum(
    field: &str,
    value: &str,
  ) -> Result<Option<i64>, DatabaseError> {
    if field == "repo_type" {
      return enum_value::<RepoType>(value).map(Some);
    }
    Ok(None)
  }
}

pub type RepoRepository = TableRepository<RepoSpec>;

impl RepoRepository {
  pub async fn add(
    conn: &mut SqliteConnection,
    new: &NewRepo,
  ) -> Result<Repo, DatabaseError> {
    let repo = sqlx::query_as::<_, Repo>(
      "INSERT INTO repo (name, repo_type) VALUES (?, ?) \
       RETURNING *",
    )
    .bind(&new.name)
    .bind(new.repo_type)
    .fetch_one(&mut *conn)
    .await?;
    Ok(repo)
  }

  pub async fn bulk_add(
    conn: &mut SqliteConnection,
    rows: &[NewRepo],
  ) -> Result<Vec<Repo>, DatabaseError> {
    if rows.is_empty() {
      return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
      "INSERT INTO repo (name, repo_type) ",
    );
    qb.push_values(rows, |mut b, row| {
      b.push_bind(row.name.clone());
      b.push_bind(row.repo_type);
    });
    qb.push(" RETURNING *");
    Ok(
      qb.build_query_as::<Repo>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }
}

// ==================
//  PULP SERVER REPO
// ==================

pub struct PulpServerRepoSpec;

const PULP_SERVER_REPO_JOIN: &str =
  "SELECT pulp_server_repo.*, repo.name AS repo_name, \
   repo.repo_type AS repo_type FROM pulp_server_repo \
   JOIN repo ON repo.id = pulp_server_repo.repo_id \
   JOIN pulp_server ON pulp_server.id = \
   pulp_server_repo.pulp_server_id";

const PULP_SERVER_REPO_JOIN_COUNT: &str =
  "SELECT COUNT(*) FROM pulp_server_repo \
   JOIN repo ON repo.id = pulp_server_repo.repo_id \
   JOIN pulp_server ON pulp_server.id = \
   pulp_server_repo.pulp_server_id";

impl TableSpec for PulpServerRepoSpec {
  type Entity = PulpServerRepo;
  type Joined = PulpServerRepoDetail;
  const TABLE: &'static str = "pulp_server_repo";
  const COLUMNS: &'static [&'static str] = &[
    "id",
    "pulp_server_id",
    "repo_id",
    "repo_href",
    "remote_href",
    "remote_feed",
    "distribution_href",
    "repo_sync_health",
    "repo_sync_health_date",
  ];
  const REMOTE_COLUMNS: &'static [(&'static str, &'static str)] = &[
    ("repo_name", "repo.name"),
    ("repo_type", "repo.repo_type"),
    ("pulp_server_name", "pulp_server.name"),
  ];

  fn join_base() -> Option<&'static str> {
    Some(PULP_SERVER_REPO_JOIN)
  }

  fn join_base_count() -> Option<&'static str> {
    Some(PULP_SERVER_REPO_JOIN_COUNT)
  }

  fn translate_enum(
    field: &str,
    value: &str,
  ) -> Result<Option<i64>, DatabaseError> {
    match field {
      "repo_sync_health" => {
        enum_value::<RepoHealthStatus>(value).map(Some)
      }
      "repo_type" => enum_value::<RepoType>(value).map(Some),
      _ => Ok(None),
    }
  }
}

pub type PulpServerRepoRepository =
  TableRepository<PulpServerRepoSpec>;

impl PulpServerRepoRepository {
  /// All bindings of a server, joined with repo name/type.
  pub async fn for_server(
    conn: &mut SqliteConnection,
    pulp_server_id: i64,
  ) -> Result<Vec<PulpServerRepoDetail>, DatabaseError> {
    Self::filter_join(
      conn,
      &FilterQuery::new()
        .eq("pulp_server_id", pulp_server_id)
        .order_by("repo_name", SortOrder::Asc),
    )
    .await
  }

  pub async fn add(
    conn: &mut SqliteConnection,
    new: &NewPulpServerRepo,
  ) -> Result<PulpServerRepo, DatabaseError> {
    let row = sqlx::query_as::<_, PulpServerRepo>(
      "INSERT INTO pulp_server_repo (pulp_server_id, repo_id, \
       repo_href, remote_href, remote_feed, distribution_href) \
       VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(new.pulp_server_id)
    .bind(new.repo_id)
    .bind(&new.repo_href)
    .bind(&new.remote_href)
    .bind(&new.remote_feed)
    .bind(&new.distribution_href)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
  }

  pub async fn bulk_add(
    conn: &mut SqliteConnection,
    rows: &[NewPulpServerRepo],
  ) -> Result<Vec<PulpServerRepo>, DatabaseError> {
    if rows.is_empty() {
      return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
      "INSERT INTO pulp_server_repo (pulp_server_id, repo_id, \
       repo_href, remote_href, remote_feed, distribution_href) ",
    );
    qb.push_values(rows, |mut b, row| {
      b.push_bind(row.pulp_server_id);
      b.push_bind(row.repo_id);
      b.push_bind(row.repo_href.clone());
      b.push_bind(row.remote_href.clone());
      b.push_bind(row.remote_feed.clone());
      b.push_bind(row.distribution_href.clone());
    });
    qb.push(" RETURNING *");
    Ok(
      qb.build_query_as::<PulpServerRepo>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }

  pub async fn update(
    conn: &mut SqliteConnection,
    id: i64,
    patch: &PulpServerRepoPatch,
  ) -> Result<(), DatabaseError> {
    if patch.is_empty() {
      return Ok(());
    }
    let mut qb =
      QueryBuilder::<Sqlite>::new("UPDATE pulp_server_repo SET ");
    let mut fields = qb.separated(", ");
    if let Some(value) = &patch.repo_href {
      fields.push("repo_href = ");
      fields.push_bind_unseparated(value.clone());
    }
    if let Some(value) = &patch.remote_href {
      fields.push("remote_href = ");
      fields.push_bind_unseparated(value.clone());
    }
    if let Some(value) = &patch.remote_feed {
      fields.push("remote_feed = ");
      fields.push_bind_unseparated(value.clone());
    }
    if let Some(value) = &patch.distribution_href {
      fields.push("distribution_href = ");
      fields.push_bind_unseparated(value.clone());
    }
    if let Some(health) = patch.repo_sync_health {
      fields.push("repo_sync_health = ");
      fields.push_bind_unseparated(health);
    }
    if let Some(date) = patch.repo_sync_health_date {
      fields.push("repo_sync_health_date = ");
      fields.push_bind_unseparated(date);
    }
    qb.push(" WHERE id = ");
    qb.push_bind(id);
    qb.build().execute(&mut *conn).await?;
    Ok(())
  }

  pub async fn bulk_update(
    conn: &mut SqliteConnection,
    updates: &[(i64, PulpServerRepoPatch)],
  ) -> Result<(), DatabaseError> {
    for (id, patch) in updates {
      Self::update(conn, *id, patch).await?;
    }
    Ok(())
  }
}

// ========================
//  PULP SERVER REPO GROUP
// ========================

pub struct PulpServerRepoGroupSpec;

impl TableSpec for PulpServerRepoGroupSpec {
  type Entity = PulpServerRepoGroup;
  type Joined = PulpServerRepoGroup;
  const TABLE: &'static str = "pulp_server_repo_group";
  const COLUMNS: &'static [&'static str] = &[
    "id",
    "pulp_server_id",
    "name",
    "schedule",
    "max_concurrent_syncs",
    "max_runtime",
    "regex_include",
    "regex_exclude",
    "pulp_master_id",
  ];
}

pub type PulpServerRepoGroupRepository =
  TableRepository<PulpServerRepoGroupSpec>;

impl PulpServerRepoGroupRepository {
  pub async fn for_server(
    conn: &mut SqliteConnection,
    pulp_server_id: i64,
  ) -> Result<Vec<PulpServerRepoGroup>, DatabaseError> {
    Self::filter(
      conn,
      &FilterQuery::new().eq("pulp_server_id", pulp_server_id),
    )
    .await
  }

  pub async fn add(
    conn: &mut SqliteConnection,
    new: &NewPulpServerRepoGroup,
  ) -> Result<PulpServerRepoGroup, DatabaseError> {
    let group = sqlx::query_as::<_, PulpServerRepoGroup>(
      "INSERT INTO pulp_server_repo_group (pulp_server_id, name, \
       schedule, max_concurrent_syncs, max_runtime, regex_include, \
       regex_exclude, pulp_master_id, sync_options) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(new.pulp_server_id)
    .bind(&new.name)
    .bind(&new.schedule)
    .bind(new.max_concurrent_syncs)
    .bind(new.max_runtime)
    .bind(&new.regex_include)
    .bind(&new.regex_exclude)
    .bind(new.pulp_master_id)
    .bind(new.sync_options.clone().map(Json))
    .fetch_one(&mut *conn)
    .await?;
    Ok(group)
  }
}

// ======
//  TASK
// ======

pub struct TaskSpec;

const TASK_JOIN: &str =
  "SELECT task.* FROM task \
   LEFT JOIN pulp_server_repo_task ON \
   pulp_server_repo_task.task_id = task.id \
   LEFT JOIN pulp_server_repo ON pulp_server_repo.id = \
   pulp_server_repo_task.pulp_server_repo_id \
   LEFT JOIN repo ON repo.id = pulp_server_repo.repo_id \
   LEFT JOIN pulp_server ON pulp_server.id = \
   pulp_server_repo.pulp_server_id";

const TASK_JOIN_COUNT: &str =
  "SELECT COUNT(*) FROM task \
   LEFT JOIN pulp_server_repo_task ON \
   pulp_server_repo_task.task_id = task.id \
   LEFT JOIN pulp_server_repo ON pulp_server_repo.id = \
   pulp_server_repo_task.pulp_server_repo_id \
   LEFT JOIN repo ON repo.id = pulp_server_repo.repo_id \
   LEFT JOIN pulp_server ON pulp_server.id = \
   pulp_server_repo.pulp_server_id";

impl TableSpec for TaskSpec {
  type Entity = Task;
  type Joined = Task;
  const TABLE: &'static str = "task";
  const COLUMNS: &'static [&'static str] = &[
    "id",
    "name",
    "task_type",
    "state",
    "parent_task_id",
    "worker_job_id",
    "worker_name",
    "date_created",
    "date_queued",
    "date_started",
    "date_finished",
  ];
  const REMOTE_COLUMNS: &'static [(&'static str, &'static str)] = &[
    ("repo_name", "repo.name"),
    ("pulp_server_name", "pulp_server.name"),
  ];

  fn join_base() -> Option<&'static str> {
    Some(TASK_JOIN)
  }

  fn join_base_count() -> Option<&'static str> {
    Some(TASK_JOIN_COUNT)
  }

  fn translate_enum(
    field: &str,
    value: &str,
  ) -> Result<Option<i64>, DatabaseError> {
    match field {
      "state" => enum_value::<TaskState>(value).map(Some),
      "task_type" => enum_value::<TaskType>(value).map(Some),
      _ => Ok(None),
    }
  }
}

pub type TaskRepository = TableRepository<TaskSpec>;

impl TaskRepository {
  pub async fn add(
    conn: &mut SqliteConnection,
    new: &NewTask,
  ) -> Result<Task, DatabaseError> {
    let task = sqlx::query_as::<_, Task>(
      "INSERT INTO task (name, task_type, state, parent_task_id, \
       worker_job_id, worker_name, date_created, date_queued, \
       date_started, task_args) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(&new.name)
    .bind(new.task_type)
    .bind(new.state)
    .bind(new.parent_task_id)
    .bind(&new.worker_job_id)
    .bind(&new.worker_name)
    .bind(Utc::now())
    .bind(new.date_queued)
    .bind(new.date_started)
    .bind(new.task_args.clone().map(Json))
    .fetch_one(&mut *conn)
    .await?;
    Ok(task)
  }

  pub async fn bulk_add(
    conn: &mut SqliteConnection,
    rows: &[NewTask],
  ) -> Result<Vec<Task>, DatabaseError> {
    if rows.is_empty() {
      return Ok(Vec::new());
    }
    let now = Utc::now();
    let mut qb = QueryBuilder::<Sqlite>::new(
      "INSERT INTO task (name, task_type, state, parent_task_id, \
       worker_job_id, worker_name, date_created, date_queued, \
       date_started, task_args) ",
    );
    qb.push_values(rows, |mut b, row| {
      b.push_bind(row.name.clone());
      b.push_bind(row.task_type);
      b.push_bind(row.state);
      b.push_bind(row.parent_task_id);
      b.push_bind(row.worker_job_id.clone());
      b.push_bind(row.worker_name.clone());
      b.push_bind(now);
      b.push_bind(row.date_queued);
      b.push_bind(row.date_started);
      b.push_bind(row.task_args.clone().map(Json));
    });
    qb.push(" RETURNING *");
    Ok(
      qb.build_query_as::<Task>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }

  pub async fn update(
    conn: &mut SqliteConnection,
    id: i64,
    patch: &TaskPatch,
  ) -> Result<(), DatabaseError> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE task SET ");
    let mut fields = qb.separated(", ");
    let mut any = false;
    if let Some(state) = patch.state {
      fields.push("state = ");
      fields.push_bind_unseparated(state);
      any = true;
    }
    if let Some(job_id) = &patch.worker_job_id {
      fields.push("worker_job_id = ");
      fields.push_bind_unseparated(job_id.clone());
      any = true;
    }
    if let Some(worker) = &patch.worker_name {
      fields.push("worker_name = ");
      fields.push_bind_unseparated(worker.clone());
      any = true;
    }
    if let Some(date) = patch.date_started {
      fields.push("date_started = ");
      fields.push_bind_unseparated(date);
      any = true;
    }
    if let Some(date) = patch.date_finished {
      fields.push("date_finished = ");
      fields.push_bind_unseparated(date);
      any = true;
    }
    if let Some(error) = &patch.error {
      fields.push("error = ");
      fields.push_bind_unseparated(Json(error.clone()));
      any = true;
    }
    if !any {
      return Ok(());
    }
    qb.push(" WHERE id = ");
    qb.push_bind(id);
    qb.build().execute(&mut *conn).await?;
    Ok(())
  }

  pub async fn bulk_update(
    conn: &mut SqliteConnection,
    updates: &[(i64, TaskPatch)],
  ) -> Result<(), DatabaseError> {
    for (id, patch) in updates {
      Self::update(conn, *id, patch).await?;
    }
    Ok(())
  }
}

// ============
//  TASK STAGE
// ============

pub struct TaskStageSpec;

impl TableSpec for TaskStageSpec {
  type Entity = TaskStage;
  type Joined = TaskStage;
  const TABLE: &'static str = "task_stage";
  const COLUMNS: &'static [&'static str] =
    &["id", "task_id", "name", "date_created"];
}

pub type TaskStageRepository = TableRepository<TaskStageSpec>;

impl TaskStageRepository {
  pub async fn add(
    conn: &mut SqliteConnection,
    new: &NewTaskStage,
  ) -> Result<TaskStage, DatabaseError> {
    let stage = sqlx::query_as::<_, TaskStage>(
      "INSERT INTO task_stage (task_id, name, detail, \
       date_created) VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.name)
    .bind(new.detail.clone().map(Json))
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;
    Ok(stage)
  }

  /// The stage the driver is currently progressing: the latest
  /// appended stage of the task.
  pub async fn current_for_task(
    conn: &mut SqliteConnection,
    task_id: i64,
  ) -> Result<Option<TaskStage>, DatabaseError> {
    Self::first(
      conn,
      &FilterQuery::new()
        .eq("task_id", task_id)
        .order_by("id", SortOrder::Desc),
    )
    .await
  }

  pub async fn update_detail(
    conn: &mut SqliteConnection,
    id: i64,
    detail: &Value,
  ) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE task_stage SET detail = ? WHERE id = ?")
      .bind(Json(detail.clone()))
      .bind(id)
      .execute(&mut *conn)
      .await?;
    Ok(())
  }

  pub async fn set_error(
    conn: &mut SqliteConnection,
    id: i64,
    error: &Value,
  ) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE task_stage SET error = ? WHERE id = ?")
      .bind(Json(error.clone()))
      .bind(id)
      .execute(&mut *conn)
      .await?;
    Ok(())
  }
}

// =======================
//  PULP SERVER REPO TASK
// =======================

pub struct PulpServerRepoTaskSpec;

impl TableSpec for PulpServerRepoTaskSpec {
  type Entity = PulpServerRepoTask;
  type Joined = PulpServerRepoTask;
  const TABLE: &'static str = "pulp_server_repo_task";
  const COLUMNS: &'static [&'static str] =
    &["id", "pulp_server_repo_id", "task_id", "date_created"];
}

pub type PulpServerRepoTaskRepository =
  TableRepository<PulpServerRepoTaskSpec>;

impl PulpServerRepoTaskRepository {
  pub async fn bulk_add(
    conn: &mut SqliteConnection,
    bindings: &[(i64, i64)],
  ) -> Result<Vec<PulpServerRepoTask>, DatabaseError> {
    if bindings.is_empty() {
      return Ok(Vec::new());
    }
    let now = Utc::now();
    let mut qb = QueryBuilder::<Sqlite>::new(
      "INSERT INTO pulp_server_repo_task (pulp_server_repo_id, \
       task_id, date_created) ",
    );
    qb.push_values(bindings, |mut b, (repo_id, task_id)| {
      b.push_bind(*repo_id);
      b.push_bind(*task_id);
      b.push_bind(now);
    });
    qb.push(" RETURNING *");
    Ok(
      qb.build_query_as::<PulpServerRepoTask>()
        .fetch_all(&mut *conn)
        .await?,
    )
  }

  /// The most recent tasks bound to a repo, newest binding first.
  /// Ties on the binding timestamp break on task id so the window
  /// is stable within a bulk insert.
  pub async fn recent_tasks(
    conn: &mut SqliteConnection,
    pulp_server_repo_id: i64,
    limit: i64,
  ) -> Result<Vec<Task>, DatabaseError> {
    let tasks = sqlx::query_as::<_, Task>(
      "SELECT task.* FROM task \
       JOIN pulp_server_repo_task ON \
       pulp_server_repo_task.task_id = task.id \
       WHERE pulp_server_repo_task.pulp_server_repo_id = ? \
       ORDER BY pulp_server_repo_task.date_created DESC, \
       task.id DESC LIMIT ?",
    )
    .bind(pulp_server_repo_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(tasks)
  }
}
