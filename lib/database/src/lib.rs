mod entities;
mod error;
mod filter;
mod repos;
mod repository;

pub use entities::*;
pub use error::DatabaseError;
pub use filter::{
  Filter, FilterOp, FilterQuery, FilterValue, Sort, SortOrder,
};
pub use repos::*;
pub use repository::{Page, PageRequest, TableRepository, TableSpec};

use sqlx::{
  SqlitePool,
  pool::PoolConnection,
  sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};

const SCHEMA: &[&str] = &[
  "CREATE TABLE IF NOT EXISTS pulp_server (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    username TEXT,
    vault_service_account_mount TEXT,
    page_size INTEGER NOT NULL DEFAULT 100,
    repo_config_registration_schedule TEXT,
    repo_config_registration_regex_include TEXT,
    repo_config_registration_regex_exclude TEXT,
    repo_config_registration_max_runtime INTEGER,
    repo_sync_health_rollup INTEGER,
    repo_sync_health_rollup_date TEXT
  )",
  "CREATE TABLE IF NOT EXISTS repo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    repo_type INTEGER NOT NULL
  )",
  "CREATE TABLE IF NOT EXISTS pulp_server_repo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pulp_server_id INTEGER NOT NULL REFERENCES pulp_server(id),
    repo_id INTEGER NOT NULL REFERENCES repo(id),
    repo_href TEXT,
    remote_href TEXT,
    remote_feed TEXT,
    distribution_href TEXT,
    repo_sync_health INTEGER,
    repo_sync_health_date TEXT,
    UNIQUE (pulp_server_id, repo_id)
  )",
  "CREATE TABLE IF NOT EXISTS pulp_server_repo_group (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pulp_server_id INTEGER NOT NULL REFERENCES pulp_server(id),
    name TEXT NOT NULL,
    schedule TEXT,
    max_concurrent_syncs INTEGER NOT NULL DEFAULT 2,
    max_runtime INTEGER NOT NULL DEFAULT 21600,
    regex_include TEXT,
    regex_exclude TEXT,
    pulp_master_id INTEGER REFERENCES pulp_server(id),
    sync_options TEXT
  )",
  "CREATE TABLE IF NOT EXISTS task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    task_type INTEGER NOT NULL,
    state INTEGER NOT NULL,
    parent_task_id INTEGER REFERENCES task(id),
    worker_job_id TEXT,
    worker_name TEXT,
    date_created TEXT NOT NULL,
    date_queued TEXT,
    date_started TEXT,
    date_finished TEXT,
    task_args TEXT,
    error TEXT
  )",
  "CREATE INDEX IF NOT EXISTS idx_task_state ON task (state)",
  "CREATE INDEX IF NOT EXISTS idx_task_parent
    ON task (parent_task_id)",
  "CREATE TABLE IF NOT EXISTS task_stage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES task(id),
    name TEXT NOT NULL,
    detail TEXT,
    error TEXT,
    date_created TEXT NOT NULL
  )",
  "CREATE INDEX IF NOT EXISTS idx_task_stage_task
    ON task_stage (task_id)",
  "CREATE TABLE IF NOT EXISTS pulp_server_repo_task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pulp_server_repo_id INTEGER NOT NULL
      REFERENCES pulp_server_repo(id),
    task_id INTEGER NOT NULL REFERENCES task(id),
    date_created TEXT NOT NULL
  )",
  "CREATE INDEX IF NOT EXISTS idx_psrt_repo
    ON pulp_server_repo_task (pulp_server_repo_id, date_created)",
];

/// Pool + schema management. One clone per worker; connections are
/// checked out per unit of work and transactions are caller-owned.
#[derive(Clone)]
pub struct DbClient {
  pool: SqlitePool,
}

impl DbClient {
  pub async fn connect(
    path: &Path,
    max_connections: u32,
  ) -> Result<Self, DatabaseError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(max_connections)
      .connect_with(options)
      .await?;
    let client = Self { pool };
    client.migrate().await?;
    Ok(client)
  }

  /// In-memory database on a single connection, for tests.
  pub async fn connect_memory() -> Result<Self, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
      .map_err(sqlx::Error::from)?
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await?;
    let client = Self { pool };
    client.migrate().await?;
    Ok(client)
  }

  async fn migrate(&self) -> Result<(), DatabaseError> {
    let mut conn = self.pool.acquire().await?;
    for statement in SCHEMA {
      sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
  }

  pub async fn conn(
    &self,
  ) -> Result<PoolConnection<Sqlite>, DatabaseError> {
    Ok(self.pool.acquire().await?)
  }

  pub async fn begin(
    &self,
  ) -> Result<sqlx::Transaction<'static, Sqlite>, DatabaseError> {
    Ok(self.pool.begin().await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, Utc};

  async fn seed_server(
    conn: &mut sqlx::SqliteConnection,
  ) -> PulpServer {
    PulpServerRepository::add(
      conn,
      &NewPulpServer {
        name: "pulp01.domain.local".into(),
        username: Some("svc_pulp".into()),
        page_size: 100,
        ..Default::default()
      },
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn add_and_filter_tasks_by_enum_name() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();

    for (name, state) in [
      ("sync a", TaskState::Queued),
      ("sync b", TaskState::Failed),
      ("sync c", TaskState::Failed),
    ] {
      TaskRepository::add(
        &mut conn,
        &NewTask::new(name, TaskType::RepoSync, state),
      )
      .await
      .unwrap();
    }

    let rules = TaskSpec::rules();
    let query =
      FilterQuery::parse(&[("state", "failed")], &rules).unwrap();
    let failed =
      TaskRepository::filter(&mut conn, &query).await.unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|t| t.state == TaskState::Failed));
  }

  #[tokio::test]
  async fn paged_filter_orders_and_bounds() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();

    for i in 0..7 {
      TaskRepository::add(
        &mut conn,
        &NewTask::new(
          format!("task {i}"),
          TaskType::RepoSync,
          TaskState::Queued,
        ),
      )
      .await
      .unwrap();
    }

    let query = FilterQuery::new().order_by("id", SortOrder::Desc);
    let page = TaskRepository::filter_paged_result(
      &mut conn,
      &query,
      PageRequest::new(2, 3),
      50,
    )
    .await
    .unwrap();
    assert_eq!(page.total, 7);
    assert_eq!(page.items.len(), 3);
    assert!(page.items[0].id > page.items[1].id);

    let err = TaskRepository::filter_paged(
      &mut conn,
      &query,
      PageRequest::new(1, 100),
      50,
    )
    .await
    .unwrap_err();
    assert!(matches!(
      err,
      DatabaseError::PageSizeTooLarge {
        page_size: 100,
        max_page_size: 50
      }
    ));
  }

  #[tokio::test]
  async fn bulk_add_returns_rows_in_order() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();

    let rows = vec![
      NewTask::new("one", TaskType::RepoSync, TaskState::Queued),
      NewTask::new("two", TaskType::RepoSync, TaskState::Queued),
    ];
    let tasks =
      TaskRepository::bulk_add(&mut conn, &rows).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].name, "one");
    assert_eq!(tasks[1].name, "two");
    assert!(tasks[1].id > tasks[0].id);
  }

  #[tokio::test]
  async fn joined_filter_resolves_repo_name() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();

    let server = seed_server(&mut conn).await;
    let repo = RepoRepository::add(
      &mut conn,
      &NewRepo {
        name: "ext-epel9".into(),
        repo_type: RepoType::Rpm,
      },
    )
    .await
    .unwrap();
    PulpServerRepoRepository::add(
      &mut conn,
      &NewPulpServerRepo {
        pulp_server_id: server.id,
        repo_id: repo.id,
        repo_href: Some("/pulp/api/v3/repositories/rpm/rpm/1/".into()),
        remote_feed: Some("https://mirror.example.org/epel9".into()),
        ..Default::default()
      },
    )
    .await
    .unwrap();

    let rules = PulpServerRepoSpec::rules();
    let query =
      FilterQuery::parse(&[("repo_name", "ext-epel9")], &rules)
        .unwrap();
    let rows =
      PulpServerRepoRepository::filter_join(&mut conn, &query)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].repo_name, "ext-epel9");
    assert_eq!(rows[0].repo_type, RepoType::Rpm);

    // The same key on the direct variant must be rejected.
    let err = PulpServerRepoRepository::filter(&mut conn, &query)
      .await
      .unwrap_err();
    assert!(matches!(err, DatabaseError::Filter(_)));
  }

  #[tokio::test]
  async fn patch_update_only_touches_set_fields() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();

    let server = seed_server(&mut conn).await;
    let repo = RepoRepository::add(
      &mut conn,
      &NewRepo {
        name: "deb-repo".into(),
        repo_type: RepoType::Deb,
      },
    )
    .await
    .unwrap();
    let bound = PulpServerRepoRepository::add(
      &mut conn,
      &NewPulpServerRepo {
        pulp_server_id: server.id,
        repo_id: repo.id,
        repo_href: Some("/r/1".into()),
        remote_feed: Some("https://deb.example.org".into()),
        ..Default::default()
      },
    )
    .await
    .unwrap();

    PulpServerRepoRepository::update(
      &mut conn,
      bound.id,
      &PulpServerRepoPatch {
        distribution_href: Some(Some("/d/7".into())),
        ..Default::default()
      },
    )
    .await
    .unwrap();

    let updated =
      PulpServerRepoRepository::get_by_id(&mut conn, bound.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.distribution_href.as_deref(), Some("/d/7"));
    assert_eq!(updated.repo_href.as_deref(), Some("/r/1"));
    assert_eq!(
      updated.remote_feed.as_deref(),
      Some("https://deb.example.org")
    );
  }

  #[tokio::test]
  async fn recent_tasks_window_is_newest_first() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();

    let server = seed_server(&mut conn).await;
    let repo = RepoRepository::add(
      &mut conn,
      &NewRepo {
        name: "rpm-1".into(),
        repo_type: RepoType::Rpm,
      },
    )
    .await
    .unwrap();
    let bound = PulpServerRepoRepository::add(
      &mut conn,
      &NewPulpServerRepo {
        pulp_server_id: server.id,
        repo_id: repo.id,
        ..Default::default()
      },
    )
    .await
    .unwrap();

    // Six tasks bound over six days; only the five newest make the
    // window, newest first.
    let mut task_ids = Vec::new();
    for (i, state) in [
      TaskState::Completed,
      TaskState::Failed,
      TaskState::Failed,
      TaskState::Completed,
      TaskState::Failed,
      TaskState::Completed,
    ]
    .into_iter()
    .enumerate()
    {
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
      let created = Utc::now() - Duration::days(5 - i as i64);
      sqlx::query(
        "INSERT INTO pulp_server_repo_task (pulp_server_repo_id, \
         task_id, date_created) VALUES (?, ?, ?)",
      )
      .bind(bound.id)
      .bind(task.id)
      .bind(created)
      .execute(&mut *conn)
      .await
      .unwrap();
      task_ids.push(task.id);
    }

    let window = PulpServerRepoTaskRepository::recent_tasks(
      &mut conn, bound.id, 5,
    )
    .await
    .unwrap();
    assert_eq!(window.len(), 5);
    assert_eq!(window[0].id, task_ids[5]);
    assert_eq!(window[4].id, task_ids[1]);
  }

  #[tokio::test]
  async fn stage_append_and_current() {
    let db = DbClient::connect_memory().await.unwrap();
    let mut conn = db.conn().await.unwrap();

    let task = TaskRepository::add(
      &mut conn,
      &NewTask::new("sync", TaskType::RepoSync, TaskState::Running),
    )
    .await
    .unwrap();

    TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: task.id,
        name: "sync repo".into(),
        detail: Some(
          serde_json::json!({"task_href": "/pulp/api/v3/tasks/1/"}),
        ),
      },
    )
    .await
    .unwrap();
    TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: task.id,
        name: "publish repo".into(),
        detail: None,
      },
    )
    .await
    .unwrap();

    let current =
      TaskStageRepository::current_for_task(&mut conn, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.name, "publish repo");
  }
}
