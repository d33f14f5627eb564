use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;

/// State of a locally tracked unit of work. Stored as an integer;
/// accepted by name at the filter boundary.
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  sqlx::Type,
  strum::Display,
  strum::EnumString,
)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
  Queued = 1,
  Running = 2,
  Completed = 3,
  Failed = 4,
  Canceled = 5,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskState::Completed | TaskState::Failed | TaskState::Canceled
    )
  }
}

#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  sqlx::Type,
  strum::Display,
  strum::EnumString,
)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
  RepoGroupSync = 1,
  RemoveRepoContent = 2,
  RepoSnapshot = 3,
  RepoRemoval = 4,
  RepoCreationFromGit = 5,
  RepoSync = 6,
}

/// Rolling sync health. Ordering matters: rollup takes the max.
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  sqlx::Type,
  strum::Display,
  strum::EnumString,
)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RepoHealthStatus {
  Green = 1,
  Amber = 2,
  Red = 3,
}

#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  sqlx::Type,
  strum::Display,
  strum::EnumString,
)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RepoType {
  Rpm = 1,
  Deb = 2,
  #[strum(serialize = "file", serialize = "iso")]
  File = 3,
  Python = 4,
  Container = 5,
}

pub const SUPPORTED_REPO_TYPES: [RepoType; 5] = [
  RepoType::Rpm,
  RepoType::Deb,
  RepoType::File,
  RepoType::Python,
  RepoType::Container,
];

/// A managed pulp server (content server), addressed by FQDN.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct PulpServer {
  pub id: i64,
  pub name: String,
  pub username: Option<String>,
  pub vault_service_account_mount: Option<String>,
  pub page_size: i64,
  pub repo_config_registration_schedule: Option<String>,
  pub repo_config_registration_regex_include: Option<String>,
  pub repo_config_registration_regex_exclude: Option<String>,
  pub repo_config_registration_max_runtime: Option<i64>,
  pub repo_sync_health_rollup: Option<RepoHealthStatus>,
  pub repo_sync_health_rollup_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewPulpServer {
  pub name: String,
  pub username: Option<String>,
  pub vault_service_account_mount: Option<String>,
  pub page_size: i64,
  pub repo_config_registration_schedule: Option<String>,
  pub repo_config_registration_regex_include: Option<String>,
  pub repo_config_registration_regex_exclude: Option<String>,
  pub repo_config_registration_max_runtime: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct PulpServerPatch {
  pub repo_sync_health_rollup: Option<RepoHealthStatus>,
  pub repo_sync_health_rollup_date: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct Repo {
  pub id: i64,
  pub name: String,
  pub repo_type: RepoType,
}

#[derive(Debug, Clone)]
pub struct NewRepo {
  pub name: String,
  pub repo_type: RepoType,
}

/// Binding of a [Repo] to a [PulpServer], carrying the pulp hrefs.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct PulpServerRepo {
  pub id: i64,
  pub pulp_server_id: i64,
  pub repo_id: i64,
  pub repo_href: Option<String>,
  pub remote_href: Option<String>,
  pub remote_feed: Option<String>,
  pub distribution_href: Option<String>,
  pub repo_sync_health: Option<RepoHealthStatus>,
  pub repo_sync_health_date: Option<DateTime<Utc>>,
}

/// [PulpServerRepo] joined with its repo name/type, for selection and
/// regex filtering without a second round trip.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct PulpServerRepoDetail {
  pub id: i64,
  pub pulp_server_id: i64,
  pub repo_id: i64,
  pub repo_href: Option<String>,
  pub remote_href: Option<String>,
  pub remote_feed: Option<String>,
  pub distribution_href: Option<String>,
  pub repo_sync_health: Option<RepoHealthStatus>,
  pub repo_sync_health_date: Option<DateTime<Utc>>,
  pub repo_name: String,
  pub repo_type: RepoType,
}

#[derive(Debug, Clone, Default)]
pub struct NewPulpServerRepo {
  pub pulp_server_id: i64,
  pub repo_id: i64,
  pub repo_href: Option<String>,
  pub remote_href: Option<String>,
  pub remote_feed: Option<String>,
  pub distribution_href: Option<String>,
}

/// Field-level patch: `Some(None)` clears a nullable column,
/// `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct PulpServerRepoPatch {
  pub repo_href: Option<Option<String>>,
  pub remote_href: Option<Option<String>>,
  pub remote_feed: Option<Option<String>>,
  pub distribution_href: Option<Option<String>>,
  pub repo_sync_health: Option<RepoHealthStatus>,
  pub repo_sync_health_date: Option<DateTime<Utc>>,
}

impl PulpServerRepoPatch {
  pub fn is_empty(&self) -> bool {
    self.repo_href.is_none()
      && self.remote_href.is_none()
      && self.remote_feed.is_none()
      && self.distribution_href.is_none()
      && self.repo_sync_health.is_none()
      && self.repo_sync_health_date.is_none()
  }
}

/// Scheduled sync group configuration. Not mutated by the core.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct PulpServerRepoGroup {
  pub id: i64,
  pub pulp_server_id: i64,
  pub name: String,
  pub schedule: Option<String>,
  pub max_concurrent_syncs: i64,
  pub max_runtime: i64,
  pub regex_include: Option<String>,
  pub regex_exclude: Option<String>,
  pub pulp_master_id: Option<i64>,
  pub sync_options: Option<Json<Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewPulpServerRepoGroup {
  pub pulp_server_id: i64,
  pub name: String,
  pub schedule: Option<String>,
  pub max_concurrent_syncs: i64,
  pub max_runtime: i64,
  pub regex_include: Option<String>,
  pub regex_exclude: Option<String>,
  pub pulp_master_id: Option<i64>,
  pub sync_options: Option<Value>,
}

/// Durable record of a unit of tracked work.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct Task {
  pub id: i64,
  pub name: String,
  pub task_type: TaskType,
  pub state: TaskState,
  pub parent_task_id: Option<i64>,
  pub worker_job_id: Option<String>,
  pub worker_name: Option<String>,
  pub date_created: DateTime<Utc>,
  pub date_queued: Option<DateTime<Utc>>,
  pub date_started: Option<DateTime<Utc>>,
  pub date_finished: Option<DateTime<Utc>>,
  pub task_args: Option<Json<Value>>,
  pub error: Option<Json<Value>>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
  pub name: String,
  pub task_type: TaskType,
  pub state: TaskState,
  pub parent_task_id: Option<i64>,
  pub worker_job_id: Option<String>,
  pub worker_name: Option<String>,
  pub date_queued: Option<DateTime<Utc>>,
  pub date_started: Option<DateTime<Utc>>,
  pub task_args: Option<Value>,
}

impl NewTask {
  pub fn new(
    name: impl Into<String>,
    task_type: TaskType,
    state: TaskState,
  ) -> Self {
    Self {
      name: name.into(),
      task_type,
      state,
      parent_task_id: None,
      worker_job_id: None,
      worker_name: None,
      date_queued: None,
      date_started: None,
      task_args: None,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
  pub state: Option<TaskState>,
  pub worker_job_id: Option<String>,
  pub worker_name: Option<String>,
  pub date_started: Option<DateTime<Utc>>,
  pub date_finished: Option<DateTime<Utc>>,
  pub error: Option<Value>,
}

/// Serialized error attached to failed tasks and stages.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskError {
  pub msg: String,
  pub detail: String,
}

impl TaskError {
  /// The JSON shape stored on the task row.
  pub fn value(
    msg: impl Into<String>,
    detail: impl Into<String>,
  ) -> Value {
    serde_json::json!({
      "msg": msg.into(),
      "detail": detail.into(),
    })
  }
}

/// A step of a multi-stage task. The driver appends stages; the
/// current stage's detail holds the outstanding pulp task href.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct TaskStage {
  pub id: i64,
  pub task_id: i64,
  pub name: String,
  pub detail: Option<Json<Value>>,
  pub error: Option<Json<Value>>,
  pub date_created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTaskStage {
  pub task_id: i64,
  pub name: String,
  pub detail: Option<Value>,
}

/// Binding row between a [PulpServerRepo] and a sync [Task];
/// the per-repo health window is computed over these.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct PulpServerRepoTask {
  pub id: i64,
  pub pulp_server_repo_id: i64,
  pub task_id: i64,
  pub date_created: DateTime<Utc>,
}
