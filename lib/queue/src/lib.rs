use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod redis_queue;

pub use redis_queue::RedisQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error(transparent)]
  Redis(#[from] redis::RedisError),

  #[error("failed to (de)serialize queue payload: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("invalid cron expression {expression}: {error}")]
  Cron { expression: String, error: String },

  #[error("job {0} not found")]
  JobNotFound(String),
}

/// Lifecycle of a worker job, separate from the Task record it is
/// bound to.
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
  Queued,
  Started,
  Finished,
  Failed,
  Canceled,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
    )
  }
}

/// What to enqueue: a registered worker function by name, its
/// kwargs, and scheduler metadata (`job_type`, `pulp_server`, …)
/// used to find and replace installed entries.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobSpec {
  pub func: String,
  pub kwargs: Value,
  pub meta: Value,
  /// Hard runtime cap in seconds; `None` means unlimited.
  pub timeout: Option<i64>,
  /// How long the finished job record is retained, in seconds.
  pub result_ttl: i64,
}

impl JobSpec {
  pub fn meta_str(&self, key: &str) -> Option<&str> {
    self.meta.get(key).and_then(Value::as_str)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Job {
  pub id: String,
  #[serde(flatten)]
  pub spec: JobSpec,
  pub status: JobStatus,
  pub enqueued_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
  pub exc_info: Option<String>,
}

impl Job {
  pub fn task_id(&self) -> Option<i64> {
    self.spec.kwargs.get("task_id").and_then(Value::as_i64)
  }
}

/// An installed cron entry. `next_run` doubles as the schedule set
/// score; the scheduler loop enqueues due entries and advances it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleEntry {
  pub id: String,
  pub cron: String,
  pub job: JobSpec,
  pub next_run: DateTime<Utc>,
}

/// Next occurrence of a cron expression strictly after `after`.
pub fn next_occurrence(
  cron: &str,
  after: &DateTime<Utc>,
) -> Result<DateTime<Utc>, QueueError> {
  let parsed = cron.parse::<croner::Cron>().map_err(|e| {
    QueueError::Cron {
      expression: cron.to_string(),
      error: e.to_string(),
    }
  })?;
  parsed.find_next_occurrence(after, false).map_err(|e| {
    QueueError::Cron {
      expression: cron.to_string(),
      error: e.to_string(),
    }
  })
}

/// The queue surface the job manager depends on. The production
/// implementation is [RedisQueue]; tests swap in an in-memory fake.
#[async_trait]
pub trait JobQueue: Send + Sync {
  async fn enqueue(&self, spec: JobSpec) -> Result<Job, QueueError>;

  async fn job(&self, id: &str)
  -> Result<Option<Job>, QueueError>;

  /// Removes a not-yet-started job from the pending queue.
  async fn cancel_job(&self, id: &str) -> Result<(), QueueError>;

  /// Signals a started job's worker to stop.
  async fn send_stop(&self, id: &str) -> Result<(), QueueError>;

  async fn schedules(
    &self,
  ) -> Result<Vec<ScheduleEntry>, QueueError>;

  async fn remove_schedule(
    &self,
    id: &str,
  ) -> Result<(), QueueError>;

  async fn add_schedule(
    &self,
    cron: &str,
    spec: JobSpec,
  ) -> Result<ScheduleEntry, QueueError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn next_occurrence_advances_past_after() {
    let after = Utc.with_ymd_and_hms(2024, 3, 1, 2, 30, 0).unwrap();
    let next = next_occurrence("0 3 * * *", &after).unwrap();
    assert_eq!(
      next,
      Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap()
    );

    // Strictly after: an exact match moves to the next day.
    let next = next_occurrence("30 2 * * *", &after).unwrap();
    assert_eq!(
      next,
      Utc.with_ymd_and_hms(2024, 3, 2, 2, 30, 0).unwrap()
    );
  }

  #[test]
  fn invalid_cron_is_rejected() {
    let after = Utc::now();
    let err =
      next_occurrence("not a cron", &after).unwrap_err();
    assert!(matches!(err, QueueError::Cron { .. }));
  }

  #[test]
  fn job_task_id_reads_kwargs() {
    let job = Job {
      id: "abc".into(),
      spec: JobSpec {
        func: "sync_repos".into(),
        kwargs: serde_json::json!({"task_id": 42}),
        meta: serde_json::json!({}),
        timeout: Some(3600),
        result_ttl: 172800,
      },
      status: JobStatus::Queued,
      enqueued_at: Utc::now(),
      started_at: None,
      ended_at: None,
      exc_info: None,
    };
    assert_eq!(job.task_id(), Some(42));
  }
}
