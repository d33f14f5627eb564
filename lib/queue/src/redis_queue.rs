use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use uuid::Uuid;

use crate::{
  Job, JobQueue, JobSpec, JobStatus, QueueError, ScheduleEntry,
  next_occurrence,
};

const KEY_PREFIX: &str = "pulp-manager";

/// Redis layout: one JSON value per job under `job:{id}`, pending
/// job ids on the `queue:default` list, schedule entries in the
/// `schedules` hash with their next-run epoch mirrored in the
/// `scheduler` sorted set, stop signals on the `stop` channel.
#[derive(Clone)]
pub struct RedisQueue {
  client: Client,
  conn: ConnectionManager,
}

impl RedisQueue {
  pub async fn connect(url: &str) -> Result<Self, QueueError> {
    let client = Client::open(url)?;
    let conn = client.get_connection_manager().await?;
    Ok(Self { client, conn })
  }

  fn job_key(id: &str) -> String {
    format!("{KEY_PREFIX}:job:{id}")
  }

  fn pending_key() -> String {
    format!("{KEY_PREFIX}:queue:default")
  }

  fn schedules_key() -> String {
    format!("{KEY_PREFIX}:schedules")
  }

  fn scheduler_key() -> String {
    format!("{KEY_PREFIX}:scheduler")
  }

  pub fn stop_channel() -> String {
    format!("{KEY_PREFIX}:stop")
  }

  async fn save_job(&self, job: &Job) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let key = Self::job_key(&job.id);
    let payload = serde_json::to_string(job)?;
    let _: () = conn.set(&key, payload).await?;
    if job.status.is_terminal() && job.spec.result_ttl > 0 {
      let _: () =
        conn.expire(&key, job.spec.result_ttl).await?;
    }
    Ok(())
  }

  async fn load_job(
    &self,
    id: &str,
  ) -> Result<Option<Job>, QueueError> {
    let mut conn = self.conn.clone();
    let payload: Option<String> =
      conn.get(Self::job_key(id)).await?;
    match payload {
      Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
      None => Ok(None),
    }
  }

  /// Blocks up to `timeout` seconds for the next pending job and
  /// marks it started. Returns `None` on timeout or when the job
  /// record expired / was canceled under us.
  pub async fn pop_job(
    &self,
    timeout: f64,
  ) -> Result<Option<Job>, QueueError> {
    let mut conn = self.conn.clone();
    let popped: Option<(String, String)> =
      conn.brpop(Self::pending_key(), timeout).await?;
    let Some((_, id)) = popped else {
      return Ok(None);
    };
    let Some(mut job) = self.load_job(&id).await? else {
      return Ok(None);
    };
    if job.status != JobStatus::Queued {
      return Ok(None);
    }
    job.status = JobStatus::Started;
    job.started_at = Some(Utc::now());
    self.save_job(&job).await?;
    Ok(Some(job))
  }

  pub async fn finish_job(
    &self,
    id: &str,
  ) -> Result<(), QueueError> {
    let mut job = self
      .load_job(id)
      .await?
      .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
    job.status = JobStatus::Finished;
    job.ended_at = Some(Utc::now());
    self.save_job(&job).await
  }

  pub async fn fail_job(
    &self,
    id: &str,
    exc_info: &str,
  ) -> Result<(), QueueError> {
    let mut job = self
      .load_job(id)
      .await?
      .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
    job.status = JobStatus::Failed;
    job.ended_at = Some(Utc::now());
    job.exc_info = Some(exc_info.to_string());
    self.save_job(&job).await
  }

  /// Schedule entries due at `now`, left installed; the scheduler
  /// loop enqueues them and calls [RedisQueue::reschedule].
  pub async fn due_schedules(
    &self,
    now: &DateTime<Utc>,
  ) -> Result<Vec<ScheduleEntry>, QueueError> {
    let mut conn = self.conn.clone();
    let ids: Vec<String> = conn
      .zrangebyscore(
        Self::scheduler_key(),
        f64::MIN,
        now.timestamp() as f64,
      )
      .await?;
    let mut due = Vec::with_capacity(ids.len());
    for id in ids {
      let payload: Option<String> =
        conn.hget(Self::schedules_key(), &id).await?;
      if let Some(payload) = payload {
        due.push(serde_json::from_str(&payload)?);
      }
    }
    Ok(due)
  }

  /// Advances an entry to its next occurrence.
  pub async fn reschedule(
    &self,
    entry: &ScheduleEntry,
  ) -> Result<ScheduleEntry, QueueError> {
    let mut next = entry.clone();
    next.next_run = next_occurrence(&entry.cron, &Utc::now())?;
    let mut conn = self.conn.clone();
    let payload = serde_json::to_string(&next)?;
    let _: () = conn
      .hset(Self::schedules_key(), &next.id, payload)
      .await?;
    let _: () = conn
      .zadd(
        Self::scheduler_key(),
        &next.id,
        next.next_run.timestamp() as f64,
      )
      .await?;
    Ok(next)
  }

  pub async fn subscribe_stops(
    &self,
  ) -> Result<redis::aio::PubSub, QueueError> {
    let mut pubsub = self.client.get_async_pubsub().await?;
    pubsub.subscribe(Self::stop_channel()).await?;
    Ok(pubsub)
  }
}

#[async_trait]
impl JobQueue for RedisQueue {
  async fn enqueue(&self, spec: JobSpec) -> Result<Job, QueueError> {
    let job = Job {
      id: Uuid::new_v4().to_string(),
      spec,
      status: JobStatus::Queued,
      enqueued_at: Utc::now(),
      started_at: None,
      ended_at: None,
      exc_info: None,
    };
    self.save_job(&job).await?;
    let mut conn = self.conn.clone();
    let _: () =
      conn.lpush(Self::pending_key(), &job.id).await?;
    Ok(job)
  }

  async fn job(
    &self,
    id: &str,
  ) -> Result<Option<Job>, QueueError> {
    self.load_job(id).await
  }

  async fn cancel_job(&self, id: &str) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let _: () =
      conn.lrem(Self::pending_key(), 0, id).await?;
    if let Some(mut job) = self.load_job(id).await? {
      if job.status == JobStatus::Queued {
        job.status = JobStatus::Canceled;
        job.ended_at = Some(Utc::now());
        self.save_job(&job).await?;
      }
    }
    Ok(())
  }

  async fn send_stop(&self, id: &str) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let _: () = conn.publish(Self::stop_channel(), id).await?;
    Ok(())
  }

  async fn schedules(
    &self,
  ) -> Result<Vec<ScheduleEntry>, QueueError> {
    let mut conn = self.conn.clone();
    let entries: std::collections::HashMap<String, String> =
      conn.hgetall(Self::schedules_key()).await?;
    entries
      .into_values()
      .map(|payload| {
        serde_json::from_str(&payload).map_err(QueueError::from)
      })
      .collect()
  }

  async fn remove_schedule(
    &self,
    id: &str,
  ) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let _: () = conn.hdel(Self::schedules_key(), id).await?;
    let _: () = conn.zrem(Self::scheduler_key(), id).await?;
    Ok(())
  }

  async fn add_schedule(
    &self,
    cron: &str,
    spec: JobSpec,
  ) -> Result<ScheduleEntry, QueueError> {
    let entry = ScheduleEntry {
      id: Uuid::new_v4().to_string(),
      cron: cron.to_string(),
      job: spec,
      next_run: next_occurrence(cron, &Utc::now())?,
    };
    let mut conn = self.conn.clone();
    let payload = serde_json::to_string(&entry)?;
    let _: () = conn
      .hset(Self::schedules_key(), &entry.id, payload)
      .await?;
    let _: () = conn
      .zadd(
        Self::scheduler_key(),
        &entry.id,
        entry.next_run.timestamp() as f64,
      )
      .await?;
    Ok(entry)
  }
}
