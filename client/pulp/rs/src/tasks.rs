use std::time::Instant;

use crate::{Pulp3Client, PulpError, PulpTask, PulpTaskState};

pub async fn get_task(
  client: &Pulp3Client,
  href: &str,
) -> Result<PulpTask, PulpError> {
  client.get(href, &[]).await
}

/// Polls a pulp task until it reaches a terminal state. Completed
/// tasks are returned; failed and canceled tasks are an error, as is
/// exceeding the client's configured maximum wait.
pub async fn monitor_task(
  client: &Pulp3Client,
  href: &str,
) -> Result<PulpTask, PulpError> {
  let started = Instant::now();
  loop {
    let task = get_task(client, href).await?;
    match task.state {
      PulpTaskState::Completed => return Ok(task),
      PulpTaskState::Failed | PulpTaskState::Canceled => {
        return Err(PulpError::TaskFailed {
          href: href.to_string(),
          state: task.state,
        });
      }
      PulpTaskState::Waiting | PulpTaskState::Running => {}
    }
    if started.elapsed() > client.max_wait {
      return Err(PulpError::TaskTimeout(href.to_string()));
    }
    tokio::time::sleep(client.poll_interval).await;
  }
}
