use crate::{
  Pulp3Client, PulpError, PulpTask, Remote, RepoKind,
  SUPPORTED_REPO_KINDS, from_values, monitor_task,
};

fn list_path(kind: RepoKind) -> String {
  format!(
    "/pulp/api/v3/remotes/{}/{}/",
    kind.plugin(),
    kind.repo_segment()
  )
}

pub async fn get_all_remotes(
  client: &Pulp3Client,
  kind: Option<RepoKind>,
  params: &[(&str, String)],
) -> Result<Vec<Remote>, PulpError> {
  let kinds = match kind {
    Some(kind) => vec![kind],
    None => SUPPORTED_REPO_KINDS.to_vec(),
  };
  let mut remotes = Vec::new();
  for kind in kinds {
    let values =
      client.get_page_results(&list_path(kind), params).await?;
    remotes.append(&mut from_values(values)?);
  }
  Ok(remotes)
}

pub async fn get_remote(
  client: &Pulp3Client,
  href: &str,
) -> Result<Remote, PulpError> {
  client.get(href, &[]).await
}

/// Remote creation is synchronous on the server.
pub async fn new_remote(
  client: &Pulp3Client,
  kind: RepoKind,
  remote: &Remote,
) -> Result<Remote, PulpError> {
  client.post(&list_path(kind), remote).await
}

pub async fn update_remote_monitor(
  client: &Pulp3Client,
  remote: &Remote,
) -> Result<PulpTask, PulpError> {
  let href = remote.pulp_href.as_deref().ok_or_else(|| {
    PulpError::Api {
      status: 0,
      body: format!("remote {} has no pulp_href", remote.name),
    }
  })?;
  let task_href = client.patch_task(href, remote).await?;
  monitor_task(client, &task_href).await
}

pub async fn delete_remote_monitor(
  client: &Pulp3Client,
  href: &str,
) -> Result<PulpTask, PulpError> {
  let task_href = client.delete_task(href).await?;
  monitor_task(client, &task_href).await
}
