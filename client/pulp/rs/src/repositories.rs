use serde_json::{Map, Value, json};

use crate::{
  Pulp3Client, PulpError, PulpTask, RepoKind, Repository,
  SUPPORTED_REPO_KINDS, from_values, monitor_task,
};

fn list_path(kind: RepoKind) -> String {
  format!(
    "/pulp/api/v3/repositories/{}/{}/",
    kind.plugin(),
    kind.repo_segment()
  )
}

/// Lists repositories of one kind, or of every supported kind when
/// `kind` is `None`.
pub async fn get_all_repos(
  client: &Pulp3Client,
  kind: Option<RepoKind>,
  params: &[(&str, String)],
) -> Result<Vec<Repository>, PulpError> {
  let kinds = match kind {
    Some(kind) => vec![kind],
    None => SUPPORTED_REPO_KINDS.to_vec(),
  };
  let mut repos = Vec::new();
  for kind in kinds {
    let values =
      client.get_page_results(&list_path(kind), params).await?;
    repos.append(&mut from_values(values)?);
  }
  Ok(repos)
}

pub async fn get_repo(
  client: &Pulp3Client,
  href: &str,
) -> Result<Repository, PulpError> {
  client.get(href, &[]).await
}

/// Repository creation is synchronous on the server.
pub async fn new_repo(
  client: &Pulp3Client,
  kind: RepoKind,
  repo: &Repository,
) -> Result<Repository, PulpError> {
  client.post(&list_path(kind), repo).await
}

pub async fn update_repo_monitor(
  client: &Pulp3Client,
  repo: &Repository,
) -> Result<PulpTask, PulpError> {
  let href = repo.pulp_href.as_deref().ok_or_else(|| {
    PulpError::Api {
      status: 0,
      body: format!("repository {} has no pulp_href", repo.name),
    }
  })?;
  let task_href = client.patch_task(href, repo).await?;
  monitor_task(client, &task_href).await
}

pub async fn delete_repo_monitor(
  client: &Pulp3Client,
  href: &str,
) -> Result<PulpTask, PulpError> {
  let task_href = client.delete_task(href).await?;
  monitor_task(client, &task_href).await
}

/// Kicks off a sync of the repository from its remote. Returns the
/// running pulp task; the caller tracks it to completion.
pub async fn sync_repo(
  client: &Pulp3Client,
  repo_href: &str,
  remote_href: Option<&str>,
  sync_options: Option<&Value>,
) -> Result<PulpTask, PulpError> {
  let mut body = Map::new();
  if let Some(remote) = remote_href {
    body.insert("remote".into(), json!(remote));
  }
  if let Some(Value::Object(options)) = sync_options {
    for (key, value) in options {
      body.insert(key.clone(), value.clone());
    }
  }
  let task_href = client
    .post_task(&format!("{repo_href}sync/"), &Value::Object(body))
    .await?;
  crate::get_task(client, &task_href).await
}

/// Creates a new repository version with content units added and/or
/// removed. Returns the running pulp task.
pub async fn modify_repo(
  client: &Pulp3Client,
  repo_href: &str,
  base_version_href: &str,
  add_content_units: &[String],
  remove_content_units: &[String],
) -> Result<PulpTask, PulpError> {
  let body = json!({
    "base_version": base_version_href,
    "add_content_units": add_content_units,
    "remove_content_units": remove_content_units,
  });
  let task_href = client
    .post_task(&format!("{repo_href}modify/"), &body)
    .await?;
  crate::get_task(client, &task_href).await
}

pub async fn get_repo_version(
  client: &Pulp3Client,
  version_href: &str,
) -> Result<crate::RepositoryVersion, PulpError> {
  client.get(version_href, &[]).await
}
