use crate::{
  Distribution, Pulp3Client, PulpError, PulpTask, RepoKind,
  SUPPORTED_REPO_KINDS, from_values, monitor_task,
};

fn list_path(kind: RepoKind) -> String {
  format!(
    "/pulp/api/v3/distributions/{}/{}/",
    kind.plugin(),
    kind.distribution_segment()
  )
}

pub async fn get_all_distributions(
  client: &Pulp3Client,
  kind: Option<RepoKind>,
  params: &[(&str, String)],
) -> Result<Vec<Distribution>, PulpError> {
  let kinds = match kind {
    Some(kind) => vec![kind],
    None => SUPPORTED_REPO_KINDS.to_vec(),
  };
  let mut distributions = Vec::new();
  for kind in kinds {
    let values =
      client.get_page_results(&list_path(kind), params).await?;
    distributions.append(&mut from_values(values)?);
  }
  Ok(distributions)
}

/// Distribution create/update/delete are asynchronous on the
/// server; these wait for the task.
pub async fn new_distribution_monitor(
  client: &Pulp3Client,
  kind: RepoKind,
  distribution: &Distribution,
) -> Result<PulpTask, PulpError> {
  let task_href =
    client.post_task(&list_path(kind), distribution).await?;
  monitor_task(client, &task_href).await
}

pub async fn update_distribution_monitor(
  client: &Pulp3Client,
  distribution: &Distribution,
) -> Result<PulpTask, PulpError> {
  let href =
    distribution.pulp_href.as_deref().ok_or_else(|| {
      PulpError::Api {
        status: 0,
        body: format!(
          "distribution {} has no pulp_href",
          distribution.name
        ),
      }
    })?;
  let task_href = client.patch_task(href, distribution).await?;
  monitor_task(client, &task_href).await
}

pub async fn delete_distribution_monitor(
  client: &Pulp3Client,
  href: &str,
) -> Result<PulpTask, PulpError> {
  let task_href = client.delete_task(href).await?;
  monitor_task(client, &task_href).await
}
