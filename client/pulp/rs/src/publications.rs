use crate::{
  Pulp3Client, Publication, PulpError, PulpTask, RepoKind,
  from_values,
};

fn list_path(kind: RepoKind) -> String {
  format!(
    "/pulp/api/v3/publications/{}/{}/",
    kind.plugin(),
    kind.publication_segment()
  )
}

/// Publication creation is asynchronous; returns the running pulp
/// task so sync-driver callers can track it alongside their other
/// stages.
pub async fn new_publication(
  client: &Pulp3Client,
  kind: RepoKind,
  publication: &Publication,
) -> Result<PulpTask, PulpError> {
  let task_href =
    client.post_task(&list_path(kind), publication).await?;
  crate::get_task(client, &task_href).await
}

pub async fn get_all_publications(
  client: &Pulp3Client,
  kind: RepoKind,
  params: &[(&str, String)],
) -> Result<Vec<Publication>, PulpError> {
  let values =
    client.get_page_results(&list_path(kind), params).await?;
  from_values(values)
}
