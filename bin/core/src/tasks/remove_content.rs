use database::{
  FilterQuery, NewTaskStage, PulpServerRepoRepository,
  TaskStageRepository, TaskType,
};
use pulp_client::{
  get_repo, kind_from_href, modify_repo, monitor_task,
  new_publication, Publication,
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
  TaskContext, claim_task, complete_task, fail_task_if_active,
};
use crate::{
  error::{Error, Result},
  manager::PulpManager,
};

#[derive(Deserialize, Debug)]
struct RemoveContentKwargs {
  pulp_server_name: String,
  repo_name: String,
  content_href: String,
  #[serde(default)]
  force_publish: bool,
}

/// Removes one content unit from a repo's latest version and
/// publishes the result. Publication is skipped when nothing was
/// removed, unless forced.
pub async fn remove_repo_content(
  ctx: TaskContext,
  kwargs: &Value,
) -> Result<()> {
  let args: RemoveContentKwargs =
    serde_json::from_value(kwargs.clone()).map_err(|e| {
      Error::InvalidArgument(format!(
        "invalid remove_repo_content kwargs: {e}"
      ))
    })?;

  let Some(task) = claim_task(
    &ctx,
    kwargs,
    format!("remove repo content {}", args.pulp_server_name),
    TaskType::RemoveRepoContent,
  )
  .await?
  else {
    return Ok(());
  };

  let result: Result<()> = async {
    let manager = PulpManager::new(
      ctx.db.clone(),
      ctx.config.clone(),
      &args.pulp_server_name,
    )
    .await?;

    let mut conn = ctx.db.conn().await?;
    let bound = PulpServerRepoRepository::filter_join(
      &mut conn,
      &FilterQuery::new()
        .eq("pulp_server_id", manager.pulp_server.id)
        .eq("repo_name", args.repo_name.as_str()),
    )
    .await?
    .into_iter()
    .next()
    .ok_or_else(|| {
      Error::NotFound(format!(
        "repo {} on {}",
        args.repo_name, args.pulp_server_name
      ))
    })?;
    let repo_href = bound.repo_href.clone().ok_or_else(|| {
      Error::InvalidState(format!(
        "repo {} has no repository href",
        args.repo_name
      ))
    })?;

    let repo = get_repo(&manager.client, &repo_href).await?;
    let latest =
      repo.latest_version_href.clone().ok_or_else(|| {
        Error::InvalidState(format!(
          "repository {} has no version to remove content from",
          args.repo_name
        ))
      })?;

    let remove_task = modify_repo(
      &manager.client,
      &repo_href,
      &latest,
      &[],
      &[args.content_href.clone()],
    )
    .await?;
    TaskStageRepository::add(
      &mut conn,
      &NewTaskStage {
        task_id: task.id,
        name: "remove repo content".into(),
        detail: Some(json!({"task_href": remove_task.pulp_href})),
      },
    )
    .await?;
    let remove_task =
      monitor_task(&manager.client, &remove_task.pulp_href)
        .await?;

    let content_removed =
      !remove_task.created_resources.is_empty();
    if content_removed || args.force_publish {
      // Publish whichever version is now latest.
      let repo = get_repo(&manager.client, &repo_href).await?;
      let latest =
        repo.latest_version_href.clone().ok_or_else(|| {
          Error::InvalidState(format!(
            "repository {} lost its versions",
            args.repo_name
          ))
        })?;
      let kind = kind_from_href(&repo_href).ok_or_else(|| {
        Error::InvalidState(format!(
          "could not determine content kind of {repo_href}"
        ))
      })?;
      let publication = Publication::for_kind(kind, &latest, false);
      let publish_task =
        new_publication(&manager.client, kind, &publication)
          .await?;
      TaskStageRepository::add(
        &mut conn,
        &NewTaskStage {
          task_id: task.id,
          name: "publish repo".into(),
          detail: Some(
            json!({"task_href": publish_task.pulp_href}),
          ),
        },
      )
      .await?;
      monitor_task(&manager.client, &publish_task.pulp_href)
        .await?;
    }

    complete_task(&ctx.db, task.id).await
  }
  .await;

  if let Err(e) = &result {
    fail_task_if_active(
      &ctx.db,
      task.id,
      &format!(
        "failed to remove content from {} on {}",
        args.repo_name, args.pulp_server_name
      ),
      &e.detail(),
    )
    .await;
  }
  result
}
