use database::{NewTaskStage, PulpServerRepoRepository, TaskStageRepository, TaskType};
use pulp_client::{
  Distribution, Repository, get_all_distributions, get_all_repos,
  get_repo, kind_from_href, modify_repo, monitor_task,
  new_distribution_monitor, new_repo,
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
  TaskContext, claim_task, complete_task, fail_task_if_active,
};
use crate::{
  error::{Error, Result},
  helpers::name_matches,
  manager::PulpManager,
};

#[derive(Deserialize, Debug)]
struct SnapshotKwargs {
  pulp_server: String,
  snapshot_prefix: String,
  #[serde(default)]
  allow_snapshot_reuse: bool,
  #[serde(default)]
  regex_include: Option<String>,
  #[serde(default)]
  regex_exclude: Option<String>,
}

/// Snapshots matched repos: a `<prefix>-<name>` repository pinned
/// to the source's current latest version, served under its own
/// distribution.
pub async fn snapshot_repos(
  ctx: TaskContext,
  kwargs: &Value,
) -> Result<()> {
  let args: SnapshotKwargs =
    serde_json::from_value(kwargs.clone()).map_err(|e| {
      Error::InvalidArgument(format!(
        "invalid snapshot_repos kwargs: {e}"
      ))
    })?;

  let Some(task) = claim_task(
    &ctx,
    kwargs,
    format!("snapshot repos {}", args.pulp_server),
    TaskType::RepoSnapshot,
  )
  .await?
  else {
    return Ok(());
  };

  let result: Result<Vec<String>> = async {
    let manager = PulpManager::new(
      ctx.db.clone(),
      ctx.config.clone(),
      &args.pulp_server,
    )
    .await?;

    let mut conn = ctx.db.conn().await?;
    let repos = PulpServerRepoRepository::for_server(
      &mut conn,
      manager.pulp_server.id,
    )
    .await?;
    drop(conn);

    let mut snapshotted = Vec::new();
    for bound in repos {
      // Snapshots of snapshots are never taken.
      if bound.repo_name.starts_with("snap-") {
        continue;
      }
      if !name_matches(
        &bound.repo_name,
        args.regex_include.as_deref(),
        args.regex_exclude.as_deref(),
      )? {
        continue;
      }
      let Some(source_href) = bound.repo_href.clone() else {
        continue;
      };

      let snapshot_name =
        format!("{}-{}", args.snapshot_prefix, bound.repo_name);
      let kind = kind_from_href(&source_href).ok_or_else(|| {
        Error::InvalidState(format!(
          "could not determine content kind of {source_href}"
        ))
      })?;

      let source = get_repo(&manager.client, &source_href).await?;
      let Some(source_version) =
        source.latest_version_href.clone()
      else {
        tracing::info!(
          "{} has no version to snapshot, skipping",
          bound.repo_name
        );
        continue;
      };

      let existing = get_all_repos(
        &manager.client,
        Some(kind),
        &[("name", snapshot_name.clone())],
      )
      .await?;
      let snapshot_repo = match existing.into_iter().next() {
        Some(found) => {
          if !args.allow_snapshot_reuse {
            return Err(Error::InvalidState(format!(
              "snapshot {snapshot_name} already exists and reuse \
               is not allowed"
            )));
          }
          tracing::info!("reusing snapshot {snapshot_name}");
          found
        }
        None => {
          new_repo(
            &manager.client,
            kind,
            &Repository {
              name: snapshot_name.clone(),
              description: source.description.clone(),
              ..Default::default()
            },
          )
          .await?
        }
      };
      let snapshot_href = snapshot_repo
        .pulp_href
        .clone()
        .ok_or_else(|| {
          Error::InvalidState(format!(
            "snapshot repository {snapshot_name} has no pulp_href"
          ))
        })?;

      // Pin the snapshot to the source's current content.
      let copy_task = modify_repo(
        &manager.client,
        &snapshot_href,
        &source_version,
        &[],
        &[],
      )
      .await?;
      monitor_task(&manager.client, &copy_task.pulp_href).await?;

      let existing_distributions = get_all_distributions(
        &manager.client,
        Some(kind),
        &[("name", snapshot_name.clone())],
      )
      .await?;
      if existing_distributions.is_empty() {
        new_distribution_monitor(
          &manager.client,
          kind,
          &Distribution {
            name: snapshot_name.clone(),
            base_path: snapshot_name.clone(),
            repository: Some(snapshot_href),
            ..Default::default()
          },
        )
        .await?;
      }

      snapshotted.push(snapshot_name);
    }
    Ok(snapshotted)
  }
  .await;

  match &result {
    Ok(snapshotted) => {
      let mut conn = ctx.db.conn().await?;
      TaskStageRepository::add(
        &mut conn,
        &NewTaskStage {
          task_id: task.id,
          name: "snapshot repos".into(),
          detail: Some(json!({"snapshots": snapshotted})),
        },
      )
      .await?;
      drop(conn);
      complete_task(&ctx.db, task.id).await?;
      Ok(())
    }
    Err(e) => {
      fail_task_if_active(
        &ctx.db,
        task.id,
        &format!(
          "failed to snapshot repos on {}",
          args.pulp_server
        ),
        &e.detail(),
      )
      .await;
      result.map(|_| ())
    }
  }
}
