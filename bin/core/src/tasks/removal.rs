use database::{
  NewTaskStage, PulpServerRepoRepository, TaskStageRepository,
  TaskType,
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
struct RemovalKwargs {
  pulp_server: String,
  #[serde(default)]
  regex_include: Option<String>,
  #[serde(default)]
  regex_exclude: Option<String>,
  #[serde(default = "default_dry_run")]
  dry_run: bool,
}

fn default_dry_run() -> bool {
  true
}

/// Deletes matched repository/remote/distribution triples from the
/// pulp server together with their local binding rows. A dry run
/// only reports what would go.
pub async fn remove_repos(
  ctx: TaskContext,
  kwargs: &Value,
) -> Result<()> {
  let args: RemovalKwargs =
    serde_json::from_value(kwargs.clone()).map_err(|e| {
      Error::InvalidArgument(format!(
        "invalid remove_repos kwargs: {e}"
      ))
    })?;

  let Some(task) = claim_task(
    &ctx,
    kwargs,
    format!("remove repos {}", args.pulp_server),
    TaskType::RepoRemoval,
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

    let mut removed = Vec::new();
    for bound in repos {
      if !name_matches(
        &bound.repo_name,
        args.regex_include.as_deref(),
        args.regex_exclude.as_deref(),
      )? {
        continue;
      }

      if args.dry_run {
        tracing::info!(
          "dry run: would remove {} from {}",
          bound.repo_name,
          args.pulp_server
        );
        removed.push(bound.repo_name.clone());
        continue;
      }

      tracing::info!(
        "removing {} from {}",
        bound.repo_name,
        args.pulp_server
      );
      manager.delete_repository(&bound).await?;

      let mut tx = ctx.db.begin().await?;
      PulpServerRepoRepository::delete_by_id(&mut tx, bound.id)
        .await?;
      tx.commit().await?;
      removed.push(bound.repo_name.clone());
    }
    Ok(removed)
  }
  .await;

  match &result {
    Ok(removed) => {
      let mut conn = ctx.db.conn().await?;
      TaskStageRepository::add(
        &mut conn,
        &NewTaskStage {
          task_id: task.id,
          name: "remove repos".into(),
          detail: Some(json!({
            "dry_run": args.dry_run,
            "removed": removed,
          })),
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
          "failed to remove repos on {}",
          args.pulp_server
        ),
        &e.detail(),
      )
      .await;
      result.map(|_| ())
    }
  }
}
