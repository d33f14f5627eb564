use serde::Deserialize;
use serde_json::Value;

use super::{TaskContext, claim_task, fail_task_if_active};
use crate::{
  error::Result, manager::PulpManager, syncher::RepoSyncher,
};
use database::TaskType;

#[derive(Deserialize, Debug)]
struct SyncKwargs {
  pulp_server: String,
  #[serde(default = "default_concurrency")]
  max_concurrent_syncs: i64,
  #[serde(default)]
  regex_include: Option<String>,
  #[serde(default)]
  regex_exclude: Option<String>,
  #[serde(default)]
  source_pulp_server_name: Option<String>,
  #[serde(default)]
  sync_options: Option<Value>,
}

fn default_concurrency() -> i64 {
  2
}

/// Worker entry for scheduled and ad-hoc repo group syncs.
pub async fn sync_repos(
  ctx: TaskContext,
  kwargs: &Value,
) -> Result<()> {
  let args: SyncKwargs = serde_json::from_value(kwargs.clone())
    .map_err(|e| {
      crate::error::Error::InvalidArgument(format!(
        "invalid sync_repos kwargs: {e}"
      ))
    })?;

  let Some(task) = claim_task(
    &ctx,
    kwargs,
    format!("repo sync {}", args.pulp_server),
    TaskType::RepoGroupSync,
  )
  .await?
  else {
    tracing::info!(
      "sync of {} skipped, task was canceled",
      args.pulp_server
    );
    return Ok(());
  };

  let result: Result<()> = async {
    // Slaves first mirror the primary's repo definitions so the
    // sync below pulls from it rather than the internet.
    if let Some(source) = &args.source_pulp_server_name {
      let manager = PulpManager::new(
        ctx.db.clone(),
        ctx.config.clone(),
        &args.pulp_server,
      )
      .await?;
      manager
        .add_repos_from_pulp_server(
          source,
          args.regex_include.as_deref(),
          args.regex_exclude.as_deref(),
        )
        .await?;
    }

    let syncher = RepoSyncher::new(
      ctx.db.clone(),
      ctx.config.clone(),
      &args.pulp_server,
    )
    .await?;
    syncher
      .sync_repos(
        &task,
        args.max_concurrent_syncs.max(1) as usize,
        args.regex_include.as_deref(),
        args.regex_exclude.as_deref(),
        args.sync_options.as_ref(),
      )
      .await
  }
  .await;

  if let Err(e) = &result {
    fail_task_if_active(
      &ctx.db,
      task.id,
      &format!(
        "unexpected error syncing repos on {}",
        args.pulp_server
      ),
      &e.detail(),
    )
    .await;
  }
  result
}
