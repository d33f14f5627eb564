use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use super::TaskContext;
use crate::{error::Result, register::RepoConfigRegister};

#[derive(Deserialize, Debug)]
struct RegisterKwargs {
  pulp_server: String,
  #[serde(default)]
  regex_include: Option<String>,
  #[serde(default)]
  regex_exclude: Option<String>,
  /// Local config tree; when unset the configured git repo is
  /// cloned instead.
  #[serde(default)]
  local_repo_config_dir: Option<PathBuf>,
}

/// Worker entry for scheduled repo registration. The registrar
/// creates and finalizes its own Task record.
pub async fn register_repos(
  ctx: TaskContext,
  kwargs: &Value,
) -> Result<()> {
  let args: RegisterKwargs =
    serde_json::from_value(kwargs.clone()).map_err(|e| {
      crate::error::Error::InvalidArgument(format!(
        "invalid register_repos kwargs: {e}"
      ))
    })?;

  let register = RepoConfigRegister::new(
    ctx.db.clone(),
    ctx.config.clone(),
    &args.pulp_server,
    ctx.worker_name.clone(),
    Some(ctx.job_id.clone()),
  )
  .await?;

  register
    .create_repos_from_config(
      args.regex_include.as_deref(),
      args.regex_exclude.as_deref(),
      args.local_repo_config_dir.as_deref(),
    )
    .await
}
