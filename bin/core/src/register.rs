use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use chrono::Utc;
use database::{
  DbClient, NewTask, TaskError, TaskPatch, TaskRepository,
  TaskState, TaskType,
};
use pulp_client::RepoKind;
use serde_json::{Value, json};

use crate::{
  config::CoreConfig,
  error::{Error, Result},
  helpers::{is_internal_url, name_matches},
  manager::{PulpManager, RepoUpsert},
  vault::VaultClient,
};

/// A `vault_load_secrets` entry: which KV secret to fetch and which
/// remote property it lands on.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct VaultSecretRef {
  pub kv: String,
  pub path: String,
  pub secret_name: String,
  pub remote_property: String,
}

/// Registers repos on the target pulp server from per-repo JSON
/// config held in git (or a local directory).
pub struct RepoConfigRegister {
  db: DbClient,
  config: Arc<CoreConfig>,
  manager: PulpManager,
  worker_name: String,
  job_id: Option<String>,
}

impl RepoConfigRegister {
  pub async fn new(
    db: DbClient,
    config: Arc<CoreConfig>,
    name: &str,
    worker_name: String,
    job_id: Option<String>,
  ) -> Result<Self> {
    let manager =
      PulpManager::new(db.clone(), config.clone(), name).await?;
    Ok(Self {
      db,
      config,
      manager,
      worker_name,
      job_id,
    })
  }

  /// Creates/updates repos from config. When no local directory is
  /// given the configured git repo is cloned into a temp dir that is
  /// removed on every exit path.
  pub async fn create_repos_from_config(
    &self,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
    local_config_dir: Option<&Path>,
  ) -> Result<()> {
    let mut conn = self.db.conn().await?;
    let task = TaskRepository::add(
      &mut conn,
      &NewTask {
        worker_name: Some(self.worker_name.clone()),
        worker_job_id: self.job_id.clone(),
        date_started: Some(Utc::now()),
        task_args: Some(json!({
          "regex_include": regex_include,
          "regex_exclude": regex_exclude,
        })),
        ..NewTask::new(
          format!(
            "{} repo registration",
            self.manager.pulp_server.name
          ),
          TaskType::RepoCreationFromGit,
          TaskState::Running,
        )
      },
    )
    .await?;
    drop(conn);

    let result = self
      .register_inner(regex_include, regex_exclude, local_config_dir)
      .await;

    let mut conn = self.db.conn().await?;
    match &result {
      Ok(()) => {
        TaskRepository::update(
          &mut conn,
          task.id,
          &TaskPatch {
            state: Some(TaskState::Completed),
            date_finished: Some(Utc::now()),
            ..Default::default()
          },
        )
        .await?;
      }
      Err(e) => {
        tracing::error!(
          "error registering repos on {}: {e:#}",
          self.manager.pulp_server.name
        );
        TaskRepository::update(
          &mut conn,
          task.id,
          &TaskPatch {
            state: Some(TaskState::Failed),
            date_finished: Some(Utc::now()),
            error: Some(TaskError::value(
              format!(
                "unexpected error occurred registering repos on {}",
                self.manager.pulp_server.name
              ),
              e.detail(),
            )),
            ..Default::default()
          },
        )
        .await?;
      }
    }
    result
  }

  async fn register_inner(
    &self,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
    local_config_dir: Option<&Path>,
  ) -> Result<()> {
    // Checkout guard lives for the whole registration; the temp
    // directory is removed on drop.
    let _checkout;
    let config_dir: PathBuf = match local_config_dir {
      Some(dir) => dir.to_path_buf(),
      None => {
        let repo_url = self
          .config
          .pulp
          .git_repo_config
          .as_deref()
          .ok_or_else(|| {
            Error::InvalidArgument(
              "pulp.git_repo_config is not configured".into(),
            )
          })?;
        let checkout = git::clone_into_temp(repo_url)
          .await
          .map_err(Error::Other)?;
        let dir =
          checkout.join(&self.config.pulp.git_repo_config_dir);
        _checkout = checkout;
        dir
      }
    };

    let config_files = walk_json_files(&config_dir)?;
    for file_path in config_files {
      let raw = std::fs::read_to_string(&file_path)
        .map_err(|e| {
          Error::Other(anyhow::anyhow!(
            "failed to read {file_path:?}: {e}"
          ))
        })?;
      let file_config: Value =
        serde_json::from_str(&raw).map_err(|e| {
          Error::InvalidArgument(format!(
            "invalid json in {file_path:?}: {e}"
          ))
        })?;

      let global_config =
        load_global_config(&config_dir, &file_path)?;
      let name = prefixed_repo_name(
        &file_config,
        &file_path,
        &self.config,
      )?;

      if !name_matches(&name, regex_include, regex_exclude)? {
        continue;
      }

      let (mut upsert, secrets) = build_upsert(
        &file_config,
        global_config.as_ref(),
        name,
        &self.config,
      )?;
      self.resolve_secrets(&mut upsert, &secrets).await?;

      tracing::debug!("create/update repo for {}", upsert.name);
      self.manager.create_or_update_repository(&upsert).await?;
    }
    Ok(())
  }

  async fn resolve_secrets(
    &self,
    upsert: &mut RepoUpsert,
    secrets: &[VaultSecretRef],
  ) -> Result<()> {
    if secrets.is_empty() {
      return Ok(());
    }
    tracing::info!(
      "loading secrets for {} from vault",
      upsert.name
    );
    let vault = VaultClient::from_config(&self.config)?;
    for secret in secrets {
      let data =
        vault.read_kv_secret(&secret.path, &secret.kv).await?;
      let value = data
        .get(&secret.secret_name)
        .and_then(Value::as_str)
        .ok_or_else(|| {
          Error::NotFound(format!(
            "secret {} at {}/{}",
            secret.secret_name, secret.kv, secret.path
          ))
        })?;
      apply_secret(upsert, &secret.remote_property, value)?;
    }
    Ok(())
  }
}

/// All `*.json` files under the config dir, `global.json` excluded.
fn walk_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  let mut stack = vec![dir.to_path_buf()];
  while let Some(current) = stack.pop() {
    let entries = std::fs::read_dir(&current).map_err(|e| {
      Error::Other(anyhow::anyhow!(
        "failed to read config dir {current:?}: {e}"
      ))
    })?;
    for entry in entries {
      let entry = entry.map_err(|e| Error::Other(e.into()))?;
      let path = entry.path();
      if path.is_dir() {
        stack.push(path);
      } else if path.extension().is_some_and(|ext| ext == "json")
        && path
          .file_name()
          .is_some_and(|file| file != "global.json")
      {
        files.push(path);
      }
    }
  }
  files.sort();
  Ok(files)
}

/// `remote/global.json` applies to files under `remote/`.
fn load_global_config(
  config_dir: &Path,
  file_path: &Path,
) -> Result<Option<Value>> {
  if !path_is_under(file_path, "remote") {
    return Ok(None);
  }
  let global_path = config_dir.join("remote").join("global.json");
  if !global_path.is_file() {
    return Ok(None);
  }
  tracing::debug!("loading global config from {global_path:?}");
  let raw = std::fs::read_to_string(&global_path)
    .map_err(|e| Error::Other(e.into()))?;
  let global = serde_json::from_str(&raw).map_err(|e| {
    Error::InvalidArgument(format!(
      "invalid json in {global_path:?}: {e}"
    ))
  })?;
  Ok(Some(global))
}

fn path_is_under(path: &Path, dir_name: &str) -> bool {
  path
    .components()
    .any(|component| component.as_os_str() == dir_name)
}

/// Applies the external/internal prefix based on which tree the
/// config file sits in; an empty configured prefix disables the
/// step.
fn apply_repo_name_prefix(
  name: &str,
  file_path: &Path,
  config: &CoreConfig,
) -> String {
  if path_is_under(file_path, "remote") {
    let prefix = &config.pulp.external_repo_prefix;
    if !prefix.is_empty() && !name.starts_with(prefix.as_str()) {
      return format!("{prefix}{name}");
    }
  } else if path_is_under(file_path, "internal") {
    let prefix = &config.pulp.internal_repo_prefix;
    if !prefix.is_empty() && !name.starts_with(prefix.as_str()) {
      return format!("{prefix}{name}");
    }
  }
  name.to_string()
}

fn prefixed_repo_name(
  file_config: &Value,
  file_path: &Path,
  config: &CoreConfig,
) -> Result<String> {
  let name = file_config
    .get("name")
    .and_then(Value::as_str)
    .ok_or_else(|| {
      Error::InvalidArgument(format!(
        "repo config {file_path:?} has no name"
      ))
    })?;
  Ok(apply_repo_name_prefix(name, file_path, config))
}

/// Composes the effective config (per-file keys win over global)
/// and builds the upsert plus any vault secret references still to
/// resolve.
fn build_upsert(
  file_config: &Value,
  global_config: Option<&Value>,
  name: String,
  config: &CoreConfig,
) -> Result<(RepoUpsert, Vec<VaultSecretRef>)> {
  let field = |key: &str| -> Option<Value> {
    file_config
      .get(key)
      .or_else(|| global_config.and_then(|global| global.get(key)))
      .cloned()
  };
  let str_of = |key: &str| -> Option<String> {
    field(key).as_ref().and_then(Value::as_str).map(Into::into)
  };

  let repo_type_raw = str_of("content_repo_type").ok_or_else(
    || {
      Error::InvalidArgument(format!(
        "repo config for {name} has no content_repo_type"
      ))
    },
  )?;
  // `iso` is the legacy alias for file repos.
  let repo_type: RepoKind = repo_type_raw
    .replace("iso", "file")
    .parse()
    .map_err(|_| {
      Error::InvalidArgument(format!(
        "unknown content_repo_type {repo_type_raw} for {name}"
      ))
    })?;

  let description = format!(
    "{} - {} - base_url:{}",
    str_of("description").unwrap_or_default(),
    str_of("owner").unwrap_or_default(),
    str_of("base_url").unwrap_or_default(),
  );

  let mut upsert = RepoUpsert {
    name,
    description,
    repo_type,
    ..Default::default()
  };
  let mut secrets = Vec::new();

  if let Some(url) = str_of("url") {
    upsert.tls_validation = field("tls_validation")
      .and_then(|value| value.as_bool())
      .unwrap_or(false);
    upsert.proxy_url = str_of("proxy");

    // Syncing a remote through an internal server needs no proxy.
    if is_internal_url(&url, config) {
      upsert.proxy_url = None;
    }
    upsert.url = Some(url);

    if repo_type == RepoKind::Deb {
      upsert.distributions =
        Some(str_of("releases").unwrap_or_else(|| "stable".into()));
      upsert.architectures = str_of("architectures");
      if let Some(components) = str_of("components") {
        upsert.components = Some(components);
        upsert.ignore_missing_package_indices = true;
      }
    }

    if let Some(entries) = field("vault_load_secrets") {
      secrets = serde_json::from_value(entries).map_err(|e| {
        Error::InvalidArgument(format!(
          "invalid vault_load_secrets for {}: {e}",
          upsert.name
        ))
      })?;
    }
  }

  Ok((upsert, secrets))
}

fn apply_secret(
  upsert: &mut RepoUpsert,
  remote_property: &str,
  value: &str,
) -> Result<()> {
  match remote_property {
    "username" => upsert.username = Some(value.to_string()),
    "password" => upsert.password = Some(value.to_string()),
    "client_cert" => upsert.client_cert = Some(value.to_string()),
    "client_key" => upsert.client_key = Some(value.to_string()),
    "ca_cert" => upsert.ca_cert = Some(value.to_string()),
    "proxy_url" => upsert.proxy_url = Some(value.to_string()),
    other => {
      return Err(Error::InvalidArgument(format!(
        "unsupported remote_property {other} in vault_load_secrets"
      )));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_config() -> CoreConfig {
    CoreConfig {
      pulp: crate::config::PulpConfig {
        internal_domains: "corp.local".into(),
        ..Default::default()
      },
      ..Default::default()
    }
  }

  #[test]
  fn prefixes_follow_directory_tree() {
    let config = test_config();
    assert_eq!(
      apply_repo_name_prefix(
        "epel9",
        Path::new("/cfg/remote/epel9.json"),
        &config
      ),
      "ext-epel9"
    );
    // Already prefixed names pass through.
    assert_eq!(
      apply_repo_name_prefix(
        "ext-epel9",
        Path::new("/cfg/remote/epel9.json"),
        &config
      ),
      "ext-epel9"
    );
    assert_eq!(
      apply_repo_name_prefix(
        "tooling",
        Path::new("/cfg/internal/tooling.json"),
        &config
      ),
      "int-tooling"
    );
    // Outside both trees the name is untouched.
    assert_eq!(
      apply_repo_name_prefix(
        "misc",
        Path::new("/cfg/other/misc.json"),
        &config
      ),
      "misc"
    );
  }

  #[test]
  fn per_file_keys_win_over_global() {
    let file_config = serde_json::json!({
      "name": "epel9",
      "content_repo_type": "rpm",
      "description": "epel 9",
      "owner": "platform",
      "base_url": "el9-x86_64",
      "url": "https://mirror.example.org/epel9/",
      "proxy": "http://proxy-from-file:3128",
    });
    let global_config = serde_json::json!({
      "proxy": "http://proxy-from-global:3128",
    });

    let (upsert, secrets) = build_upsert(
      &file_config,
      Some(&global_config),
      "ext-epel9".into(),
      &test_config(),
    )
    .unwrap();
    assert_eq!(
      upsert.proxy_url.as_deref(),
      Some("http://proxy-from-file:3128")
    );
    assert!(secrets.is_empty());

    // Without the per-file key the global proxy applies.
    let file_config = serde_json::json!({
      "name": "epel9",
      "content_repo_type": "rpm",
      "description": "epel 9",
      "owner": "platform",
      "base_url": "el9-x86_64",
      "url": "https://mirror.example.org/epel9/",
    });
    let (upsert, _) = build_upsert(
      &file_config,
      Some(&global_config),
      "ext-epel9".into(),
      &test_config(),
    )
    .unwrap();
    assert_eq!(
      upsert.proxy_url.as_deref(),
      Some("http://proxy-from-global:3128")
    );
  }

  #[test]
  fn deb_defaults_and_component_side_effect() {
    let file_config = serde_json::json!({
      "name": "jammy",
      "content_repo_type": "deb",
      "description": "ubuntu jammy",
      "owner": "platform",
      "base_url": "ubuntu-22.04",
      "url": "https://archive.ubuntu.com/ubuntu/",
      "components": "main universe",
    });
    let (upsert, _) = build_upsert(
      &file_config,
      None,
      "ext-jammy".into(),
      &test_config(),
    )
    .unwrap();
    assert_eq!(upsert.distributions.as_deref(), Some("stable"));
    assert_eq!(upsert.components.as_deref(), Some("main universe"));
    assert!(upsert.ignore_missing_package_indices);
    assert_eq!(
      upsert.description,
      "ubuntu jammy - platform - base_url:ubuntu-22.04"
    );
  }

  #[test]
  fn iso_aliases_to_file_and_proxy_stripped_for_internal() {
    let file_config = serde_json::json!({
      "name": "images",
      "content_repo_type": "iso",
      "description": "boot images",
      "owner": "infra",
      "base_url": "images",
      "url": "https://artifacts.corp.local/images/",
      "proxy": "http://proxy:3128",
    });
    let (upsert, _) = build_upsert(
      &file_config,
      None,
      "ext-images".into(),
      &test_config(),
    )
    .unwrap();
    assert_eq!(upsert.repo_type, RepoKind::File);
    assert_eq!(upsert.proxy_url, None);
  }

  #[test]
  fn vault_secret_refs_are_collected() {
    let file_config = serde_json::json!({
      "name": "rhel9",
      "content_repo_type": "rpm",
      "description": "rhel 9",
      "owner": "platform",
      "base_url": "rhel9",
      "url": "https://cdn.redhat.com/rhel9/",
      "vault_load_secrets": [
        {
          "kv": "repo-secrets",
          "path": "redhat/cdn",
          "secret_name": "client_cert",
          "remote_property": "client_cert"
        }
      ],
    });
    let (_, secrets) = build_upsert(
      &file_config,
      None,
      "ext-rhel9".into(),
      &test_config(),
    )
    .unwrap();
    assert_eq!(
      secrets,
      vec![VaultSecretRef {
        kv: "repo-secrets".into(),
        path: "redhat/cdn".into(),
        secret_name: "client_cert".into(),
        remote_property: "client_cert".into(),
      }]
    );

    let mut upsert = RepoUpsert::default();
    apply_secret(&mut upsert, "client_cert", "PEM").unwrap();
    assert_eq!(upsert.client_cert.as_deref(), Some("PEM"));
    assert!(apply_secret(&mut upsert, "nope", "x").is_err());
  }

  #[test]
  fn walks_json_files_skipping_global() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    std::fs::create_dir_all(&remote).unwrap();
    std::fs::write(remote.join("epel9.json"), "{}").unwrap();
    std::fs::write(remote.join("global.json"), "{}").unwrap();
    std::fs::write(dir.path().join("readme.txt"), "x").unwrap();

    let files = walk_json_files(dir.path()).unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("remote/epel9.json"));
  }
}
