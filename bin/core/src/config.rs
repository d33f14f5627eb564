use std::path::PathBuf;

use anyhow::Context;
use logger::LogConfig;
use serde::Deserialize;

/// Environment overrides. Secrets and the deployment-specific knobs
/// can be set without touching the config file.
#[derive(Deserialize, Debug, Default)]
pub struct Env {
  pub pulp_manager_config_path: Option<PathBuf>,
  /// Takes precedence over `ca.root_ca_file_path`.
  pub pulp_manager_ca_file: Option<PathBuf>,
  pub pulp_manager_redis_host: Option<String>,
  pub pulp_manager_redis_port: Option<u16>,
  pub pulp_manager_redis_db: Option<i64>,
  pub pulp_manager_database_path: Option<PathBuf>,
  pub pulp_manager_vault_token: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RedisConfig {
  pub host: String,
  pub port: u16,
  pub db: i64,
}

impl Default for RedisConfig {
  fn default() -> Self {
    Self {
      host: "localhost".into(),
      port: 6379,
      db: 0,
    }
  }
}

impl RedisConfig {
  pub fn url(&self) -> String {
    format!("redis://{}:{}/{}", self.host, self.port, self.db)
  }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PagingConfig {
  pub max_page_size: i64,
  pub default_page_size: i64,
}

impl Default for PagingConfig {
  fn default() -> Self {
    Self {
      max_page_size: 500,
      default_page_size: 50,
    }
  }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PulpConfig {
  /// Name of the signing service attached to deb repositories.
  pub deb_signing_service: Option<String>,
  /// Comma separated substrings marking a remote URL as internal.
  pub internal_domains: String,
  pub remote_tls_validation: Option<bool>,
  pub use_https_for_sync: bool,
  pub package_name_replacement_pattern: Option<String>,
  pub package_name_replacement_rule: Option<String>,
  pub banned_package_regex: Option<String>,
  pub external_repo_prefix: String,
  pub internal_repo_prefix: String,
  pub git_repo_config: Option<String>,
  pub git_repo_config_dir: String,
  pub local_repo_config_dir: Option<PathBuf>,
  /// Seconds between fan-out loop iterations.
  pub sync_poll_interval: u64,
}

impl Default for PulpConfig {
  fn default() -> Self {
    Self {
      deb_signing_service: None,
      internal_domains: String::new(),
      remote_tls_validation: None,
      use_https_for_sync: true,
      package_name_replacement_pattern: None,
      package_name_replacement_rule: None,
      banned_package_regex: None,
      external_repo_prefix: "ext-".into(),
      internal_repo_prefix: "int-".into(),
      git_repo_config: None,
      git_repo_config_dir: "repo-config".into(),
      local_repo_config_dir: None,
      sync_poll_interval: 10,
    }
  }
}

impl PulpConfig {
  pub fn internal_domains(&self) -> Vec<&str> {
    self
      .internal_domains
      .split(',')
      .map(str::trim)
      .filter(|domain| !domain.is_empty())
      .collect()
  }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RemotesConfig {
  pub sock_connect_timeout: f64,
  pub sock_read_timeout: f64,
}

impl Default for RemotesConfig {
  fn default() -> Self {
    Self {
      sock_connect_timeout: 10.0,
      sock_read_timeout: 30.0,
    }
  }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CaConfig {
  pub root_ca_file_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct VaultConfig {
  pub vault_addr: Option<String>,
  pub repo_secret_namespace: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
  pub admin_group: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
  pub path: PathBuf,
  pub max_connections: u32,
}

impl Default for DatabaseConfig {
  fn default() -> Self {
    Self {
      path: PathBuf::from("pulp-manager.db"),
      max_connections: 5,
    }
  }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CoreConfig {
  pub redis: RedisConfig,
  pub paging: PagingConfig,
  pub pulp: PulpConfig,
  pub remotes: RemotesConfig,
  pub ca: CaConfig,
  pub vault: VaultConfig,
  pub auth: AuthConfig,
  pub database: DatabaseConfig,
  pub logging: LogConfig,
  #[serde(skip)]
  pub vault_token: Option<String>,
}

impl CoreConfig {
  /// Loads the TOML config file (if any) and applies environment
  /// overrides on top.
  pub fn load(
    cli_config_path: Option<&PathBuf>,
  ) -> anyhow::Result<Self> {
    let env: Env = envy::from_env()
      .context("failed to parse pulp-manager environment")?;

    let path =
      cli_config_path.or(env.pulp_manager_config_path.as_ref());
    let mut config = match path {
      Some(path) => {
        let raw = std::fs::read_to_string(path).with_context(
          || format!("failed to read config file {path:?}"),
        )?;
        toml::from_str(&raw).with_context(|| {
          format!("failed to parse config file {path:?}")
        })?
      }
      None => CoreConfig::default(),
    };

    if let Some(host) = env.pulp_manager_redis_host {
      config.redis.host = host;
    }
    if let Some(port) = env.pulp_manager_redis_port {
      config.redis.port = port;
    }
    if let Some(db) = env.pulp_manager_redis_db {
      config.redis.db = db;
    }
    if let Some(path) = env.pulp_manager_database_path {
      config.database.path = path;
    }
    if let Some(ca_file) = env.pulp_manager_ca_file {
      config.ca.root_ca_file_path = Some(ca_file);
    }
    config.vault_token = env.pulp_manager_vault_token;

    Ok(config)
  }

  /// Contents of the configured root CA bundle, if one is set.
  pub fn root_ca(&self) -> anyhow::Result<Option<String>> {
    match &self.ca.root_ca_file_path {
      Some(path) => {
        let pem = std::fs::read_to_string(path).with_context(
          || format!("failed to read root CA file {path:?}"),
        )?;
        Ok(Some(pem))
      }
      None => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn internal_domains_splits_and_trims() {
    let pulp = PulpConfig {
      internal_domains: "example.com, corp.local,".into(),
      ..Default::default()
    };
    assert_eq!(
      pulp.internal_domains(),
      vec!["example.com", "corp.local"]
    );
    assert!(
      PulpConfig::default().internal_domains().is_empty()
    );
  }

  #[test]
  fn parses_partial_toml() {
    let config: CoreConfig = toml::from_str(
      r#"
        [redis]
        host = "redis01.corp.local"

        [pulp]
        internal_domains = "corp.local"
        banned_package_regex = "pp-nmap|sslstrip"
      "#,
    )
    .unwrap();
    assert_eq!(config.redis.host, "redis01.corp.local");
    assert_eq!(config.redis.port, 6379);
    assert_eq!(
      config.pulp.banned_package_regex.as_deref(),
      Some("pp-nmap|sslstrip")
    );
    assert_eq!(config.paging.max_page_size, 500);
  }
}
