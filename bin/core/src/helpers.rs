use std::time::Duration;

use database::{PulpServer, RepoType};
use pulp_client::{ClientOptions, Pulp3Client, RepoKind};
use regex::Regex;

use crate::{
  config::CoreConfig,
  error::{Error, Result},
  vault::VaultClient,
};

/// Whether a remote URL points at one of the configured internal
/// domains. Substring membership, matching the TLS policy applied
/// when remotes are created.
pub fn is_internal_url(url: &str, config: &CoreConfig) -> bool {
  config
    .pulp
    .internal_domains()
    .iter()
    .any(|domain| url.contains(domain))
}

/// include/exclude regex filter over a name; exclude wins ties.
pub fn name_matches(
  name: &str,
  regex_include: Option<&str>,
  regex_exclude: Option<&str>,
) -> Result<bool> {
  if let Some(exclude) = regex_exclude {
    let exclude = Regex::new(exclude).map_err(|e| {
      Error::InvalidArgument(format!(
        "invalid exclude regex {exclude}: {e}"
      ))
    })?;
    if exclude.is_match(name) {
      return Ok(false);
    }
  }
  if let Some(include) = regex_include {
    let include = Regex::new(include).map_err(|e| {
      Error::InvalidArgument(format!(
        "invalid include regex {include}: {e}"
      ))
    })?;
    return Ok(include.is_match(name));
  }
  Ok(true)
}

/// Builds an authenticated API client for a pulp server. The service
/// account password comes out of vault when the server carries a
/// mount; anonymous otherwise.
pub async fn new_pulp_client(
  server: &PulpServer,
  config: &CoreConfig,
) -> Result<Pulp3Client> {
  let mut options = ClientOptions {
    root_ca_pem: config.root_ca()?,
    ..Default::default()
  };

  if let (Some(username), Some(mount)) =
    (&server.username, &server.vault_service_account_mount)
  {
    let vault = VaultClient::from_config(config)?;
    let secret = vault.read_kv_secret(username, mount).await?;
    options.username = Some(username.clone());
    options.password = secret
      .get("password")
      .and_then(serde_json::Value::as_str)
      .map(str::to_string);
  }

  Ok(Pulp3Client::new(&server.name, options)?)
}

pub fn repo_type_from_kind(kind: RepoKind) -> RepoType {
  match kind {
    RepoKind::Rpm => RepoType::Rpm,
    RepoKind::Deb => RepoType::Deb,
    RepoKind::File => RepoType::File,
    RepoKind::Python => RepoType::Python,
    RepoKind::Container => RepoType::Container,
  }
}

pub fn kind_from_repo_type(repo_type: RepoType) -> RepoKind {
  match repo_type {
    RepoType::Rpm => RepoKind::Rpm,
    RepoType::Deb => RepoKind::Deb,
    RepoType::File => RepoKind::File,
    RepoType::Python => RepoKind::Python,
    RepoType::Container => RepoKind::Container,
  }
}

/// Feed scheme for syncing content between pulp servers.
pub fn sync_scheme(config: &CoreConfig) -> &'static str {
  if config.pulp.use_https_for_sync {
    "https"
  } else {
    "http"
  }
}

pub fn poll_interval(config: &CoreConfig) -> Duration {
  Duration::from_secs(config.pulp.sync_poll_interval)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exclude_wins_over_include() {
    assert!(
      name_matches("rpm-repo1", Some("rpm"), Some("-ex")).unwrap()
    );
    assert!(
      !name_matches("rpm-repo-ex", Some("rpm"), Some("-ex"))
        .unwrap()
    );
    assert!(
      !name_matches("deb-repo1", Some("rpm"), None).unwrap()
    );
    assert!(name_matches("anything", None, None).unwrap());
  }

  #[test]
  fn internal_url_is_substring_membership() {
    let config = CoreConfig {
      pulp: crate::config::PulpConfig {
        internal_domains: "example.com,corp.local".into(),
        ..Default::default()
      },
      ..Default::default()
    };
    assert!(is_internal_url("https://pulp.example.com/", &config));
    assert!(!is_internal_url("https://mirror.centos.org/", &config));
  }
}
