use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content kinds a pulp server can host. The kind discriminates the
/// API path a resource lives under; it is not part of the resource
/// body itself.
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RepoKind {
  Rpm,
  Deb,
  File,
  Python,
  Container,
}

pub const SUPPORTED_REPO_KINDS: [RepoKind; 5] = [
  RepoKind::Rpm,
  RepoKind::Deb,
  RepoKind::File,
  RepoKind::Python,
  RepoKind::Container,
];

impl RepoKind {
  /// Plugin path segment, e.g. `repositories/<plugin>/<typ>/`.
  pub fn plugin(self) -> &'static str {
    match self {
      RepoKind::Rpm => "rpm",
      RepoKind::Deb => "deb",
      RepoKind::File => "file",
      RepoKind::Python => "python",
      RepoKind::Container => "container",
    }
  }

  pub fn repo_segment(self) -> &'static str {
    match self {
      RepoKind::Rpm => "rpm",
      RepoKind::Deb => "apt",
      RepoKind::File => "file",
      RepoKind::Python => "python",
      RepoKind::Container => "container",
    }
  }

  pub fn distribution_segment(self) -> &'static str {
    match self {
      RepoKind::Python => "pypi",
      other => other.repo_segment(),
    }
  }

  pub fn publication_segment(self) -> &'static str {
    match self {
      RepoKind::Python => "pypi",
      other => other.repo_segment(),
    }
  }

  /// Field the package listing uses for the package name; debs call
  /// it `package`.
  pub fn package_name_field(self) -> &'static str {
    match self {
      RepoKind::Deb => "package",
      _ => "name",
    }
  }
}

/// Parses the content kind out of a pulp href, e.g.
/// `/pulp/api/v3/repositories/deb/apt/0189…/` is a deb resource.
pub fn kind_from_href(href: &str) -> Option<RepoKind> {
  let mut segments = href.split('/').skip_while(|segment| {
    !matches!(
      *segment,
      "repositories"
        | "remotes"
        | "distributions"
        | "publications"
        | "content"
    )
  });
  segments.next()?;
  segments.next()?.parse().ok()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Repository {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pulp_href: Option<String>,
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub remote: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub latest_version_href: Option<String>,
  /// Deb only; attaching it elsewhere is rejected by the server.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub signing_service: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Remote {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pulp_href: Option<String>,
  pub name: String,
  pub url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ca_cert: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub client_cert: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub client_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub username: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub proxy_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tls_validation: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub policy: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sock_connect_timeout: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sock_read_timeout: Option<f64>,
  // Deb-only sync scoping.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub distributions: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub components: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub architectures: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ignore_missing_package_indices: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Distribution {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pulp_href: Option<String>,
  pub name: String,
  pub base_path: String,
  /// Read-only on the server; where the distribution is served.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub base_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub repository: Option<String>,
}

/// Publication create body. Which fields apply depends on the kind;
/// [Publication::for_kind] builds the right shape.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Publication {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pulp_href: Option<String>,
  pub repository_version: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub metadata_checksum_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub package_checksum_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub structured: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub simple: Option<bool>,
}

impl Publication {
  pub fn for_kind(
    kind: RepoKind,
    repository_version: &str,
    deb_flat_repo: bool,
  ) -> Self {
    let mut publication = Publication {
      repository_version: repository_version.to_string(),
      ..Default::default()
    };
    match kind {
      RepoKind::Rpm => {
        publication.metadata_checksum_type = Some("sha256".into());
        publication.package_checksum_type = Some("sha256".into());
      }
      RepoKind::Deb if deb_flat_repo => {
        publication.structured = Some(false);
        publication.simple = Some(true);
      }
      RepoKind::Deb => {
        publication.structured = Some(true);
      }
      _ => {}
    }
    publication
  }
}

#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PulpTaskState {
  Waiting,
  Running,
  Completed,
  Failed,
  Canceled,
}

impl PulpTaskState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      PulpTaskState::Completed
        | PulpTaskState::Failed
        | PulpTaskState::Canceled
    )
  }
}

/// The server's own asynchronous unit of work, observed by href.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PulpTask {
  pub pulp_href: String,
  pub pulp_created: DateTime<Utc>,
  pub state: PulpTaskState,
  pub name: String,
  #[serde(default)]
  pub created_resources: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ContentSummaryEntry {
  pub count: i64,
  pub href: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ContentSummary {
  #[serde(default)]
  pub present: HashMap<String, ContentSummaryEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepositoryVersion {
  pub pulp_href: String,
  pub number: i64,
  pub repository: String,
  #[serde(default)]
  pub content_summary: ContentSummary,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SigningService {
  pub pulp_href: String,
  pub name: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kind_parses_from_hrefs() {
    assert_eq!(
      kind_from_href("/pulp/api/v3/repositories/rpm/rpm/018/"),
      Some(RepoKind::Rpm)
    );
    assert_eq!(
      kind_from_href("/pulp/api/v3/remotes/deb/apt/018/"),
      Some(RepoKind::Deb)
    );
    assert_eq!(
      kind_from_href("/pulp/api/v3/content/deb/packages/1/"),
      Some(RepoKind::Deb)
    );
    assert_eq!(kind_from_href("/pulp/api/v3/tasks/018/"), None);
  }

  #[test]
  fn publication_shape_per_kind() {
    let rpm = Publication::for_kind(RepoKind::Rpm, "/v/1/", false);
    assert_eq!(rpm.metadata_checksum_type.as_deref(), Some("sha256"));
    assert_eq!(rpm.package_checksum_type.as_deref(), Some("sha256"));
    assert_eq!(rpm.structured, None);

    let deb = Publication::for_kind(RepoKind::Deb, "/v/1/", false);
    assert_eq!(deb.structured, Some(true));
    assert_eq!(deb.simple, None);

    let flat = Publication::for_kind(RepoKind::Deb, "/v/1/", true);
    assert_eq!(flat.structured, Some(false));
    assert_eq!(flat.simple, Some(true));

    let file = Publication::for_kind(RepoKind::File, "/v/1/", false);
    assert_eq!(file.metadata_checksum_type, None);
    assert_eq!(file.structured, None);
  }
}
