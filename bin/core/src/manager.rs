use std::{collections::HashMap, sync::Arc};

use database::{
  DbClient, FilterQuery, NewPulpServerRepo, NewRepo, PulpServer,
  PulpServerRepo, PulpServerRepoDetail, PulpServerRepoPatch,
  PulpServerRepoRepository, PulpServerRepository, Repo,
  RepoRepository,
};
use pulp_client::{
  Distribution, Publication, Pulp3Client, PulpTask, Remote,
  RepoKind, Repository, delete_by_href_monitor,
  get_all_distributions, get_all_remotes, get_all_repos, get_repo,
  get_signing_service, kind_from_href, monitor_task,
  new_distribution_monitor, new_publication, new_remote, new_repo,
  update_distribution_monitor, update_remote_monitor,
  update_repo_monitor,
};
use regex::Regex;
use serde_json::Value;

use crate::{
  config::CoreConfig,
  error::{Error, Result},
  helpers::{
    is_internal_url, name_matches, new_pulp_client,
    repo_type_from_kind, sync_scheme,
  },
};

/// Inputs for the idempotent remote + repository + distribution
/// upsert. The description must carry a `base_url:<prefix>` token.
#[derive(Debug, Clone)]
pub struct RepoUpsert {
  pub name: String,
  pub description: String,
  pub repo_type: RepoKind,
  pub url: Option<String>,
  pub username: Option<String>,
  pub password: Option<String>,
  pub proxy_url: Option<String>,
  pub tls_validation: bool,
  pub ca_cert: Option<String>,
  pub client_cert: Option<String>,
  pub client_key: Option<String>,
  pub distributions: Option<String>,
  pub components: Option<String>,
  pub architectures: Option<String>,
  pub ignore_missing_package_indices: bool,
}

impl Default for RepoUpsert {
  fn default() -> Self {
    Self {
      name: String::new(),
      description: String::new(),
      repo_type: RepoKind::Rpm,
      url: None,
      username: None,
      password: None,
      proxy_url: None,
      tls_validation: false,
      ca_cert: None,
      client_cert: None,
      client_key: None,
      distributions: None,
      components: None,
      architectures: None,
      ignore_missing_package_indices: false,
    }
  }
}

/// Carries out creation and updates of repos and their associated
/// remotes, distributions and publications on one pulp server.
pub struct PulpManager {
  db: DbClient,
  config: Arc<CoreConfig>,
  pub pulp_server: PulpServer,
  pub client: Pulp3Client,
  deb_signing_service_href: Option<String>,
  root_ca: Option<String>,
  feed_http: reqwest::Client,
}

impl PulpManager {
  pub async fn new(
    db: DbClient,
    config: Arc<CoreConfig>,
    name: &str,
  ) -> Result<Self> {
    let mut conn = db.conn().await?;
    let pulp_server =
      PulpServerRepository::get_by_name(&mut conn, name)
        .await?
        .ok_or_else(|| {
          Error::NotFound(format!("pulp server {name}"))
        })?;
    drop(conn);

    let client = new_pulp_client(&pulp_server, &config).await?;

    let deb_signing_service_href = match &config
      .pulp
      .deb_signing_service
    {
      Some(service_name) => Some(
        get_signing_service(&client, service_name).await?.pulp_href,
      ),
      None => None,
    };

    let root_ca = config.root_ca().map_err(Error::Other)?;

    Ok(Self {
      db,
      config,
      pulp_server,
      client,
      deb_signing_service_href,
      root_ca,
      feed_http: reqwest::Client::new(),
    })
  }

  fn generate_base_path(
    &self,
    name: &str,
    base_url: &str,
  ) -> Result<String> {
    let base_url = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{base_url}/")
    };
    let transformed = transform_package_name(
      name,
      self.config.pulp.package_name_replacement_pattern.as_deref(),
      self.config.pulp.package_name_replacement_rule.as_deref(),
    )?;
    Ok(format!("{base_url}{transformed}"))
  }

  /// Builds the publication matching the content kind and kicks off
  /// its creation. Returns the running pulp task.
  pub async fn create_publication_from_repo_version(
    &self,
    repo_version_href: &str,
    repo_type: RepoKind,
    is_deb_flat_repo: bool,
  ) -> Result<PulpTask> {
    let publication = Publication::for_kind(
      repo_type,
      repo_version_href,
      is_deb_flat_repo,
    );
    Ok(
      new_publication(&self.client, repo_type, &publication)
        .await?,
    )
  }

  async fn get_or_create_pm_repo(
    &self,
    name: &str,
    repo_type: RepoKind,
  ) -> Result<Repo> {
    let mut conn = self.db.conn().await?;
    if let Some(repo) = RepoRepository::first(
      &mut conn,
      &FilterQuery::new().eq("name", name),
    )
    .await?
    {
      return Ok(repo);
    }
    drop(conn);
    tracing::debug!("adding repo {name} to database");
    let mut tx = self.db.begin().await?;
    let repo = RepoRepository::add(
      &mut tx,
      &NewRepo {
        name: name.to_string(),
        repo_type: repo_type_from_kind(repo_type),
      },
    )
    .await?;
    tx.commit().await?;
    Ok(repo)
  }

  /// TLS policy: internal remotes always validate against the
  /// configured root CA; otherwise the config-level override wins
  /// over the caller's flag.
  fn remote_tls_policy(
    &self,
    url: &str,
    requested: bool,
    ca_cert: Option<String>,
  ) -> (bool, Option<String>) {
    let mut tls_validation = self
      .config
      .pulp
      .remote_tls_validation
      .unwrap_or(requested);
    let mut ca_cert = ca_cert;
    if is_internal_url(url, &self.config) {
      tls_validation = true;
      ca_cert = self.root_ca.clone();
    }
    (tls_validation, ca_cert)
  }

  fn build_remote(&self, upsert: &RepoUpsert, url: &str) -> Remote {
    let (tls_validation, ca_cert) = self.remote_tls_policy(
      url,
      upsert.tls_validation,
      upsert.ca_cert.clone(),
    );
    let mut remote = Remote {
      name: upsert.name.clone(),
      url: url.to_string(),
      ca_cert,
      client_cert: upsert.client_cert.clone(),
      client_key: upsert.client_key.clone(),
      username: upsert.username.clone(),
      password: upsert.password.clone(),
      proxy_url: upsert.proxy_url.clone(),
      tls_validation: Some(tls_validation),
      policy: Some("immediate".into()),
      sock_connect_timeout: Some(
        self.config.remotes.sock_connect_timeout,
      ),
      sock_read_timeout: Some(
        self.config.remotes.sock_read_timeout,
      ),
      ..Default::default()
    };
    if upsert.repo_type == RepoKind::Deb {
      remote.distributions = upsert.distributions.clone();
      remote.components = upsert.components.clone();
      remote.architectures = upsert.architectures.clone();
      remote.ignore_missing_package_indices =
        Some(upsert.ignore_missing_package_indices);
    }
    remote
  }

  async fn create_remote(
    &self,
    upsert: &RepoUpsert,
    url: &str,
  ) -> Result<Remote> {
    tracing::debug!(
      "attempting to create remote {} on {}",
      upsert.name,
      self.pulp_server.name
    );
    let remote = self.build_remote(upsert, url);
    Ok(new_remote(&self.client, upsert.repo_type, &remote).await?)
  }

  async fn update_remote(
    &self,
    existing: &Remote,
    upsert: &RepoUpsert,
    url: &str,
  ) -> Result<Remote> {
    let mut desired = self.build_remote(upsert, url);
    desired.pulp_href = existing.pulp_href.clone();

    if remote_needs_update(existing, &desired) {
      tracing::debug!(
        "updating remote {:?} on {}",
        existing.pulp_href,
        self.pulp_server.name
      );
      update_remote_monitor(&self.client, &desired).await?;
    } else {
      tracing::debug!(
        "no updates required for remote {:?} on {}",
        existing.pulp_href,
        self.pulp_server.name
      );
    }
    Ok(desired)
  }

  async fn create_repo(
    &self,
    upsert: &RepoUpsert,
    remote_href: Option<&str>,
  ) -> Result<Repository> {
    let mut repo = Repository {
      name: upsert.name.clone(),
      description: Some(upsert.description.clone()),
      remote: remote_href.map(Into::into),
      ..Default::default()
    };
    if upsert.repo_type == RepoKind::Deb {
      repo.signing_service = self.deb_signing_service_href.clone();
    }
    tracing::debug!(
      "create repo on {}: {}",
      self.pulp_server.name,
      repo.name
    );
    Ok(new_repo(&self.client, upsert.repo_type, &repo).await?)
  }

  async fn update_repo(
    &self,
    mut existing: Repository,
    upsert: &RepoUpsert,
    remote_href: Option<&str>,
  ) -> Result<Repository> {
    let mut updates_needed = false;

    if existing.description.as_deref()
      != Some(upsert.description.as_str())
    {
      existing.description = Some(upsert.description.clone());
      updates_needed = true;
    }
    if existing.remote.as_deref() != remote_href {
      existing.remote = remote_href.map(Into::into);
      updates_needed = true;
    }
    if upsert.repo_type == RepoKind::Deb
      && self.deb_signing_service_href.is_some()
      && existing.signing_service != self.deb_signing_service_href
    {
      existing.signing_service =
        self.deb_signing_service_href.clone();
      updates_needed = true;
    }

    if updates_needed {
      tracing::debug!(
        "repo {:?} requires updates",
        existing.pulp_href
      );
      update_repo_monitor(&self.client, &existing).await?;
    }
    Ok(existing)
  }

  async fn create_distribution(
    &self,
    name: &str,
    base_path: &str,
    repo_href: &str,
    repo_type: RepoKind,
  ) -> Result<Distribution> {
    let distribution = Distribution {
      name: name.to_string(),
      base_path: base_path.to_string(),
      repository: Some(repo_href.to_string()),
      ..Default::default()
    };
    let task =
      new_distribution_monitor(&self.client, repo_type, &distribution)
        .await?;
    // The created href comes back on the task.
    let pulp_href = task
      .created_resources
      .iter()
      .find(|href| href.contains("/distributions/"))
      .cloned();
    Ok(Distribution {
      pulp_href,
      ..distribution
    })
  }

  async fn update_distribution(
    &self,
    mut existing: Distribution,
    base_path: &str,
    repo_href: Option<&str>,
  ) -> Result<Distribution> {
    let mut updates_needed = false;

    if existing.base_path != base_path {
      existing.base_path = base_path.to_string();
      updates_needed = true;
    }
    if let Some(repo_href) = repo_href {
      if existing.repository.as_deref() != Some(repo_href) {
        existing.repository = Some(repo_href.to_string());
        updates_needed = true;
      }
    }

    if updates_needed {
      tracing::debug!(
        "attempting to update distribution {:?} on {}",
        existing.pulp_href,
        self.pulp_server.name
      );
      update_distribution_monitor(&self.client, &existing).await?;
    }
    Ok(existing)
  }

  /// Creates/updates the remote (url given), repository and
  /// distribution on the pulp server, then brings the local binding
  /// row in line. All resource steps are idempotent; the DB write is
  /// one commit.
  pub async fn create_or_update_repository(
    &self,
    upsert: &RepoUpsert,
  ) -> Result<PulpServerRepo> {
    let base_url = base_url_from_description(&upsert.description)
      .ok_or_else(|| {
        Error::InvalidArgument(format!(
          "could not determine base_url for {} from description",
          upsert.name
        ))
      })?;
    let base_path =
      self.generate_base_path(&upsert.name, &base_url)?;

    let pm_repo = self
      .get_or_create_pm_repo(&upsert.name, upsert.repo_type)
      .await?;

    let mut remote = None;
    if let Some(url) = &upsert.url {
      let existing = get_all_remotes(
        &self.client,
        Some(upsert.repo_type),
        &[("name", upsert.name.clone())],
      )
      .await?;
      remote = Some(match existing.into_iter().next() {
        Some(found) => {
          self.update_remote(&found, upsert, url).await?
        }
        None => self.create_remote(upsert, url).await?,
      });
    }
    let remote_href = remote
      .as_ref()
      .and_then(|remote| remote.pulp_href.as_deref());

    let existing_repos = get_all_repos(
      &self.client,
      Some(upsert.repo_type),
      &[("name", upsert.name.clone())],
    )
    .await?;
    let repo = match existing_repos.into_iter().next() {
      Some(found) => {
        self.update_repo(found, upsert, remote_href).await?
      }
      None => self.create_repo(upsert, remote_href).await?,
    };
    let repo_href =
      repo.pulp_href.clone().ok_or_else(|| {
        Error::InvalidState(format!(
          "repository {} has no pulp_href after upsert",
          upsert.name
        ))
      })?;

    let existing_distributions = get_all_distributions(
      &self.client,
      Some(upsert.repo_type),
      &[("name", upsert.name.clone())],
    )
    .await?;
    let distribution =
      match existing_distributions.into_iter().next() {
        Some(found) => {
          self
            .update_distribution(found, &base_path, Some(&repo_href))
            .await?
        }
        None => {
          self
            .create_distribution(
              &upsert.name,
              &base_path,
              &repo_href,
              upsert.repo_type,
            )
            .await?
        }
      };

    let mut conn = self.db.conn().await?;
    let bound = PulpServerRepoRepository::first(
      &mut conn,
      &FilterQuery::new()
        .eq("pulp_server_id", self.pulp_server.id)
        .eq("repo_id", pm_repo.id),
    )
    .await?;
    drop(conn);

    let mut tx = self.db.begin().await?;
    let bound = match bound {
      Some(bound) => {
        let mut patch = PulpServerRepoPatch::default();
        if bound.repo_href.as_deref() != Some(repo_href.as_str()) {
          patch.repo_href = Some(Some(repo_href.clone()));
        }
        if let Some(remote) = &remote {
          if bound.remote_href != remote.pulp_href {
            patch.remote_href = Some(remote.pulp_href.clone());
            patch.remote_feed = Some(upsert.url.clone());
          }
        }
        if bound.distribution_href != distribution.pulp_href {
          patch.distribution_href =
            Some(distribution.pulp_href.clone());
        }
        if !patch.is_empty() {
          tracing::debug!(
            "updating PulpServerRepo {} in database",
            bound.id
          );
          PulpServerRepoRepository::update(
            &mut tx, bound.id, &patch,
          )
          .await?;
        }
        bound.id
      }
      None => {
        tracing::debug!(
          "add PulpServerRepo {} for {}",
          upsert.name,
          self.pulp_server.name
        );
        PulpServerRepoRepository::add(
          &mut tx,
          &NewPulpServerRepo {
            pulp_server_id: self.pulp_server.id,
            repo_id: pm_repo.id,
            repo_href: Some(repo_href.clone()),
            remote_href: remote
              .as_ref()
              .and_then(|remote| remote.pulp_href.clone()),
            remote_feed: remote
              .as_ref()
              .map(|remote| remote.url.clone()),
            distribution_href: distribution.pulp_href.clone(),
          },
        )
        .await?
        .id
      }
    };
    tx.commit().await?;

    let mut conn = self.db.conn().await?;
    let bound =
      PulpServerRepoRepository::get_by_id(&mut conn, bound)
        .await?
        .ok_or_else(|| {
          Error::NotFound(format!(
            "pulp server repo binding for {}",
            upsert.name
          ))
        })?;
    Ok(bound)
  }

  /// Searches one repo version for package content. At least one of
  /// name/version/sha256 is required; debs key the package name
  /// under `package`.
  pub async fn find_repo_version_package_content(
    &self,
    repo_version_href: &str,
    name: Option<&str>,
    version: Option<&str>,
    sha256: Option<&str>,
  ) -> Result<Vec<Value>> {
    if name.is_none() && version.is_none() && sha256.is_none() {
      return Err(Error::InvalidArgument(
        "name, version or sha256 must be specified".into(),
      ));
    }
    let kind =
      kind_from_href(repo_version_href).ok_or_else(|| {
        Error::InvalidArgument(format!(
          "could not determine content kind from {repo_version_href}"
        ))
      })?;

    let mut params = vec![
      ("repository_version", repo_version_href.to_string()),
      (
        "fields",
        "package,pkgId,name,sha256,pulp_href,version".to_string(),
      ),
    ];
    if let Some(name) = name {
      params.push((kind.package_name_field(), name.to_string()));
    }
    if let Some(version) = version {
      params.push(("version", version.to_string()));
    }
    if let Some(sha256) = sha256 {
      params.push(("sha256", sha256.to_string()));
    }

    let path = format!(
      "/pulp/api/v3/content/{}/packages/",
      kind.plugin()
    );
    let params: Vec<(&str, String)> = params;
    Ok(self.client.get_page_results(&path, &params).await?)
  }

  /// Same search against the latest version of a repo.
  pub async fn find_repo_package_content(
    &self,
    repo_href: &str,
    name: Option<&str>,
    version: Option<&str>,
    sha256: Option<&str>,
  ) -> Result<Vec<Value>> {
    let repo = get_repo(&self.client, repo_href).await?;
    let latest =
      repo.latest_version_href.ok_or_else(|| {
        Error::InvalidState(format!(
          "repository {repo_href} has no latest version"
        ))
      })?;
    self
      .find_repo_version_package_content(
        &latest, name, version, sha256,
      )
      .await
  }

  /// Deletes the repository, remote and distribution resources of a
  /// bound repo from the pulp server, waiting on each removal task.
  pub async fn delete_repository(
    &self,
    bound: &PulpServerRepoDetail,
  ) -> Result<()> {
    if let Some(href) = &bound.distribution_href {
      delete_by_href_monitor(&self.client, href).await?;
    }
    if let Some(href) = &bound.remote_href {
      delete_by_href_monitor(&self.client, href).await?;
    }
    if let Some(href) = &bound.repo_href {
      tracing::debug!(
        "deleting repository {href} on {}",
        self.pulp_server.name
      );
      delete_by_href_monitor(&self.client, href).await?;
    }
    Ok(())
  }

  /// Waits on an outstanding pulp task; thin passthrough used by
  /// the ad-hoc task functions.
  pub async fn monitor(&self, task_href: &str) -> Result<PulpTask> {
    Ok(monitor_task(&self.client, task_href).await?)
  }

  // ======================
  //  SLAVE SYNC FROM PEER
  // ======================

  fn generate_feed_from_distribution(
    &self,
    source_name: &str,
    distribution: &Distribution,
  ) -> String {
    format!(
      "{}://{}/pulp/content/{}",
      sync_scheme(&self.config),
      source_name,
      distribution.base_path
    )
  }

  async fn get_repo_file_list_from_url(
    &self,
    url: &str,
  ) -> Result<Vec<String>> {
    let url = if url.ends_with('/') {
      url.to_string()
    } else {
      format!("{url}/")
    };

    let mut retry_count = 0;
    let body = loop {
      let response = self
        .feed_http
        .get(&url)
        .send()
        .await
        .map_err(|e| {
          Error::Other(anyhow::anyhow!(
            "could not fetch {url}: {e}"
          ))
        })?;
      let status = response.status();
      if status.as_u16() == 404 {
        return Err(Error::Other(anyhow::anyhow!(
          "could not fetch {url}, got 404. \
           Repo sync maybe failed on primary"
        )));
      }
      if status.is_success() {
        break response.text().await.map_err(|e| {
          Error::Other(anyhow::anyhow!(
            "could not read body of {url}: {e}"
          ))
        })?;
      }
      if retry_count == 3 {
        return Err(Error::Other(anyhow::anyhow!(
          "could not fetch {url}, status code {status}"
        )));
      }
      retry_count += 1;
    };

    Ok(parse_listing_links(&body))
  }

  /// Walks the `/dists/` tree of a deb repo feed and returns the
  /// distribution paths that carry a Release file.
  async fn get_apt_distributions_from_url(
    &self,
    url: &str,
  ) -> Result<Vec<String>> {
    let mut url = url.to_string();
    if self.config.pulp.use_https_for_sync {
      url = url.replace("http://", "https://");
    }
    // Pulp's content app answers on 24816 behind the front proxy.
    url = url.replace(":24816", "");
    if !url.contains("dists/") {
      url = format!("{}/dists/", url.trim_end_matches('/'));
    }
    if !url.ends_with('/') {
      url.push('/');
    }
    self.walk_apt_distributions(url).await
  }

  fn walk_apt_distributions(
    &self,
    url: String,
  ) -> futures_util::future::BoxFuture<'_, Result<Vec<String>>> {
    Box::pin(async move {
      let mut distributions = Vec::new();
      let entries = self.get_repo_file_list_from_url(&url).await?;

      for entry in entries {
        let entry_url = format!("{url}{entry}/");
        let contents =
          self.get_repo_file_list_from_url(&entry_url).await?;
        if contents.iter().any(|name| {
          name == "Release" || name == "Release.gpg"
        }) {
          distributions.push(entry);
        } else {
          let children =
            self.walk_apt_distributions(entry_url).await?;
          for child in children {
            distributions.push(format!("{entry}/{child}"));
          }
        }
      }
      Ok(distributions)
    })
  }

  async fn create_or_update_repository_from_source(
    &self,
    source_repo: &Repository,
    source_distribution: &Distribution,
    source_name: &str,
  ) -> Result<()> {
    let kind = source_repo
      .pulp_href
      .as_deref()
      .and_then(kind_from_href)
      .ok_or_else(|| {
        Error::InvalidState(format!(
          "could not determine kind of source repo {}",
          source_repo.name
        ))
      })?;

    let mut url = self.generate_feed_from_distribution(
      source_name,
      source_distribution,
    );
    let mut distributions = None;

    if kind == RepoKind::Deb {
      let base_url = source_distribution
        .base_url
        .clone()
        .unwrap_or_else(|| url.clone());
      let found =
        self.get_apt_distributions_from_url(&base_url).await?;
      if found.is_empty() {
        tracing::error!(
          "no distributions found for deb {}",
          source_repo.name
        );
        return Ok(());
      }
      distributions = Some(found.join(" "));
    }
    if kind == RepoKind::File {
      url.push_str("/PULP_MANIFEST");
    }

    tracing::debug!(
      "create/update repo from source {} url {url}",
      source_repo.name
    );
    self
      .create_or_update_repository(&RepoUpsert {
        name: source_repo.name.clone(),
        description: source_repo
          .description
          .clone()
          .unwrap_or_default(),
        repo_type: kind,
        url: Some(url),
        distributions,
        ..Default::default()
      })
      .await?;
    Ok(())
  }

  /// Mirrors repo definitions from another managed pulp server onto
  /// this one, so that slaves sync from the primary instead of the
  /// internet.
  pub async fn add_repos_from_pulp_server(
    &self,
    source: &str,
    regex_include: Option<&str>,
    regex_exclude: Option<&str>,
  ) -> Result<()> {
    if self.pulp_server.name == source {
      return Err(Error::InvalidArgument(
        "source cannot be the pulp server this service manages"
          .into(),
      ));
    }

    let mut conn = self.db.conn().await?;
    let source_server =
      PulpServerRepository::get_by_name(&mut conn, source)
        .await?
        .ok_or_else(|| {
          Error::NotFound(format!("pulp server {source}"))
        })?;
    drop(conn);

    let source_client =
      new_pulp_client(&source_server, &self.config).await?;

    tracing::info!("retrieving source repositories on {source}");
    let source_repos: HashMap<String, Repository> =
      get_all_repos(&source_client, None, &[])
        .await?
        .into_iter()
        .map(|repo| (repo.name.clone(), repo))
        .collect();
    tracing::info!("retrieving source distributions on {source}");
    let source_distributions =
      get_all_distributions(&source_client, None, &[]).await?;

    for distribution in source_distributions {
      if !name_matches(
        &distribution.name,
        regex_include,
        regex_exclude,
      )? {
        continue;
      }
      let Some(source_repo) = source_repos.get(&distribution.name)
      else {
        continue;
      };
      self
        .create_or_update_repository_from_source(
          source_repo,
          &distribution,
          source,
        )
        .await?;
    }
    Ok(())
  }
}

/// `base_url:<prefix>` token out of a repo description.
pub fn base_url_from_description(
  description: &str,
) -> Option<String> {
  description
    .split_once("base_url:")
    .map(|(_, rest)| rest.trim().to_string())
    .filter(|base_url| !base_url.is_empty())
}

/// Applies the configured rename rule when the pattern matches the
/// name from its start; the rule's `{group}` placeholders are filled
/// from the pattern's named captures. A named group that did not
/// participate in the match fills in empty; a placeholder the
/// pattern never defines is a configuration error.
pub fn transform_package_name(
  name: &str,
  pattern: Option<&str>,
  rule: Option<&str>,
) -> Result<String> {
  let (Some(pattern), Some(rule)) = (pattern, rule) else {
    return Ok(name.to_string());
  };
  if pattern.is_empty() {
    return Ok(name.to_string());
  }
  let regex =
    Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
      Error::InvalidArgument(format!(
        "invalid package_name_replacement_pattern: {e}"
      ))
    })?;
  let Some(captures) = regex.captures(name) else {
    return Ok(name.to_string());
  };
  let mut output = rule.to_string();
  for group in regex.capture_names().flatten() {
    let capture = captures
      .name(group)
      .map(|capture| capture.as_str())
      .unwrap_or_default();
    output = output.replace(&format!("{{{group}}}"), capture);
  }
  if let Some(unknown) = leftover_placeholder(&output) {
    return Err(Error::InvalidArgument(format!(
      "package_name_replacement_rule references {{{unknown}}}, \
       which package_name_replacement_pattern does not capture"
    )));
  }
  Ok(output)
}

fn leftover_placeholder(rule: &str) -> Option<&str> {
  let regex =
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
  regex
    .captures(rule)
    .map(|captures| captures.get(1).unwrap().as_str())
}

fn trimmed(value: &Option<String>) -> Option<&str> {
  value.as_deref().map(str::trim)
}

/// Pulp pads some fields (e.g. ca_cert) with trailing newlines, so
/// comparisons trim before deciding an update is needed.
fn remote_needs_update(existing: &Remote, desired: &Remote) -> bool {
  existing.url.trim() != desired.url.trim()
    || trimmed(&existing.ca_cert) != trimmed(&desired.ca_cert)
    || trimmed(&existing.client_cert)
      != trimmed(&desired.client_cert)
    || trimmed(&existing.client_key) != trimmed(&desired.client_key)
    || trimmed(&existing.username) != trimmed(&desired.username)
    || trimmed(&existing.proxy_url) != trimmed(&desired.proxy_url)
    || existing.tls_validation != desired.tls_validation
    || existing.sock_connect_timeout != desired.sock_connect_timeout
    || existing.sock_read_timeout != desired.sock_read_timeout
    || trimmed(&existing.distributions)
      != trimmed(&desired.distributions)
    || trimmed(&existing.components) != trimmed(&desired.components)
    || trimmed(&existing.architectures)
      != trimmed(&desired.architectures)
    || existing.ignore_missing_package_indices
      != desired.ignore_missing_package_indices
}

/// Anchors in pulp's directory listing pages; `.` and `..` never
/// match.
fn parse_listing_links(body: &str) -> Vec<String> {
  let regex =
    Regex::new("<a href=\"([A-Za-z0-9-_.+~]+)/?\">").unwrap();
  regex
    .captures_iter(body)
    .map(|captures| captures[1].to_string())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn base_url_token_extraction() {
    assert_eq!(
      base_url_from_description(
        "epel 9 mirror - platform - base_url:el9-x86_64"
      )
      .as_deref(),
      Some("el9-x86_64")
    );
    assert_eq!(base_url_from_description("no token here"), None);
  }

  #[test]
  fn name_transform_round_trip() {
    // Unset pattern leaves the name untouched.
    assert_eq!(
      transform_package_name("ext-epel9", None, None).unwrap(),
      "ext-epel9"
    );

    // Matching pattern formats the rule from named groups.
    let pattern = r"snap-(?P<date>\d{4}-\d{2})-(?P<rest>.+)";
    let rule = "{rest}-{date}";
    assert_eq!(
      transform_package_name(
        "snap-2024-03-ext-jammy",
        Some(pattern),
        Some(rule)
      )
      .unwrap(),
      "ext-jammy-2024-03"
    );

    // Non-matching name passes through verbatim.
    assert_eq!(
      transform_package_name(
        "ext-epel9",
        Some(pattern),
        Some(rule)
      )
      .unwrap(),
      "ext-epel9"
    );
  }

  #[test]
  fn name_transform_optional_group_fills_empty() {
    // The release group is optional and absent here; its
    // placeholder resolves to empty rather than surviving as a
    // literal {release} token.
    let pattern =
      r"snap-(?P<date>\d{4}-\d{2})(?:-r(?P<release>\d+))?-";
    let rule = "{date}{release}";
    assert_eq!(
      transform_package_name(
        "snap-2024-03-ext-jammy",
        Some(pattern),
        Some(rule)
      )
      .unwrap(),
      "2024-03"
    );
    // With the group participating, its text lands in the output.
    assert_eq!(
      transform_package_name(
        "snap-2024-03-r1-ext-jammy",
        Some(pattern),
        Some(rule)
      )
      .unwrap(),
      "2024-031"
    );
  }

  #[test]
  fn name_transform_unknown_placeholder_is_rejected() {
    let pattern = r"snap-(?P<date>\d{4}-\d{2})-";
    let rule = "{date}-{channel}";
    let err = transform_package_name(
      "snap-2024-03-ext-jammy",
      Some(pattern),
      Some(rule),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
  }

  #[test]
  fn listing_links_skip_parent_dir() {
    let body = concat!(
      "<a href=\"../\">../</a>\n",
      "<a href=\"focal-backports/\">focal-backports/</a>\n",
      "<a href=\"Release\">Release</a>"
    );
    assert_eq!(
      parse_listing_links(body),
      vec!["focal-backports".to_string(), "Release".to_string()]
    );
  }

  #[test]
  fn remote_diffing_trims_whitespace() {
    let existing = Remote {
      name: "r".into(),
      url: "https://mirror.example.org/".into(),
      ca_cert: Some("CERT\n".into()),
      tls_validation: Some(true),
      ..Default::default()
    };
    let mut desired = existing.clone();
    desired.ca_cert = Some("CERT".into());
    assert!(!remote_needs_update(&existing, &desired));

    desired.url = "https://other.example.org/".into();
    assert!(remote_needs_update(&existing, &desired));
  }
}
