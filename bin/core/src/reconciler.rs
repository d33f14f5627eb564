use std::{collections::HashMap, sync::Arc};

use database::{
  DbClient, NewPulpServerRepo, NewRepo, PulpServer,
  PulpServerRepoDetail, PulpServerRepoPatch,
  PulpServerRepoRepository, PulpServerRepository, Repo,
  RepoRepository, FilterQuery,
};
use pulp_client::{
  Pulp3Client, get_all_distributions, get_all_remotes,
  get_all_repos, kind_from_href,
};

use crate::{
  config::CoreConfig,
  error::{Error, Result},
  helpers::{new_pulp_client, repo_type_from_kind},
};

/// One repository as it exists on the pulp server, with its linked
/// remote and distribution resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PulpRepoInstance {
  pub name: String,
  pub repo_href: String,
  pub remote_href: Option<String>,
  pub remote_feed: Option<String>,
  pub distribution_href: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
  pub added: usize,
  pub updated: usize,
  pub deleted: usize,
}

impl ReconcileSummary {
  pub fn writes(&self) -> usize {
    self.added + self.updated + self.deleted
  }
}

/// Brings the local PulpServerRepo rows in line with what actually
/// exists on the pulp server.
pub struct PulpReconciler {
  db: DbClient,
  pulp_server: PulpServer,
  client: Pulp3Client,
}

impl PulpReconciler {
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
    Ok(Self {
      db,
      pulp_server,
      client,
    })
  }

  /// Fetches repositories, remotes and distributions and links them
  /// into instances keyed by repo name. Remote linkage prefers the
  /// repository's `remote` href, falling back to a name match.
  async fn get_pulp_server_repo_instances(
    &self,
  ) -> Result<HashMap<String, PulpRepoInstance>> {
    let repos = get_all_repos(&self.client, None, &[]).await?;
    let remotes = get_all_remotes(&self.client, None, &[]).await?;
    let distributions =
      get_all_distributions(&self.client, None, &[]).await?;

    let mut remotes_by_href = HashMap::new();
    let mut remotes_by_name = HashMap::new();
    for remote in &remotes {
      if let Some(href) = &remote.pulp_href {
        remotes_by_href.insert(href.clone(), remote);
      }
      remotes_by_name.insert(remote.name.clone(), remote);
    }
    let distributions_by_name: HashMap<_, _> = distributions
      .iter()
      .map(|distribution| {
        (distribution.name.clone(), distribution)
      })
      .collect();

    let mut instances = HashMap::new();
    for repo in repos {
      let Some(repo_href) = repo.pulp_href.clone() else {
        continue;
      };
      let remote = repo
        .remote
        .as_ref()
        .and_then(|href| remotes_by_href.get(href).copied())
        .or_else(|| remotes_by_name.get(&repo.name).copied());
      instances.insert(
        repo.name.clone(),
        PulpRepoInstance {
          name: repo.name.clone(),
          repo_href,
          remote_href: remote
            .and_then(|remote| remote.pulp_href.clone()),
          remote_feed: remote.map(|remote| remote.url.clone()),
          distribution_href: distributions_by_name
            .get(&repo.name)
            .and_then(|distribution| {
              distribution.pulp_href.clone()
            }),
        },
      );
    }
    Ok(instances)
  }

  /// Inserts repo names the local table has never seen, deriving the
  /// content kind from the repository href. Returns all known repos
  /// keyed by name.
  async fn add_missing_repos(
    &self,
    instances: &HashMap<String, PulpRepoInstance>,
  ) -> Result<HashMap<String, Repo>> {
    let mut conn = self.db.conn().await?;
    let known =
      RepoRepository::filter(&mut conn, &FilterQuery::new())
        .await?;
    let known_names: std::collections::HashSet<_> =
      known.iter().map(|repo| repo.name.clone()).collect();

    let missing: Vec<NewRepo> = instances
      .values()
      .filter(|instance| !known_names.contains(&instance.name))
      .filter_map(|instance| {
        let kind = kind_from_href(&instance.repo_href)?;
        Some(NewRepo {
          name: instance.name.clone(),
          repo_type: repo_type_from_kind(kind),
        })
      })
      .collect();

    let mut repos: HashMap<String, Repo> = known
      .into_iter()
      .map(|repo| (repo.name.clone(), repo))
      .collect();

    if !missing.is_empty() {
      tracing::info!(
        "adding {} repo names for {}",
        missing.len(),
        self.pulp_server.name
      );
      let mut tx = self.db.begin().await?;
      let added =
        RepoRepository::bulk_add(&mut tx, &missing).await?;
      tx.commit().await?;
      for repo in added {
        repos.insert(repo.name.clone(), repo);
      }
    }

    Ok(repos)
  }

  pub async fn reconcile(&self) -> Result<ReconcileSummary> {
    tracing::info!(
      "reconciling repos for {}",
      self.pulp_server.name
    );
    let instances = self.get_pulp_server_repo_instances().await?;
    let repos = self.add_missing_repos(&instances).await?;

    let mut conn = self.db.conn().await?;
    let existing = PulpServerRepoRepository::for_server(
      &mut conn,
      self.pulp_server.id,
    )
    .await?;
    drop(conn);

    let to_add = calculate_repos_to_add(
      self.pulp_server.id,
      &repos,
      &instances,
      &existing,
    );
    let to_update = calculate_repos_to_update(&existing, &instances);
    let to_delete = calculate_repos_to_delete(&existing, &instances);

    tracing::debug!(
      "{}: {} to add, {} to update, {} to delete",
      self.pulp_server.name,
      to_add.len(),
      to_update.len(),
      to_delete.len()
    );

    let summary = ReconcileSummary {
      added: to_add.len(),
      updated: to_update.len(),
      deleted: to_delete.len(),
    };

    let mut tx = self.db.begin().await?;
    if !to_add.is_empty() {
      PulpServerRepoRepository::bulk_add(&mut tx, &to_add).await?;
    }
    if !to_update.is_empty() {
      PulpServerRepoRepository::bulk_update(&mut tx, &to_update)
        .await?;
    }
    for id in &to_delete {
      PulpServerRepoRepository::delete_by_id(&mut tx, *id).await?;
    }
    tx.commit().await?;

    tracing::info!(
      "successfully reconciled repos for {}",
      self.pulp_server.name
    );
    Ok(summary)
  }
}

fn calculate_repos_to_add(
  pulp_server_id: i64,
  repos: &HashMap<String, Repo>,
  instances: &HashMap<String, PulpRepoInstance>,
  existing: &[PulpServerRepoDetail],
) -> Vec<NewPulpServerRepo> {
  let existing_repo_ids: std::collections::HashSet<i64> =
    existing.iter().map(|bound| bound.repo_id).collect();

  let mut to_add: Vec<NewPulpServerRepo> = instances
    .values()
    .filter_map(|instance| {
      let repo = repos.get(&instance.name)?;
      if existing_repo_ids.contains(&repo.id) {
        return None;
      }
      Some(NewPulpServerRepo {
        pulp_server_id,
        repo_id: repo.id,
        repo_href: Some(instance.repo_href.clone()),
        remote_href: instance.remote_href.clone(),
        remote_feed: instance.remote_feed.clone(),
        distribution_href: instance.distribution_href.clone(),
      })
    })
    .collect();
  to_add.sort_by_key(|row| row.repo_id);
  to_add
}

fn calculate_repos_to_update(
  existing: &[PulpServerRepoDetail],
  instances: &HashMap<String, PulpRepoInstance>,
) -> Vec<(i64, PulpServerRepoPatch)> {
  existing
    .iter()
    .filter_map(|bound| {
      let instance = instances.get(&bound.repo_name)?;
      let mut patch = PulpServerRepoPatch::default();
      if bound.repo_href.as_deref()
        != Some(instance.repo_href.as_str())
      {
        patch.repo_href = Some(Some(instance.repo_href.clone()));
      }
      if bound.remote_href != instance.remote_href {
        patch.remote_href = Some(instance.remote_href.clone());
      }
      if bound.remote_feed != instance.remote_feed {
        patch.remote_feed = Some(instance.remote_feed.clone());
      }
      if bound.distribution_href != instance.distribution_href {
        patch.distribution_href =
          Some(instance.distribution_href.clone());
      }
      if patch.is_empty() {
        None
      } else {
        Some((bound.id, patch))
      }
    })
    .collect()
}

fn calculate_repos_to_delete(
  existing: &[PulpServerRepoDetail],
  instances: &HashMap<String, PulpRepoInstance>,
) -> Vec<i64> {
  existing
    .iter()
    .filter(|bound| !instances.contains_key(&bound.repo_name))
    .map(|bound| bound.id)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use database::RepoType;

  fn detail(
    id: i64,
    repo_id: i64,
    name: &str,
    repo_href: Option<&str>,
    distribution_href: Option<&str>,
  ) -> PulpServerRepoDetail {
    PulpServerRepoDetail {
      id,
      pulp_server_id: 1,
      repo_id,
      repo_href: repo_href.map(Into::into),
      remote_href: None,
      remote_feed: None,
      distribution_href: distribution_href.map(Into::into),
      repo_sync_health: None,
      repo_sync_health_date: None,
      repo_name: name.into(),
      repo_type: RepoType::Rpm,
    }
  }

  fn instance(
    name: &str,
    repo_href: &str,
    distribution_href: Option<&str>,
  ) -> PulpRepoInstance {
    PulpRepoInstance {
      name: name.into(),
      repo_href: repo_href.into(),
      remote_href: None,
      remote_feed: None,
      distribution_href: distribution_href.map(Into::into),
    }
  }

  #[test]
  fn adds_updates_and_deletes_are_computed() {
    // Server now has rpm-1 (distribution appeared) and rpm-2 (new);
    // rpm-gone no longer exists upstream.
    let instances: HashMap<_, _> = [
      (
        "rpm-1".to_string(),
        instance("rpm-1", "/r/rpm/1", Some("/d/rpm/7")),
      ),
      (
        "rpm-2".to_string(),
        instance("rpm-2", "/r/rpm/2", None),
      ),
    ]
    .into();

    let repos: HashMap<_, _> = [
      (
        "rpm-1".to_string(),
        Repo {
          id: 10,
          name: "rpm-1".into(),
          repo_type: RepoType::Rpm,
        },
      ),
      (
        "rpm-2".to_string(),
        Repo {
          id: 11,
          name: "rpm-2".into(),
          repo_type: RepoType::Rpm,
        },
      ),
    ]
    .into();

    let existing = vec![
      detail(100, 10, "rpm-1", Some("/r/rpm/1"), None),
      detail(101, 12, "rpm-gone", Some("/r/rpm/9"), None),
    ];

    let adds =
      calculate_repos_to_add(1, &repos, &instances, &existing);
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].repo_id, 11);
    assert_eq!(adds[0].repo_href.as_deref(), Some("/r/rpm/2"));

    let updates = calculate_repos_to_update(&existing, &instances);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, 100);
    assert_eq!(
      updates[0].1.distribution_href,
      Some(Some("/d/rpm/7".into()))
    );
    assert!(updates[0].1.repo_href.is_none());

    let deletes = calculate_repos_to_delete(&existing, &instances);
    assert_eq!(deletes, vec![101]);
  }

  #[test]
  fn unchanged_state_produces_no_writes() {
    let instances: HashMap<_, _> = [(
      "rpm-1".to_string(),
      instance("rpm-1", "/r/rpm/1", Some("/d/rpm/7")),
    )]
    .into();
    let repos: HashMap<_, _> = [(
      "rpm-1".to_string(),
      Repo {
        id: 10,
        name: "rpm-1".into(),
        repo_type: RepoType::Rpm,
      },
    )]
    .into();
    let existing = vec![detail(
      100,
      10,
      "rpm-1",
      Some("/r/rpm/1"),
      Some("/d/rpm/7"),
    )];

    assert!(
      calculate_repos_to_add(1, &repos, &instances, &existing)
        .is_empty()
    );
    assert!(
      calculate_repos_to_update(&existing, &instances).is_empty()
    );
    assert!(
      calculate_repos_to_delete(&existing, &instances).is_empty()
    );
  }
}
