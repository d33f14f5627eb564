use anyhow::Context;
use serde_json::Value;

use crate::{
  config::CoreConfig,
  error::{Error, Result},
};

/// Minimal KV v2 reader. Auth is either ambient (vault agent in
/// front of the address) or a token from the environment.
pub struct VaultClient {
  addr: String,
  namespace: Option<String>,
  token: Option<String>,
  http: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct KvResponse {
  data: KvData,
}

#[derive(serde::Deserialize)]
struct KvData {
  data: Value,
}

impl VaultClient {
  pub fn from_config(config: &CoreConfig) -> Result<Self> {
    let addr =
      config.vault.vault_addr.clone().ok_or_else(|| {
        Error::InvalidArgument(
          "vault.vault_addr is not configured".into(),
        )
      })?;
    Ok(Self {
      addr,
      namespace: config.vault.repo_secret_namespace.clone(),
      token: config.vault_token.clone(),
      http: reqwest::Client::new(),
    })
  }

  /// Reads the secret at `path` in the `kv` engine and returns the
  /// inner data map.
  pub async fn read_kv_secret(
    &self,
    path: &str,
    kv: &str,
  ) -> Result<Value> {
    let url = format!(
      "{}/v1/{}/data/{}",
      self.addr.trim_end_matches('/'),
      kv,
      path.trim_start_matches('/')
    );
    let mut request = self.http.get(&url);
    if let Some(namespace) = &self.namespace {
      request = request.header("X-Vault-Namespace", namespace);
    }
    if let Some(token) = &self.token {
      request = request.header("X-Vault-Token", token);
    }
    let response = request
      .send()
      .await
      .with_context(|| format!("vault request to {url} failed"))?;
    if !response.status().is_success() {
      return Err(
        anyhow::anyhow!(
          "vault returned {} for {url}",
          response.status()
        )
        .into(),
      );
    }
    let body: KvResponse = response
      .json()
      .await
      .context("failed to decode vault response")?;
    Ok(body.data.data)
  }
}
