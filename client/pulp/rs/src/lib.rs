use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

mod distributions;
mod publications;
mod remotes;
mod repositories;
mod resources;
mod signing;
mod tasks;

pub use distributions::*;
pub use publications::*;
pub use remotes::*;
pub use repositories::*;
pub use resources::*;
pub use signing::*;
pub use tasks::*;

#[derive(Debug, thiserror::Error)]
pub enum PulpError {
  #[error("pulp api request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("pulp returned {status}: {body}")]
  Api { status: u16, body: String },

  #[error("failed to decode pulp response: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("invalid pulp url: {0}")]
  Url(#[from] url::ParseError),

  #[error("pulp task {href} finished {state}")]
  TaskFailed { href: String, state: PulpTaskState },

  #[error("timed out waiting on pulp task {0}")]
  TaskTimeout(String),

  #[error("could not find signing service {0}")]
  MissingSigningService(String),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
  pub username: Option<String>,
  pub password: Option<String>,
  /// PEM bundle added to the trust store for the pulp server itself.
  pub root_ca_pem: Option<String>,
  pub tls_validation: bool,
  pub connect_timeout: Duration,
  pub request_timeout: Duration,
  /// Poll cadence and ceiling for [monitor_task].
  pub poll_interval: Duration,
  pub max_wait: Duration,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      username: None,
      password: None,
      root_ca_pem: None,
      tls_validation: true,
      connect_timeout: Duration::from_secs(10),
      request_timeout: Duration::from_secs(120),
      poll_interval: Duration::from_secs(1),
      max_wait: Duration::from_secs(900),
    }
  }
}

/// Authenticated client for one pulp server, addressed by FQDN.
#[derive(Clone)]
pub struct Pulp3Client {
  base: Url,
  http: reqwest::Client,
  username: Option<String>,
  password: Option<String>,
  pub poll_interval: Duration,
  pub max_wait: Duration,
}

/// Body shape of async create/update/delete responses.
#[derive(serde::Deserialize)]
struct TaskResponse {
  task: String,
}

#[derive(serde::Deserialize)]
struct PageResponse {
  next: Option<String>,
  results: Vec<Value>,
}

impl Pulp3Client {
  pub fn new(
    name: &str,
    options: ClientOptions,
  ) -> Result<Self, PulpError> {
    let mut builder = reqwest::Client::builder()
      .connect_timeout(options.connect_timeout)
      .timeout(options.request_timeout)
      .danger_accept_invalid_certs(!options.tls_validation);
    if let Some(pem) = &options.root_ca_pem {
      builder = builder.add_root_certificate(
        reqwest::Certificate::from_pem(pem.as_bytes())?,
      );
    }
    Ok(Self {
      base: Url::parse(&format!("https://{name}"))?,
      http: builder.build()?,
      username: options.username,
      password: options.password,
      poll_interval: options.poll_interval,
      max_wait: options.max_wait,
    })
  }

  fn request(
    &self,
    method: reqwest::Method,
    url: Url,
  ) -> reqwest::RequestBuilder {
    let mut req = self.http.request(method, url);
    if let Some(username) = &self.username {
      req = req.basic_auth(username, self.password.as_deref());
    }
    req
  }

  fn url(&self, path: &str) -> Result<Url, PulpError> {
    Ok(self.base.join(path)?)
  }

  async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
  ) -> Result<T, PulpError> {
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(PulpError::Api {
        status: status.as_u16(),
        body,
      });
    }
    Ok(response.json::<T>().await?)
  }

  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    params: &[(&str, String)],
  ) -> Result<T, PulpError> {
    let response = self
      .request(reqwest::Method::GET, self.url(path)?)
      .query(params)
      .send()
      .await?;
    Self::decode(response).await
  }

  pub async fn post<T: DeserializeOwned>(
    &self,
    path: &str,
    body: &impl Serialize,
  ) -> Result<T, PulpError> {
    let response = self
      .request(reqwest::Method::POST, self.url(path)?)
      .json(body)
      .send()
      .await?;
    Self::decode(response).await
  }

  /// POST that the server answers with a task handle.
  pub async fn post_task(
    &self,
    path: &str,
    body: &impl Serialize,
  ) -> Result<String, PulpError> {
    let response: TaskResponse = self.post(path, body).await?;
    Ok(response.task)
  }

  /// PATCH that the server answers with a task handle.
  pub async fn patch_task(
    &self,
    path: &str,
    body: &impl Serialize,
  ) -> Result<String, PulpError> {
    let response = self
      .request(reqwest::Method::PATCH, self.url(path)?)
      .json(body)
      .send()
      .await?;
    let response: TaskResponse = Self::decode(response).await?;
    Ok(response.task)
  }

  /// DELETE that the server answers with a task handle.
  pub async fn delete_task(
    &self,
    path: &str,
  ) -> Result<String, PulpError> {
    let response = self
      .request(reqwest::Method::DELETE, self.url(path)?)
      .send()
      .await?;
    let response: TaskResponse = Self::decode(response).await?;
    Ok(response.task)
  }

  /// Iterates a paged listing to completion, following `next`
  /// links. Callers that only need a page should query directly.
  pub async fn get_page_results(
    &self,
    path: &str,
    params: &[(&str, String)],
  ) -> Result<Vec<Value>, PulpError> {
    let mut results = Vec::new();
    let mut page: PageResponse = self.get(path, params).await?;
    loop {
      results.append(&mut page.results);
      let Some(next) = page.next else {
        break;
      };
      let response = self
        .request(reqwest::Method::GET, Url::parse(&next)?)
        .send()
        .await?;
      page = Self::decode(response).await?;
    }
    Ok(results)
  }
}

/// Deletes any resource by href and waits for the removal task.
pub async fn delete_by_href_monitor(
  client: &Pulp3Client,
  href: &str,
) -> Result<PulpTask, PulpError> {
  let task_href = client.delete_task(href).await?;
  monitor_task(client, &task_href).await
}

pub(crate) fn from_values<T: DeserializeOwned>(
  values: Vec<Value>,
) -> Result<Vec<T>, PulpError> {
  values
    .into_iter()
    .map(|value| serde_json::from_value(value).map_err(Into::into))
    .collect()
}
