use std::sync::Arc;

use database::DbClient;
use queue::RedisQueue;

use crate::config::CoreConfig;

/// Everything a worker or loop needs, passed through construction
/// rather than process globals.
#[derive(Clone)]
pub struct AppState {
  pub config: Arc<CoreConfig>,
  pub db: DbClient,
  pub queue: Arc<RedisQueue>,
}

impl AppState {
  pub async fn init(
    config: CoreConfig,
  ) -> anyhow::Result<Self> {
    let db = DbClient::connect(
      &config.database.path,
      config.database.max_connections,
    )
    .await?;
    let queue = RedisQueue::connect(&config.redis.url()).await?;
    Ok(Self {
      config: Arc::new(config),
      db,
      queue: Arc::new(queue),
    })
  }
}
