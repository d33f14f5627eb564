use database::DatabaseError;
use pulp_client::PulpError;
use queue::QueueError;

/// Error taxonomy surfaced at the service boundary. Filter, paging
/// and integrity failures arrive wrapped in [DatabaseError]; a
/// missing signing service arrives as
/// [PulpError::MissingSigningService].
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("{0} not found")]
  NotFound(String),

  #[error("invalid state: {0}")]
  InvalidState(String),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error(transparent)]
  Database(#[from] DatabaseError),

  #[error("upstream failure: {0}")]
  Upstream(#[from] PulpError),

  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
  fn from(e: sqlx::Error) -> Self {
    Error::Database(DatabaseError::from(e))
  }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// Flattened detail string recorded onto failed tasks.
  pub fn detail(&self) -> String {
    format!("{self:#}")
  }
}
