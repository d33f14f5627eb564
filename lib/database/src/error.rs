#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
  /// Malformed filter key, unsupported operator, or a remote column
  /// used where only direct columns are allowed.
  #[error("invalid filter: {0}")]
  Filter(String),

  #[error("page_size {page_size} larger than maximum {max_page_size}")]
  PageSizeTooLarge { page_size: i64, max_page_size: i64 },

  /// Constraint violation surfaced by sqlite during a write.
  #[error("integrity failure: {0}")]
  Integrity(String),

  #[error(transparent)]
  Sqlx(sqlx::Error),
}

impl From<sqlx::Error> for DatabaseError {
  fn from(e: sqlx::Error) -> Self {
    match &e {
      sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
        DatabaseError::Integrity(db.message().to_string())
      }
      _ => DatabaseError::Sqlx(e),
    }
  }
}
