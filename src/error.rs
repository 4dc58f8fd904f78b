use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
  /// Network failures, timeouts and malformed upstream payloads. The affected date stays
  /// missing and is picked up again by the next scheduled run.
  #[error("transient upstream error: {0}")]
  Transient(String),

  /// Upstream rejected the bearer token with an expiry signature.
  #[error("access token expired: {0}")]
  AuthExpired(String),

  /// The token cannot be renewed without an operator re-authorizing the app.
  #[error("manual re-authorization required: {0}")]
  PermanentAuth(String),

  #[error("persistence error: {0}")]
  Persistence(String),

  #[error("validation error: {0}")]
  Validation(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("configuration error: {0}")]
  Config(String),
}

impl SyncError {
  pub fn is_auth_expired(&self) -> bool {
    matches!(self, SyncError::AuthExpired(_))
  }

  pub fn is_permanent_auth(&self) -> bool {
    matches!(self, SyncError::PermanentAuth(_))
  }
}

impl From<sqlx::Error> for SyncError {
  fn from(err: sqlx::Error) -> Self {
    SyncError::Persistence(err.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    SyncError::Transient(format!("invalid json: {err}"))
  }
}
