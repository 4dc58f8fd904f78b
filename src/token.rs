use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::StatusCode;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MetaConfig;
use crate::error::{Result, SyncError};

/// Secret-store key the current access token is published under.
pub const ACCESS_TOKEN_SECRET_KEY: &str = "meta_access_token";

const EXPIRY_BUFFER_SECS: i64 = 24 * 60 * 60;
const PROACTIVE_REFRESH_WINDOW_SECS: i64 = 24 * 60 * 60;

const EXPIRY_MESSAGES: &[&str] = &[
  "Error validating access token",
  "Session has expired",
  "The session has been invalidated",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
  pub access_token: String,
  /// Lifetime in seconds as reported by the provider.
  pub expires_in: i64,
}

#[async_trait]
pub trait TokenExchanger: Send + Sync {
  /// Trades `token` for a fresh long-lived token.
  async fn exchange(&self, token: &str) -> Result<TokenGrant>;

  /// Real expiry of `token`, when the provider reports one.
  async fn inspect(&self, token: &str) -> Result<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
  async fn put_secret(&self, service_ref: &str, key: &str, value: &str) -> Result<()>;
}

/// Expiry to record for a freshly issued token: one day before the real expiry, or half the
/// lifetime when the token lives less than a day.
pub fn compute_expiry(now: DateTime<Utc>, expires_in_secs: i64) -> DateTime<Utc> {
  let mut safe = expires_in_secs - EXPIRY_BUFFER_SECS;
  if safe < 0 {
    safe = expires_in_secs / 2;
  }
  now + chrono::Duration::seconds(safe)
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
  error: GraphErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetails {
  #[serde(default)]
  code: i64,
  #[serde(rename = "type", default)]
  kind: String,
  #[serde(default)]
  error_subcode: i64,
}

pub fn contains_expiry_message(body: &str) -> bool {
  EXPIRY_MESSAGES.iter().any(|m| body.contains(m))
}

/// True when an error body carries a token-expiry signature (structured code/subcode or one of
/// the known messages).
pub fn is_expiry_signature(body: &str) -> bool {
  if let Ok(envelope) = serde_json::from_str::<GraphErrorEnvelope>(body) {
    let e = envelope.error;
    if e.code == 190 || (e.kind == "OAuthException" && matches!(e.error_subcode, 460 | 463 | 467)) {
      return true;
    }
  }
  contains_expiry_message(body)
}

/// Maps a non-200 upstream response to an error; expiry signatures become `AuthExpired` so
/// [`TokenLifecycleManager::call_with_refresh`] retries them.
pub fn classify_error_response(status: StatusCode, body: &str) -> SyncError {
  let snippet: String = body.chars().take(800).collect();
  if is_expiry_signature(body) {
    SyncError::AuthExpired(format!("status {}: {}", status.as_u16(), snippet))
  } else {
    SyncError::Transient(format!("status {}: {}", status.as_u16(), snippet))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
  pub interval: Duration,
  pub retry_interval: Duration,
}

impl Default for RefreshSchedule {
  fn default() -> Self {
    RefreshSchedule {
      interval: Duration::from_secs(23 * 60 * 60),
      retry_interval: Duration::from_secs(60 * 60),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
  Uninitialized,
  Valid,
  Expiring,
  RequiresManualReauth,
}

/// Token material known at startup.
#[derive(Debug, Clone, Default)]
pub struct TokenSeed {
  pub access_token: String,
  pub long_lived_token: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl From<&MetaConfig> for TokenSeed {
  fn from(cfg: &MetaConfig) -> Self {
    TokenSeed {
      access_token: cfg.access_token.clone(),
      long_lived_token: cfg.long_lived_token.clone(),
      expires_at: cfg.token_expires_at,
    }
  }
}

struct TokenState {
  access_token: String,
  long_lived_token: Option<String>,
  expires_at: Option<DateTime<Utc>>,
  reauth_reason: Option<String>,
  /// Bumped by every finished exchange attempt; concurrent refresh callers compare it to join
  /// an attempt that finished while they waited.
  attempts: u64,
  last_outcome: Result<()>,
}

pub struct TokenLifecycleManager {
  exchanger: Arc<dyn TokenExchanger>,
  secrets: Option<Arc<dyn SecretStore>>,
  secret_service: String,
  schedule: RefreshSchedule,
  state: RwLock<TokenState>,
  refresh_lock: Mutex<()>,
}

impl TokenLifecycleManager {
  pub fn new(
    seed: TokenSeed,
    exchanger: Arc<dyn TokenExchanger>,
    secrets: Option<Arc<dyn SecretStore>>,
    secret_service: impl Into<String>,
  ) -> Self {
    let access_token = seed
      .long_lived_token
      .clone()
      .unwrap_or_else(|| seed.access_token.clone());

    TokenLifecycleManager {
      exchanger,
      secrets,
      secret_service: secret_service.into(),
      schedule: RefreshSchedule::default(),
      state: RwLock::new(TokenState {
        access_token,
        long_lived_token: seed.long_lived_token,
        expires_at: seed.expires_at,
        reauth_reason: None,
        attempts: 0,
        last_outcome: Ok(()),
      }),
      refresh_lock: Mutex::new(()),
    }
  }

  pub fn with_schedule(mut self, schedule: RefreshSchedule) -> Self {
    self.schedule = schedule;
    self
  }

  pub async fn phase(&self) -> TokenPhase {
    let state = self.state.read().await;
    if state.reauth_reason.is_some() {
      return TokenPhase::RequiresManualReauth;
    }
    match (state.long_lived_token.as_ref(), state.expires_at) {
      (None, _) => TokenPhase::Uninitialized,
      (Some(_), Some(at)) if at - Utc::now() >= chrono::Duration::seconds(PROACTIVE_REFRESH_WINDOW_SECS) => {
        TokenPhase::Valid
      }
      _ => TokenPhase::Expiring,
    }
  }

  pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
    self.state.read().await.expires_at
  }

  /// Bearer token for the next upstream call.
  pub async fn current_token(&self) -> Result<String> {
    let state = self.state.read().await;
    if let Some(reason) = &state.reauth_reason {
      return Err(SyncError::PermanentAuth(reason.clone()));
    }
    if state.access_token.is_empty() {
      return Err(SyncError::Config("meta access token is not configured".to_string()));
    }
    Ok(state.access_token.clone())
  }

  /// Brings the token into a usable state at startup: exchanges the seed token when there is no
  /// long-lived one, learns the expiry of a long-lived token when it is unknown, and otherwise
  /// refreshes only if expiry is near.
  pub async fn initialize(&self) -> Result<()> {
    let (long_lived, expires_at) = {
      let state = self.state.read().await;
      (state.long_lived_token.clone(), state.expires_at)
    };

    let Some(long_lived) = long_lived else {
      info!("no long-lived token configured; exchanging the seed token");
      return self.refresh().await;
    };

    if expires_at.is_some() {
      return self.ensure_valid().await;
    }

    info!("validating existing long-lived token");
    match self.exchanger.inspect(&long_lived).await {
      Ok(Some(real_expiry)) => {
        let expires_at = real_expiry - chrono::Duration::seconds(EXPIRY_BUFFER_SECS);
        self.state.write().await.expires_at = Some(expires_at);
        info!(expires_at = %expires_at.to_rfc3339(), "long-lived token is valid");
        Ok(())
      }
      Ok(None) => {
        warn!("token inspection reported no expiry; refreshing");
        self.refresh().await
      }
      Err(e) => {
        warn!(error = %e, "token inspection failed; refreshing");
        self.refresh().await
      }
    }
  }

  /// No network call while at least 24h of validity remain; a single refresh otherwise.
  pub async fn ensure_valid(&self) -> Result<()> {
    {
      let state = self.state.read().await;
      if let Some(reason) = &state.reauth_reason {
        return Err(SyncError::PermanentAuth(reason.clone()));
      }
      let fresh = state
        .expires_at
        .map(|at| at - Utc::now() >= chrono::Duration::seconds(PROACTIVE_REFRESH_WINDOW_SECS))
        .unwrap_or(false);
      if fresh && !state.access_token.is_empty() {
        return Ok(());
      }
    }

    info!("token expires within 24h; refreshing proactively");
    self.refresh().await
  }

  /// Single-flight re-exchange. Callers that arrive while an exchange is in progress wait for it
  /// and share its outcome instead of issuing their own.
  pub async fn refresh(&self) -> Result<()> {
    let observed = self.state.read().await.attempts;
    let _guard = self.refresh_lock.lock().await;

    let token = {
      let state = self.state.read().await;
      if state.attempts != observed {
        debug!("token refresh joined a concurrent attempt");
        return state.last_outcome.clone();
      }
      if let Some(reason) = &state.reauth_reason {
        return Err(SyncError::PermanentAuth(reason.clone()));
      }
      if let Some(at) = state.expires_at {
        if at - Utc::now() < chrono::Duration::hours(1) {
          warn!("token is at or past expiry; manual re-authorization may be required");
        }
      }
      state.access_token.clone()
    };

    let outcome = self.exchange_and_store(&token).await;

    let mut state = self.state.write().await;
    state.attempts += 1;
    state.last_outcome = outcome.clone();
    outcome
  }

  /// Operator path out of `RequiresManualReauth`: exchanges a newly issued short-lived token.
  pub async fn reauthorize(&self, short_lived_token: &str) -> Result<()> {
    let _guard = self.refresh_lock.lock().await;
    self.state.write().await.reauth_reason = None;

    let outcome = self.exchange_and_store(short_lived_token).await;

    let mut state = self.state.write().await;
    state.attempts += 1;
    state.last_outcome = outcome.clone();
    outcome
  }

  async fn exchange_and_store(&self, token: &str) -> Result<()> {
    if token.trim().is_empty() {
      return Err(SyncError::Validation("access token must not be empty".to_string()));
    }

    info!("refreshing access token");
    let grant = match self.exchanger.exchange(token).await {
      Ok(grant) => grant,
      Err(e) => {
        let message = e.to_string();
        if e.is_permanent_auth() || contains_expiry_message(&message) {
          error!(error = %message, "access token can no longer be renewed; manual re-authorization required");
          self.state.write().await.reauth_reason = Some(message.clone());
          return Err(SyncError::PermanentAuth(message));
        }
        error!(error = %message, "token refresh failed");
        return Err(e);
      }
    };

    let expires_at = compute_expiry(Utc::now(), grant.expires_in);
    {
      let mut state = self.state.write().await;
      if state.access_token == grant.access_token {
        info!("token exchange returned the same token");
      }
      state.access_token = grant.access_token.clone();
      state.long_lived_token = Some(grant.access_token.clone());
      state.expires_at = Some(expires_at);
      state.reauth_reason = None;
    }
    info!(expires_at = %expires_at.to_rfc3339(), "access token refreshed");

    if let Some(secrets) = &self.secrets {
      if let Err(e) = secrets
        .put_secret(&self.secret_service, ACCESS_TOKEN_SECRET_KEY, &grant.access_token)
        .await
      {
        warn!(error = %e, "failed to publish refreshed token to the secret store");
      }
    }

    Ok(())
  }

  /// Refreshes every 23h, retrying hourly after a failure, until `cancel` fires.
  pub async fn run_refresh_loop(&self, cancel: CancellationToken) {
    let mut wait = self.schedule.interval;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("token refresh loop stopped");
          return;
        }
        _ = tokio::time::sleep(wait) => {}
      }

      match self.refresh().await {
        Ok(()) => {
          info!("periodic token refresh succeeded");
          wait = self.schedule.interval;
        }
        Err(e) => {
          error!(error = %e, retry_in_secs = self.schedule.retry_interval.as_secs(), "periodic token refresh failed");
          wait = self.schedule.retry_interval;
        }
      }
    }
  }

  /// Runs `op` with the current token. An `AuthExpired` failure triggers one refresh and exactly
  /// one retry; a refresh that ends in manual re-authorization abandons the retry.
  pub async fn call_with_refresh<T, F, Fut>(&self, mut op: F) -> Result<T>
  where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let token = self.current_token().await?;
    match op(token).await {
      Err(e) if e.is_auth_expired() => {
        warn!(error = %e, "access token rejected; refreshing before one retry");
        self.refresh().await?;
        let token = self.current_token().await?;
        op(token).await
      }
      other => other,
    }
  }
}
