use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::MetaConfig;
use crate::error::{Result, SyncError};
use crate::http_client::{build_url, HttpClient};
use crate::token::{is_expiry_signature, TokenExchanger, TokenGrant};

/// Lifetime assumed when the exchange response omits `expires_in`.
const DEFAULT_LONG_LIVED_SECS: i64 = 60 * 24 * 60 * 60;

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
  #[serde(default)]
  access_token: String,
  #[serde(default)]
  token_type: String,
  expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DebugTokenResponse {
  data: DebugTokenData,
}

#[derive(Debug, Deserialize)]
struct DebugTokenData {
  #[serde(default)]
  is_valid: Option<bool>,
  #[serde(default)]
  expires_at: Option<i64>,
}

/// Long-lived token exchange and token inspection against the Graph OAuth endpoints.
pub struct GraphTokenExchanger {
  http: HttpClient,
  api_url: String,
  app_id: String,
  app_secret: String,
}

impl GraphTokenExchanger {
  /// `http` is re-bounded to the config's exchange timeout.
  pub fn new(http: &HttpClient, config: &MetaConfig) -> Self {
    GraphTokenExchanger {
      http: http.with_timeout(config.exchange_timeout),
      api_url: config.api_url(),
      app_id: config.app_id.clone(),
      app_secret: config.app_secret.clone(),
    }
  }

  fn check_credentials(&self) -> Result<()> {
    if self.app_id.is_empty() || self.app_secret.is_empty() {
      return Err(SyncError::Config(
        "META_APP_ID and META_APP_SECRET are required for token exchange".to_string(),
      ));
    }
    Ok(())
  }

  fn rejection(status: hyper::StatusCode, body: &str) -> SyncError {
    let snippet: String = body.chars().take(800).collect();
    if is_expiry_signature(body) {
      SyncError::PermanentAuth(format!("status {}: {}", status.as_u16(), snippet))
    } else {
      SyncError::Transient(format!("status {}: {}", status.as_u16(), snippet))
    }
  }
}

#[async_trait]
impl TokenExchanger for GraphTokenExchanger {
  async fn exchange(&self, token: &str) -> Result<TokenGrant> {
    self.check_credentials()?;
    let url = build_url(
      &self.api_url,
      "oauth/access_token",
      &[
        ("grant_type", "fb_exchange_token"),
        ("client_id", &self.app_id),
        ("client_secret", &self.app_secret),
        ("fb_exchange_token", token),
      ],
    );

    let resp = self.http.get(&url, None).await?;
    if !resp.is_ok() {
      return Err(Self::rejection(resp.status, &resp.text()));
    }

    let parsed: ExchangeResponse = resp.json()?;
    if parsed.access_token.is_empty() {
      return Err(SyncError::Transient(
        "token exchange returned an empty access token".to_string(),
      ));
    }
    debug!(token_type = %parsed.token_type, expires_in = ?parsed.expires_in, "token exchanged");

    Ok(TokenGrant {
      access_token: parsed.access_token,
      expires_in: parsed.expires_in.unwrap_or(DEFAULT_LONG_LIVED_SECS),
    })
  }

  async fn inspect(&self, token: &str) -> Result<Option<DateTime<Utc>>> {
    self.check_credentials()?;
    let app_token = format!("{}|{}", self.app_id, self.app_secret);
    let url = build_url(
      &self.api_url,
      "debug_token",
      &[("input_token", token), ("access_token", &app_token)],
    );

    let resp = self.http.get(&url, None).await?;
    if !resp.is_ok() {
      return Err(Self::rejection(resp.status, &resp.text()));
    }

    let parsed: DebugTokenResponse = resp.json()?;
    if parsed.data.is_valid == Some(false) {
      return Err(SyncError::Transient("token inspection reports an invalid token".to_string()));
    }
    match parsed.data.expires_at {
      None | Some(0) => Ok(None),
      Some(secs) => Ok(Utc.timestamp_opt(secs, 0).single()),
    }
  }
}
