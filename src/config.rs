use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{Result, SyncError};

pub const DEFAULT_META_BASE_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_META_VERSION: &str = "v22.0";
pub const DEFAULT_SSOTICA_URL: &str = "https://app.ssotica.com.br/api/v1";
pub const DEFAULT_RENDER_API_URL: &str = "https://api.render.com/v1";

#[derive(Debug, Clone)]
pub struct MetaConfig {
  pub base_url: String,
  pub version: String,
  pub access_token: String,
  pub long_lived_token: Option<String>,
  pub token_expires_at: Option<DateTime<Utc>>,
  pub app_id: String,
  pub app_secret: String,
  pub exchange_timeout: Duration,
}

impl MetaConfig {
  /// Versioned Graph API root, e.g. `https://graph.facebook.com/v22.0`.
  pub fn api_url(&self) -> String {
    format!("{}/{}", self.base_url.trim_end_matches('/'), self.version)
  }
}

#[derive(Debug, Clone)]
pub struct SsoticaConfig {
  pub url: String,
  /// Bearer token per secret name.
  pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
  pub api_url: String,
  pub api_key: String,
  pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJobConfig {
  pub cron: String,
  /// Days for the daily jobs, months for the monthly job.
  pub lookback: u32,
  pub request_delay: Duration,
  pub max_concurrent_jobs: usize,
  pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingJobConfig {
  pub cron: String,
  pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
  pub filter: String,
  pub json: bool,
}

impl LogConfig {
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let filter = non_empty(lookup("RUST_LOG")).unwrap_or_else(|| "info".to_string());
    let json = lookup("LOG_FORMAT")
      .map(|v| v.trim().eq_ignore_ascii_case("json"))
      .unwrap_or(false);
    LogConfig { filter, json }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: Option<String>,
  pub http_timeout: Duration,
  pub cache_fill_max_concurrent: usize,
  pub meta: MetaConfig,
  pub ssotica: SsoticaConfig,
  pub render: RenderConfig,
  pub meta_sync: SyncJobConfig,
  pub ssotica_sync: SyncJobConfig,
  pub monthly_sync: SyncJobConfig,
  pub ranking: RankingJobConfig,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let database_url =
      non_empty(lookup("TIDB_DATABASE_URL")).or_else(|| non_empty(lookup("DATABASE_URL")));

    let token_expires_at = match non_empty(lookup("META_TOKEN_EXPIRES_AT")) {
      Some(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
          warn!(value = %raw, error = %e, "ignoring invalid META_TOKEN_EXPIRES_AT");
          None
        }
      },
      None => None,
    };

    let meta = MetaConfig {
      base_url: string_or(&lookup, "META_BASE_URL", DEFAULT_META_BASE_URL),
      version: string_or(&lookup, "META_VERSION", DEFAULT_META_VERSION),
      access_token: lookup("META_ACCESS_TOKEN").unwrap_or_default(),
      long_lived_token: non_empty(lookup("META_LONG_LIVED_TOKEN")),
      token_expires_at,
      app_id: lookup("META_APP_ID").unwrap_or_default(),
      app_secret: lookup("META_APP_SECRET").unwrap_or_default(),
      exchange_timeout: Duration::from_secs(parse_or(&lookup, "TOKEN_EXCHANGE_TIMEOUT_SECONDS", 30u64)),
    };

    let tokens = match non_empty(lookup("SSOTICA_TOKENS")) {
      Some(raw) => serde_json::from_str::<HashMap<String, String>>(&raw)
        .map_err(|e| SyncError::Config(format!("invalid SSOTICA_TOKENS: {e}")))?,
      None => HashMap::new(),
    };

    let ssotica = SsoticaConfig {
      url: string_or(&lookup, "SSOTICA_URL", DEFAULT_SSOTICA_URL),
      tokens,
    };

    let render = RenderConfig {
      api_url: string_or(&lookup, "RENDER_API_URL", DEFAULT_RENDER_API_URL),
      api_key: lookup("RENDER_API_KEY").unwrap_or_default(),
      service_id: lookup("RENDER_SERVICE_ID").unwrap_or_default(),
    };

    Ok(Config {
      database_url,
      http_timeout: Duration::from_secs(parse_or(&lookup, "HTTP_TIMEOUT_SECONDS", 45u64)),
      cache_fill_max_concurrent: parse_or(&lookup, "CACHE_FILL_MAX_CONCURRENT", 5usize).max(1),
      meta,
      ssotica,
      render,
      meta_sync: sync_job_config(&lookup, "META_INSIGHT_SYNC", "0 3 * * *", "LOOKBACK_DAYS", 7),
      ssotica_sync: sync_job_config(&lookup, "SSOTICA_INSIGHT_SYNC", "0 4 * * *", "LOOKBACK_DAYS", 7),
      monthly_sync: sync_job_config(&lookup, "MONTHLY_INSIGHT_SYNC", "0 5 1 * *", "LOOKBACK_MONTHS", 1),
      ranking: RankingJobConfig {
        cron: string_or(&lookup, "TOP_RANKING_ACCOUNTS_CRON", "0 6 * * *"),
        enabled: parse_or(&lookup, "TOP_RANKING_ACCOUNTS_ENABLED", false),
      },
    })
  }

  pub fn database_url(&self) -> Result<&str> {
    let url = self.database_url.as_deref().map(str::trim).unwrap_or("");
    if url.is_empty() {
      return Err(SyncError::Config(
        "Missing TIDB_DATABASE_URL (or DATABASE_URL)".to_string(),
      ));
    }
    if !url.contains("://") {
      return Err(SyncError::Config(
        "Invalid TIDB_DATABASE_URL/DATABASE_URL (expected URL scheme like mysql://...)".to_string(),
      ));
    }
    Ok(url)
  }
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.trim().is_empty())
}

fn string_or<F>(lookup: &F, key: &str, default: &str) -> String
where
  F: Fn(&str) -> Option<String>,
{
  non_empty(lookup(key))
    .map(|v| v.trim().to_string())
    .unwrap_or_else(|| default.to_string())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
  F: Fn(&str) -> Option<String>,
  T: std::str::FromStr + Copy,
{
  match non_empty(lookup(key)) {
    Some(raw) => match raw.trim().parse::<T>() {
      Ok(v) => v,
      Err(_) => {
        warn!(key, value = %raw, "invalid value, using default");
        default
      }
    },
    None => default,
  }
}

fn sync_job_config<F>(
  lookup: &F,
  prefix: &str,
  default_cron: &str,
  lookback_suffix: &str,
  default_lookback: u32,
) -> SyncJobConfig
where
  F: Fn(&str) -> Option<String>,
{
  SyncJobConfig {
    cron: string_or(lookup, &format!("{prefix}_CRON"), default_cron),
    lookback: parse_or(lookup, &format!("{prefix}_{lookback_suffix}"), default_lookback).max(1),
    request_delay: Duration::from_secs(parse_or(
      lookup,
      &format!("{prefix}_REQUEST_DELAY_SECONDS"),
      2u64,
    )),
    max_concurrent_jobs: parse_or(lookup, &format!("{prefix}_MAX_CONCURRENT_JOBS"), 3usize).max(1),
    enabled: parse_or(lookup, &format!("{prefix}_ENABLED"), false),
  }
}
