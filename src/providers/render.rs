use async_trait::async_trait;
use tracing::info;

use crate::config::RenderConfig;
use crate::error::{Result, SyncError};
use crate::http_client::{build_url, HttpClient};
use crate::token::SecretStore;

/// Publishes secrets as secret files on a hosted service.
pub struct RenderSecretStore {
  http: HttpClient,
  api_url: String,
  api_key: String,
}

impl RenderSecretStore {
  pub fn new(http: HttpClient, config: &RenderConfig) -> Self {
    RenderSecretStore {
      http,
      api_url: config.api_url.clone(),
      api_key: config.api_key.clone(),
    }
  }
}

#[async_trait]
impl SecretStore for RenderSecretStore {
  async fn put_secret(&self, service_ref: &str, key: &str, value: &str) -> Result<()> {
    if self.api_key.is_empty() || service_ref.is_empty() {
      return Err(SyncError::Config(
        "RENDER_API_KEY and RENDER_SERVICE_ID are required to publish secrets".to_string(),
      ));
    }

    let url = build_url(
      &self.api_url,
      &format!("services/{service_ref}/secret-files/{key}"),
      &[],
    );
    let body = serde_json::json!({ "content": value });
    let resp = self.http.put_json(&url, Some(&self.api_key), &body).await?;

    if !resp.status.is_success() {
      return Err(SyncError::Transient(format!(
        "secret update failed with status {}: {}",
        resp.status.as_u16(),
        resp.snippet()
      )));
    }
    info!(service = service_ref, key, "secret file updated");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{RecordedRequest, TestServer};
  use hyper::StatusCode;
  use std::time::Duration;

  fn store(base_url: &str, api_key: &str) -> RenderSecretStore {
    let config = RenderConfig {
      api_url: format!("{base_url}/v1"),
      api_key: api_key.to_string(),
      service_id: "srv-1".into(),
    };
    RenderSecretStore::new(HttpClient::new(Duration::from_secs(5)).unwrap(), &config)
  }

  #[tokio::test]
  async fn puts_secret_file_content() {
    let server = TestServer::start(|_req: &RecordedRequest| (StatusCode::OK, "{}".to_string())).await;

    store(&server.base_url, "rnd_key")
      .put_secret("srv-1", "meta_access_token", "long-abc")
      .await
      .unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "PUT");
    assert_eq!(requests[0].path, "/v1/services/srv-1/secret-files/meta_access_token");
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer rnd_key"));
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body, serde_json::json!({ "content": "long-abc" }));
  }

  #[tokio::test]
  async fn rejected_update_is_an_error() {
    let server = TestServer::start(|_req: &RecordedRequest| {
      (StatusCode::UNAUTHORIZED, r#"{"message":"unauthorized"}"#.to_string())
    })
    .await;

    let err = store(&server.base_url, "rnd_key")
      .put_secret("srv-1", "meta_access_token", "v")
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Transient(_)));
  }

  #[tokio::test]
  async fn missing_api_key_is_a_config_error() {
    let server = TestServer::start(|_req: &RecordedRequest| (StatusCode::OK, "{}".to_string())).await;

    let err = store(&server.base_url, "")
      .put_secret("srv-1", "meta_access_token", "v")
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert!(server.requests().is_empty());
  }
}
