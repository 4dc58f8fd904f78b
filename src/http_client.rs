use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{Result, SyncError};

const SNIPPET_CHARS: usize = 800;

#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: StatusCode,
  pub body: Bytes,
}

impl HttpResponse {
  pub fn is_ok(&self) -> bool {
    self.status == StatusCode::OK
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).to_string()
  }

  pub fn snippet(&self) -> String {
    self.text().chars().take(SNIPPET_CHARS).collect()
  }

  pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice::<T>(&self.body)
      .map_err(|e| SyncError::Transient(format!("invalid json response: {e}")))
  }
}

/// Shared HTTPS client. Every request is bounded by `timeout`, independent of the caller's
/// overall deadline. Non-200 statuses are returned to the caller, not turned into errors.
#[derive(Clone)]
pub struct HttpClient {
  client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
  timeout: Duration,
}

impl HttpClient {
  pub fn new(timeout: Duration) -> Result<Self> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
      .with_native_roots()
      .map_err(|e| SyncError::Config(format!("failed to load native TLS roots: {e}")))?
      .https_or_http()
      .enable_http1()
      .build();

    let client = Client::builder(TokioExecutor::new()).build(connector);
    Ok(HttpClient { client, timeout })
  }

  /// Same connection pool, different per-call bound.
  pub fn with_timeout(&self, timeout: Duration) -> Self {
    HttpClient {
      client: self.client.clone(),
      timeout,
    }
  }

  pub async fn get(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse> {
    let mut builder = Request::builder()
      .method(Method::GET)
      .uri(url)
      .header(ACCEPT, "application/json")
      .header(USER_AGENT, "insight-sync");
    if let Some(token) = bearer {
      builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }

    let req = builder
      .body(Full::new(Bytes::new()))
      .map_err(|e| SyncError::Transient(e.to_string()))?;
    self.send(req).await
  }

  pub async fn put_json(
    &self,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
  ) -> Result<HttpResponse> {
    let payload = serde_json::to_vec(body)?;
    let mut builder = Request::builder()
      .method(Method::PUT)
      .uri(url)
      .header(ACCEPT, "application/json")
      .header(CONTENT_TYPE, "application/json")
      .header(USER_AGENT, "insight-sync");
    if let Some(token) = bearer {
      builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }

    let req = builder
      .body(Full::new(Bytes::from(payload)))
      .map_err(|e| SyncError::Transient(e.to_string()))?;
    self.send(req).await
  }

  async fn send(&self, req: Request<Full<Bytes>>) -> Result<HttpResponse> {
    let uri = req.uri().clone();
    let path = uri.path().to_string();

    let fut = async {
      let resp = self
        .client
        .request(req)
        .await
        .map_err(|e| SyncError::Transient(format!("request to {path} failed: {e}")))?;

      let status = resp.status();
      let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| SyncError::Transient(format!("reading body from {path} failed: {e}")))?
        .to_bytes();

      Ok(HttpResponse { status, body })
    };

    match tokio::time::timeout(self.timeout, fut).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Transient(format!(
        "request to {} timed out after {}s",
        path,
        self.timeout.as_secs()
      ))),
    }
  }
}

/// Percent-encodes a query component (RFC 3986 unreserved characters pass through).
pub fn encode_query_value(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for b in value.bytes() {
    match b {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
      _ => out.push_str(&format!("%{:02X}", b)),
    }
  }
  out
}

pub fn build_url(base_url: &str, path: &str, params: &[(&str, &str)]) -> String {
  let base = base_url.trim_end_matches('/');
  let path = path.trim_start_matches('/');
  let mut url = format!("{base}/{path}");
  for (i, (k, v)) in params.iter().enumerate() {
    url.push(if i == 0 { '?' } else { '&' });
    url.push_str(k);
    url.push('=');
    url.push_str(&encode_query_value(v));
  }
  url
}
