use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::config::SsoticaConfig;
use crate::domain::{DateRange, SaleTransaction};
use crate::error::{Result, SyncError};
use crate::http_client::{build_url, HttpClient};
use crate::source::SalesSource;

const SALES_PATH: &str = "integracoes/vendas/periodo";

/// Sales-by-period client. Each store authenticates with its own bearer token, looked up by the
/// account's secret reference.
pub struct SsoticaClient {
  http: HttpClient,
  base_url: String,
  tokens: HashMap<String, String>,
}

impl SsoticaClient {
  pub fn new(http: HttpClient, config: &SsoticaConfig) -> Self {
    SsoticaClient {
      http,
      base_url: config.url.clone(),
      tokens: config.tokens.clone(),
    }
  }
}

#[async_trait]
impl SalesSource for SsoticaClient {
  async fn fetch_sales(
    &self,
    tax_id: &str,
    secret_ref: &str,
    range: DateRange,
  ) -> Result<Vec<SaleTransaction>> {
    let token = self
      .tokens
      .get(secret_ref)
      .filter(|t| !t.is_empty())
      .ok_or_else(|| SyncError::Config(format!("no sales token configured for {secret_ref}")))?;

    let start = range.start.format("%Y-%m-%d").to_string();
    let end = range.end.format("%Y-%m-%d").to_string();
    let url = build_url(
      &self.base_url,
      SALES_PATH,
      &[("inicio_periodo", &start), ("fim_periodo", &end), ("cnpj", tax_id)],
    );

    let resp = self.http.get(&url, Some(token)).await?;
    if !resp.is_ok() {
      return Err(SyncError::Transient(format!(
        "sales request failed with status {}: {}",
        resp.status.as_u16(),
        resp.snippet()
      )));
    }

    let sales: Vec<SaleTransaction> = resp.json()?;
    debug!(secret_ref, %start, %end, count = sales.len(), "fetched sales");
    Ok(sales)
  }
}
