use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::{AccountRef, AdMetrics, DateRange, SaleTransaction};
use crate::error::Result;

#[async_trait]
pub trait AdMetricSource: Send + Sync {
  /// Account-level ad metrics (with campaign breakdown) for an inclusive range.
  async fn fetch_ad_metrics(&self, external_id: &str, range: DateRange) -> Result<AdMetrics>;

  async fn fetch_daily_metrics(&self, account: &AccountRef, date: NaiveDate) -> Result<AdMetrics> {
    self
      .fetch_ad_metrics(&account.external_id, DateRange::single(date))
      .await
  }
}

#[async_trait]
pub trait SalesSource: Send + Sync {
  async fn fetch_sales(
    &self,
    tax_id: &str,
    secret_ref: &str,
    range: DateRange,
  ) -> Result<Vec<SaleTransaction>>;
}
