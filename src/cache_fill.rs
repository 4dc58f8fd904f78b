use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{future, stream, StreamExt};
use tracing::{debug, info, warn};

use crate::aggregate::sales_metrics_by_origin;
use crate::backfill::missing_dates;
use crate::domain::{AccountRef, AdMetrics, DailyRecord, DateRange, SalesByOrigin};
use crate::error::{Result, SyncError};
use crate::source::{AdMetricSource, SalesSource};
use crate::store::DailyMetricStore;

pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Fetches one day of metrics for one account from an upstream source.
#[async_trait]
pub trait DailyFetcher<M>: Send + Sync {
  async fn fetch_day(&self, account: &AccountRef, date: NaiveDate) -> Result<M>;
}

pub struct AdDayFetcher {
  source: Arc<dyn AdMetricSource>,
}

impl AdDayFetcher {
  pub fn new(source: Arc<dyn AdMetricSource>) -> Self {
    AdDayFetcher { source }
  }
}

#[async_trait]
impl DailyFetcher<AdMetrics> for AdDayFetcher {
  async fn fetch_day(&self, account: &AccountRef, date: NaiveDate) -> Result<AdMetrics> {
    self.source.fetch_daily_metrics(account, date).await
  }
}

pub struct SalesDayFetcher {
  source: Arc<dyn SalesSource>,
}

impl SalesDayFetcher {
  pub fn new(source: Arc<dyn SalesSource>) -> Self {
    SalesDayFetcher { source }
  }
}

#[async_trait]
impl DailyFetcher<SalesByOrigin> for SalesDayFetcher {
  async fn fetch_day(&self, account: &AccountRef, date: NaiveDate) -> Result<SalesByOrigin> {
    let (tax_id, secret_ref) = account.sales_credentials().ok_or_else(|| {
      SyncError::Validation(format!("account {} has no sales credentials", account.id))
    })?;
    let transactions = self
      .source
      .fetch_sales(tax_id, secret_ref, DateRange::single(date))
      .await?;
    sales_metrics_by_origin(&transactions)
  }
}

/// Read-through cache over a [`DailyMetricStore`]: serves the cached days of a range and fetches
/// the rest concurrently.
pub struct CacheFiller<M> {
  store: Arc<dyn DailyMetricStore<M>>,
  fetcher: Arc<dyn DailyFetcher<M>>,
  max_concurrent: usize,
}

impl<M> CacheFiller<M>
where
  M: Clone + Send + Sync + 'static,
{
  pub fn new(
    store: Arc<dyn DailyMetricStore<M>>,
    fetcher: Arc<dyn DailyFetcher<M>>,
    max_concurrent: usize,
  ) -> Self {
    CacheFiller {
      store,
      fetcher,
      max_concurrent: max_concurrent.max(1),
    }
  }

  /// Returns one record per day of `range` that is either cached or could be fetched, sorted by
  /// date. A day whose fetch fails is left out. Fetched days before `today` are persisted; today
  /// and later are returned but never written.
  pub async fn fill(
    &self,
    account: &AccountRef,
    range: DateRange,
    today: NaiveDate,
  ) -> Result<Vec<DailyRecord<M>>> {
    let mut records = self.store.get_by_date_range(account.id, range).await?;
    let cached: BTreeSet<NaiveDate> = records.iter().map(|r| r.date).collect();
    let missing = missing_dates(&range, &cached);

    if missing.is_empty() {
      records.sort_by_key(|r| r.date);
      return Ok(records);
    }

    debug!(
      account_id = account.id,
      cached = cached.len(),
      missing = missing.len(),
      "filling metric cache"
    );

    let fetched: Vec<DailyRecord<M>> = stream::iter(missing)
      .map(|date| self.fetch_one(account, date, today))
      .buffer_unordered(self.max_concurrent)
      .filter_map(future::ready)
      .collect()
      .await;

    info!(
      account_id = account.id,
      fetched = fetched.len(),
      "metric cache fill finished"
    );

    records.extend(fetched);
    records.sort_by_key(|r| r.date);
    Ok(records)
  }

  async fn fetch_one(
    &self,
    account: &AccountRef,
    date: NaiveDate,
    today: NaiveDate,
  ) -> Option<DailyRecord<M>> {
    let metrics = match self.fetcher.fetch_day(account, date).await {
      Ok(metrics) => metrics,
      Err(e) => {
        warn!(account_id = account.id, %date, error = %e, "daily fetch failed; skipping day");
        return None;
      }
    };

    let record = DailyRecord {
      account_id: account.id,
      external_id: account.external_id.clone(),
      date,
      metrics,
      updated_at: None,
    };

    if date < today {
      if let Err(e) = self.store.save_or_update(&record).await {
        warn!(account_id = account.id, %date, error = %e, "failed to cache daily metrics");
      }
    }

    Some(record)
  }
}
