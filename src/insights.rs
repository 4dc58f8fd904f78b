use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future;
use tracing::{debug, warn};

use crate::aggregate::{combine_ad_metrics, combine_sales_metrics, result_metrics};
use crate::cache_fill::CacheFiller;
use crate::domain::{
  AccountInsights, AccountRef, AccountStatus, AdMetrics, AvailablePeriods, DateRange, MonthKey,
  MonthlyReport, SalesByOrigin,
};
use crate::error::{Result, SyncError};
use crate::store::{AccountDirectory, MonthlyMetricStore};

/// Read side: period summaries assembled from the daily caches and the monthly snapshots.
pub struct InsightService {
  accounts: Arc<dyn AccountDirectory>,
  ad_cache: CacheFiller<AdMetrics>,
  sales_cache: CacheFiller<SalesByOrigin>,
  monthly_ads: Arc<dyn MonthlyMetricStore<AdMetrics>>,
  monthly_sales: Arc<dyn MonthlyMetricStore<SalesByOrigin>>,
}

impl InsightService {
  pub fn new(
    accounts: Arc<dyn AccountDirectory>,
    ad_cache: CacheFiller<AdMetrics>,
    sales_cache: CacheFiller<SalesByOrigin>,
    monthly_ads: Arc<dyn MonthlyMetricStore<AdMetrics>>,
    monthly_sales: Arc<dyn MonthlyMetricStore<SalesByOrigin>>,
  ) -> Self {
    InsightService {
      accounts,
      ad_cache,
      sales_cache,
      monthly_ads,
      monthly_sales,
    }
  }

  /// Looks up one account by id, whatever its status.
  pub async fn find_account(&self, account_id: i64) -> Result<AccountRef> {
    self
      .accounts
      .list_accounts(&[])
      .await?
      .into_iter()
      .find(|a| a.id == account_id)
      .ok_or_else(|| SyncError::NotFound(format!("account {account_id} not found")))
  }

  /// Ad and sales summary for `[start, end]`, backfilling missing days on the way. The sales side
  /// is only loaded for accounts with sales credentials.
  pub async fn account_insights(
    &self,
    account: &AccountRef,
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
  ) -> Result<AccountInsights> {
    let range = DateRange::new(start, end)?;

    let ads = self.ad_cache.fill(account, range, today);
    let sales = async {
      match account.sales_credentials() {
        Some(_) => self.sales_cache.fill(account, range, today).await.map(Some),
        None => Ok(None),
      }
    };
    let (ads, sales) = tokio::join!(ads, sales);

    let ad_metrics = combine_ad_metrics(&ads?);
    let sales_metrics = sales?.and_then(|records| combine_sales_metrics(&records));
    let result_metrics = match (&ad_metrics, &sales_metrics) {
      (Some(ad), Some(sales)) => result_metrics(ad, sales),
      _ => None,
    };

    Ok(AccountInsights {
      range,
      ad_metrics,
      sales_metrics,
      result_metrics,
    })
  }

  /// One report per active account with at least one monthly snapshot for `period`.
  pub async fn monthly_reports(&self, period: MonthKey) -> Result<Vec<MonthlyReport>> {
    let accounts = self.accounts.list_accounts(&[AccountStatus::Active]).await?;

    let loads = accounts.iter().map(|account| async move {
      let loaded = tokio::try_join!(
        self.monthly_ads.get_by_period(account.id, period),
        self.monthly_sales.get_by_period(account.id, period),
      );
      (account, loaded)
    });

    let mut reports = Vec::new();
    for (account, loaded) in future::join_all(loads).await {
      let (ads, sales) = match loaded {
        Ok(pair) => pair,
        Err(e) => {
          warn!(account_id = account.id, %period, error = %e, "failed to load monthly snapshot");
          continue;
        }
      };
      if ads.is_none() && sales.is_none() {
        debug!(account_id = account.id, %period, "no monthly snapshot");
        continue;
      }

      let ad_metrics = ads.map(|r| r.metrics);
      let sales_metrics = sales.map(|r| r.metrics);
      let result_metrics = match (&ad_metrics, &sales_metrics) {
        (Some(ad), Some(sales)) => result_metrics(ad, sales),
        _ => None,
      };

      reports.push(MonthlyReport {
        account_id: account.id,
        account_name: account.display_name().to_string(),
        period,
        ad_metrics,
        sales_metrics,
        result_metrics,
      });
    }

    Ok(reports)
  }

  /// Periods with any monthly snapshot, plus their distinct years and months.
  pub async fn available_periods(&self) -> Result<AvailablePeriods> {
    let (ad_periods, sales_periods) = tokio::try_join!(
      self.monthly_ads.get_all_periods(),
      self.monthly_sales.get_all_periods(),
    )?;

    let periods: BTreeSet<MonthKey> = ad_periods.into_iter().chain(sales_periods).collect();
    let years: BTreeSet<i32> = periods.iter().map(|p| p.year()).collect();
    let months: BTreeSet<u32> = periods.iter().map(|p| p.month()).collect();

    Ok(AvailablePeriods {
      periods: periods.iter().map(|p| p.to_string()).collect(),
      years: years.iter().map(|y| y.to_string()).collect(),
      months: months.iter().map(|m| format!("{m:02}")).collect(),
    })
  }
}
