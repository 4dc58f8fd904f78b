use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::sales_metrics_by_origin;
use crate::backfill::{compute_lookback_dates, compute_lookback_months};
use crate::config::SyncJobConfig;
use crate::domain::{
  AccountRef, AccountStatus, AdMetrics, DailyRecord, DateRange, MonthKey, MonthlyRecord,
  SalesByOrigin,
};
use crate::error::{Result, SyncError};
use crate::scheduler::{JobCallback, Scheduler};
use crate::source::{AdMetricSource, SalesSource};
use crate::store::{AccountDirectory, DailyMetricStore, MonthlyMetricStore};

/// What a periodic sync job does for one account and one window.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
  fn name(&self) -> &'static str;

  /// Windows to process in one pass, oldest first.
  fn windows(&self, today: NaiveDate, lookback: u32) -> Vec<DateRange>;

  fn accepts(&self, _account: &AccountRef) -> bool {
    true
  }

  async fn process(&self, account: &AccountRef, window: DateRange) -> Result<()>;
}

fn daily_windows(today: NaiveDate, lookback: u32) -> Vec<DateRange> {
  compute_lookback_dates(today, lookback)
    .into_iter()
    .map(DateRange::single)
    .collect()
}

/// Re-fetches each lookback day of ad metrics and upserts it.
pub struct DailyAdSync {
  source: Arc<dyn AdMetricSource>,
  store: Arc<dyn DailyMetricStore<AdMetrics>>,
}

impl DailyAdSync {
  pub fn new(source: Arc<dyn AdMetricSource>, store: Arc<dyn DailyMetricStore<AdMetrics>>) -> Self {
    DailyAdSync { source, store }
  }
}

#[async_trait]
impl SyncStrategy for DailyAdSync {
  fn name(&self) -> &'static str {
    "meta_insights"
  }

  fn windows(&self, today: NaiveDate, lookback: u32) -> Vec<DateRange> {
    daily_windows(today, lookback)
  }

  fn accepts(&self, account: &AccountRef) -> bool {
    !account.external_id.trim().is_empty()
  }

  async fn process(&self, account: &AccountRef, window: DateRange) -> Result<()> {
    let metrics = self.source.fetch_daily_metrics(account, window.start).await?;
    self
      .store
      .save_or_update(&DailyRecord {
        account_id: account.id,
        external_id: account.external_id.clone(),
        date: window.start,
        metrics,
        updated_at: None,
      })
      .await
  }
}

/// Re-fetches each lookback day of sales for accounts with sales credentials.
pub struct DailySalesSync {
  source: Arc<dyn SalesSource>,
  store: Arc<dyn DailyMetricStore<SalesByOrigin>>,
}

impl DailySalesSync {
  pub fn new(source: Arc<dyn SalesSource>, store: Arc<dyn DailyMetricStore<SalesByOrigin>>) -> Self {
    DailySalesSync { source, store }
  }
}

#[async_trait]
impl SyncStrategy for DailySalesSync {
  fn name(&self) -> &'static str {
    "ssotica_insights"
  }

  fn windows(&self, today: NaiveDate, lookback: u32) -> Vec<DateRange> {
    daily_windows(today, lookback)
  }

  fn accepts(&self, account: &AccountRef) -> bool {
    account.sales_credentials().is_some()
  }

  async fn process(&self, account: &AccountRef, window: DateRange) -> Result<()> {
    let (tax_id, secret_ref) = account.sales_credentials().ok_or_else(|| {
      SyncError::Validation(format!("account {} has no sales credentials", account.id))
    })?;
    let transactions = self.source.fetch_sales(tax_id, secret_ref, window).await?;
    let metrics = sales_metrics_by_origin(&transactions)?;
    self
      .store
      .save_or_update(&DailyRecord {
        account_id: account.id,
        external_id: account.external_id.clone(),
        date: window.start,
        metrics,
        updated_at: None,
      })
      .await
  }
}

/// Snapshots whole past months: ad metrics for every account, sales for accounts with
/// credentials.
pub struct MonthlySync {
  ad_source: Arc<dyn AdMetricSource>,
  sales_source: Arc<dyn SalesSource>,
  ad_store: Arc<dyn MonthlyMetricStore<AdMetrics>>,
  sales_store: Arc<dyn MonthlyMetricStore<SalesByOrigin>>,
}

impl MonthlySync {
  pub fn new(
    ad_source: Arc<dyn AdMetricSource>,
    sales_source: Arc<dyn SalesSource>,
    ad_store: Arc<dyn MonthlyMetricStore<AdMetrics>>,
    sales_store: Arc<dyn MonthlyMetricStore<SalesByOrigin>>,
  ) -> Self {
    MonthlySync {
      ad_source,
      sales_source,
      ad_store,
      sales_store,
    }
  }

  async fn sync_ads(&self, account: &AccountRef, window: DateRange, period: MonthKey) -> Result<()> {
    let metrics = self
      .ad_source
      .fetch_ad_metrics(&account.external_id, window)
      .await?;
    self
      .ad_store
      .save_or_update(&MonthlyRecord {
        account_id: account.id,
        external_id: account.external_id.clone(),
        period,
        metrics,
        updated_at: None,
      })
      .await
  }

  async fn sync_sales(
    &self,
    account: &AccountRef,
    tax_id: &str,
    secret_ref: &str,
    window: DateRange,
    period: MonthKey,
  ) -> Result<()> {
    let transactions = self.sales_source.fetch_sales(tax_id, secret_ref, window).await?;
    let metrics = sales_metrics_by_origin(&transactions)?;
    self
      .sales_store
      .save_or_update(&MonthlyRecord {
        account_id: account.id,
        external_id: account.external_id.clone(),
        period,
        metrics,
        updated_at: None,
      })
      .await
  }
}

#[async_trait]
impl SyncStrategy for MonthlySync {
  fn name(&self) -> &'static str {
    "monthly_insights"
  }

  fn windows(&self, today: NaiveDate, lookback: u32) -> Vec<DateRange> {
    compute_lookback_months(today, lookback)
  }

  async fn process(&self, account: &AccountRef, window: DateRange) -> Result<()> {
    let period = MonthKey::from_date(window.start);
    let mut failures = Vec::new();
    let mut auth_failure = None;

    if !account.external_id.trim().is_empty() {
      match self.sync_ads(account, window, period).await {
        Ok(()) => {}
        Err(e) if e.is_permanent_auth() => auth_failure = Some(e),
        Err(e) => failures.push(format!("ads: {e}")),
      }
    }

    if let Some((tax_id, secret_ref)) = account.sales_credentials() {
      if let Err(e) = self.sync_sales(account, tax_id, secret_ref, window, period).await {
        failures.push(format!("sales: {e}"));
      }
    }

    if let Some(e) = auth_failure {
      Err(e)
    } else if failures.is_empty() {
      Ok(())
    } else {
      Err(SyncError::Transient(failures.join("; ")))
    }
  }
}

#[derive(Debug, Clone, Default)]
struct SyncRunState {
  running: bool,
  last_started_at: Option<DateTime<Utc>>,
  last_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
  pub job: String,
  pub enabled: bool,
  pub cron: String,
  pub lookback: u32,
  pub concurrency: usize,
  pub delay_seconds: u64,
  pub last_start: Option<DateTime<Utc>>,
  pub last_complete: Option<DateTime<Utc>>,
  pub running: bool,
}

/// One cron-driven job: lists active accounts, then walks each accepted account's windows in
/// order under a bounded number of concurrent accounts. At most one pass runs at a time; a
/// trigger that arrives mid-pass is dropped.
pub struct PeriodicSyncJob {
  config: SyncJobConfig,
  strategy: Arc<dyn SyncStrategy>,
  accounts: Arc<dyn AccountDirectory>,
  state: Mutex<SyncRunState>,
  cancel: CancellationToken,
}

impl PeriodicSyncJob {
  pub fn new(
    config: SyncJobConfig,
    strategy: Arc<dyn SyncStrategy>,
    accounts: Arc<dyn AccountDirectory>,
    cancel: CancellationToken,
  ) -> Self {
    info!(
      job = strategy.name(),
      cron = %config.cron,
      lookback = config.lookback,
      request_delay_secs = config.request_delay.as_secs(),
      max_concurrent = config.max_concurrent_jobs,
      enabled = config.enabled,
      "sync job configured"
    );
    PeriodicSyncJob {
      config,
      strategy,
      accounts,
      state: Mutex::new(SyncRunState::default()),
      cancel,
    }
  }

  pub fn name(&self) -> &'static str {
    self.strategy.name()
  }

  pub fn config(&self) -> &SyncJobConfig {
    &self.config
  }

  /// Runs one pass for the local calendar day. Returns false when a pass was already running.
  pub async fn run_once(&self) -> bool {
    self.run_for(Local::now().date_naive()).await
  }

  pub async fn run_for(&self, today: NaiveDate) -> bool {
    {
      let mut state = self.state.lock().await;
      if state.running {
        info!(job = self.name(), "sync already running; ignoring trigger");
        return false;
      }
      state.running = true;
      state.last_started_at = Some(Utc::now());
    }

    let started = std::time::Instant::now();
    let completed = self.run_pass(today).await;

    let mut state = self.state.lock().await;
    state.running = false;
    if completed {
      state.last_completed_at = Some(Utc::now());
      info!(
        job = self.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "sync pass finished"
      );
    }
    true
  }

  /// Starts a pass in the background unless one is already running.
  pub async fn trigger_manual(self: &Arc<Self>) -> bool {
    if self.state.lock().await.running {
      info!(job = self.name(), "sync already running; ignoring manual trigger");
      return false;
    }
    info!(job = self.name(), "manual sync triggered");
    let job = Arc::clone(self);
    tokio::spawn(async move {
      job.run_once().await;
    });
    true
  }

  pub async fn status(&self) -> SyncStatus {
    let state = self.state.lock().await.clone();
    SyncStatus {
      job: self.name().to_string(),
      enabled: self.config.enabled,
      cron: self.config.cron.clone(),
      lookback: self.config.lookback,
      concurrency: self.config.max_concurrent_jobs,
      delay_seconds: self.config.request_delay.as_secs(),
      last_start: state.last_started_at,
      last_complete: state.last_completed_at,
      running: state.running,
    }
  }

  /// Registers the job on `scheduler` when enabled.
  pub async fn schedule(self: &Arc<Self>, scheduler: &dyn Scheduler) -> Result<()> {
    if !self.config.enabled {
      info!(job = self.name(), "sync job disabled");
      return Ok(());
    }
    let job = Arc::clone(self);
    let callback: JobCallback = Arc::new(move || {
      let job = Arc::clone(&job);
      Box::pin(async move {
        job.run_once().await;
      })
    });
    scheduler.register(self.name(), &self.config.cron, callback).await
  }

  async fn run_pass(&self, today: NaiveDate) -> bool {
    let job = self.name();
    let accounts = match self.accounts.list_accounts(&[AccountStatus::Active]).await {
      Ok(accounts) => accounts,
      Err(e) => {
        error!(job, error = %e, "failed to list accounts");
        return false;
      }
    };

    let (accounts, skipped): (Vec<AccountRef>, Vec<AccountRef>) =
      accounts.into_iter().partition(|a| self.strategy.accepts(a));
    for account in &skipped {
      debug!(job, account_id = account.id, "account not eligible; skipping");
    }
    if accounts.is_empty() {
      info!(job, "no eligible accounts");
      return true;
    }

    let windows = self.strategy.windows(today, self.config.lookback);
    if let (Some(first), Some(last)) = (windows.first(), windows.last()) {
      info!(
        job,
        accounts = accounts.len(),
        start = %first.start,
        end = %last.end,
        "sync pass started"
      );
    }

    let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
    let mut workers = JoinSet::new();

    for account in accounts {
      let permit = tokio::select! {
        _ = self.cancel.cancelled() => break,
        permit = Arc::clone(&semaphore).acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };

      let strategy = Arc::clone(&self.strategy);
      let windows = windows.clone();
      let delay = self.config.request_delay;
      let cancel = self.cancel.clone();
      workers.spawn(async move {
        let _permit = permit;
        process_account(strategy.as_ref(), &account, &windows, delay, &cancel).await;
      });
    }

    while let Some(joined) = workers.join_next().await {
      if let Err(e) = joined {
        error!(job, error = %e, "account worker panicked");
      }
    }

    if self.cancel.is_cancelled() {
      warn!(job, "sync pass cancelled");
      return false;
    }
    true
  }
}

async fn process_account(
  strategy: &dyn SyncStrategy,
  account: &AccountRef,
  windows: &[DateRange],
  delay: Duration,
  cancel: &CancellationToken,
) {
  let job = strategy.name();
  for (i, window) in windows.iter().enumerate() {
    if cancel.is_cancelled() {
      return;
    }

    match strategy.process(account, *window).await {
      Ok(()) => info!(
        job,
        account_id = account.id,
        external_id = %account.external_id,
        start = %window.start,
        end = %window.end,
        "window synced"
      ),
      Err(e) if e.is_permanent_auth() => error!(
        job,
        account_id = account.id,
        start = %window.start,
        error = %e,
        "window sync needs manual re-authorization"
      ),
      Err(e) => warn!(
        job,
        account_id = account.id,
        start = %window.start,
        error = %e,
        "window sync failed"
      ),
    }

    if i + 1 < windows.len() && !delay.is_zero() {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }
}
