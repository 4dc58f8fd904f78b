use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};
use futures::future;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::aggregate::social_network_revenue;
use crate::backfill::RankingWindow;
use crate::config::RankingJobConfig;
use crate::domain::{AccountRef, AccountStatus, MonthKey, RankingRecord};
use crate::error::Result;
use crate::scheduler::{JobCallback, Scheduler};
use crate::source::SalesSource;
use crate::store::{AccountDirectory, RankingStore};

/// Orders accounts by social-network revenue, highest first; ties keep input order. Position
/// deltas compare against `priors` (keyed by account id): a riser gets a positive change and
/// accounts without a prior row get 0 for both change and previous position.
pub fn rank_accounts(
  month: MonthKey,
  revenues: Vec<(AccountRef, f64)>,
  priors: &HashMap<i64, RankingRecord>,
) -> Vec<RankingRecord> {
  let mut rows: Vec<RankingRecord> = revenues
    .into_iter()
    .map(|(account, revenue)| RankingRecord {
      account_id: account.id,
      month,
      store_name: account.name,
      social_network_revenue: revenue,
      position: 0,
      position_change: 0,
      previous_position: 0,
      updated_at: None,
    })
    .collect();

  rows.sort_by(|a, b| b.social_network_revenue.total_cmp(&a.social_network_revenue));

  for (idx, row) in rows.iter_mut().enumerate() {
    row.position = idx as i32 + 1;
    if let Some(prior) = priors.get(&row.account_id) {
      row.previous_position = prior.position;
      row.position_change = prior.position - row.position;
    }
  }

  rows
}

#[derive(Debug, Clone, Default)]
struct RankingRunState {
  running: bool,
  last_started_at: Option<DateTime<Utc>>,
  last_completed_at: Option<DateTime<Utc>>,
  last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankingStatus {
  pub enabled: bool,
  pub cron: String,
  pub last_start: Option<DateTime<Utc>>,
  /// Last run that persisted its leaderboard.
  pub last_complete: Option<DateTime<Utc>>,
  /// Error of the most recent run, cleared by the next successful one.
  pub last_error: Option<String>,
  pub running: bool,
}

/// Monthly store leaderboard by social-network revenue. Revenue is recomputed from the sales
/// source over the whole month to date on every run.
pub struct RankingEngine {
  config: RankingJobConfig,
  accounts: Arc<dyn AccountDirectory>,
  sales: Arc<dyn SalesSource>,
  store: Arc<dyn RankingStore>,
  state: Mutex<RankingRunState>,
}

impl RankingEngine {
  pub fn new(
    config: RankingJobConfig,
    accounts: Arc<dyn AccountDirectory>,
    sales: Arc<dyn SalesSource>,
    store: Arc<dyn RankingStore>,
  ) -> Self {
    RankingEngine {
      config,
      accounts,
      sales,
      store,
      state: Mutex::new(RankingRunState::default()),
    }
  }

  /// Builds the leaderboard for the month containing `reference - 1 day` without persisting it.
  pub async fn compute(&self, reference: NaiveDate) -> Result<Vec<RankingRecord>> {
    let window = RankingWindow::for_reference(reference);
    let accounts: Vec<AccountRef> = self
      .accounts
      .list_accounts(&[AccountStatus::Active])
      .await?
      .into_iter()
      .filter(|a| a.sales_credentials().is_some())
      .collect();

    if accounts.is_empty() {
      info!("no accounts eligible for ranking");
      return Ok(Vec::new());
    }

    info!(
      accounts = accounts.len(),
      month = %window.month,
      start = %window.first_of_month,
      end = %window.yesterday,
      "computing store ranking"
    );

    let lookups = accounts.iter().map(|account| self.lookup(account, window));
    let results = future::join_all(lookups).await;

    let mut priors = HashMap::new();
    let mut revenues = Vec::with_capacity(accounts.len());
    for (account, (prior, revenue)) in accounts.into_iter().zip(results) {
      if let Some(prior) = prior {
        priors.insert(account.id, prior);
      }
      if let Some(revenue) = revenue {
        revenues.push((account, revenue));
      }
    }

    Ok(rank_accounts(window.month, revenues, &priors))
  }

  /// Prior row and fresh month-to-date revenue for one account, fetched concurrently. A failed
  /// revenue lookup leaves the account out of this run.
  async fn lookup(
    &self,
    account: &AccountRef,
    window: RankingWindow,
  ) -> (Option<RankingRecord>, Option<f64>) {
    let prior = async {
      match self.store.get_by_account(account.id, window.month).await {
        Ok(prior) => prior,
        Err(e) => {
          warn!(account_id = account.id, error = %e, "failed to load prior ranking; treating as new entrant");
          None
        }
      }
    };

    let revenue = async {
      let (tax_id, secret_ref) = account.sales_credentials()?;
      match self.sales.fetch_sales(tax_id, secret_ref, window.range()).await {
        Ok(transactions) => Some(social_network_revenue(&transactions)),
        Err(e) => {
          error!(account_id = account.id, error = %e, "failed to fetch sales for ranking; account excluded");
          None
        }
      }
    };

    tokio::join!(prior, revenue)
  }

  /// Computes and persists the leaderboard in one batch. Returns `None` when a run is already in
  /// progress.
  pub async fn run(&self, reference: NaiveDate) -> Result<Option<Vec<RankingRecord>>> {
    {
      let mut state = self.state.lock().await;
      if state.running {
        warn!("ranking update already running; ignoring trigger");
        return Ok(None);
      }
      state.running = true;
      state.last_started_at = Some(Utc::now());
    }

    let outcome = self.compute_and_store(reference).await;

    let mut state = self.state.lock().await;
    state.running = false;
    match &outcome {
      Ok(_) => {
        state.last_completed_at = Some(Utc::now());
        state.last_error = None;
      }
      Err(e) => state.last_error = Some(e.to_string()),
    }
    outcome.map(Some)
  }

  async fn compute_and_store(&self, reference: NaiveDate) -> Result<Vec<RankingRecord>> {
    let rows = self.compute(reference).await?;
    if !rows.is_empty() {
      self.store.upsert_batch(&rows).await?;
    }
    info!(stores = rows.len(), "store ranking updated");
    Ok(rows)
  }

  pub async fn run_once(&self) {
    if let Err(e) = self.run(Local::now().date_naive()).await {
      error!(error = %e, "store ranking update failed");
    }
  }

  pub async fn status(&self) -> RankingStatus {
    let state = self.state.lock().await.clone();
    RankingStatus {
      enabled: self.config.enabled,
      cron: self.config.cron.clone(),
      last_start: state.last_started_at,
      last_complete: state.last_completed_at,
      last_error: state.last_error,
      running: state.running,
    }
  }

  pub async fn schedule(self: &Arc<Self>, scheduler: &dyn Scheduler) -> Result<()> {
    if !self.config.enabled {
      info!("store ranking job disabled");
      return Ok(());
    }
    let engine = Arc::clone(self);
    let callback: JobCallback = Arc::new(move || {
      let engine = Arc::clone(&engine);
      Box::pin(async move { engine.run_once().await })
    });
    scheduler.register("top_ranking_accounts", &self.config.cron, callback).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{DateRange, SaleTransaction};
  use crate::error::SyncError;
  use crate::testing::{account, sales_account, FakeSalesSource, MemoryRankingStore, StaticAccounts};
  use std::time::Duration;

  fn d(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  fn social(amount: f64) -> SaleTransaction {
    SaleTransaction {
      date: "2026-02-10".into(),
      net_amount: amount,
      customer_origins: vec!["Redes Sociais".into()],
    }
  }

  fn store_sale(amount: f64) -> SaleTransaction {
    SaleTransaction {
      date: "2026-02-10".into(),
      net_amount: amount,
      customer_origins: vec!["Indicação".into()],
    }
  }

  fn prior(account_id: i64, month: MonthKey, position: i32) -> RankingRecord {
    RankingRecord {
      account_id,
      month,
      store_name: format!("Loja {account_id}"),
      social_network_revenue: 0.0,
      position,
      position_change: 0,
      previous_position: 0,
      updated_at: None,
    }
  }

  fn engine(
    accounts: Vec<AccountRef>,
    sales: Arc<FakeSalesSource>,
    store: Arc<MemoryRankingStore>,
  ) -> RankingEngine {
    RankingEngine::new(
      RankingJobConfig {
        cron: "0 6 * * *".into(),
        enabled: true,
      },
      Arc::new(StaticAccounts::new(accounts)),
      sales,
      store,
    )
  }

  #[test]
  fn new_entrants_rank_by_revenue() {
    let month = MonthKey::new(2026, 2).unwrap();
    let rows = rank_accounts(
      month,
      vec![(account(1), 1500.0), (account(2), 3000.0), (account(3), 2500.0)],
      &HashMap::new(),
    );

    let order: Vec<(i64, i32)> = rows.iter().map(|r| (r.account_id, r.position)).collect();
    assert_eq!(order, vec![(2, 1), (3, 2), (1, 3)]);
    assert!(rows.iter().all(|r| r.position_change == 0 && r.previous_position == 0));
    assert_eq!(rows[0].store_name, "Loja 2");
  }

  #[test]
  fn riser_and_passed_store_get_opposite_changes() {
    let month = MonthKey::new(2026, 2).unwrap();
    let priors = HashMap::from([(1, prior(1, month, 1)), (2, prior(2, month, 2))]);
    let rows = rank_accounts(month, vec![(account(1), 900.0), (account(2), 1200.0)], &priors);

    assert_eq!(rows[0].account_id, 2);
    assert_eq!(rows[0].position_change, 1);
    assert_eq!(rows[0].previous_position, 2);
    assert_eq!(rows[1].account_id, 1);
    assert_eq!(rows[1].position_change, -1);
    assert_eq!(rows[1].previous_position, 1);
  }

  #[test]
  fn ties_keep_directory_order() {
    let month = MonthKey::new(2026, 2).unwrap();
    let rows = rank_accounts(
      month,
      vec![(account(5), 100.0), (account(3), 100.0), (account(4), 100.0)],
      &HashMap::new(),
    );
    let ids: Vec<i64> = rows.iter().map(|r| r.account_id).collect();
    assert_eq!(ids, vec![5, 3, 4]);
  }

  #[tokio::test]
  async fn run_ranks_eligible_accounts_over_month_to_date() {
    let sales = Arc::new(FakeSalesSource::default());
    sales.set_transactions("tax-1", vec![social(1000.0), social(500.0), store_sale(9000.0)]);
    sales.set_transactions("tax-2", vec![social(3000.0)]);
    sales.set_transactions("tax-3", vec![social(2500.0)]);
    let store = Arc::new(MemoryRankingStore::default());
    let accounts = vec![sales_account(1), sales_account(2), sales_account(3), account(4)];
    let engine = engine(accounts, sales.clone(), store.clone());

    let rows = engine.run(d(2026, 3, 1)).await.unwrap().unwrap();

    let month = MonthKey::new(2026, 2).unwrap();
    let summary: Vec<(i64, f64, i32)> = rows
      .iter()
      .map(|r| (r.account_id, r.social_network_revenue, r.position))
      .collect();
    assert_eq!(summary, vec![(2, 3000.0, 1), (3, 2500.0, 2), (1, 1500.0, 3)]);
    assert!(rows.iter().all(|r| r.month == month));
    assert_eq!(store.batch_count(), 1);

    let expected = DateRange::new(d(2026, 2, 1), d(2026, 2, 28)).unwrap();
    assert_eq!(sales.call_count(), 3);
    assert!(sales.calls().iter().all(|(_, range)| *range == expected));

    let persisted = store.list_by_month(month).await.unwrap();
    assert_eq!(persisted.len(), 3);
  }

  #[tokio::test]
  async fn rerun_compares_against_persisted_positions() {
    let sales = Arc::new(FakeSalesSource::default());
    sales.set_transactions("tax-1", vec![social(100.0)]);
    sales.set_transactions("tax-2", vec![social(200.0)]);
    let store = Arc::new(MemoryRankingStore::default());
    let engine = engine(vec![sales_account(1), sales_account(2)], sales.clone(), store.clone());

    engine.run(d(2026, 3, 1)).await.unwrap();

    sales.set_transactions("tax-1", vec![social(100.0), social(250.0)]);
    let rows = engine.run(d(2026, 3, 1)).await.unwrap().unwrap();
    assert_eq!(rows[0].account_id, 1);
    assert_eq!(rows[0].position_change, 1);
    assert_eq!(rows[0].social_network_revenue, 350.0);
    assert_eq!(rows[1].position_change, -1);

    let rows = engine.run(d(2026, 3, 1)).await.unwrap().unwrap();
    assert!(rows.iter().all(|r| r.position_change == 0));
    assert_eq!(rows[0].previous_position, 1);
  }

  #[tokio::test]
  async fn sales_failure_excludes_account_and_lookup_failure_means_no_prior() {
    let sales = Arc::new(FakeSalesSource::default());
    sales.set_transactions("tax-1", vec![social(100.0)]);
    sales.set_transactions("tax-2", vec![social(50.0)]);
    sales.fail_for("tax-3");
    let store = Arc::new(MemoryRankingStore::default());
    let month = MonthKey::new(2026, 2).unwrap();
    store.insert(prior(1, month, 2));
    store.fail_lookups();
    let engine = engine(
      vec![sales_account(1), sales_account(2), sales_account(3)],
      sales,
      store,
    );

    let rows = engine.compute(d(2026, 3, 1)).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.account_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(rows[0].previous_position, 0);
    assert_eq!(rows[0].position_change, 0);
  }

  #[tokio::test]
  async fn no_eligible_accounts_skips_the_write() {
    let sales = Arc::new(FakeSalesSource::default());
    let store = Arc::new(MemoryRankingStore::default());
    let engine = engine(vec![account(1)], sales.clone(), store.clone());

    let rows = engine.run(d(2026, 3, 1)).await.unwrap().unwrap();
    assert!(rows.is_empty());
    assert_eq!(store.batch_count(), 0);
    assert_eq!(sales.call_count(), 0);
  }

  #[tokio::test]
  async fn concurrent_runs_are_single_flight() {
    let sales = Arc::new(FakeSalesSource::default().with_delay(Duration::from_millis(30)));
    let store = Arc::new(MemoryRankingStore::default());
    let engine = engine(vec![sales_account(1)], sales, store.clone());

    let (a, b) = tokio::join!(engine.run(d(2026, 3, 1)), engine.run(d(2026, 3, 1)));
    let ran = [a.unwrap(), b.unwrap()].iter().filter(|r| r.is_some()).count();
    assert_eq!(ran, 1);
    assert_eq!(store.batch_count(), 1);

    let status = engine.status().await;
    assert!(!status.running);
    assert!(status.last_complete.is_some());
  }

  #[tokio::test]
  async fn failed_run_is_not_reported_as_completed() {
    let sales = Arc::new(FakeSalesSource::default());
    sales.set_transactions("tax-1", vec![social(250.0)]);
    let store = Arc::new(MemoryRankingStore::default());
    store.fail_batches(true);
    let engine = engine(vec![sales_account(1)], sales, store.clone());

    let err = engine.run(d(2026, 3, 1)).await.unwrap_err();
    assert!(matches!(err, SyncError::Persistence(_)));
    let status = engine.status().await;
    assert!(!status.running);
    assert!(status.last_start.is_some());
    assert!(status.last_complete.is_none());
    assert!(status.last_error.unwrap().contains("batch upsert failed"));

    store.fail_batches(false);
    engine.run(d(2026, 3, 1)).await.unwrap();
    let status = engine.status().await;
    assert!(status.last_complete.is_some());
    assert!(status.last_error.is_none());
  }
}
