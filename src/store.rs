use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::{
  AccountRef, AccountStatus, DailyRecord, DateRange, MonthKey, MonthlyRecord, RankingRecord,
};
use crate::error::Result;

/// Per-day metric cache, unique on (account_id, date).
#[async_trait]
pub trait DailyMetricStore<M>: Send + Sync
where
  M: Send + Sync + 'static,
{
  async fn get_by_date(&self, account_id: i64, date: NaiveDate) -> Result<Option<DailyRecord<M>>>;

  async fn get_by_date_range(&self, account_id: i64, range: DateRange) -> Result<Vec<DailyRecord<M>>>;

  /// Insert or update in place on the unique key.
  async fn save_or_update(&self, record: &DailyRecord<M>) -> Result<()>;
}

/// Per-month metric snapshots, unique on (account_id, period).
#[async_trait]
pub trait MonthlyMetricStore<M>: Send + Sync
where
  M: Send + Sync + 'static,
{
  async fn get_by_period(&self, account_id: i64, period: MonthKey) -> Result<Option<MonthlyRecord<M>>>;

  async fn save_or_update(&self, record: &MonthlyRecord<M>) -> Result<()>;

  async fn get_all_periods(&self) -> Result<Vec<MonthKey>>;
}

#[async_trait]
pub trait RankingStore: Send + Sync {
  async fn get_by_account(&self, account_id: i64, month: MonthKey) -> Result<Option<RankingRecord>>;

  async fn list_by_month(&self, month: MonthKey) -> Result<Vec<RankingRecord>>;

  /// Upserts the whole leaderboard in one statement.
  async fn upsert_batch(&self, records: &[RankingRecord]) -> Result<()>;
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
  /// Accounts whose status is in `statuses`; an empty filter returns every account.
  async fn list_accounts(&self, statuses: &[AccountStatus]) -> Result<Vec<AccountRef>>;
}
