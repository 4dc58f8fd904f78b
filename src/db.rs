use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, QueryBuilder};

use crate::domain::{
  AccountRef, AccountStatus, AdMetrics, DailyRecord, DateRange, MonthKey, MonthlyRecord,
  RankingRecord, SalesByOrigin,
};
use crate::error::{Result, SyncError};
use crate::store::{AccountDirectory, DailyMetricStore, MonthlyMetricStore, RankingStore};

/// Metric payloads persisted as JSON text, with their daily and monthly tables.
pub trait StoredMetrics: Serialize + DeserializeOwned + Send + Sync + 'static {
  const DAILY_TABLE: &'static str;
  const MONTHLY_TABLE: &'static str;
}

impl StoredMetrics for AdMetrics {
  const DAILY_TABLE: &'static str = "ad_insights";
  const MONTHLY_TABLE: &'static str = "monthly_ad_insights";
}

impl StoredMetrics for SalesByOrigin {
  const DAILY_TABLE: &'static str = "sales_insights";
  const MONTHLY_TABLE: &'static str = "monthly_sales_insights";
}

#[derive(Clone)]
pub struct MySqlStore {
  pool: MySqlPool,
}

impl MySqlStore {
  pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
    let pool = MySqlPoolOptions::new()
      .max_connections(max_connections)
      .connect(database_url)
      .await?;
    Ok(MySqlStore { pool })
  }

  pub async fn ensure_schema(&self) -> Result<()> {
    // Idempotent; every table carries the unique key its upsert relies on.
    sqlx::query(
      r#"
        CREATE TABLE IF NOT EXISTS ad_accounts (
          id BIGINT PRIMARY KEY AUTO_INCREMENT,
          external_id VARCHAR(128) NOT NULL,
          name VARCHAR(255) NOT NULL,
          nickname VARCHAR(255) NULL,
          cnpj VARCHAR(32) NULL,
          secret_name VARCHAR(128) NULL,
          status VARCHAR(16) NOT NULL DEFAULT 'ACTIVE',
          created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
          updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
          UNIQUE KEY uq_ad_accounts_external (external_id),
          KEY idx_ad_accounts_status (status)
        );
      "#,
    )
    .execute(&self.pool)
    .await?;

    for table in [AdMetrics::DAILY_TABLE, SalesByOrigin::DAILY_TABLE] {
      let sql = format!(
        r#"
          CREATE TABLE IF NOT EXISTS {table} (
            account_id BIGINT NOT NULL,
            external_id VARCHAR(128) NOT NULL,
            dt DATE NOT NULL,
            metrics_json MEDIUMTEXT NOT NULL,
            created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
            updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
            UNIQUE KEY uq_{table}_account_dt (account_id, dt)
          );
        "#
      );
      sqlx::query(&sql).execute(&self.pool).await?;
    }

    for table in [AdMetrics::MONTHLY_TABLE, SalesByOrigin::MONTHLY_TABLE] {
      let sql = format!(
        r#"
          CREATE TABLE IF NOT EXISTS {table} (
            account_id BIGINT NOT NULL,
            external_id VARCHAR(128) NOT NULL,
            period VARCHAR(7) NOT NULL,
            metrics_json MEDIUMTEXT NOT NULL,
            created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
            updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
            UNIQUE KEY uq_{table}_account_period (account_id, period)
          );
        "#
      );
      sqlx::query(&sql).execute(&self.pool).await?;
    }

    sqlx::query(
      r#"
        CREATE TABLE IF NOT EXISTS store_ranking (
          account_id BIGINT NOT NULL,
          month VARCHAR(7) NOT NULL,
          store_name VARCHAR(255) NOT NULL,
          social_network_revenue DOUBLE NOT NULL DEFAULT 0,
          position INT NOT NULL,
          position_change INT NOT NULL DEFAULT 0,
          previous_position INT NOT NULL DEFAULT 0,
          updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
          UNIQUE KEY uq_store_ranking_account_month (account_id, month),
          KEY idx_store_ranking_month (month, position)
        );
      "#,
    )
    .execute(&self.pool)
    .await?;

    Ok(())
  }
}

fn decode_metrics<M: DeserializeOwned>(raw: &str) -> Result<M> {
  serde_json::from_str::<M>(raw)
    .map_err(|e| SyncError::Persistence(format!("corrupt metrics_json: {e}")))
}

fn encode_metrics<M: Serialize>(metrics: &M) -> Result<String> {
  serde_json::to_string(metrics)
    .map_err(|e| SyncError::Persistence(format!("failed to encode metrics: {e}")))
}

fn decode_period(raw: &str) -> Result<MonthKey> {
  raw
    .parse::<MonthKey>()
    .map_err(|e| SyncError::Persistence(format!("corrupt period column: {e}")))
}

type DailyRow = (i64, String, NaiveDate, String, Option<DateTime<Utc>>);
type MonthlyRow = (i64, String, String, String, Option<DateTime<Utc>>);
type RankingRow = (i64, String, String, f64, i32, i32, i32, Option<DateTime<Utc>>);

fn daily_from_row<M: StoredMetrics>(row: DailyRow) -> Result<DailyRecord<M>> {
  let (account_id, external_id, date, metrics_json, updated_at) = row;
  Ok(DailyRecord {
    account_id,
    external_id,
    date,
    metrics: decode_metrics(&metrics_json)?,
    updated_at,
  })
}

fn ranking_from_row(row: RankingRow) -> Result<RankingRecord> {
  let (account_id, month, store_name, revenue, position, position_change, previous_position, updated_at) = row;
  Ok(RankingRecord {
    account_id,
    month: decode_period(&month)?,
    store_name,
    social_network_revenue: revenue,
    position,
    position_change,
    previous_position,
    updated_at,
  })
}

#[async_trait]
impl<M: StoredMetrics> DailyMetricStore<M> for MySqlStore {
  async fn get_by_date(&self, account_id: i64, date: NaiveDate) -> Result<Option<DailyRecord<M>>> {
    let sql = format!(
      r#"
        SELECT account_id, external_id, dt, metrics_json, updated_at
        FROM {}
        WHERE account_id = ?
          AND dt = ?
        LIMIT 1;
      "#,
      M::DAILY_TABLE
    );
    let row = sqlx::query_as::<_, DailyRow>(&sql)
      .bind(account_id)
      .bind(date)
      .fetch_optional(&self.pool)
      .await?;

    row.map(daily_from_row::<M>).transpose()
  }

  async fn get_by_date_range(&self, account_id: i64, range: DateRange) -> Result<Vec<DailyRecord<M>>> {
    let sql = format!(
      r#"
        SELECT account_id, external_id, dt, metrics_json, updated_at
        FROM {}
        WHERE account_id = ?
          AND dt BETWEEN ? AND ?
        ORDER BY dt ASC;
      "#,
      M::DAILY_TABLE
    );
    let rows = sqlx::query_as::<_, DailyRow>(&sql)
      .bind(account_id)
      .bind(range.start)
      .bind(range.end)
      .fetch_all(&self.pool)
      .await?;

    rows.into_iter().map(daily_from_row::<M>).collect()
  }

  async fn save_or_update(&self, record: &DailyRecord<M>) -> Result<()> {
    let metrics_json = encode_metrics(&record.metrics)?;
    let sql = format!(
      r#"
        INSERT INTO {}
          (account_id, external_id, dt, metrics_json)
        VALUES
          (?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          external_id = VALUES(external_id),
          metrics_json = VALUES(metrics_json),
          updated_at = CURRENT_TIMESTAMP(3);
      "#,
      M::DAILY_TABLE
    );
    sqlx::query(&sql)
      .bind(record.account_id)
      .bind(&record.external_id)
      .bind(record.date)
      .bind(metrics_json)
      .execute(&self.pool)
      .await?;

    Ok(())
  }
}

#[async_trait]
impl<M: StoredMetrics> MonthlyMetricStore<M> for MySqlStore {
  async fn get_by_period(&self, account_id: i64, period: MonthKey) -> Result<Option<MonthlyRecord<M>>> {
    let sql = format!(
      r#"
        SELECT account_id, external_id, period, metrics_json, updated_at
        FROM {}
        WHERE account_id = ?
          AND period = ?
        LIMIT 1;
      "#,
      M::MONTHLY_TABLE
    );
    let row = sqlx::query_as::<_, MonthlyRow>(&sql)
      .bind(account_id)
      .bind(period.to_string())
      .fetch_optional(&self.pool)
      .await?;

    match row {
      Some((account_id, external_id, period, metrics_json, updated_at)) => Ok(Some(MonthlyRecord {
        account_id,
        external_id,
        period: decode_period(&period)?,
        metrics: decode_metrics(&metrics_json)?,
        updated_at,
      })),
      None => Ok(None),
    }
  }

  async fn save_or_update(&self, record: &MonthlyRecord<M>) -> Result<()> {
    let metrics_json = encode_metrics(&record.metrics)?;
    let sql = format!(
      r#"
        INSERT INTO {}
          (account_id, external_id, period, metrics_json)
        VALUES
          (?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          external_id = VALUES(external_id),
          metrics_json = VALUES(metrics_json),
          updated_at = CURRENT_TIMESTAMP(3);
      "#,
      M::MONTHLY_TABLE
    );
    sqlx::query(&sql)
      .bind(record.account_id)
      .bind(&record.external_id)
      .bind(record.period.to_string())
      .bind(metrics_json)
      .execute(&self.pool)
      .await?;

    Ok(())
  }

  async fn get_all_periods(&self) -> Result<Vec<MonthKey>> {
    let sql = format!("SELECT DISTINCT period FROM {};", M::MONTHLY_TABLE);
    let rows = sqlx::query_scalar::<_, String>(&sql)
      .fetch_all(&self.pool)
      .await?;

    let mut periods = rows
      .iter()
      .map(|raw| decode_period(raw))
      .collect::<Result<Vec<_>>>()?;
    periods.sort();
    Ok(periods)
  }
}

#[async_trait]
impl RankingStore for MySqlStore {
  async fn get_by_account(&self, account_id: i64, month: MonthKey) -> Result<Option<RankingRecord>> {
    let row = sqlx::query_as::<_, RankingRow>(
      r#"
        SELECT account_id, month, store_name, social_network_revenue,
               position, position_change, previous_position, updated_at
        FROM store_ranking
        WHERE account_id = ?
          AND month = ?
        LIMIT 1;
      "#,
    )
    .bind(account_id)
    .bind(month.to_string())
    .fetch_optional(&self.pool)
    .await?;

    row.map(ranking_from_row).transpose()
  }

  async fn list_by_month(&self, month: MonthKey) -> Result<Vec<RankingRecord>> {
    let rows = sqlx::query_as::<_, RankingRow>(
      r#"
        SELECT account_id, month, store_name, social_network_revenue,
               position, position_change, previous_position, updated_at
        FROM store_ranking
        WHERE month = ?
        ORDER BY position ASC;
      "#,
    )
    .bind(month.to_string())
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(ranking_from_row).collect()
  }

  async fn upsert_batch(&self, records: &[RankingRecord]) -> Result<()> {
    if records.is_empty() {
      return Ok(());
    }

    let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
      "INSERT INTO store_ranking (account_id, month, store_name, social_network_revenue, position, position_change, previous_position) ",
    );
    qb.push_values(records, |mut b, r| {
      b.push_bind(r.account_id)
        .push_bind(r.month.to_string())
        .push_bind(r.store_name.clone())
        .push_bind(r.social_network_revenue)
        .push_bind(r.position)
        .push_bind(r.position_change)
        .push_bind(r.previous_position);
    });
    qb.push(
      " ON DUPLICATE KEY UPDATE \
        store_name = VALUES(store_name), \
        social_network_revenue = VALUES(social_network_revenue), \
        position = VALUES(position), \
        position_change = VALUES(position_change), \
        previous_position = VALUES(previous_position), \
        updated_at = CURRENT_TIMESTAMP(3)",
    );

    qb.build().execute(&self.pool).await?;
    Ok(())
  }
}

#[async_trait]
impl AccountDirectory for MySqlStore {
  async fn list_accounts(&self, statuses: &[AccountStatus]) -> Result<Vec<AccountRef>> {
    let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
      "SELECT id, external_id, name, nickname, cnpj, secret_name, status FROM ad_accounts",
    );
    if !statuses.is_empty() {
      qb.push(" WHERE status IN (");
      let mut separated = qb.separated(", ");
      for status in statuses {
        separated.push_bind(status.as_str());
      }
      separated.push_unseparated(")");
    }
    qb.push(" ORDER BY id ASC");

    let rows = qb
      .build_query_as::<(i64, String, String, Option<String>, Option<String>, Option<String>, String)>()
      .fetch_all(&self.pool)
      .await?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, external_id, name, nickname, tax_id, secret_ref, status) in rows {
      let status = AccountStatus::parse(&status)
        .ok_or_else(|| SyncError::Persistence(format!("unknown account status {status:?}")))?;
      out.push(AccountRef {
        id,
        external_id,
        name,
        nickname,
        tax_id,
        secret_ref,
        status,
      });
    }
    Ok(out)
  }
}
