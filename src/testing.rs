//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::domain::{
  AccountRef, AccountStatus, AdMetrics, DailyRecord, DateRange, MonthKey, MonthlyRecord,
  RankingRecord, SaleTransaction,
};
use crate::error::{Result, SyncError};
use crate::source::{AdMetricSource, SalesSource};
use crate::store::{AccountDirectory, DailyMetricStore, MonthlyMetricStore, RankingStore};
use crate::token::{SecretStore, TokenExchanger, TokenGrant};

pub fn account(id: i64) -> AccountRef {
  AccountRef {
    id,
    external_id: format!("act_{id}"),
    name: format!("Loja {id}"),
    nickname: None,
    tax_id: None,
    secret_ref: None,
    status: AccountStatus::Active,
  }
}

pub fn sales_account(id: i64) -> AccountRef {
  AccountRef {
    tax_id: Some(format!("tax-{id}")),
    secret_ref: Some(format!("loja{id}")),
    ..account(id)
  }
}

pub fn ad_metrics(external_id: &str, result: i64) -> AdMetrics {
  AdMetrics {
    account_id: external_id.to_string(),
    name: format!("Conta {external_id}"),
    objective: "OUTCOME_ENGAGEMENT".to_string(),
    impressions: 100,
    reach: 50,
    frequency: 2.0,
    spend: 10.0,
    result,
    cost_per_result: if result > 0 { 10.0 / result as f64 } else { 0.0 },
    ..AdMetrics::default()
  }
}

pub struct MemoryDailyStore<M> {
  records: Mutex<BTreeMap<(i64, NaiveDate), DailyRecord<M>>>,
  writes: AtomicUsize,
  range_queries: AtomicUsize,
  fail_writes: AtomicBool,
  fail_range: AtomicBool,
}

impl<M> Default for MemoryDailyStore<M> {
  fn default() -> Self {
    MemoryDailyStore {
      records: Mutex::new(BTreeMap::new()),
      writes: AtomicUsize::new(0),
      range_queries: AtomicUsize::new(0),
      fail_writes: AtomicBool::new(false),
      fail_range: AtomicBool::new(false),
    }
  }
}

impl<M: Clone> MemoryDailyStore<M> {
  pub fn insert(&self, record: DailyRecord<M>) {
    self
      .records
      .lock()
      .unwrap()
      .insert((record.account_id, record.date), record);
  }

  pub fn get(&self, account_id: i64, date: NaiveDate) -> Option<DailyRecord<M>> {
    self.records.lock().unwrap().get(&(account_id, date)).cloned()
  }

  pub fn len(&self) -> usize {
    self.records.lock().unwrap().len()
  }

  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn range_query_count(&self) -> usize {
    self.range_queries.load(Ordering::SeqCst)
  }

  pub fn fail_writes(&self) {
    self.fail_writes.store(true, Ordering::SeqCst);
  }

  pub fn fail_range_queries(&self) {
    self.fail_range.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl<M> DailyMetricStore<M> for MemoryDailyStore<M>
where
  M: Clone + Send + Sync + 'static,
{
  async fn get_by_date(&self, account_id: i64, date: NaiveDate) -> Result<Option<DailyRecord<M>>> {
    Ok(self.get(account_id, date))
  }

  async fn get_by_date_range(&self, account_id: i64, range: DateRange) -> Result<Vec<DailyRecord<M>>> {
    self.range_queries.fetch_add(1, Ordering::SeqCst);
    if self.fail_range.load(Ordering::SeqCst) {
      return Err(SyncError::Persistence("range query failed".into()));
    }
    Ok(
      self
        .records
        .lock()
        .unwrap()
        .values()
        .filter(|r| r.account_id == account_id && range.contains(r.date))
        .cloned()
        .collect(),
    )
  }

  async fn save_or_update(&self, record: &DailyRecord<M>) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(SyncError::Persistence("write failed".into()));
    }
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.insert(record.clone());
    Ok(())
  }
}

pub struct MemoryMonthlyStore<M> {
  records: Mutex<BTreeMap<(i64, MonthKey), MonthlyRecord<M>>>,
  writes: AtomicUsize,
  fail_writes: AtomicBool,
}

impl<M> Default for MemoryMonthlyStore<M> {
  fn default() -> Self {
    MemoryMonthlyStore {
      records: Mutex::new(BTreeMap::new()),
      writes: AtomicUsize::new(0),
      fail_writes: AtomicBool::new(false),
    }
  }
}

impl<M: Clone> MemoryMonthlyStore<M> {
  pub fn insert(&self, record: MonthlyRecord<M>) {
    self
      .records
      .lock()
      .unwrap()
      .insert((record.account_id, record.period), record);
  }

  pub fn get(&self, account_id: i64, period: MonthKey) -> Option<MonthlyRecord<M>> {
    self.records.lock().unwrap().get(&(account_id, period)).cloned()
  }

  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn fail_writes(&self) {
    self.fail_writes.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl<M> MonthlyMetricStore<M> for MemoryMonthlyStore<M>
where
  M: Clone + Send + Sync + 'static,
{
  async fn get_by_period(&self, account_id: i64, period: MonthKey) -> Result<Option<MonthlyRecord<M>>> {
    Ok(self.get(account_id, period))
  }

  async fn save_or_update(&self, record: &MonthlyRecord<M>) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(SyncError::Persistence("write failed".into()));
    }
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.insert(record.clone());
    Ok(())
  }

  async fn get_all_periods(&self) -> Result<Vec<MonthKey>> {
    let mut periods: Vec<MonthKey> = self.records.lock().unwrap().keys().map(|(_, p)| *p).collect();
    periods.sort();
    periods.dedup();
    Ok(periods)
  }
}

#[derive(Default)]
pub struct MemoryRankingStore {
  rows: Mutex<BTreeMap<(i64, MonthKey), RankingRecord>>,
  batches: AtomicUsize,
  fail_lookups: AtomicBool,
  fail_batches: AtomicBool,
}

impl MemoryRankingStore {
  pub fn insert(&self, record: RankingRecord) {
    self
      .rows
      .lock()
      .unwrap()
      .insert((record.account_id, record.month), record);
  }

  pub fn batch_count(&self) -> usize {
    self.batches.load(Ordering::SeqCst)
  }

  pub fn fail_lookups(&self) {
    self.fail_lookups.store(true, Ordering::SeqCst);
  }

  pub fn fail_batches(&self, fail: bool) {
    self.fail_batches.store(fail, Ordering::SeqCst);
  }
}

#[async_trait]
impl RankingStore for MemoryRankingStore {
  async fn get_by_account(&self, account_id: i64, month: MonthKey) -> Result<Option<RankingRecord>> {
    if self.fail_lookups.load(Ordering::SeqCst) {
      return Err(SyncError::Persistence("lookup failed".into()));
    }
    Ok(self.rows.lock().unwrap().get(&(account_id, month)).cloned())
  }

  async fn list_by_month(&self, month: MonthKey) -> Result<Vec<RankingRecord>> {
    let mut rows: Vec<RankingRecord> = self
      .rows
      .lock()
      .unwrap()
      .values()
      .filter(|r| r.month == month)
      .cloned()
      .collect();
    rows.sort_by_key(|r| r.position);
    Ok(rows)
  }

  async fn upsert_batch(&self, records: &[RankingRecord]) -> Result<()> {
    if self.fail_batches.load(Ordering::SeqCst) {
      return Err(SyncError::Persistence("batch upsert failed".into()));
    }
    self.batches.fetch_add(1, Ordering::SeqCst);
    for record in records {
      self.insert(record.clone());
    }
    Ok(())
  }
}

pub struct StaticAccounts {
  accounts: Vec<AccountRef>,
  lists: AtomicUsize,
}

impl StaticAccounts {
  pub fn new(accounts: Vec<AccountRef>) -> Self {
    StaticAccounts {
      accounts,
      lists: AtomicUsize::new(0),
    }
  }

  pub fn list_count(&self) -> usize {
    self.lists.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl AccountDirectory for StaticAccounts {
  async fn list_accounts(&self, statuses: &[AccountStatus]) -> Result<Vec<AccountRef>> {
    self.lists.fetch_add(1, Ordering::SeqCst);
    Ok(
      self
        .accounts
        .iter()
        .filter(|a| statuses.is_empty() || statuses.contains(&a.status))
        .cloned()
        .collect(),
    )
  }
}

#[derive(Default)]
pub struct FakeAdSource {
  responses: Mutex<HashMap<(String, NaiveDate), AdMetrics>>,
  failing_dates: Mutex<HashSet<NaiveDate>>,
  calls: Mutex<Vec<(String, DateRange)>>,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
  delay: Duration,
}

impl FakeAdSource {
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn set(&self, external_id: &str, start: NaiveDate, metrics: AdMetrics) {
    self
      .responses
      .lock()
      .unwrap()
      .insert((external_id.to_string(), start), metrics);
  }

  pub fn fail_on(&self, date: NaiveDate) {
    self.failing_dates.lock().unwrap().insert(date);
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls(&self) -> Vec<(String, DateRange)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn peak_in_flight(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl AdMetricSource for FakeAdSource {
  async fn fetch_ad_metrics(&self, external_id: &str, range: DateRange) -> Result<AdMetrics> {
    self.calls.lock().unwrap().push((external_id.to_string(), range));
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    if self.failing_dates.lock().unwrap().contains(&range.start) {
      return Err(SyncError::Transient(format!("upstream failed for {}", range.start)));
    }
    let configured = self
      .responses
      .lock()
      .unwrap()
      .get(&(external_id.to_string(), range.start))
      .cloned();
    Ok(configured.unwrap_or_else(|| ad_metrics(external_id, 1)))
  }
}

#[derive(Default)]
pub struct FakeSalesSource {
  transactions: Mutex<HashMap<String, Vec<SaleTransaction>>>,
  failing: Mutex<HashSet<String>>,
  calls: Mutex<Vec<(String, DateRange)>>,
  delay: Duration,
}

impl FakeSalesSource {
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn set_transactions(&self, tax_id: &str, transactions: Vec<SaleTransaction>) {
    self
      .transactions
      .lock()
      .unwrap()
      .insert(tax_id.to_string(), transactions);
  }

  pub fn fail_for(&self, tax_id: &str) {
    self.failing.lock().unwrap().insert(tax_id.to_string());
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls(&self) -> Vec<(String, DateRange)> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl SalesSource for FakeSalesSource {
  async fn fetch_sales(
    &self,
    tax_id: &str,
    _secret_ref: &str,
    range: DateRange,
  ) -> Result<Vec<SaleTransaction>> {
    self.calls.lock().unwrap().push((tax_id.to_string(), range));
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if self.failing.lock().unwrap().contains(tax_id) {
      return Err(SyncError::Transient(format!("sales api failed for {tax_id}")));
    }
    Ok(
      self
        .transactions
        .lock()
        .unwrap()
        .get(tax_id)
        .cloned()
        .unwrap_or_default(),
    )
  }
}

pub struct FakeExchanger {
  exchanged: Mutex<Vec<String>>,
  failure: Mutex<Option<SyncError>>,
  inspection: Mutex<Result<Option<DateTime<Utc>>>>,
  delay: Duration,
}

impl Default for FakeExchanger {
  fn default() -> Self {
    FakeExchanger {
      exchanged: Mutex::new(Vec::new()),
      failure: Mutex::new(None),
      inspection: Mutex::new(Ok(None)),
      delay: Duration::ZERO,
    }
  }
}

impl FakeExchanger {
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn fail_with(&self, err: SyncError) {
    *self.failure.lock().unwrap() = Some(err);
  }

  pub fn succeed(&self) {
    *self.failure.lock().unwrap() = None;
  }

  pub fn set_inspection(&self, expires_at: Option<DateTime<Utc>>) {
    *self.inspection.lock().unwrap() = Ok(expires_at);
  }

  pub fn fail_inspection(&self) {
    *self.inspection.lock().unwrap() = Err(SyncError::Transient("debug_token failed".into()));
  }

  pub fn exchange_count(&self) -> usize {
    self.exchanged.lock().unwrap().len()
  }

  pub fn exchanged_tokens(&self) -> Vec<String> {
    self.exchanged.lock().unwrap().clone()
  }
}

#[async_trait]
impl TokenExchanger for FakeExchanger {
  async fn exchange(&self, token: &str) -> Result<TokenGrant> {
    let n = {
      let mut exchanged = self.exchanged.lock().unwrap();
      exchanged.push(token.to_string());
      exchanged.len()
    };
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if let Some(err) = self.failure.lock().unwrap().clone() {
      return Err(err);
    }
    Ok(TokenGrant {
      access_token: format!("long-lived-{n}"),
      expires_in: 60 * 24 * 3600,
    })
  }

  async fn inspect(&self, _token: &str) -> Result<Option<DateTime<Utc>>> {
    self.inspection.lock().unwrap().clone()
  }
}

#[derive(Default)]
pub struct FakeSecretStore {
  puts: Mutex<Vec<(String, String, String)>>,
}

impl FakeSecretStore {
  pub fn puts(&self) -> Vec<(String, String, String)> {
    self.puts.lock().unwrap().clone()
  }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
  async fn put_secret(&self, service_ref: &str, key: &str, value: &str) -> Result<()> {
    self
      .puts
      .lock()
      .unwrap()
      .push((service_ref.to_string(), key.to_string(), value.to_string()));
    Ok(())
  }
}

/// A request as seen by [`TestServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
  pub method: String,
  pub path: String,
  pub query: String,
  pub authorization: Option<String>,
  pub body: String,
}

impl RecordedRequest {
  /// Raw (still percent-encoded) value of a query parameter.
  pub fn param(&self, key: &str) -> Option<&str> {
    self.query.split('&').find_map(|pair| {
      let (k, v) = pair.split_once('=')?;
      (k == key).then_some(v)
    })
  }
}

type Handler = dyn Fn(&RecordedRequest) -> (StatusCode, String) + Send + Sync;

/// Local HTTP/1 server on an ephemeral port; every request is answered by `handler` and recorded.
pub struct TestServer {
  pub base_url: String,
  requests: Arc<Mutex<Vec<RecordedRequest>>>,
  task: JoinHandle<()>,
}

impl TestServer {
  pub async fn start<F>(handler: F) -> Self
  where
    F: Fn(&RecordedRequest) -> (StatusCode, String) + Send + Sync + 'static,
  {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler: Arc<Handler> = Arc::new(handler);
    let requests = Arc::new(Mutex::new(Vec::new()));

    let recorded = requests.clone();
    let task = tokio::spawn(async move {
      loop {
        let Ok((stream, _)) = listener.accept().await else {
          return;
        };
        let handler = handler.clone();
        let recorded = recorded.clone();
        tokio::spawn(async move {
          let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let recorded = recorded.clone();
            async move {
              let (parts, body) = req.into_parts();
              let body = body.collect().await?.to_bytes();
              let request = RecordedRequest {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                query: parts.uri.query().unwrap_or_default().to_string(),
                authorization: parts
                  .headers
                  .get(hyper::header::AUTHORIZATION)
                  .and_then(|v| v.to_str().ok())
                  .map(str::to_string),
                body: String::from_utf8_lossy(&body).to_string(),
              };
              let (status, payload) = handler(&request);
              recorded.lock().unwrap().push(request);
              Ok::<_, hyper::Error>(
                Response::builder()
                  .status(status)
                  .header("content-type", "application/json")
                  .body(Full::new(Bytes::from(payload)))
                  .unwrap(),
              )
            }
          });
          let _ = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await;
        });
      }
    });

    TestServer {
      base_url: format!("http://{addr}"),
      requests,
      task,
    }
  }

  pub fn requests(&self) -> Vec<RecordedRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl Drop for TestServer {
  fn drop(&mut self) {
    self.task.abort();
  }
}
