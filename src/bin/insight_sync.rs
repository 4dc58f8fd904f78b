use std::sync::Arc;

use chrono::{Duration, Local, NaiveDate};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use insight_sync::cache_fill::{AdDayFetcher, CacheFiller, SalesDayFetcher};
use insight_sync::config::{Config, LogConfig};
use insight_sync::db::MySqlStore;
use insight_sync::domain::{AdMetrics, MonthKey, SalesByOrigin};
use insight_sync::error::SyncError;
use insight_sync::http_client::HttpClient;
use insight_sync::insights::InsightService;
use insight_sync::logging::init_tracing;
use insight_sync::providers::meta::MetaGraphClient;
use insight_sync::providers::meta_token::GraphTokenExchanger;
use insight_sync::providers::render::RenderSecretStore;
use insight_sync::providers::ssotica::SsoticaClient;
use insight_sync::ranking::RankingEngine;
use insight_sync::scheduler::{CronScheduler, Scheduler};
use insight_sync::source::{AdMetricSource, SalesSource};
use insight_sync::sync_job::{DailyAdSync, DailySalesSync, MonthlySync, PeriodicSyncJob};
use insight_sync::token::{SecretStore, TokenLifecycleManager, TokenSeed};

const DB_MAX_CONNECTIONS: u32 = 10;

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn parse_dt(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

fn date_flag(args: &[String], flag: &str) -> Result<Option<NaiveDate>, SyncError> {
  match parse_flag_value(args, flag) {
    Some(raw) => parse_dt(&raw)
      .map(Some)
      .ok_or_else(|| SyncError::Validation(format!("invalid {flag} {raw:?}, expected YYYY-MM-DD"))),
    None => Ok(None),
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  init_tracing(&LogConfig::from_env());
  let config = Config::from_env()?;

  let args: Vec<String> = std::env::args().collect();
  let run_once = parse_flag_value(&args, "--run-once");
  let reference = date_flag(&args, "--reference-date")?;

  let http = HttpClient::new(config.http_timeout)?;
  let store = Arc::new(MySqlStore::connect(config.database_url()?, DB_MAX_CONNECTIONS).await?);
  store.ensure_schema().await?;

  let secrets: Option<Arc<dyn SecretStore>> = if config.render.api_key.is_empty() {
    info!("RENDER_API_KEY not set; refreshed tokens stay in memory only");
    None
  } else {
    Some(Arc::new(RenderSecretStore::new(http.clone(), &config.render)))
  };
  let tokens = Arc::new(TokenLifecycleManager::new(
    TokenSeed::from(&config.meta),
    Arc::new(GraphTokenExchanger::new(&http, &config.meta)),
    secrets,
    config.render.service_id.clone(),
  ));
  if let Err(e) = tokens.initialize().await {
    warn!(error = %e, "token initialization failed; ad syncs will retry on demand");
  }
  info!(
    phase = ?tokens.phase().await,
    expires_at = ?tokens.expires_at().await,
    "meta token state"
  );

  let ad_source: Arc<dyn AdMetricSource> = Arc::new(MetaGraphClient::new(
    http.clone(),
    config.meta.api_url(),
    Arc::clone(&tokens),
  ));
  let sales_source: Arc<dyn SalesSource> =
    Arc::new(SsoticaClient::new(http.clone(), &config.ssotica));

  let cancel = CancellationToken::new();
  let meta_sync = Arc::new(PeriodicSyncJob::new(
    config.meta_sync.clone(),
    Arc::new(DailyAdSync::new(ad_source.clone(), store.clone())),
    store.clone(),
    cancel.clone(),
  ));
  let ssotica_sync = Arc::new(PeriodicSyncJob::new(
    config.ssotica_sync.clone(),
    Arc::new(DailySalesSync::new(sales_source.clone(), store.clone())),
    store.clone(),
    cancel.clone(),
  ));
  let monthly_sync = Arc::new(PeriodicSyncJob::new(
    config.monthly_sync.clone(),
    Arc::new(MonthlySync::new(
      ad_source.clone(),
      sales_source.clone(),
      store.clone(),
      store.clone(),
    )),
    store.clone(),
    cancel.clone(),
  ));
  let ranking = Arc::new(RankingEngine::new(
    config.ranking.clone(),
    store.clone(),
    sales_source.clone(),
    store.clone(),
  ));
  let insights = InsightService::new(
    store.clone(),
    CacheFiller::<AdMetrics>::new(
      store.clone(),
      Arc::new(AdDayFetcher::new(ad_source.clone())),
      config.cache_fill_max_concurrent,
    ),
    CacheFiller::<SalesByOrigin>::new(
      store.clone(),
      Arc::new(SalesDayFetcher::new(sales_source.clone())),
      config.cache_fill_max_concurrent,
    ),
    store.clone(),
    store.clone(),
  );

  if let Some(job) = run_once {
    let today = reference.unwrap_or_else(|| Local::now().date_naive());
    info!(job = %job, %today, "running a single pass");
    match job.as_str() {
      "meta" => {
        meta_sync.run_for(today).await;
      }
      "ssotica" => {
        ssotica_sync.run_for(today).await;
      }
      "monthly" => {
        monthly_sync.run_for(today).await;
      }
      "ranking" => {
        let rows = ranking.run(today).await?.unwrap_or_default();
        for row in &rows {
          info!(
            position = row.position,
            store = %row.store_name,
            revenue = row.social_network_revenue,
            "ranked"
          );
        }
      }
      "insights" => {
        let account_id = parse_flag_value(&args, "--account-id")
          .and_then(|v| v.trim().parse::<i64>().ok())
          .ok_or_else(|| {
            SyncError::Validation("insights requires a numeric --account-id".to_string())
          })?;
        let end = date_flag(&args, "--end-date")?.unwrap_or(today - Duration::days(1));
        let start = date_flag(&args, "--start-date")?.unwrap_or(end);
        let account = insights.find_account(account_id).await?;
        let summary = insights.account_insights(&account, start, end, today).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
      }
      "reports" => {
        let period = match parse_flag_value(&args, "--period") {
          Some(raw) => raw.parse::<MonthKey>()?,
          None => MonthKey::from_date(today).previous(),
        };
        let reports = insights.monthly_reports(period).await?;
        println!("{}", serde_json::to_string_pretty(&reports)?);
      }
      "periods" => {
        let periods = insights.available_periods().await?;
        println!("{}", serde_json::to_string_pretty(&periods)?);
      }
      other => {
        return Err(
          SyncError::Validation(format!(
            "unknown job {other:?}; expected meta, ssotica, monthly, ranking, insights, reports or periods"
          ))
          .into(),
        );
      }
    }
    return Ok(());
  }

  let refresh_loop = {
    let tokens = Arc::clone(&tokens);
    let cancel = cancel.clone();
    tokio::spawn(async move { tokens.run_refresh_loop(cancel).await })
  };

  let scheduler = CronScheduler::new().await?;
  meta_sync.schedule(&scheduler).await?;
  ssotica_sync.schedule(&scheduler).await?;
  monthly_sync.schedule(&scheduler).await?;
  ranking.schedule(&scheduler).await?;
  scheduler.start().await?;
  info!("insight sync daemon running; press Ctrl-C to stop");

  tokio::signal::ctrl_c().await?;
  info!("shutdown requested");
  cancel.cancel();

  if let Err(e) = scheduler.stop().await {
    warn!(error = %e, "scheduler did not stop cleanly");
  }
  if let Err(e) = refresh_loop.await {
    error!(error = %e, "token refresh loop ended abnormally");
  }
  info!("insight sync daemon stopped");
  Ok(())
}
