use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

use crate::error::{Result, SyncError};

pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Scheduler: Send + Sync {
  /// Registers `callback` to fire on the 5-field cron expression `expr`.
  async fn register(&self, name: &str, expr: &str, callback: JobCallback) -> Result<()>;

  async fn start(&self) -> Result<()>;

  async fn stop(&self) -> Result<()>;
}

/// Widens a standard 5-field cron expression to the seconds-first form the cron engine expects.
/// 6- and 7-field expressions pass through unchanged.
pub fn normalize_cron(expr: &str) -> Result<String> {
  let fields: Vec<&str> = expr.split_whitespace().collect();
  match fields.len() {
    5 => Ok(format!("0 {}", fields.join(" "))),
    6 | 7 => Ok(fields.join(" ")),
    n => Err(SyncError::Validation(format!(
      "invalid cron expression {expr:?}: expected 5 fields, got {n}"
    ))),
  }
}

/// Jobs fire on the host's local clock, the same clock the jobs use to pick "today".
fn cron_job(cron: &str, callback: JobCallback) -> Result<Job> {
  Job::new_async_tz(cron, Local, move |_uuid, _lock| {
    let callback = Arc::clone(&callback);
    Box::pin(async move { callback().await })
  })
  .map_err(|e| SyncError::Validation(format!("invalid cron expression {cron:?}: {e}")))
}

pub struct CronScheduler {
  inner: Mutex<JobScheduler>,
}

impl CronScheduler {
  pub async fn new() -> Result<Self> {
    let inner = JobScheduler::new()
      .await
      .map_err(|e| SyncError::Config(format!("failed to create scheduler: {e}")))?;
    Ok(CronScheduler {
      inner: Mutex::new(inner),
    })
  }
}

#[async_trait]
impl Scheduler for CronScheduler {
  async fn register(&self, name: &str, expr: &str, callback: JobCallback) -> Result<()> {
    let cron = normalize_cron(expr)?;
    let job = cron_job(&cron, callback)?;

    let id = self
      .inner
      .lock()
      .await
      .add(job)
      .await
      .map_err(|e| SyncError::Config(format!("failed to register job {name}: {e}")))?;

    debug!(job = name, cron = %cron, %id, "registered scheduled job");
    Ok(())
  }

  async fn start(&self) -> Result<()> {
    self
      .inner
      .lock()
      .await
      .start()
      .await
      .map_err(|e| SyncError::Config(format!("failed to start scheduler: {e}")))?;
    info!("scheduler started");
    Ok(())
  }

  async fn stop(&self) -> Result<()> {
    self
      .inner
      .lock()
      .await
      .shutdown()
      .await
      .map_err(|e| SyncError::Config(format!("failed to stop scheduler: {e}")))?;
    info!("scheduler stopped");
    Ok(())
  }
}
