use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Installs the process-wide subscriber. Safe to call more than once; later calls are ignored.
pub fn init_tracing(cfg: &LogConfig) {
  let filter = EnvFilter::try_new(&cfg.filter).unwrap_or_else(|_| EnvFilter::new("info"));

  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_level(true);

  let result = if cfg.json {
    builder.json().with_current_span(false).try_init()
  } else {
    builder.try_init()
  };

  if let Err(e) = result {
    eprintln!("tracing subscriber already installed: {e}");
  }
}
