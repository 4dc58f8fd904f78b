pub mod aggregate;
pub mod backfill;
pub mod cache_fill;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod insights;
pub mod logging;
pub mod providers;
pub mod ranking;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod sync_job;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;
