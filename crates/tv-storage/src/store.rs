use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tv_core::{IngestionRunLog, NewRunLog, NewTender, TenderRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The persistent tender store shared by every writer and reader.
///
/// Listing and count reads exclude rows tagged with [`tv_core::SAMPLE_SOURCE`].
/// Run logs are append-only and returned newest first.
#[async_trait]
pub trait TenderStore: Send + Sync {
    /// Insert-or-overwrite keyed on `natural_key`. Keys must be unique within the batch.
    async fn upsert_tenders(&self, tenders: &[NewTender]) -> Result<u64, StoreError>;

    async fn latest_tenders(&self, limit: usize) -> Result<Vec<TenderRecord>, StoreError>;

    async fn count_tenders(&self) -> Result<u64, StoreError>;

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn counts_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    async fn append_run_log(&self, log: NewRunLog) -> Result<IngestionRunLog, StoreError>;

    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<IngestionRunLog>, StoreError>;

    async fn latest_run_log_for(&self, source: &str) -> Result<Option<IngestionRunLog>, StoreError>;

    /// Expiry sweep: removes tenders whose deadline is before `before`.
    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
