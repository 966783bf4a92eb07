use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tv_core::{IngestionRunLog, NewRunLog, NewTender, TenderRecord, SAMPLE_SOURCE};

use crate::store::{StoreError, TenderStore};

/// In-process store used when no database is configured, and by tests.
///
/// Counts listing/count reads so callers can assert on cache behaviour.
#[derive(Debug, Default)]
pub struct MemoryTenderStore {
    state: Mutex<MemoryState>,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    tenders: BTreeMap<String, TenderRecord>,
    run_logs: Vec<IngestionRunLog>,
    next_log_id: i64,
}

impl MemoryTenderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listing + count reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes tender upserts and deletes fail. Run-log appends keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Appends a run log with an explicit timestamp.
    pub async fn insert_run_log_at(&self, log: NewRunLog, created_at: DateTime<Utc>) -> IngestionRunLog {
        let mut state = self.state.lock().await;
        state.push_log(log, created_at)
    }

    /// Inserts a fully-formed record as-is, bypassing upsert semantics.
    pub async fn insert_record(&self, record: TenderRecord) {
        let mut state = self.state.lock().await;
        state.tenders.insert(record.natural_key.clone(), record);
    }

    /// All rows including samples, keyed by natural key.
    pub async fn snapshot(&self) -> Vec<TenderRecord> {
        self.state.lock().await.tenders.values().cloned().collect()
    }

    fn check_read(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl MemoryState {
    fn push_log(&mut self, log: NewRunLog, created_at: DateTime<Utc>) -> IngestionRunLog {
        self.next_log_id += 1;
        let row = IngestionRunLog {
            id: self.next_log_id,
            source: log.source,
            status: log.status,
            records_found: log.records_found,
            records_inserted: log.records_inserted,
            error_message: log.error_message,
            trigger: log.trigger,
            created_at,
        };
        self.run_logs.push(row.clone());
        row
    }

    fn logs_newest_first(&self) -> Vec<IngestionRunLog> {
        let mut logs = self.run_logs.clone();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        logs
    }

    fn listed(&self) -> impl Iterator<Item = &TenderRecord> {
        self.tenders.values().filter(|t| t.source != SAMPLE_SOURCE)
    }
}

#[async_trait]
impl TenderStore for MemoryTenderStore {
    async fn upsert_tenders(&self, tenders: &[NewTender]) -> Result<u64, StoreError> {
        self.check_write()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for tender in tenders {
            let created_at = state
                .tenders
                .get(&tender.natural_key)
                .map(|existing| existing.created_at)
                .unwrap_or(now);
            let record = tender.clone().into_record(created_at, now);
            state.tenders.insert(record.natural_key.clone(), record);
        }
        Ok(tenders.len() as u64)
    }

    async fn latest_tenders(&self, limit: usize) -> Result<Vec<TenderRecord>, StoreError> {
        self.check_read()?;
        let state = self.state.lock().await;
        let mut rows = state.listed().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.natural_key.cmp(&b.natural_key)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_tenders(&self) -> Result<u64, StoreError> {
        self.check_read()?;
        let state = self.state.lock().await;
        Ok(state.listed().count() as u64)
    }

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.listed().filter(|t| t.created_at >= since).count() as u64)
    }

    async fn counts_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for tender in state.listed() {
            *counts.entry(tender.source.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn append_run_log(&self, log: NewRunLog) -> Result<IngestionRunLog, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.push_log(log, Utc::now()))
    }

    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<IngestionRunLog>, StoreError> {
        let state = self.state.lock().await;
        let mut logs = state.logs_newest_first();
        logs.truncate(limit);
        Ok(logs)
    }

    async fn latest_run_log_for(&self, source: &str) -> Result<Option<IngestionRunLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logs_newest_first()
            .into_iter()
            .find(|log| log.source == source))
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let start = state.tenders.len();
        state
            .tenders
            .retain(|_, t| t.deadline.map_or(true, |deadline| deadline >= before));
        Ok((start - state.tenders.len()) as u64)
    }
}
