//! Ingestion health summary built from the run-log table.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tv_adapters::SourceConfig;
use tv_core::{IngestionRunLog, RunStatus};
use tv_storage::{StoreError, TenderStore};

/// How many recent run logs the summary looks at.
pub const DEFAULT_LOG_WINDOW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Idle,
    Running,
    Success,
    Failed,
}

impl SourceState {
    pub fn from_latest(latest: Option<&IngestionRunLog>) -> Self {
        match latest.map(|log| log.status) {
            None => Self::Idle,
            Some(RunStatus::Started) => Self::Running,
            Some(RunStatus::Success) => Self::Success,
            Some(RunStatus::Error) => Self::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

pub type OverallStatus = SourceState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub name: String,
    pub count: u64,
    pub status: SourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub last_run: Option<DateTime<Utc>>,
    pub status: OverallStatus,
    pub tenders_found: u64,
    pub new_tenders_count: u64,
    pub sources: Vec<SourceStatus>,
    /// Seconds until the next scheduled run of any enabled source.
    pub next_run_in: Option<i64>,
}

/// Seconds from `now` until the earliest scheduled hour across `sources`.
pub fn next_run_in(sources: &[SourceConfig], now: DateTime<Utc>) -> Option<i64> {
    let today = now.date_naive();
    sources
        .iter()
        .filter(|s| s.enabled)
        .flat_map(|s| s.schedule_hours.iter().copied())
        .filter_map(|hour| {
            let at = today.and_hms_opt(hour, 0, 0)?.and_utc();
            let at = if at > now { at } else { at + Duration::days(1) };
            Some((at - now).num_seconds())
        })
        .min()
}

pub struct StatusService {
    store: Arc<dyn TenderStore>,
    sources: Vec<SourceConfig>,
    log_window: usize,
}

impl StatusService {
    pub fn new(store: Arc<dyn TenderStore>, sources: Vec<SourceConfig>) -> Self {
        Self {
            store,
            sources,
            log_window: DEFAULT_LOG_WINDOW,
        }
    }

    pub fn with_log_window(mut self, log_window: usize) -> Self {
        self.log_window = log_window.max(1);
        self
    }

    pub async fn summary(&self, now: DateTime<Utc>) -> Result<StatusSummary, StoreError> {
        let logs = self.store.recent_run_logs(self.log_window).await?;
        let tenders_found = self.store.count_tenders().await?;
        let new_tenders_count = self
            .store
            .count_created_since(now - Duration::hours(24))
            .await?;
        let counts = self.store.counts_by_source().await?;

        let mut names = self
            .sources
            .iter()
            .map(|s| s.source_id.clone())
            .collect::<Vec<_>>();
        for log in &logs {
            if !names.contains(&log.source) {
                names.push(log.source.clone());
            }
        }

        let mut sources = Vec::with_capacity(names.len());
        for name in names {
            let in_window = logs.iter().filter(|l| l.source == name).collect::<Vec<_>>();
            let latest = match in_window.first() {
                Some(latest) => Some((*latest).clone()),
                None => self.store.latest_run_log_for(&name).await?,
            };
            let status = SourceState::from_latest(latest.as_ref());
            let last_success = in_window
                .iter()
                .find(|l| l.status == RunStatus::Success)
                .map(|l| l.created_at);
            let error_message = match status {
                SourceState::Failed => latest.and_then(|l| l.error_message),
                _ => None,
            };
            sources.push(SourceStatus {
                count: counts.get(&name).copied().unwrap_or(0),
                name,
                status,
                last_success,
                error_message,
            });
        }

        Ok(StatusSummary {
            last_run: logs.first().map(|l| l.created_at),
            status: overall_status(&logs, &sources),
            tenders_found,
            new_tenders_count,
            sources,
            next_run_in: next_run_in(&self.sources, now),
        })
    }
}

fn overall_status(logs: &[IngestionRunLog], sources: &[SourceStatus]) -> OverallStatus {
    if sources.iter().any(|s| s.status == SourceState::Running) {
        SourceState::Running
    } else if logs.first().is_some_and(|l| l.status == RunStatus::Error) {
        SourceState::Failed
    } else if logs.iter().any(|l| l.status == RunStatus::Success) {
        SourceState::Success
    } else {
        SourceState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::source_config;
    use chrono::TimeZone;
    use tv_adapters::SourceKind;
    use tv_core::{NewRunLog, TriggerKind};
    use tv_storage::MemoryTenderStore;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, h, m, 0).single().unwrap()
    }

    #[tokio::test]
    async fn most_recent_row_decides_source_status() {
        let store = Arc::new(MemoryTenderStore::new());
        store
            .insert_run_log_at(NewRunLog::success("x", TriggerKind::Scheduled, 4, 4), at(6, 0))
            .await;
        store
            .insert_run_log_at(NewRunLog::error("x", TriggerKind::Manual, 0, "timeout"), at(7, 0))
            .await;

        let service = StatusService::new(store, vec![source_config("x", SourceKind::Html, vec![6, 18])]);
        let summary = service.summary(at(8, 0)).await.unwrap();

        let x = &summary.sources[0];
        assert_eq!(x.status, SourceState::Failed);
        assert_eq!(x.error_message.as_deref(), Some("timeout"));
        assert_eq!(x.last_success, Some(at(6, 0)));
        assert_eq!(summary.status, SourceState::Failed);
        assert_eq!(summary.last_run, Some(at(7, 0)));
    }

    #[tokio::test]
    async fn running_source_dominates_and_unseen_sources_are_idle() {
        let store = Arc::new(MemoryTenderStore::new());
        store
            .insert_run_log_at(NewRunLog::error("x", TriggerKind::Manual, 0, "boom"), at(6, 0))
            .await;
        store
            .insert_run_log_at(NewRunLog::started("y", TriggerKind::Manual), at(6, 30))
            .await;

        let service = StatusService::new(
            store,
            vec![
                source_config("x", SourceKind::Html, vec![6]),
                source_config("y", SourceKind::Csv, vec![6]),
                source_config("z", SourceKind::Html, vec![6]),
            ],
        );
        let summary = service.summary(at(7, 0)).await.unwrap();
        let states = summary.sources.iter().map(|s| s.status).collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![SourceState::Failed, SourceState::Running, SourceState::Idle]
        );
        assert_eq!(summary.status, SourceState::Running);
    }

    #[tokio::test]
    async fn empty_history_is_idle() {
        let store = Arc::new(MemoryTenderStore::new());
        let summary = StatusService::new(store, vec![]).summary(at(7, 0)).await.unwrap();
        assert_eq!(summary.status, SourceState::Idle);
        assert_eq!(summary.last_run, None);
        assert_eq!(summary.next_run_in, None);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "idle");
        assert!(json.get("tendersFound").is_some());
        assert!(json.get("nextRunIn").is_some());
    }

    #[test]
    fn next_run_is_the_earliest_upcoming_hour() {
        let sources = vec![
            source_config("a", SourceKind::Html, vec![6, 18]),
            source_config("b", SourceKind::Html, vec![0, 4, 8, 12, 16, 20]),
        ];
        assert_eq!(next_run_in(&sources, at(7, 30)), Some(30 * 60));
        assert_eq!(next_run_in(&sources, at(20, 0)), Some(4 * 3600));

        let mut disabled = source_config("c", SourceKind::Html, vec![21]);
        disabled.enabled = false;
        assert_eq!(next_run_in(&[disabled], at(20, 0)), None);
    }
}
