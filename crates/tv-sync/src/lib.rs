//! Ingestion pipeline: adapters → enrichment → natural keys → upsert, with run logs per source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use tv_adapters::{
    adapter_for_source, load_source_registry, run_adapter, AdapterContext, CandidateTender, SourceAdapter,
    SourceConfig,
};
use tv_core::{KeyStrategy, NaturalKey, NewRunLog, NewTender, TriggerKind};
use tv_storage::{HttpClientConfig, HttpFetcher, TenderStore};

mod enrichment;
pub mod poll;
pub mod status;

pub use enrichment::YamlRuleEnrichmentHook;
pub use poll::{trigger_and_wait, PollOutcome, PollPolicy, PollReport, TriggerAndWait};
pub use status::{next_run_in, OverallStatus, SourceState, SourceStatus, StatusService, StatusSummary};

pub const CRATE_NAME: &str = "tv-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Non-forced triggers skip a source whose latest run log is younger than this.
    pub min_run_interval: Duration,
    pub poll: PollPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            scheduler_enabled: false,
            user_agent: default_user_agent(),
            http_timeout_secs: 20,
            min_run_interval: Duration::from_secs(600),
            poll: PollPolicy::default(),
        }
    }
}

fn default_user_agent() -> String {
    format!("TendersVille/{} (+https://tendersville.co.ke)", env!("CARGO_PKG_VERSION"))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("TV_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            scheduler_enabled: std::env::var("TV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(false),
            user_agent: std::env::var("TV_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("TV_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            min_run_interval: Duration::from_secs(env_or("TV_MIN_RUN_INTERVAL_SECS", 600)),
            poll: PollPolicy {
                attempts: env_or("TV_POLL_ATTEMPTS", defaults.poll.attempts),
                interval: Duration::from_millis(env_or("TV_POLL_INTERVAL_MS", 3000)),
            },
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

/// Body of a manual, scheduled or fallback ingestion request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerRequest {
    /// Bypass the minimum-interval guard.
    pub force: bool,
    pub scheduled: bool,
    /// Accepted from older callers and ignored.
    pub use_api_layer: bool,
    /// Restrict the run to these source ids.
    pub sources: Option<Vec<String>>,
    #[serde(skip)]
    pub fallback: bool,
}

impl TriggerRequest {
    pub fn manual(force: bool) -> Self {
        Self {
            force,
            ..Default::default()
        }
    }

    pub fn scheduled_for(source_id: &str) -> Self {
        Self {
            scheduled: true,
            sources: Some(vec![source_id.to_string()]),
            ..Default::default()
        }
    }

    pub fn fallback() -> Self {
        Self {
            fallback: true,
            ..Default::default()
        }
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        if self.fallback {
            TriggerKind::Fallback
        } else if self.scheduled {
            TriggerKind::Scheduled
        } else {
            TriggerKind::Manual
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRunReport {
    pub source: String,
    pub outcome: SourceOutcome,
    pub records_found: u32,
    pub records_inserted: u32,
    /// Error message, or the reason a source was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SourceRunReport {
    fn skipped(source: &str, reason: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            outcome: SourceOutcome::Skipped,
            records_found: 0,
            records_inserted: 0,
            detail: Some(reason.into()),
        }
    }

    fn failed(source: &str, found: u32, error: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            outcome: SourceOutcome::Error,
            records_found: found,
            records_inserted: 0,
            detail: Some(error.into()),
        }
    }
}

/// Structured result of a trigger. Never an `Err`: failures are described in-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenders_scraped: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceRunReport>,
}

impl TriggerResponse {
    /// A trigger that never reached any source.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            tenders_scraped: None,
            error: Some(error.into()),
            sources: Vec::new(),
        }
    }

    fn from_reports(sources: Vec<SourceRunReport>) -> Self {
        let errors = sources
            .iter()
            .filter(|r| r.outcome == SourceOutcome::Error)
            .map(|r| format!("{}: {}", r.source, r.detail.as_deref().unwrap_or("failed")))
            .collect::<Vec<_>>();
        let ran = sources
            .iter()
            .filter(|r| r.outcome != SourceOutcome::Skipped)
            .count();
        let scraped = sources.iter().map(|r| u64::from(r.records_inserted)).sum::<u64>();

        let message = if ran == 0 && !sources.is_empty() {
            "all sources ran recently; pass force to run anyway".to_string()
        } else {
            format!("ingested {scraped} tenders from {ran} source(s)")
        };
        Self {
            success: errors.is_empty(),
            message: Some(message),
            tenders_scraped: Some(scraped),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            sources,
        }
    }
}

/// Anything that can start an ingestion run: the pipeline itself, or a stub in tests.
#[async_trait]
pub trait IngestionTrigger: Send + Sync {
    async fn trigger(&self, request: TriggerRequest) -> TriggerResponse;
}

/// Runs on adapter output before keys are derived, so an absent field is still `None`.
pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, items: Vec<CandidateTender>) -> Result<Vec<CandidateTender>>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, items: Vec<CandidateTender>) -> Result<Vec<CandidateTender>> {
        Ok(items)
    }
}

struct RegisteredSource {
    config: SourceConfig,
    adapter: Box<dyn SourceAdapter>,
}

/// Converts candidates into upsert rows keyed by natural key.
///
/// Later candidates replace earlier ones with the same key, so one batch never carries a key twice.
/// Returns the rows and the number of candidates that had nothing to key on.
pub fn stage_candidates(candidates: Vec<CandidateTender>, strategy: KeyStrategy) -> (Vec<NewTender>, usize) {
    let mut rows: Vec<NewTender> = Vec::with_capacity(candidates.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unkeyed = 0usize;

    for candidate in candidates {
        let deadline = candidate.deadline.value();
        let Some(key) = NaturalKey::derive(
            strategy,
            candidate.tender_url.as_deref(),
            &candidate.title,
            deadline,
            candidate.tender_no.as_deref(),
        ) else {
            unkeyed += 1;
            continue;
        };
        let row = NewTender {
            natural_key: key.to_string(),
            tender_no: candidate.tender_no,
            title: candidate.title,
            procuring_entity: candidate.organization,
            description: candidate.description,
            category: candidate.category,
            location: candidate.location,
            deadline,
            source: candidate.source_id,
            contact_info: candidate.contact_info,
            tender_url: candidate.tender_url,
            requirements: candidate.requirements,
            affirmative_action: candidate.affirmative_action.unwrap_or_default(),
            points_required: candidate.points_required,
        };
        match index.get(&row.natural_key) {
            Some(&at) => rows[at] = row,
            None => {
                index.insert(row.natural_key.clone(), rows.len());
                rows.push(row);
            }
        }
    }
    (rows, unkeyed)
}

pub struct IngestionPipeline {
    config: SyncConfig,
    store: Arc<dyn TenderStore>,
    http: HttpFetcher,
    sources: Vec<RegisteredSource>,
    enrichment: Box<dyn EnrichmentHook>,
}

impl IngestionPipeline {
    /// Builds the pipeline from `sources.yaml` and `rules/enrichment.yaml` under the workspace root.
    pub fn new(config: SyncConfig, store: Arc<dyn TenderStore>) -> Result<Self> {
        let registry = load_source_registry(config.sources_path())?;
        let mut sources = Vec::new();
        for source in registry.sources.into_iter().filter(|s| s.enabled) {
            let adapter = adapter_for_source(&source)
                .with_context(|| format!("building adapter for {}", source.source_id))?;
            sources.push((source, adapter));
        }
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let rules_path = YamlRuleEnrichmentHook::rules_path(&config.workspace_root);
        let enrichment: Box<dyn EnrichmentHook> = if rules_path.exists() {
            Box::new(YamlRuleEnrichmentHook::from_workspace_root(&config.workspace_root)?)
        } else {
            warn!(path = %rules_path.display(), "no enrichment rules; keyword enrichment disabled");
            Box::<NoopEnrichmentHook>::default()
        };
        Ok(Self::with_adapters(config, store, http, sources).with_enrichment(enrichment))
    }

    pub fn with_adapters(
        config: SyncConfig,
        store: Arc<dyn TenderStore>,
        http: HttpFetcher,
        sources: Vec<(SourceConfig, Box<dyn SourceAdapter>)>,
    ) -> Self {
        Self {
            config,
            store,
            http,
            sources: sources
                .into_iter()
                .map(|(config, adapter)| RegisteredSource { config, adapter })
                .collect(),
            enrichment: Box::<NoopEnrichmentHook>::default(),
        }
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TenderStore> {
        Arc::clone(&self.store)
    }

    pub fn source_configs(&self) -> Vec<SourceConfig> {
        self.sources.iter().map(|s| s.config.clone()).collect()
    }

    pub async fn run(&self, request: TriggerRequest) -> TriggerResponse {
        let trigger = request.trigger_kind();
        if request.use_api_layer {
            info!("useApiLayer flag received; ignored");
        }
        info!(
            trigger = trigger.as_str(),
            force = request.force,
            sources = ?request.sources,
            "ingestion triggered"
        );

        let mut reports = Vec::new();
        if let Some(wanted) = &request.sources {
            for name in wanted {
                if !self.sources.iter().any(|s| &s.config.source_id == name) {
                    reports.push(SourceRunReport::failed(name, 0, "unknown or disabled source"));
                }
            }
        }
        for source in &self.sources {
            let selected = request
                .sources
                .as_ref()
                .map_or(true, |wanted| wanted.iter().any(|w| w == &source.config.source_id));
            if !selected {
                continue;
            }
            let span = info_span!("ingest_source", source_id = %source.config.source_id);
            let report = self
                .run_source(source, trigger, request.force)
                .instrument(span)
                .await;
            reports.push(report);
        }

        let response = TriggerResponse::from_reports(reports);
        if response.success {
            info!(tenders_scraped = ?response.tenders_scraped, "ingestion finished");
        } else {
            warn!(error = ?response.error, "ingestion finished with errors");
        }
        response
    }

    async fn run_source(&self, source: &RegisteredSource, trigger: TriggerKind, force: bool) -> SourceRunReport {
        let source_id = source.config.source_id.as_str();
        let now = Utc::now();

        if !force {
            match self.store.latest_run_log_for(source_id).await {
                Ok(Some(last)) => {
                    let age = (now - last.created_at).to_std().unwrap_or_default();
                    if age < self.config.min_run_interval {
                        info!(age_secs = age.as_secs(), "source ran recently; skipping");
                        return SourceRunReport::skipped(
                            source_id,
                            format!("last run {}s ago", age.as_secs()),
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "could not read last run; running anyway"),
            }
        }

        if let Err(err) = self.store.append_run_log(NewRunLog::started(source_id, trigger)).await {
            warn!(error = %err, "could not record run start");
            return SourceRunReport::failed(source_id, 0, err.to_string());
        }

        let ctx = AdapterContext { now };
        let output = match run_adapter(source.adapter.as_ref(), &self.http, &ctx).await {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "source fetch failed");
                return self.finish_error(source_id, trigger, 0, err.to_string()).await;
            }
        };

        let found = u32::try_from(output.candidates.len()).unwrap_or(u32::MAX);
        let candidates = match self.enrichment.apply(output.candidates) {
            Ok(candidates) => candidates,
            Err(err) => return self.finish_error(source_id, trigger, found, format!("{err:#}")).await,
        };
        let (rows, unkeyed) = stage_candidates(candidates, source.adapter.key_strategy());
        if unkeyed > 0 {
            warn!(unkeyed, "candidates without url, dated title or tender number were skipped");
        }

        match self.store.upsert_tenders(&rows).await {
            Ok(affected) => {
                let inserted = u32::try_from(affected).unwrap_or(u32::MAX);
                if let Err(err) = self
                    .store
                    .append_run_log(NewRunLog::success(source_id, trigger, found, inserted))
                    .await
                {
                    warn!(error = %err, "could not record run success");
                }
                info!(
                    found,
                    inserted,
                    dropped_expired = output.dropped_expired,
                    "source ingested"
                );
                SourceRunReport {
                    source: source_id.to_string(),
                    outcome: SourceOutcome::Success,
                    records_found: found,
                    records_inserted: inserted,
                    detail: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "upsert failed");
                self.finish_error(source_id, trigger, found, err.to_string()).await
            }
        }
    }

    async fn finish_error(&self, source_id: &str, trigger: TriggerKind, found: u32, message: String) -> SourceRunReport {
        if let Err(err) = self
            .store
            .append_run_log(NewRunLog::error(source_id, trigger, found, message.clone()))
            .await
        {
            warn!(error = %err, "could not record run failure");
        }
        SourceRunReport::failed(source_id, found, message)
    }

    /// Deletes tenders whose deadline passed more than `grace` ago.
    pub async fn sweep_expired(&self, grace: chrono::Duration) -> Result<u64> {
        let before = Utc::now() - grace;
        let removed = self
            .store
            .delete_expired(before)
            .await
            .context("deleting expired tenders")?;
        info!(removed, before = %before, "expiry sweep finished");
        Ok(removed)
    }
}

#[async_trait]
impl IngestionTrigger for IngestionPipeline {
    async fn trigger(&self, request: TriggerRequest) -> TriggerResponse {
        self.run(request).await
    }
}

/// Six-field cron (with seconds) firing at the top of each listed UTC hour.
pub fn cron_for_hours(hours: &[u32]) -> Option<String> {
    let mut hours = hours.iter().copied().filter(|h| *h < 24).collect::<Vec<_>>();
    if hours.is_empty() {
        return None;
    }
    hours.sort_unstable();
    hours.dedup();
    let list = hours.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
    Some(format!("0 0 {list} * * *"))
}

/// One cron job per enabled source. Returns `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<IngestionPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for source in pipeline.source_configs() {
        let Some(cron) = cron_for_hours(&source.schedule_hours) else {
            warn!(source_id = %source.source_id, "no valid schedule hours; not scheduled");
            continue;
        };
        let pipeline = Arc::clone(&pipeline);
        let source_id = source.source_id.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let source_id = source_id.clone();
            Box::pin(async move {
                let response = pipeline.run(TriggerRequest::scheduled_for(&source_id)).await;
                if !response.success {
                    warn!(source_id = %source_id, error = ?response.error, "scheduled ingestion failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(source_id = %source.source_id, cron = %cron, "source scheduled");
    }
    Ok(Some(sched))
}

pub fn load_enabled_sources(workspace_root: &Path) -> Result<Vec<SourceConfig>> {
    let registry = load_source_registry(workspace_root.join("sources.yaml"))?;
    Ok(registry.sources.into_iter().filter(|s| s.enabled).collect())
}
