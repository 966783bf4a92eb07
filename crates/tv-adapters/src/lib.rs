//! Source adapter contracts + HTML/CSV adapter implementations.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tv_core::{AffirmativeAction, KeyStrategy};
use tv_storage::{FetchError, HttpFetcher};

mod csv_import;
mod deadline;
mod html;

pub use csv_import::CsvImportAdapter;
pub use deadline::parse_deadline;
pub use html::HtmlSelectorAdapter;

pub const CRATE_NAME: &str = "tv-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Html,
    Csv,
}

/// CSS selectors used to pull candidate tenders out of a listing page.
///
/// `item` selects one element per tender; every other selector is evaluated inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlRule {
    pub item: String,
    pub title: String,
    pub organization: String,
    pub deadline: String,
    pub link: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tender_no: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub html: Option<HtmlRule>,
    /// UTC hours at which the scheduler runs this source.
    #[serde(default = "default_schedule_hours")]
    pub schedule_hours: Vec<u32>,
    #[serde(default)]
    pub default_location: Option<String>,
}

fn default_schedule_hours() -> Vec<u32> {
    vec![6, 18]
}

pub fn load_source_registry(path: impl AsRef<Path>) -> anyhow::Result<SourceRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for source in &registry.sources {
        if source.kind == SourceKind::Html && source.html.is_none() {
            anyhow::bail!("html source {} has no selector rule", source.source_id);
        }
    }
    Ok(registry)
}

/// Either a resolved deadline or the explicit marker that none could be found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeadlineField {
    Parsed { at: DateTime<Utc> },
    NotFound { raw: Option<String> },
}

impl DeadlineField {
    pub fn from_text(raw: Option<String>) -> Self {
        match raw.as_deref().and_then(parse_deadline) {
            Some(at) => Self::Parsed { at },
            None => Self::NotFound { raw },
        }
    }

    pub fn value(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Parsed { at } => Some(*at),
            Self::NotFound { .. } => None,
        }
    }
}

/// Partially-normalized handoff contract from adapters into the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTender {
    pub source_id: String,
    pub title: String,
    pub organization: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub deadline: DeadlineField,
    pub tender_url: Option<String>,
    pub tender_no: Option<String>,
    pub contact_info: Option<String>,
    pub requirements: Option<String>,
    pub affirmative_action: Option<AffirmativeAction>,
    pub points_required: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub url: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("reading local export: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;
    fn key_strategy(&self) -> KeyStrategy;

    async fn fetch_documents(&self, http: &HttpFetcher) -> Result<Vec<FetchedDocument>, AdapterError>;

    fn parse_document(&self, document: &FetchedDocument) -> Result<Vec<CandidateTender>, AdapterError>;
}

/// Result of one adapter invocation, after expiry filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    pub candidates: Vec<CandidateTender>,
    pub dropped_expired: usize,
}

/// Fetches, parses and expiry-filters one source. One attempt per listing URL.
pub async fn run_adapter(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Result<AdapterOutput, AdapterError> {
    let documents = adapter.fetch_documents(http).await?;
    let mut candidates = Vec::new();
    for document in &documents {
        candidates.extend(adapter.parse_document(document)?);
    }
    let (candidates, dropped_expired) = drop_expired(candidates, ctx.now);
    debug!(
        source_id = adapter.source_id(),
        kept = candidates.len(),
        dropped_expired,
        "adapter finished"
    );
    Ok(AdapterOutput {
        candidates,
        dropped_expired,
    })
}

/// Drops candidates whose parsed deadline is already in the past. Undated ones are kept.
pub fn drop_expired(candidates: Vec<CandidateTender>, now: DateTime<Utc>) -> (Vec<CandidateTender>, usize) {
    let before = candidates.len();
    let kept = candidates
        .into_iter()
        .filter(|c| c.deadline.value().map_or(true, |deadline| deadline >= now))
        .collect::<Vec<_>>();
    let dropped = before - kept.len();
    (kept, dropped)
}

pub fn adapter_for_source(source: &SourceConfig) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match source.kind {
        SourceKind::Html => {
            let rule = source.html.clone().ok_or_else(|| {
                AdapterError::Message(format!("html source {} has no selector rule", source.source_id))
            })?;
            Ok(Box::new(HtmlSelectorAdapter::new(
                source.source_id.clone(),
                source.listing_urls.clone(),
                rule,
                source.default_location.clone(),
            )?))
        }
        SourceKind::Csv => Ok(Box::new(CsvImportAdapter::new(
            source.source_id.clone(),
            source.listing_urls.clone(),
            source.default_location.clone(),
        ))),
    }
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let collapsed = value
        .as_ref()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}
