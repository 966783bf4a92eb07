//! Axum HTTP surface: ingestion triggers, status, cached listings, and an Askama status page.

use std::sync::Arc;

use askama::Template;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tv_core::{AffirmativeActionType, TenderFilter};
use tv_feed::TenderFeed;
use tv_storage::TenderStore;
use tv_sync::{trigger_and_wait, IngestionTrigger, PollPolicy, StatusService, TriggerRequest, TriggerResponse};

pub const CRATE_NAME: &str = "tv-web";

/// Upper bound on `limit` for listing requests.
pub const MAX_LISTING_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TenderStore>,
    pub feed: Arc<TenderFeed>,
    pub trigger: Arc<dyn IngestionTrigger>,
    pub status: Arc<StatusService>,
    pub poll: PollPolicy,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TenderStore>,
        feed: Arc<TenderFeed>,
        trigger: Arc<dyn IngestionTrigger>,
        status: Arc<StatusService>,
    ) -> Self {
        Self {
            store,
            feed,
            trigger,
            status,
            poll: PollPolicy::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct TendersQuery {
    limit: Option<usize>,
    category: Option<String>,
    location: Option<String>,
    q: Option<String>,
    affirmative: Option<String>,
}

impl TendersQuery {
    fn filter(&self) -> TenderFilter {
        let non_blank = |v: &Option<String>| v.as_ref().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        TenderFilter {
            category: non_blank(&self.category),
            location: non_blank(&self.location),
            search: non_blank(&self.q),
            affirmative: non_blank(&self.affirmative).map(|a| AffirmativeActionType::parse(&a)),
        }
    }
}

#[derive(Debug, Serialize)]
struct CountBody {
    count: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct StatusRow {
    name: String,
    status: &'static str,
    count: u64,
    last_success: String,
    error: String,
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    overall: &'static str,
    last_run: String,
    tenders_found: u64,
    new_tenders_count: u64,
    next_run: String,
    rows: Vec<StatusRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest_handler))
        .route("/api/status", get(status_handler))
        .route("/api/status/trigger", post(status_trigger_handler))
        .route("/api/tenders", get(tenders_handler))
        .route("/api/tenders/count", get(count_handler))
        .route("/api/cache/clear", post(cache_clear_handler))
        .route("/status", get(status_page_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn ingest_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        match serde_json::from_slice::<TriggerRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "rejected ingest body");
                return Json(TriggerResponse::failure(format!("invalid trigger body: {err}"))).into_response();
            }
        }
    };
    let response = state.trigger.trigger(request).await;
    state.feed.clear_cache().await;
    Json(response).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.status.summary(Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn status_trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    let cancel = state.shutdown.child_token();
    let result = trigger_and_wait(
        Arc::clone(&state.trigger),
        state.store.as_ref(),
        TriggerRequest::manual(true),
        state.poll,
        &cancel,
    )
    .await;
    state.feed.clear_cache().await;
    Json(result).into_response()
}

async fn tenders_handler(State(state): State<Arc<AppState>>, Query(query): Query<TendersQuery>) -> Response {
    let limit = query
        .limit
        .unwrap_or(state.feed.config().default_limit)
        .clamp(1, MAX_LISTING_LIMIT);
    let views = state.feed.fetch_latest(limit).await;
    Json(query.filter().apply(views)).into_response()
}

async fn count_handler(State(state): State<Arc<AppState>>) -> Response {
    let count = state.feed.get_total_count().await;
    Json(CountBody { count }).into_response()
}

async fn cache_clear_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.feed.clear_cache().await;
    StatusCode::NO_CONTENT
}

async fn status_page_handler(State(state): State<Arc<AppState>>) -> Response {
    let summary = match state.status.summary(Utc::now()).await {
        Ok(summary) => summary,
        Err(err) => return server_error(anyhow::anyhow!(err)),
    };
    let stamp = |t: Option<chrono::DateTime<Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".into())
    };
    render_html(StatusTemplate {
        overall: summary.status.as_str(),
        last_run: stamp(summary.last_run),
        tenders_found: summary.tenders_found,
        new_tenders_count: summary.new_tenders_count,
        next_run: summary
            .next_run_in
            .map(|secs| format!("in {}h {:02}m", secs / 3600, (secs % 3600) / 60))
            .unwrap_or_else(|| "not scheduled".into()),
        rows: summary
            .sources
            .into_iter()
            .map(|s| StatusRow {
                status: s.status.as_str(),
                count: s.count,
                last_success: stamp(s.last_success),
                error: s.error_message.unwrap_or_default(),
                name: s.name,
            })
            .collect(),
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn json_error(status: StatusCode, error: String) -> Response {
    if status.is_server_error() {
        warn!(error = %error, "request failed");
    }
    (status, Json(ErrorBody { error })).into_response()
}
