//! Bounded wait for new tenders after a manual trigger.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tv_storage::TenderStore;

use crate::{IngestionTrigger, TriggerRequest, TriggerResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    /// The run succeeded, or the tender count grew past its pre-trigger value.
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub attempts: u32,
    pub tenders_found: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerAndWait {
    /// `None` while the run is still going in the background.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerResponse>,
    #[serde(flatten)]
    pub poll: PollReport,
}

/// Starts the trigger on its own task and polls once per interval until the run finishes,
/// the tender count grows past its pre-trigger value, the attempts run out, or `cancel` fires.
///
/// A successful run completes the wait even when it only updated existing rows. A failed run
/// that added nothing ends the wait as `TimedOut`, with the error in `trigger`. When the wait
/// gives up first, the run keeps going in the background.
pub async fn trigger_and_wait(
    trigger: Arc<dyn IngestionTrigger>,
    store: &dyn TenderStore,
    request: TriggerRequest,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> TriggerAndWait {
    let baseline = store.count_tenders().await.unwrap_or_else(|err| {
        warn!(error = %err, "baseline count unavailable; assuming zero");
        0
    });
    let mut run = tokio::spawn(async move { trigger.trigger(request).await });
    let attempts = policy.attempts.max(1);
    let mut last_seen = baseline;

    for attempt in 1..=attempts {
        let mut response = None;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(PollOutcome::Cancelled, attempt, last_seen, None);
            }
            joined = &mut run => {
                response = Some(joined.unwrap_or_else(|err| {
                    TriggerResponse::failure(format!("ingestion task failed: {err}"))
                }));
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }

        match store.count_tenders().await {
            Ok(count) => last_seen = count,
            Err(err) => warn!(attempt, error = %err, "count read failed while polling"),
        }
        let grew = last_seen > baseline;
        match response {
            Some(response) => {
                let outcome = if response.success || grew {
                    PollOutcome::Completed
                } else {
                    PollOutcome::TimedOut
                };
                return finish(outcome, attempt, last_seen, Some(response));
            }
            None if grew => return finish(PollOutcome::Completed, attempt, last_seen, None),
            None => debug!(attempt, last_seen, "ingestion still running"),
        }
    }
    finish(PollOutcome::TimedOut, attempts, last_seen, None)
}

fn finish(outcome: PollOutcome, attempts: u32, tenders_found: u64, trigger: Option<TriggerResponse>) -> TriggerAndWait {
    info!(outcome = ?outcome, attempts, finished = trigger.is_some(), "trigger-and-wait finished");
    TriggerAndWait {
        trigger,
        poll: PollReport {
            outcome,
            attempts,
            tenders_found,
        },
    }
}
