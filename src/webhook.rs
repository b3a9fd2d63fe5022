//! Webhook Dispatcher (C8) — notifies `callbackUrl`s with the terminal
//! state of a job. Sends run on their own worker pool (a bounded mpsc
//! channel drained by a fixed number of `tokio::spawn`ed loops) so a slow
//! or unreachable subscriber never blocks a partition worker (spec.md
//! §4.8: "webhook sends must not block the pipeline").

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::WebhookConfig;
use crate::domain::job::JobStatus;
use crate::domain::{Job, SwapBlotter};

/// JSON body shape from spec.md §6: `{jobId, status, progress, message?,
/// tradeId?, tradeStatus?, swapBlotter?, error?: {code,message}, createdAt,
/// updatedAt}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_blotter: Option<SwapBlotter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WebhookError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookError {
    pub code: String,
    pub message: String,
}

impl WebhookPayload {
    pub fn from_job(job: &Job, blotter: Option<&SwapBlotter>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
            trade_id: job.trade_id.clone(),
            trade_status: blotter.map(|b| b.enrichment_status.to_string()),
            swap_blotter: blotter.cloned(),
            error: job.error_code.clone().map(|code| WebhookError {
                code,
                message: job.error_message.clone().unwrap_or_default(),
            }),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// A queued webhook delivery: the destination URL plus the body to send.
struct Delivery {
    callback_url: String,
    payload: WebhookPayload,
}

/// Handle used by callers (the partition dispatcher) to enqueue a
/// delivery without waiting for it.
#[derive(Clone)]
pub struct WebhookDispatcher {
    tx: mpsc::Sender<Delivery>,
}

impl WebhookDispatcher {
    /// Spawn `worker_count` send loops draining a shared bounded queue.
    /// Returns the dispatcher handle; the workers run for the lifetime of
    /// the process (no explicit shutdown — the channel is dropped with the
    /// handle, which ends the loops).
    pub fn spawn(config: WebhookConfig, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| Client::new());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..worker_count.max(1) {
            let rx = rx.clone();
            let client = client.clone();
            let config = config.clone();
            tokio::spawn(async move {
                loop {
                    let delivery = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(delivery) = delivery else { break };
                    send_with_retry(&client, &config, delivery).await;
                }
            });
        }
        Self { tx }
    }

    /// Enqueue a delivery. Never blocks the caller beyond the bounded
    /// channel's backpressure; a full queue is itself a signal the worker
    /// pool is falling behind, surfaced by the channel's own send latency.
    pub async fn notify(&self, callback_url: String, payload: WebhookPayload) {
        if self.tx.send(Delivery { callback_url, payload }).await.is_err() {
            tracing::warn!("webhook dispatcher channel closed, dropping delivery");
        }
    }
}

/// Up to `max_retries` attempts with linear `1s * attempt` backoff, per
/// spec.md §4.8. Exhaustion is logged, not escalated — the job's terminal
/// status is already durable by the time a webhook is enqueued.
async fn send_with_retry(client: &Client, config: &WebhookConfig, delivery: Delivery) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = client
            .post(&delivery.callback_url)
            .json(&delivery.payload)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url = %delivery.callback_url, attempt, "webhook delivered");
                return;
            }
            Ok(resp) => {
                tracing::warn!(url = %delivery.callback_url, attempt, status = %resp.status(), "webhook rejected");
            }
            Err(err) => {
                tracing::warn!(url = %delivery.callback_url, attempt, error = %err, "webhook send failed");
            }
        }

        if attempt >= config.max_retries {
            tracing::error!(url = %delivery.callback_url, attempt, "webhook delivery exhausted retries, giving up");
            return;
        }
        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_omits_absent_optional_fields() {
        let job = Job::new_pending("J1".into(), Some("T1".into()));
        let payload = WebhookPayload::from_job(&job, None);
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("swapBlotter").is_none() || json.get("swap_blotter").is_none());
    }

    #[tokio::test]
    async fn dispatcher_accepts_notifications_without_blocking() {
        let dispatcher = WebhookDispatcher::spawn(WebhookConfig { max_retries: 1, timeout_secs: 1 }, 1);
        let job = Job::new_pending("J1".into(), Some("T1".into()));
        dispatcher
            .notify("http://127.0.0.1:0/unreachable".into(), WebhookPayload::from_job(&job, None))
            .await;
    }
}
