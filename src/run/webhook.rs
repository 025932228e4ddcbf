//! End-of-run notifications.
//!
//! The recorder calls `RunNotifier::run_ended` on every terminal write while
//! it may still hold the database lock, so the webhook notifier only pushes
//! the run id onto a channel. `WebhookDispatcher` drains that channel and
//! POSTs the payload to each subscription of the run's project.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::db::DbHandle;
use super::models::{Project, Run};
use crate::errors::Result;

/// Status codes counted as a successful delivery.
const SUCCESS_STATUS_CODES: [u16; 3] = [200, 201, 202];

pub trait RunNotifier: Send + Sync {
    fn run_ended(&self, run: &Run);
}

/// Notifier that drops every notification.
pub struct NoopNotifier;

impl RunNotifier for NoopNotifier {
    fn run_ended(&self, _run: &Run) {}
}

/// Forwards ended run ids to a `WebhookDispatcher`.
#[derive(Clone)]
pub struct WebhookNotifier {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl WebhookNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RunNotifier for WebhookNotifier {
    fn run_ended(&self, run: &Run) {
        if self.tx.send(run.uuid).is_err() {
            debug!(run_id = %run.uuid, "Webhook dispatcher gone, notification dropped");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub uuid: Uuid,
    pub project_id: Uuid,
    pub target_url: String,
    pub created_date: DateTime<Utc>,
    pub response_status_code: Option<u16>,
    pub response_text: String,
    pub delivery_error: String,
}

impl WebhookSubscription {
    pub fn delivered(&self) -> bool {
        self.response_status_code.is_some()
    }

    pub fn success(&self) -> bool {
        self.response_status_code
            .is_some_and(|code| SUCCESS_STATUS_CODES.contains(&code))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub project: ProjectSummary,
    pub run: RunSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub uuid: Uuid,
    pub pipeline_name: String,
    pub status: String,
    pub runner_version: String,
}

impl WebhookPayload {
    pub fn new(project: &Project, run: &Run) -> Self {
        Self {
            project: ProjectSummary {
                uuid: project.uuid,
                name: project.name.clone(),
            },
            run: RunSummary {
                uuid: run.uuid,
                pipeline_name: run.pipeline_name.clone(),
                status: run.status().to_string(),
                runner_version: run.runner_version.clone(),
            },
        }
    }
}

pub struct WebhookDispatcher {
    db: DbHandle,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(db: DbHandle, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self { db, client })
    }

    /// Deliver every subscription of the run's project. Returns the number
    /// of subscriptions that answered with a success status code.
    pub async fn deliver_for_run(&self, run_id: Uuid) -> Result<usize> {
        let (project, run, subscriptions) = self
            .db
            .call(move |db| {
                let run = db.require_run(run_id)?;
                let project = db.require_project(run.project_id)?;
                let subscriptions = db.list_webhook_subscriptions(project.uuid)?;
                Ok((project, run, subscriptions))
            })
            .await?;

        let payload = WebhookPayload::new(&project, &run);
        let mut succeeded = 0;
        for subscription in &subscriptions {
            if self.deliver(subscription, &payload).await? {
                succeeded += 1;
            }
        }
        Ok(succeeded)
    }

    /// POST the payload to one subscription and store the response, or the
    /// delivery error when the request could not be made.
    pub async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        payload: &WebhookPayload,
    ) -> Result<bool> {
        info!(webhook = %subscription.uuid, "Sending webhook");
        let sub_id = subscription.uuid;

        let response = self
            .client
            .post(&subscription.target_url)
            .json(payload)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(webhook = %sub_id, error = %e, "Webhook delivery failed");
                let error = e.to_string();
                self.db
                    .call(move |db| db.record_webhook_error(sub_id, &error))
                    .await?;
                return Ok(false);
            }
        };

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        self.db
            .call(move |db| db.record_webhook_response(sub_id, status, &text))
            .await?;

        let success = SUCCESS_STATUS_CODES.contains(&status);
        if success {
            info!(webhook = %sub_id, "Webhook delivered and received");
        } else {
            warn!(webhook = %sub_id, status, "Webhook returned a non-success status");
        }
        Ok(success)
    }

    /// Deliver notifications until the channel closes or `shutdown` fires.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Uuid>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => {
                    let Some(run_id) = next else { break };
                    if let Err(e) = self.deliver_for_run(run_id).await {
                        warn!(run_id = %run_id, error = %e, "Webhook delivery aborted");
                    }
                }
            }
        }
        // Flush what was already queued before shutdown.
        while let Ok(run_id) = rx.try_recv() {
            if let Err(e) = self.deliver_for_run(run_id).await {
                warn!(run_id = %run_id, error = %e, "Webhook delivery aborted");
            }
        }
    }
}
