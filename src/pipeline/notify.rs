use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::pipeline::RunId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub run_id: RunId,
    pub stage_key: String,
    pub stage: String,
    pub attempt: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunCompletion {
    pub run_id: RunId,
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub abandoned: Vec<String>,
    pub at: DateTime<Utc>,
}

impl RunCompletion {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.abandoned.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification client init failed: {0}")]
    Client(String),
    #[error("notification request to '{endpoint}' failed: {message}")]
    Request { endpoint: String, message: String },
}

pub trait Notifier: Send + Sync + 'static {
    fn escalate(&self, escalation: &Escalation) -> Result<(), NotifyError>;

    fn run_completed(&self, completion: &RunCompletion) -> Result<(), NotifyError>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn escalate(&self, escalation: &Escalation) -> Result<(), NotifyError> {
        error!(
            run = %escalation.run_id,
            stage = %escalation.stage_key,
            attempt = escalation.attempt,
            reason = %escalation.reason,
            "critical stage abandoned; operator attention required"
        );
        Ok(())
    }

    fn run_completed(&self, completion: &RunCompletion) -> Result<(), NotifyError> {
        info!(
            run = %completion.run_id,
            succeeded = completion.succeeded.len(),
            skipped = completion.skipped.len(),
            abandoned = completion.abandoned.len(),
            "run reached a terminal state"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    endpoint: Url,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(endpoint: Url) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        Ok(Self { endpoint, client })
    }

    fn post(&self, body: serde_json::Value) -> Result<(), NotifyError> {
        let request_err = |message: String| NotifyError::Request {
            endpoint: self.endpoint.to_string(),
            message,
        };
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .map_err(|e| request_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(request_err(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn escalate(&self, escalation: &Escalation) -> Result<(), NotifyError> {
        LogNotifier.escalate(escalation)?;
        self.post(json!({
            "event": "escalation",
            "escalation": escalation,
        }))
    }

    fn run_completed(&self, completion: &RunCompletion) -> Result<(), NotifyError> {
        LogNotifier.run_completed(completion)?;
        self.post(json!({
            "event": "run_completed",
            "completion": completion,
        }))
    }
}
