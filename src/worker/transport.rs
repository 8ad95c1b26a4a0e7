use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::worker::LaunchCommand;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("launch client init failed: {0}")]
    Client(String),
    #[error("launch of '{stage_key}' via '{endpoint}' failed: {message}")]
    Request {
        endpoint: String,
        stage_key: String,
        message: String,
    },
}

pub trait LaunchTransport: Send + Sync + 'static {
    fn dispatch(&self, command: &LaunchCommand) -> Result<(), TransportError>;
}

pub type SharedLaunchTransport = Arc<dyn LaunchTransport>;

#[derive(Debug, Default, Clone)]
pub struct LogLaunchTransport;

impl LaunchTransport for LogLaunchTransport {
    fn dispatch(&self, command: &LaunchCommand) -> Result<(), TransportError> {
        info!(
            run = %command.run_id,
            stage = %command.stage_key,
            worker = %command.worker,
            attempt = command.attempt,
            launch_id = %command.launch_id,
            "launch command (no launcher configured)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpLaunchTransport {
    endpoint: Url,
    client: Client,
}

impl HttpLaunchTransport {
    pub fn new(endpoint: Url) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { endpoint, client })
    }
}

impl LaunchTransport for HttpLaunchTransport {
    fn dispatch(&self, command: &LaunchCommand) -> Result<(), TransportError> {
        let request_err = |message: String| TransportError::Request {
            endpoint: self.endpoint.to_string(),
            stage_key: command.stage_key.clone(),
            message,
        };
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(command)
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
