use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pipeline::catalog::MAX_TIMEOUT_SECS;
use crate::pipeline::checklist::Checklist;
use crate::pipeline::coordinator::{CoordinatorError, OperatorAction, Reaction, RunCoordinator};
use crate::pipeline::retry::MAX_BACKOFF_SECS;
use crate::pipeline::RunId;
use crate::worker::transport::SharedLaunchTransport;
use crate::worker::{CompletionEvent, LaunchCommand};

// Catalog limits keep launch deadlines inside this window; hand-edited ones are pulled in.
const MAX_ARMED_WAIT: Duration = Duration::from_secs(MAX_TIMEOUT_SECS + MAX_BACKOFF_SECS);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("coordinator task failed: {0}")]
    Join(String),
}

#[derive(Clone)]
pub struct CoordinatorService {
    coordinator: Arc<RunCoordinator>,
    transport: SharedLaunchTransport,
}

impl CoordinatorService {
    pub fn new(coordinator: Arc<RunCoordinator>, transport: SharedLaunchTransport) -> Self {
        Self {
            coordinator,
            transport,
        }
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    pub async fn start_run(&self, run_id: RunId) -> Result<Reaction, ServiceError> {
        let reaction = self
            .blocking(move |coordinator| coordinator.start_run(&run_id, Utc::now()))
            .await?;
        self.act_on(&reaction);
        Ok(reaction)
    }

    pub async fn handle_completion(&self, event: CompletionEvent) -> Result<Reaction, ServiceError> {
        let reaction = self
            .blocking(move |coordinator| coordinator.handle_completion(&event, Utc::now()))
            .await?;
        self.act_on(&reaction);
        Ok(reaction)
    }

    pub async fn apply_operator_action(
        &self,
        run_id: RunId,
        stage_key: String,
        action: OperatorAction,
    ) -> Result<Reaction, ServiceError> {
        let reaction = self
            .blocking(move |coordinator| {
                coordinator.apply_operator_action(&run_id, stage_key.as_str(), action, Utc::now())
            })
            .await?;
        self.act_on(&reaction);
        Ok(reaction)
    }

    pub async fn checklist(&self, run_id: RunId) -> Result<Checklist, ServiceError> {
        self.blocking(move |coordinator| coordinator.checklist(&run_id))
            .await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunId>, ServiceError> {
        self.blocking(RunCoordinator::list_runs).await
    }

    // Re-arms stage deadlines persisted by a previous process.
    pub async fn resume(&self) -> Result<usize, ServiceError> {
        let deadlines = self
            .blocking(RunCoordinator::pending_deadlines)
            .await?;
        for armed in &deadlines {
            self.arm_deadline(
                armed.run_id.clone(),
                armed.stage_key.clone(),
                armed.attempt,
                armed.deadline,
            );
        }
        info!(armed = deadlines.len(), "resumed stage deadlines");
        Ok(deadlines.len())
    }

    async fn blocking<T, F>(&self, job: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&RunCoordinator) -> Result<T, CoordinatorError> + Send + 'static,
    {
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || job(coordinator.as_ref()))
            .await
            .map_err(|e| ServiceError::Join(e.to_string()))?
            .map_err(ServiceError::from)
    }

    fn act_on(&self, reaction: &Reaction) {
        for launch in &reaction.launches {
            self.dispatch(launch.clone());
            self.arm_deadline(
                launch.run_id.clone(),
                launch.stage_key.clone(),
                launch.attempt,
                launch.deadline,
            );
        }
    }

    fn dispatch(&self, command: LaunchCommand) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if command.delay_secs > 0 {
                debug!(stage = %command.stage_key, delay_secs = command.delay_secs, "waiting out retry backoff");
                tokio::time::sleep(Duration::from_secs(command.delay_secs)).await;
            }
            let run_id = command.run_id.clone();
            let stage_key = command.stage_key.clone();
            match tokio::task::spawn_blocking(move || transport.dispatch(&command)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(
                    run = %run_id,
                    stage = %stage_key,
                    error = %error,
                    "launch dispatch failed; the stage deadline will retry it"
                ),
                Err(error) => error!(run = %run_id, stage = %stage_key, error = %error, "launch task failed"),
            }
        });
    }

    fn arm_deadline(&self, run_id: RunId, stage_key: String, attempt: u32, deadline: DateTime<Utc>) {
        let mut wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if wait > MAX_ARMED_WAIT {
            warn!(run = %run_id, stage = %stage_key, %deadline, "deadline beyond the longest stage wait; arming at the limit");
            wait = MAX_ARMED_WAIT;
        }
        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let id = run_id.clone();
            let key = stage_key.clone();
            let outcome = service
                .blocking(move |coordinator| {
                    coordinator.handle_timeout(&id, key.as_str(), attempt, Utc::now())
                })
                .await;
            match outcome {
                Ok(reaction) => service.act_on(&reaction),
                Err(error) => error!(
                    run = %run_id,
                    stage = %stage_key,
                    attempt,
                    error = %error,
                    "failed to process stage deadline"
                ),
            }
        });
    }
}
