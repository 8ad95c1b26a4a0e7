use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::catalog::{FanOut, InputBinding, StageCatalog, StageDefinition};
use crate::pipeline::checklist::{split_stage_key, stage_key, Checklist};
use crate::pipeline::checklist_store::{ChecklistStoreError, SharedChecklistStore};
use crate::pipeline::notify::{Escalation, RunCompletion, SharedNotifier};
use crate::pipeline::retry::{on_failure, RetryDecision};
use crate::pipeline::{RunId, StageStatus};
use crate::worker::{CompletionEvent, CompletionOutcome, LaunchCommand};

const OPERATOR_SKIP_REASON: &str = "skipped by operator";
const OPERATOR_ABANDON_REASON: &str = "abandoned by operator";
const DEADLINE_REASON: &str = "deadline exceeded without a completion event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Abandon,
    Retry,
    Skip,
}

impl OperatorAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abandon => "abandon",
            Self::Retry => "retry",
            Self::Skip => "skip",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abandon" => Some(Self::Abandon),
            "retry" => Some(Self::Retry),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub stage_key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reaction {
    pub launches: Vec<LaunchCommand>,
    pub anomalies: Vec<Anomaly>,
    pub escalations: Vec<Escalation>,
    pub run_completed: bool,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArmedDeadline {
    pub run_id: RunId,
    pub stage_key: String,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("unknown run type '{0}'")]
    UnknownRunType(String),
    #[error("unknown stage '{stage_key}' for run {run_id}")]
    UnknownStage { run_id: String, stage_key: String },
    #[error("cannot {action} stage '{stage_key}': {reason}")]
    OperatorRejected {
        action: &'static str,
        stage_key: String,
        reason: String,
    },
    #[error("run {run_id} stage '{stage_key}' violates dependency order: {message}")]
    InvariantViolation {
        run_id: String,
        stage_key: String,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] ChecklistStoreError),
    #[error("coordinator lock poisoned for {0}")]
    LockPoisoned(String),
}

#[derive(Debug, Default)]
struct RunSlot {
    cached: Option<Checklist>,
}

pub struct RunCoordinator {
    catalog: Arc<StageCatalog>,
    store: SharedChecklistStore,
    notifier: SharedNotifier,
    slots: Mutex<HashMap<RunId, Arc<Mutex<RunSlot>>>>,
}

impl RunCoordinator {
    pub fn new(
        catalog: Arc<StageCatalog>,
        store: SharedChecklistStore,
        notifier: SharedNotifier,
    ) -> Self {
        Self {
            catalog,
            store,
            notifier,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<StageCatalog> {
        &self.catalog
    }

    pub fn start_run(
        &self,
        run_id: &RunId,
        now: DateTime<Utc>,
    ) -> Result<Reaction, CoordinatorError> {
        self.transact(run_id, now, |transition| {
            transition.start();
            Ok(())
        })
    }

    pub fn handle_completion(
        &self,
        event: &CompletionEvent,
        now: DateTime<Utc>,
    ) -> Result<Reaction, CoordinatorError> {
        self.transact(&event.run_id, now, |transition| transition.complete(event))
    }

    pub fn handle_timeout(
        &self,
        run_id: &RunId,
        stage_key: &str,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<Reaction, CoordinatorError> {
        self.transact(run_id, now, |transition| {
            transition.time_out(stage_key, attempt)
        })
    }

    pub fn apply_operator_action(
        &self,
        run_id: &RunId,
        stage_key: &str,
        action: OperatorAction,
        now: DateTime<Utc>,
    ) -> Result<Reaction, CoordinatorError> {
        self.transact(run_id, now, |transition| {
            transition.operator(stage_key, action)
        })
    }

    pub fn checklist(&self, run_id: &RunId) -> Result<Checklist, CoordinatorError> {
        self.ensure_run_type(run_id)?;
        let handle = self.slot(run_id)?;
        let checklist = {
            let _guard = handle
                .lock()
                .map_err(|_| CoordinatorError::LockPoisoned(run_id.to_string()))?;
            self.store.load(run_id)?
        };
        if checklist.retired || !checklist.is_started() {
            self.release_slot(run_id, handle);
        }
        Ok(checklist)
    }

    pub fn list_runs(&self) -> Result<Vec<RunId>, CoordinatorError> {
        Ok(self.store.list_runs()?)
    }

    pub fn pending_deadlines(&self) -> Result<Vec<ArmedDeadline>, CoordinatorError> {
        let mut armed = Vec::new();
        for run_id in self.store.list_runs()? {
            if !self.catalog.has_run_type(run_id.run_type.as_str()) {
                warn!(run = %run_id, "skipping persisted run with a run type the catalog does not declare");
                continue;
            }
            let checklist = self.checklist(&run_id)?;
            if checklist.retired {
                continue;
            }
            for (key, record) in &checklist.stages {
                if record.status != StageStatus::Running {
                    continue;
                }
                if let Some(deadline) = record.deadline {
                    armed.push(ArmedDeadline {
                        run_id: run_id.clone(),
                        stage_key: key.clone(),
                        attempt: record.attempt,
                        deadline,
                    });
                }
            }
        }
        Ok(armed)
    }

    fn ensure_run_type(&self, run_id: &RunId) -> Result<(), CoordinatorError> {
        if self.catalog.has_run_type(run_id.run_type.as_str()) {
            Ok(())
        } else {
            Err(CoordinatorError::UnknownRunType(run_id.run_type.clone()))
        }
    }

    fn slot(&self, run_id: &RunId) -> Result<Arc<Mutex<RunSlot>>, CoordinatorError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CoordinatorError::LockPoisoned(String::from("run registry")))?;
        Ok(slots.entry(run_id.clone()).or_default().clone())
    }

    fn transact<F>(
        &self,
        run_id: &RunId,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Reaction, CoordinatorError>
    where
        F: FnOnce(&mut RunTransition<'_>) -> Result<(), CoordinatorError>,
    {
        self.ensure_run_type(run_id)?;
        let handle = self.slot(run_id)?;
        let (reaction, retired) = {
            let mut slot = handle
                .lock()
                .map_err(|_| CoordinatorError::LockPoisoned(run_id.to_string()))?;
            self.transact_locked(run_id, &mut slot, now, apply)?
        };
        if retired {
            self.release_slot(run_id, handle);
        }
        Ok(reaction)
    }

    // Drops the slot of a retired run unless another event for it is queued on the lock.
    fn release_slot(&self, run_id: &RunId, handle: Arc<Mutex<RunSlot>>) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        if Arc::strong_count(&handle) == 2 {
            slots.remove(run_id);
        }
    }

    fn transact_locked<F>(
        &self,
        run_id: &RunId,
        slot: &mut RunSlot,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<(Reaction, bool), CoordinatorError>
    where
        F: FnOnce(&mut RunTransition<'_>) -> Result<(), CoordinatorError>,
    {
        let stored = self.store.load(run_id)?;
        let base = reconcile(slot.cached.take(), stored);
        if let Some(digest) = base.catalog_digest.as_deref() {
            if digest != self.catalog.digest() {
                warn!(
                    run = %run_id,
                    "stage catalog changed since this run started; continuing with the loaded catalog"
                );
            }
        }

        let mut transition = RunTransition::new(self.catalog.as_ref(), base.clone(), now);
        apply(&mut transition)?;
        transition.finish();
        let RunTransition {
            checklist: mut next,
            launches,
            anomalies,
            escalations,
            run_completed,
            ..
        } = transition;

        for anomaly in &anomalies {
            warn!(
                run = %run_id,
                stage = %anomaly.stage_key,
                anomaly = %anomaly.message,
                "discarding event"
            );
        }

        if next == base {
            let version = base.version;
            let retired = base.retired;
            slot.cached = (!retired).then_some(base);
            return Ok((
                Reaction {
                    anomalies,
                    version,
                    ..Reaction::default()
                },
                retired,
            ));
        }

        if let Err(error) = self.store.save(run_id, &mut next) {
            error!(run = %run_id, error = %error, "failed to persist checklist; event not acknowledged");
            return Err(error.into());
        }
        slot.cached = (!next.retired).then(|| next.clone());

        for launch in &launches {
            info!(
                run = %run_id,
                stage = %launch.stage_key,
                worker = %launch.worker,
                attempt = launch.attempt,
                delay_secs = launch.delay_secs,
                "launching stage"
            );
        }
        for escalation in &escalations {
            if let Err(error) = self.notifier.escalate(escalation) {
                error!(run = %run_id, stage = %escalation.stage_key, error = %error, "escalation delivery failed");
            }
        }
        if run_completed {
            if let Err(error) = self.store.archive(&next) {
                warn!(run = %run_id, error = %error, "failed to archive retired checklist");
            }
            let completion = summarize(&next, now);
            if let Err(error) = self.notifier.run_completed(&completion) {
                error!(run = %run_id, error = %error, "run completion notification failed");
            }
        }

        Ok((
            Reaction {
                launches,
                anomalies,
                escalations,
                run_completed,
                version: next.version,
            },
            next.retired,
        ))
    }
}

fn reconcile(cached: Option<Checklist>, stored: Checklist) -> Checklist {
    match cached {
        Some(cached) if cached == stored => cached,
        Some(cached) => {
            info!(
                run = %stored.run_id,
                cached_version = cached.version,
                stored_version = stored.version,
                "checklist changed outside the coordinator; using stored copy"
            );
            stored
        }
        None => stored,
    }
}

fn summarize(checklist: &Checklist, now: DateTime<Utc>) -> RunCompletion {
    let mut completion = RunCompletion {
        run_id: checklist.run_id.clone(),
        succeeded: Vec::new(),
        skipped: Vec::new(),
        abandoned: Vec::new(),
        at: now,
    };
    for (key, record) in &checklist.stages {
        match record.status {
            StageStatus::Succeeded => completion.succeeded.push(key.clone()),
            StageStatus::Skipped => completion.skipped.push(key.clone()),
            StageStatus::Abandoned => completion.abandoned.push(key.clone()),
            _ => {}
        }
    }
    completion
}

fn deadline_after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct RunTransition<'a> {
    catalog: &'a StageCatalog,
    checklist: Checklist,
    now: DateTime<Utc>,
    launches: Vec<LaunchCommand>,
    anomalies: Vec<Anomaly>,
    escalations: Vec<Escalation>,
    run_completed: bool,
}

impl<'a> RunTransition<'a> {
    fn new(catalog: &'a StageCatalog, checklist: Checklist, now: DateTime<Utc>) -> Self {
        Self {
            catalog,
            checklist,
            now,
            launches: Vec::new(),
            anomalies: Vec::new(),
            escalations: Vec::new(),
            run_completed: false,
        }
    }

    fn run_type(&self) -> String {
        self.checklist.run_id.run_type.clone()
    }

    fn run_label(&self) -> String {
        self.checklist.run_id.to_string()
    }

    fn anomaly(&mut self, stage_key: &str, message: impl Into<String>) {
        self.anomalies.push(Anomaly {
            stage_key: stage_key.to_string(),
            message: message.into(),
        });
    }

    fn definition(&self, stage: &str) -> Option<&'a StageDefinition> {
        let run_type = self.run_type();
        self.catalog
            .get(stage)
            .filter(|definition| definition.applies_to(run_type.as_str()))
    }

    fn start(&mut self) {
        if self.checklist.retired {
            self.anomaly("*", "run already retired; start ignored");
            return;
        }
        if self.checklist.created_at.is_none() {
            self.checklist.created_at = Some(self.now);
            self.checklist.catalog_digest = Some(self.catalog.digest().to_string());
            info!(run = %self.run_label(), "starting run");
        }
        self.advance();
    }

    fn advance(&mut self) {
        let catalog = self.catalog;
        let run_type = self.run_type();
        for definition in catalog.stages_for(run_type.as_str()) {
            if self.checklist.status_of(definition.name.as_str()) != StageStatus::Pending {
                continue;
            }
            if !catalog.ready(definition.name.as_str(), &self.checklist) {
                continue;
            }
            self.launch_stage(definition);
        }
    }

    fn launch_stage(&mut self, definition: &StageDefinition) {
        match &definition.fan_out {
            None => self.launch(definition, None, Duration::ZERO),
            Some(fan_out) => self.expand_fan_out(definition, fan_out),
        }
    }

    fn expand_fan_out(&mut self, definition: &StageDefinition, fan_out: &FanOut) {
        let raw_items = match fan_out {
            FanOut::Static { items } => items.clone(),
            FanOut::Payload { stage, field } => self
                .checklist
                .get(stage.as_str())
                .and_then(|record| record.result.as_ref())
                .and_then(|result| result.list_field(field.as_str()))
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
        };
        let mut seen = HashSet::new();
        let items = raw_items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty() && seen.insert(item.clone()))
            .collect::<Vec<_>>();

        let now = self.now;
        let parent = self
            .checklist
            .record_mut_or_pending(definition.name.as_str(), None);
        parent.status = StageStatus::Running;
        parent.attempt += 1;
        parent.last_attempt_at = Some(now);
        parent.deadline = None;
        parent.result = None;
        parent.failure_reason = None;
        parent.skipped_because = None;

        if items.is_empty() {
            parent.status = StageStatus::Succeeded;
            info!(run = %self.run_label(), stage = %definition.name, "fan-out stage has no items; marking succeeded");
            return;
        }

        for item in &items {
            let key = stage_key(definition.name.as_str(), Some(item.as_str()));
            if self.checklist.status_of(key.as_str()) == StageStatus::Pending {
                self.launch(definition, Some(item.as_str()), Duration::ZERO);
            }
        }
    }

    fn launch(&mut self, definition: &StageDefinition, item: Option<&str>, delay: Duration) {
        let args = self.launch_args(definition, item);
        let key = stage_key(definition.name.as_str(), item);
        let delay_secs = delay.as_secs();
        let deadline = deadline_after(self.now, delay_secs.saturating_add(definition.timeout_secs));
        let launch_id = Uuid::new_v4();
        let now = self.now;

        let record = self
            .checklist
            .record_mut_or_pending(definition.name.as_str(), item);
        record.status = StageStatus::Running;
        record.attempt += 1;
        record.last_attempt_at = Some(now);
        record.deadline = Some(deadline);
        record.launch_id = Some(launch_id);
        record.result = None;
        record.skipped_because = None;
        let attempt = record.attempt;

        self.launches.push(LaunchCommand {
            launch_id,
            run_id: self.checklist.run_id.clone(),
            stage_key: key,
            stage: definition.name.clone(),
            item: item.map(str::to_string),
            worker: definition.worker.clone(),
            attempt,
            args,
            delay_secs,
            deadline,
        });
    }

    fn launch_args(
        &self,
        definition: &StageDefinition,
        item: Option<&str>,
    ) -> BTreeMap<String, Value> {
        let mut args = BTreeMap::new();
        args.insert(
            String::from("run_type"),
            Value::String(self.checklist.run_id.run_type.clone()),
        );
        args.insert(
            String::from("run_date"),
            Value::String(self.checklist.run_id.date_str()),
        );
        if let Some(item) = item {
            args.insert(String::from("item"), Value::String(item.to_string()));
        }
        for binding in &definition.inputs {
            args.insert(binding.arg.clone(), self.binding_value(binding));
        }
        args
    }

    fn binding_value(&self, binding: &InputBinding) -> Value {
        let upstream_fans_out = self
            .catalog
            .get(binding.stage.as_str())
            .is_some_and(StageDefinition::is_fan_out);
        if upstream_fans_out {
            return Value::Array(
                self.checklist
                    .instances_of(binding.stage.as_str())
                    .filter_map(|(_, record)| record.result.as_ref())
                    .filter_map(|result| result.field(binding.field.as_str()))
                    .collect(),
            );
        }
        self.checklist
            .get(binding.stage.as_str())
            .and_then(|record| record.result.as_ref())
            .and_then(|result| result.field(binding.field.as_str()))
            .unwrap_or(Value::Null)
    }

    fn complete(&mut self, event: &CompletionEvent) -> Result<(), CoordinatorError> {
        let key = event.stage_key.as_str();
        let (stage, item) = split_stage_key(key);
        let Some(definition) = self.definition(stage) else {
            self.anomaly(key, "completion for a stage this run type does not declare");
            return Ok(());
        };
        if definition.is_fan_out() && item.is_none() {
            self.anomaly(key, "completion addressed to a fan-out stage instead of one of its items");
            return Ok(());
        }
        if !definition.is_fan_out() && item.is_some() {
            self.anomaly(key, "completion carries an item for a stage that does not fan out");
            return Ok(());
        }
        let Some(record) = self.checklist.get(key).cloned() else {
            self.anomaly(key, "completion for a stage that was never launched");
            return Ok(());
        };
        if event.attempt > record.attempt {
            self.anomaly(
                key,
                format!(
                    "completion for attempt {} but only {} launched",
                    event.attempt, record.attempt
                ),
            );
            return Ok(());
        }

        let mut update = record.clone();
        update.attempt = event.attempt;
        update.deadline = None;
        match &event.outcome {
            CompletionOutcome::Success { result } if result.kind() == definition.produces => {
                update.status = StageStatus::Succeeded;
                update.result = Some(result.clone());
                update.failure_reason = None;
            }
            CompletionOutcome::Success { result } => {
                update.status = StageStatus::Failed;
                update.result = None;
                update.failure_reason = Some(format!(
                    "worker contract violation: expected {} result, got {}",
                    definition.produces,
                    result.kind()
                ));
            }
            CompletionOutcome::Failure { reason } => {
                update.status = StageStatus::Failed;
                update.failure_reason = Some(reason.clone());
            }
        }

        let applicable =
            record.status == StageStatus::Running && event.attempt == record.attempt;
        if applicable && update.status == StageStatus::Failed {
            update.failures = record.failures + 1;
        }
        if applicable && update.status == StageStatus::Succeeded {
            if let Some(missing) = definition
                .predecessors
                .iter()
                .find(|predecessor| !self.checklist.is_succeeded(predecessor.as_str()))
            {
                return Err(CoordinatorError::InvariantViolation {
                    run_id: self.run_label(),
                    stage_key: key.to_string(),
                    message: format!("predecessor '{missing}' has not succeeded"),
                });
            }
        }

        let status = update.status;
        let outcome = self.checklist.merge(key, update);
        if let Some(message) = outcome.anomaly() {
            self.anomaly(key, message);
            return Ok(());
        }

        if status == StageStatus::Succeeded {
            info!(run = %self.run_label(), stage = %key, attempt = event.attempt, "stage succeeded");
            if item.is_some() {
                self.refresh_fan_out(definition);
            }
            self.advance();
        } else {
            self.handle_failure(key, definition, item);
        }
        Ok(())
    }

    fn handle_failure(&mut self, key: &str, definition: &StageDefinition, item: Option<&str>) {
        let reason = self
            .checklist
            .get(key)
            .and_then(|record| record.failure_reason.clone())
            .unwrap_or_else(|| String::from("stage failed"));
        if item.is_some() && self.checklist.status_of(definition.name.as_str()).is_terminal() {
            info!(run = %self.run_label(), stage = %key, reason = %reason, "fan-out stage already settled; not retrying item");
            if let Some(record) = self.checklist.get_mut(key) {
                record.status = StageStatus::Abandoned;
                record.deadline = None;
            }
            return;
        }
        match on_failure(key, &self.checklist, definition) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    run = %self.run_label(),
                    stage = %key,
                    attempt,
                    delay_secs = delay.as_secs(),
                    reason = %reason,
                    "stage failed; scheduling retry"
                );
                if let Some(record) = self.checklist.get_mut(key) {
                    record.status = StageStatus::Pending;
                }
                self.launch(definition, item, delay);
            }
            RetryDecision::Abandon { escalate } => {
                warn!(run = %self.run_label(), stage = %key, reason = %reason, "retries exhausted; abandoning stage");
                self.abandon(key, definition, item, reason, escalate);
            }
        }
    }

    fn abandon(
        &mut self,
        key: &str,
        definition: &StageDefinition,
        item: Option<&str>,
        reason: String,
        escalate: bool,
    ) {
        let record = self
            .checklist
            .record_mut_or_pending(definition.name.as_str(), item);
        record.status = StageStatus::Abandoned;
        record.deadline = None;
        record.failure_reason = Some(reason.clone());
        let attempt = record.attempt;

        if item.is_some() {
            let parent = self
                .checklist
                .record_mut_or_pending(definition.name.as_str(), None);
            if parent.status == StageStatus::Abandoned {
                return;
            }
            parent.status = StageStatus::Abandoned;
            parent.failure_reason = Some(format!("{key} abandoned: {reason}"));
        }

        if escalate {
            self.escalations.push(Escalation {
                run_id: self.checklist.run_id.clone(),
                stage_key: key.to_string(),
                stage: definition.name.clone(),
                attempt,
                reason,
                at: self.now,
            });
        }
        self.skip_dependents(definition, format!("{} abandoned", definition.name));
    }

    fn skip_dependents(&mut self, definition: &StageDefinition, cause: String) {
        let catalog = self.catalog;
        let run_type = self.run_type();
        for dependent in catalog.transitive_dependents(definition.name.as_str(), run_type.as_str()) {
            self.skip_key(dependent.name.as_str(), cause.as_str());
            for key in self.checklist.instance_keys(dependent.name.as_str()) {
                self.skip_key(key.as_str(), cause.as_str());
            }
        }
    }

    fn skip_key(&mut self, key: &str, cause: &str) {
        let (stage, item) = split_stage_key(key);
        let record = self.checklist.record_mut_or_pending(stage, item);
        if record.status.is_terminal() {
            return;
        }
        record.status = StageStatus::Skipped;
        record.deadline = None;
        record.skipped_because = Some(cause.to_string());
    }

    fn refresh_fan_out(&mut self, definition: &StageDefinition) {
        let name = definition.name.as_str();
        let statuses = self
            .checklist
            .instances_of(name)
            .map(|(_, record)| record.status)
            .collect::<Vec<_>>();
        if statuses.is_empty() {
            return;
        }
        let parent_status = self.checklist.status_of(name);

        if statuses.iter().all(|status| *status == StageStatus::Succeeded) {
            if parent_status != StageStatus::Succeeded {
                let parent = self.checklist.record_mut_or_pending(name, None);
                parent.status = StageStatus::Succeeded;
                parent.failure_reason = None;
                info!(run = %self.run_label(), stage = %name, items = statuses.len(), "all fan-out items succeeded");
            }
            return;
        }
        if parent_status.is_terminal() {
            return;
        }
        if statuses.iter().all(|status| status.is_terminal()) {
            let parent = self.checklist.record_mut_or_pending(name, None);
            parent.status = StageStatus::Skipped;
            parent.skipped_because = Some(format!("{name} items did not all succeed"));
            self.skip_dependents(definition, format!("{name} skipped"));
        }
    }

    fn time_out(&mut self, key: &str, attempt: u32) -> Result<(), CoordinatorError> {
        let current = self
            .checklist
            .get(key)
            .is_some_and(|record| record.status == StageStatus::Running && record.attempt == attempt);
        if !current {
            debug!(run = %self.run_label(), stage = %key, attempt, "deadline no longer applies");
            return Ok(());
        }
        warn!(run = %self.run_label(), stage = %key, attempt, "stage deadline exceeded");
        let event = CompletionEvent::failure(
            self.checklist.run_id.clone(),
            key,
            attempt,
            DEADLINE_REASON,
        );
        self.complete(&event)
    }

    fn operator(&mut self, key: &str, action: OperatorAction) -> Result<(), CoordinatorError> {
        let (stage, item) = split_stage_key(key);
        let unknown = || CoordinatorError::UnknownStage {
            run_id: self.run_label(),
            stage_key: key.to_string(),
        };
        let definition = self.definition(stage).ok_or_else(unknown)?;
        if item.is_some() && (!definition.is_fan_out() || self.checklist.get(key).is_none()) {
            return Err(unknown());
        }
        info!(run = %self.run_label(), stage = %key, action = action.as_str(), "operator action");
        match action {
            OperatorAction::Abandon => self.force_abandon(key, definition, item),
            OperatorAction::Skip => self.force_skip(key, definition, item),
            OperatorAction::Retry => self.force_retry(key, definition, item),
        }
    }

    fn rejected(&self, action: OperatorAction, key: &str, reason: String) -> CoordinatorError {
        CoordinatorError::OperatorRejected {
            action: action.as_str(),
            stage_key: key.to_string(),
            reason,
        }
    }

    fn force_abandon(
        &mut self,
        key: &str,
        definition: &StageDefinition,
        item: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let status = self.checklist.status_of(key);
        if status.is_terminal() {
            return Err(self.rejected(
                OperatorAction::Abandon,
                key,
                format!("stage is already {status}"),
            ));
        }
        if item.is_none() && definition.is_fan_out() {
            for instance in self.checklist.instance_keys(definition.name.as_str()) {
                if let Some(record) = self.checklist.get_mut(instance.as_str()) {
                    if !record.status.is_terminal() {
                        record.status = StageStatus::Abandoned;
                        record.deadline = None;
                        record.failure_reason = Some(String::from(OPERATOR_ABANDON_REASON));
                    }
                }
            }
        }
        self.abandon(
            key,
            definition,
            item,
            String::from(OPERATOR_ABANDON_REASON),
            definition.critical,
        );
        Ok(())
    }

    fn force_skip(
        &mut self,
        key: &str,
        definition: &StageDefinition,
        item: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let status = self.checklist.status_of(key);
        if status.is_terminal() {
            return Err(self.rejected(
                OperatorAction::Skip,
                key,
                format!("stage is already {status}"),
            ));
        }
        if item.is_none() && definition.is_fan_out() {
            for instance in self.checklist.instance_keys(definition.name.as_str()) {
                self.skip_key(instance.as_str(), OPERATOR_SKIP_REASON);
            }
        }
        self.skip_key(key, OPERATOR_SKIP_REASON);
        match item {
            Some(_) => self.refresh_fan_out(definition),
            None => self.skip_dependents(definition, format!("{} skipped", definition.name)),
        }
        Ok(())
    }

    fn force_retry(
        &mut self,
        key: &str,
        definition: &StageDefinition,
        item: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let status = self.checklist.status_of(key);
        if matches!(status, StageStatus::Succeeded | StageStatus::Pending) {
            return Err(self.rejected(
                OperatorAction::Retry,
                key,
                format!("stage is {status}; nothing to retry"),
            ));
        }
        if let Some(missing) = definition
            .predecessors
            .iter()
            .find(|predecessor| !self.checklist.is_succeeded(predecessor.as_str()))
        {
            return Err(self.rejected(
                OperatorAction::Retry,
                key,
                format!("predecessor '{missing}' has not succeeded"),
            ));
        }

        if self.checklist.retired {
            info!(run = %self.run_label(), "reopening retired run for operator retry");
            self.checklist.retired = false;
            self.checklist.retired_at = None;
        }

        match (item, definition.is_fan_out()) {
            (None, false) => {
                self.reset_for_retry(key);
                self.launch(definition, None, Duration::ZERO);
            }
            (None, true) => {
                let instances = self.checklist.instance_keys(definition.name.as_str());
                if instances.is_empty() {
                    self.reset_for_retry(key);
                    self.launch_stage(definition);
                } else {
                    if let Some(parent) = self.checklist.get_mut(key) {
                        parent.status = StageStatus::Running;
                        parent.failure_reason = None;
                        parent.skipped_because = None;
                    }
                    for instance in instances {
                        if self.checklist.is_succeeded(instance.as_str()) {
                            continue;
                        }
                        let (_, instance_item) = split_stage_key(instance.as_str());
                        self.reset_for_retry(instance.as_str());
                        self.launch(definition, instance_item, Duration::ZERO);
                    }
                }
            }
            (Some(item), _) => {
                self.reset_for_retry(key);
                self.launch(definition, Some(item), Duration::ZERO);
                if let Some(parent) = self.checklist.get_mut(definition.name.as_str()) {
                    if parent.status != StageStatus::Running {
                        parent.status = StageStatus::Running;
                        parent.failure_reason = None;
                        parent.skipped_because = None;
                    }
                }
            }
        }

        self.restore_dependents(definition);
        self.advance();
        Ok(())
    }

    fn reset_for_retry(&mut self, key: &str) {
        if let Some(record) = self.checklist.get_mut(key) {
            record.status = StageStatus::Pending;
            record.failures = 0;
            record.skipped_because = None;
        }
    }

    fn restore_dependents(&mut self, definition: &StageDefinition) {
        let catalog = self.catalog;
        let run_type = self.run_type();
        for dependent in catalog.transitive_dependents(definition.name.as_str(), run_type.as_str()) {
            let name = dependent.name.as_str();
            let Some(record) = self.checklist.get(name) else {
                continue;
            };
            if record.status != StageStatus::Skipped
                || record.skipped_because.as_deref() == Some(OPERATOR_SKIP_REASON)
            {
                continue;
            }
            let blocked = dependent.predecessors.iter().any(|predecessor| {
                matches!(
                    self.checklist.status_of(predecessor.as_str()),
                    StageStatus::Abandoned | StageStatus::Skipped
                )
            });
            if blocked {
                continue;
            }
            if let Some(record) = self.checklist.get_mut(name) {
                record.status = StageStatus::Pending;
                record.skipped_because = None;
            }
            for instance in self.checklist.instance_keys(name) {
                if self.checklist.status_of(instance.as_str()) == StageStatus::Skipped {
                    self.checklist.stages.remove(instance.as_str());
                }
            }
        }
    }

    fn finish(&mut self) {
        if self.checklist.retired || !self.checklist.is_started() {
            return;
        }
        let run_type = self.run_type();
        let every_stage_terminal = self
            .catalog
            .stages_for(run_type.as_str())
            .iter()
            .all(|definition| {
                self.checklist
                    .status_of(definition.name.as_str())
                    .is_terminal()
            });
        if every_stage_terminal && self.checklist.all_records_terminal() {
            self.checklist.retired = true;
            self.checklist.retired_at = Some(self.now);
            self.run_completed = true;
            info!(run = %self.run_label(), "run is terminal; retiring checklist");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::checklist_store::{ChecklistStore, MemoryChecklistStore};
    use crate::pipeline::notify::{Notifier, NotifyError};
    use crate::worker::StageResult;
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;

    const DIAMOND: &str = r#"
run_types: [nowcast]
defaults:
  max_retries: 2
  timeout_secs: 600
  backoff: {kind: exponential, initial_secs: 30, multiplier: 2.0, max_secs: 300}
stages:
  - name: a
    produces: files
  - name: b
    predecessors: [a]
    inputs:
      - {arg: forcing, stage: a, field: paths}
  - name: c
    predecessors: [a]
  - name: d
    predecessors: [b, c]
"#;

    const FORECAST: &str = r#"
run_types: [forecast]
defaults:
  max_retries: 1
  timeout_secs: 1800
  backoff: {kind: fixed, delay_secs: 60}
stages:
  - name: download_weather
    produces: files
  - name: upload_forcing
    predecessors: [download_weather]
    critical: true
    produces: transfer
  - name: run_model
    predecessors: [upload_forcing]
    produces: model_run
  - name: download_results
    predecessors: [run_model]
    produces: products
  - name: make_plots
    predecessors: [download_results]
    fan_out: {kind: payload, stage: download_results, field: items}
    produces: files
  - name: publish
    predecessors: [make_plots]
    inputs:
      - {arg: figures, stage: make_plots, field: paths}
"#;

    #[derive(Default)]
    struct RecordingNotifier {
        escalations: Mutex<Vec<Escalation>>,
        completions: Mutex<Vec<RunCompletion>>,
    }

    impl Notifier for RecordingNotifier {
        fn escalate(&self, escalation: &Escalation) -> Result<(), NotifyError> {
            self.escalations
                .lock()
                .expect("notifier mutex poisoned")
                .push(escalation.clone());
            Ok(())
        }

        fn run_completed(&self, completion: &RunCompletion) -> Result<(), NotifyError> {
            self.completions
                .lock()
                .expect("notifier mutex poisoned")
                .push(completion.clone());
            Ok(())
        }
    }

    struct Harness {
        coordinator: RunCoordinator,
        store: Arc<MemoryChecklistStore>,
        notifier: Arc<RecordingNotifier>,
        run_id: RunId,
    }

    impl Harness {
        fn new(catalog_yaml: &str, run_type: &str) -> Self {
            let catalog =
                Arc::new(StageCatalog::from_yaml_str(catalog_yaml).expect("catalog should parse"));
            let store = Arc::new(MemoryChecklistStore::new());
            let notifier = Arc::new(RecordingNotifier::default());
            let coordinator = RunCoordinator::new(catalog, store.clone(), notifier.clone());
            Self {
                coordinator,
                store,
                notifier,
                run_id: RunId::new(
                    run_type,
                    NaiveDate::from_ymd_opt(2026, 10, 18).expect("valid date"),
                ),
            }
        }

        fn start(&self) -> Reaction {
            self.coordinator
                .start_run(&self.run_id, now())
                .expect("start should succeed")
        }

        fn succeed(&self, key: &str, attempt: u32, result: StageResult) -> Reaction {
            self.coordinator
                .handle_completion(
                    &CompletionEvent::success(self.run_id.clone(), key, attempt, result),
                    now(),
                )
                .expect("completion should succeed")
        }

        fn fail(&self, key: &str, attempt: u32) -> Reaction {
            self.coordinator
                .handle_completion(
                    &CompletionEvent::failure(self.run_id.clone(), key, attempt, "worker crashed"),
                    now(),
                )
                .expect("completion should succeed")
        }

        fn operator(&self, key: &str, action: OperatorAction) -> Result<Reaction, CoordinatorError> {
            self.coordinator
                .apply_operator_action(&self.run_id, key, action, now())
        }

        fn status(&self, key: &str) -> StageStatus {
            self.store
                .load(&self.run_id)
                .expect("load should succeed")
                .status_of(key)
        }

        fn escalation_count(&self) -> usize {
            self.notifier
                .escalations
                .lock()
                .expect("notifier mutex poisoned")
                .len()
        }

        fn completion_count(&self) -> usize {
            self.notifier
                .completions
                .lock()
                .expect("notifier mutex poisoned")
                .len()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn files(path: &str) -> StageResult {
        StageResult::Files {
            paths: vec![path.to_string()],
        }
    }

    fn launched_keys(reaction: &Reaction) -> Vec<String> {
        let mut keys = reaction
            .launches
            .iter()
            .map(|launch| launch.stage_key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    #[test]
    fn start_launches_entry_stages_once() {
        let harness = Harness::new(DIAMOND, "nowcast");

        let first = harness.start();
        assert_eq!(launched_keys(&first), vec![String::from("a")]);
        assert_eq!(first.launches[0].attempt, 1);
        assert_eq!(first.launches[0].args["run_date"], Value::from("2026-10-18"));
        assert_eq!(first.launches[0].deadline, now() + TimeDelta::seconds(600));

        let second = harness.start();
        assert!(second.launches.is_empty());
        assert_eq!(second.version, first.version);
    }

    #[test]
    fn success_unblocks_siblings_with_bound_arguments() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        let reaction = harness.succeed("a", 1, files("/forcing/hrdps_2026-10-18.nc"));

        assert_eq!(launched_keys(&reaction), vec![String::from("b"), String::from("c")]);
        let b = reaction
            .launches
            .iter()
            .find(|launch| launch.stage_key == "b")
            .expect("b should launch");
        assert_eq!(
            b.args["forcing"],
            serde_json::json!(["/forcing/hrdps_2026-10-18.nc"])
        );
        assert_eq!(harness.status("b"), StageStatus::Running);
        assert_eq!(harness.status("c"), StageStatus::Running);
        assert_eq!(harness.status("d"), StageStatus::Pending);
    }

    #[test]
    fn exhausted_retries_abandon_and_skip_downstream() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();
        harness.succeed("a", 1, files("/forcing/a.nc"));

        let first_retry = harness.fail("b", 1);
        assert_eq!(launched_keys(&first_retry), vec![String::from("b")]);
        assert_eq!(first_retry.launches[0].attempt, 2);
        assert_eq!(first_retry.launches[0].delay_secs, 30);

        let second_retry = harness.fail("b", 2);
        assert_eq!(second_retry.launches[0].attempt, 3);
        assert_eq!(second_retry.launches[0].delay_secs, 60);

        let abandoned = harness.fail("b", 3);
        assert!(abandoned.launches.is_empty());
        assert!(abandoned.escalations.is_empty());
        assert_eq!(harness.status("b"), StageStatus::Abandoned);
        assert_eq!(harness.status("d"), StageStatus::Skipped);
        assert!(!abandoned.run_completed);

        let finished = harness.succeed("c", 1, StageResult::Empty);
        assert!(finished.launches.is_empty());
        assert!(finished.run_completed);

        let checklist = harness.store.load(&harness.run_id).expect("load");
        assert!(checklist.retired);
        assert_eq!(harness.completion_count(), 1);
        assert_eq!(harness.store.archived().expect("archived").len(), 1);
    }

    #[test]
    fn duplicate_success_changes_nothing_and_launches_nothing() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        let first = harness.succeed("a", 1, files("/forcing/a.nc"));
        let after_first = harness.store.load(&harness.run_id).expect("load");
        let second = harness.succeed("a", 1, files("/forcing/a.nc"));
        let after_second = harness.store.load(&harness.run_id).expect("load");

        assert_eq!(launched_keys(&first), vec![String::from("b"), String::from("c")]);
        assert!(second.launches.is_empty());
        assert_eq!(second.anomalies.len(), 1);
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn failure_after_success_is_an_anomaly() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();
        harness.succeed("a", 1, files("/forcing/a.nc"));

        let reaction = harness.fail("a", 1);

        assert!(reaction.launches.is_empty());
        assert_eq!(reaction.anomalies.len(), 1);
        assert_eq!(harness.status("a"), StageStatus::Succeeded);
    }

    #[test]
    fn stale_failure_from_an_earlier_attempt_is_ignored() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();
        harness.succeed("a", 1, files("/forcing/a.nc"));
        harness.fail("b", 1);

        let late = harness.fail("b", 1);

        assert!(late.launches.is_empty());
        assert_eq!(late.anomalies.len(), 1);
        let checklist = harness.store.load(&harness.run_id).expect("load");
        assert_eq!(checklist.get("b").map(|r| (r.attempt, r.failures)), Some((2, 1)));
    }

    #[test]
    fn completion_for_unlaunched_attempt_is_an_anomaly() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        let early = harness.succeed("b", 1, StageResult::Empty);
        let future = harness.succeed("a", 5, files("/forcing/a.nc"));

        assert_eq!(early.anomalies.len(), 1);
        assert_eq!(future.anomalies.len(), 1);
        assert_eq!(harness.status("a"), StageStatus::Running);
    }

    #[test]
    fn wrong_result_kind_counts_as_failure() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        let reaction = harness.succeed("a", 1, StageResult::Empty);

        assert_eq!(launched_keys(&reaction), vec![String::from("a")]);
        let checklist = harness.store.load(&harness.run_id).expect("load");
        let record = checklist.get("a").expect("record");
        assert_eq!(record.attempt, 2);
        assert!(record
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("contract violation")));
    }

    #[test]
    fn persistence_failure_rejects_event_and_redelivery_recovers() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        harness.store.set_fail_saves(true);
        let err = harness
            .coordinator
            .handle_completion(
                &CompletionEvent::success(harness.run_id.clone(), "a", 1, files("/f.nc")),
                now(),
            )
            .expect_err("save failure should surface");
        assert!(matches!(err, CoordinatorError::Store(_)));
        assert_eq!(harness.status("a"), StageStatus::Running);

        harness.store.set_fail_saves(false);
        let redelivered = harness.succeed("a", 1, files("/f.nc"));
        assert_eq!(
            launched_keys(&redelivered),
            vec![String::from("b"), String::from("c")]
        );
    }

    #[test]
    fn critical_abandonment_escalates_once_and_blocks_the_model_run() {
        let harness = Harness::new(FORECAST, "forecast");
        harness.start();
        harness.succeed("download_weather", 1, files("/forcing/hrdps.nc"));

        harness.fail("upload_forcing", 1);
        let abandoned = harness.fail("upload_forcing", 2);
        let duplicate = harness.fail("upload_forcing", 2);

        assert_eq!(abandoned.escalations.len(), 1);
        assert!(duplicate.escalations.is_empty());
        assert_eq!(harness.escalation_count(), 1);
        assert_eq!(harness.status("upload_forcing"), StageStatus::Abandoned);
        assert_eq!(harness.status("run_model"), StageStatus::Skipped);
        assert_eq!(harness.status("publish"), StageStatus::Skipped);
        assert!(abandoned.run_completed);
        let checklist = harness.store.load(&harness.run_id).expect("load");
        assert_eq!(checklist.get("run_model").map(|r| r.attempt), Some(0));
    }

    fn drive_forecast_to_plots(harness: &Harness, products: &[&str]) -> Reaction {
        harness.start();
        harness.succeed("download_weather", 1, files("/forcing/hrdps.nc"));
        harness.succeed(
            "upload_forcing",
            1,
            StageResult::Transfer {
                host: String::from("arbutus.cloud"),
                paths: vec![String::from("/nemoShare/forcing")],
            },
        );
        harness.succeed(
            "run_model",
            1,
            StageResult::ModelRun {
                host: String::from("arbutus.cloud"),
                run_dir: String::from("/nemoShare/runs/18oct26"),
            },
        );
        harness.succeed(
            "download_results",
            1,
            StageResult::Products {
                items: products.iter().map(|p| (*p).to_string()).collect(),
            },
        )
    }

    #[test]
    fn fan_out_launches_one_command_per_item_and_joins() {
        let harness = Harness::new(FORECAST, "forecast");
        let expanded = drive_forecast_to_plots(&harness, &["research", "publish"]);

        assert_eq!(
            launched_keys(&expanded),
            vec![
                String::from("make_plots:publish"),
                String::from("make_plots:research")
            ]
        );
        assert!(expanded
            .launches
            .iter()
            .all(|launch| launch.args.contains_key("item")));
        assert_eq!(harness.status("make_plots"), StageStatus::Running);

        let partial = harness.succeed("make_plots:research", 1, files("/figs/research.svg"));
        assert!(partial.launches.is_empty());

        let joined = harness.succeed("make_plots:publish", 1, files("/figs/publish.svg"));
        assert_eq!(launched_keys(&joined), vec![String::from("publish")]);
        assert_eq!(
            joined.launches[0].args["figures"],
            serde_json::json!([["/figs/publish.svg"], ["/figs/research.svg"]])
        );
        assert_eq!(harness.status("make_plots"), StageStatus::Succeeded);
    }

    #[test]
    fn empty_fan_out_succeeds_immediately() {
        let harness = Harness::new(FORECAST, "forecast");
        let reaction = drive_forecast_to_plots(&harness, &[]);

        assert_eq!(launched_keys(&reaction), vec![String::from("publish")]);
        assert_eq!(harness.status("make_plots"), StageStatus::Succeeded);
    }

    #[test]
    fn completion_addressed_to_fan_out_parent_is_an_anomaly() {
        let harness = Harness::new(FORECAST, "forecast");
        drive_forecast_to_plots(&harness, &["research"]);

        let reaction = harness.succeed("make_plots", 1, files("/figs/all.svg"));
        assert_eq!(reaction.anomalies.len(), 1);
        assert_eq!(harness.status("make_plots"), StageStatus::Running);
    }

    #[test]
    fn abandoned_fan_out_item_skips_the_join() {
        let harness = Harness::new(FORECAST, "forecast");
        drive_forecast_to_plots(&harness, &["research", "publish"]);

        harness.fail("make_plots:research", 1);
        harness.fail("make_plots:research", 2);

        assert_eq!(harness.status("make_plots:research"), StageStatus::Abandoned);
        assert_eq!(harness.status("make_plots"), StageStatus::Abandoned);
        assert_eq!(harness.status("publish"), StageStatus::Skipped);

        let done = harness.succeed("make_plots:publish", 1, files("/figs/publish.svg"));
        assert!(done.launches.is_empty());
        assert!(done.run_completed);
    }

    #[test]
    fn timeout_of_the_current_attempt_follows_the_failure_path() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        let stale = harness
            .coordinator
            .handle_timeout(&harness.run_id, "a", 7, now())
            .expect("timeout should be handled");
        assert!(stale.anomalies.is_empty());
        assert!(stale.launches.is_empty());

        let retried = harness
            .coordinator
            .handle_timeout(&harness.run_id, "a", 1, now())
            .expect("timeout should be handled");
        assert_eq!(launched_keys(&retried), vec![String::from("a")]);
        let checklist = harness.store.load(&harness.run_id).expect("load");
        assert_eq!(
            checklist.get("a").and_then(|r| r.failure_reason.clone()),
            Some(String::from(DEADLINE_REASON))
        );
    }

    #[test]
    fn deadline_after_completion_is_silently_dropped() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();
        let finished = harness.succeed("a", 1, files("/forcing/a.nc"));

        let late = harness
            .coordinator
            .handle_timeout(&harness.run_id, "a", 1, now())
            .expect("timeout should be handled");
        assert!(late.anomalies.is_empty());
        assert!(late.launches.is_empty());
        assert_eq!(late.version, finished.version);

        let unknown = harness
            .coordinator
            .handle_timeout(&harness.run_id, "d", 1, now())
            .expect("timeout should be handled");
        assert!(unknown.anomalies.is_empty());
        assert_eq!(harness.status("a"), StageStatus::Succeeded);
    }

    #[test]
    fn sibling_item_of_abandoned_fan_out_is_not_retried() {
        let harness = Harness::new(FORECAST, "forecast");
        drive_forecast_to_plots(&harness, &["research", "publish"]);

        harness.fail("make_plots:research", 1);
        harness.fail("make_plots:research", 2);
        assert_eq!(harness.status("make_plots"), StageStatus::Abandoned);

        let sibling = harness.fail("make_plots:publish", 1);
        assert!(sibling.launches.is_empty());
        assert!(sibling.escalations.is_empty());
        assert!(sibling.run_completed);
        assert_eq!(harness.status("make_plots:publish"), StageStatus::Abandoned);
        assert_eq!(harness.status("publish"), StageStatus::Skipped);
    }

    #[test]
    fn retired_runs_release_their_slot() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();
        harness.succeed("a", 1, files("/forcing/a.nc"));
        harness.succeed("b", 1, StageResult::Empty);
        harness.succeed("c", 1, StageResult::Empty);
        assert_eq!(harness.coordinator.slots.lock().expect("registry").len(), 1);

        let done = harness.succeed("d", 1, StageResult::Empty);
        assert!(done.run_completed);
        assert!(harness.coordinator.slots.lock().expect("registry").is_empty());

        let late = harness.succeed("d", 1, StageResult::Empty);
        assert_eq!(late.anomalies.len(), 1);
        assert!(harness
            .coordinator
            .checklist(&harness.run_id)
            .expect("checklist should load")
            .retired);
        assert!(harness.coordinator.slots.lock().expect("registry").is_empty());
    }

    #[test]
    fn operator_abandon_propagates_like_exhausted_retries() {
        let harness = Harness::new(FORECAST, "forecast");
        harness.start();

        let reaction = harness
            .operator("download_weather", OperatorAction::Abandon)
            .expect("abandon should succeed");

        assert_eq!(harness.status("download_weather"), StageStatus::Abandoned);
        assert_eq!(harness.status("upload_forcing"), StageStatus::Skipped);
        assert_eq!(harness.status("publish"), StageStatus::Skipped);
        assert!(reaction.run_completed);

        let again = harness.operator("download_weather", OperatorAction::Abandon);
        assert!(matches!(again, Err(CoordinatorError::OperatorRejected { .. })));
    }

    #[test]
    fn operator_retry_reopens_run_and_restores_skipped_dependents() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();
        harness.succeed("a", 1, files("/forcing/a.nc"));
        harness.succeed("c", 1, StageResult::Empty);
        harness.fail("b", 1);
        harness.fail("b", 2);
        let abandoned = harness.fail("b", 3);
        assert!(abandoned.run_completed);

        let retried = harness
            .operator("b", OperatorAction::Retry)
            .expect("retry should succeed");
        assert_eq!(launched_keys(&retried), vec![String::from("b")]);
        assert_eq!(retried.launches[0].attempt, 4);
        assert_eq!(retried.launches[0].delay_secs, 0);
        assert_eq!(harness.status("d"), StageStatus::Pending);
        let checklist = harness.store.load(&harness.run_id).expect("load");
        assert!(!checklist.retired);

        let unblocked = harness.succeed("b", 4, StageResult::Empty);
        assert_eq!(launched_keys(&unblocked), vec![String::from("d")]);
    }

    #[test]
    fn operator_skip_marks_dependents_without_escalating() {
        let harness = Harness::new(FORECAST, "forecast");
        harness.start();
        harness.succeed("download_weather", 1, files("/forcing/hrdps.nc"));

        harness
            .operator("upload_forcing", OperatorAction::Skip)
            .expect("skip should succeed");

        assert_eq!(harness.status("upload_forcing"), StageStatus::Skipped);
        assert_eq!(harness.status("run_model"), StageStatus::Skipped);
        assert_eq!(harness.escalation_count(), 0);

        let late = harness.succeed(
            "upload_forcing",
            1,
            StageResult::Transfer {
                host: String::from("arbutus.cloud"),
                paths: Vec::new(),
            },
        );
        assert!(late.launches.is_empty());
        assert_eq!(late.anomalies.len(), 1);
    }

    #[test]
    fn operator_actions_validate_their_target() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        assert!(matches!(
            harness.operator("ghost", OperatorAction::Skip),
            Err(CoordinatorError::UnknownStage { .. })
        ));
        assert!(matches!(
            harness.operator("b", OperatorAction::Retry),
            Err(CoordinatorError::OperatorRejected { .. })
        ));
        assert!(matches!(
            harness.operator("a:extra", OperatorAction::Abandon),
            Err(CoordinatorError::UnknownStage { .. })
        ));
    }

    #[test]
    fn unknown_run_type_is_rejected() {
        let harness = Harness::new(DIAMOND, "nowcast");
        let run_id = RunId::new("hindcast", harness.run_id.date);
        let err = harness
            .coordinator
            .start_run(&run_id, now())
            .expect_err("unknown run type should fail");
        assert!(matches!(err, CoordinatorError::UnknownRunType(_)));
    }

    #[test]
    fn launches_only_follow_persisted_predecessor_success() {
        let harness = Harness::new(FORECAST, "forecast");
        let mut pending = harness.start().launches;
        let mut rounds = 0;

        while let Some(launch) = pending.pop() {
            rounds += 1;
            assert!(rounds < 100, "run did not converge");
            let persisted = harness.store.load(&harness.run_id).expect("load");
            let definition = harness
                .coordinator
                .catalog()
                .get(launch.stage.as_str())
                .expect("launched stage should exist");
            for predecessor in &definition.predecessors {
                assert!(
                    persisted.is_succeeded(predecessor),
                    "{} launched before {predecessor} succeeded",
                    launch.stage_key
                );
            }
            let result = match definition.produces {
                crate::worker::ResultKind::Files => files("/out/file.nc"),
                crate::worker::ResultKind::Transfer => StageResult::Transfer {
                    host: String::from("orcinus"),
                    paths: Vec::new(),
                },
                crate::worker::ResultKind::ModelRun => StageResult::ModelRun {
                    host: String::from("orcinus"),
                    run_dir: String::from("/runs/x"),
                },
                crate::worker::ResultKind::Products => StageResult::Products {
                    items: vec![String::from("research"), String::from("publish")],
                },
                crate::worker::ResultKind::Publication => StageResult::Publication {
                    urls: Vec::new(),
                },
                crate::worker::ResultKind::Empty => StageResult::Empty,
            };
            let reaction = harness.succeed(launch.stage_key.as_str(), launch.attempt, result);
            pending.extend(reaction.launches);
        }

        let checklist = harness.store.load(&harness.run_id).expect("load");
        assert!(checklist.retired);
        assert_eq!(harness.completion_count(), 1);
    }

    #[test]
    fn relentless_failures_still_reach_a_terminal_state() {
        let harness = Harness::new(DIAMOND, "nowcast");
        let mut pending = harness.start().launches;
        let mut rounds = 0;

        while let Some(launch) = pending.pop() {
            rounds += 1;
            assert!(rounds < 100, "run did not converge");
            let reaction = harness.fail(launch.stage_key.as_str(), launch.attempt);
            pending.extend(reaction.launches);
        }

        assert_eq!(harness.status("a"), StageStatus::Abandoned);
        for key in ["b", "c", "d"] {
            assert_eq!(harness.status(key), StageStatus::Skipped);
        }
        assert!(harness.store.load(&harness.run_id).expect("load").retired);
    }

    #[test]
    fn pending_deadlines_cover_running_records() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();
        harness.succeed("a", 1, files("/forcing/a.nc"));

        let mut armed = harness
            .coordinator
            .pending_deadlines()
            .expect("deadlines should list");
        armed.sort_by(|x, y| x.stage_key.cmp(&y.stage_key));

        assert_eq!(
            armed
                .iter()
                .map(|d| (d.stage_key.as_str(), d.attempt))
                .collect::<Vec<_>>(),
            vec![("b", 1), ("c", 1)]
        );
    }

    #[test]
    fn hand_repaired_checklist_wins_over_cached_copy() {
        let harness = Harness::new(DIAMOND, "nowcast");
        harness.start();

        let mut repaired = harness.store.load(&harness.run_id).expect("load");
        if let Some(record) = repaired.get_mut("a") {
            record.status = StageStatus::Succeeded;
            record.result = Some(files("/forcing/manual.nc"));
            record.deadline = None;
        }
        harness.store.put(repaired).expect("put should succeed");

        let reaction = harness
            .coordinator
            .start_run(&harness.run_id, now())
            .expect("start should succeed");
        assert_eq!(launched_keys(&reaction), vec![String::from("b"), String::from("c")]);
    }
}
