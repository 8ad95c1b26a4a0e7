use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{RunId, StageStatus};
use crate::worker::StageResult;

pub const FAN_OUT_SEPARATOR: char = ':';

pub fn stage_key(stage: &str, item: Option<&str>) -> String {
    match item {
        Some(item) => format!("{stage}{FAN_OUT_SEPARATOR}{item}"),
        None => stage.to_string(),
    }
}

pub fn split_stage_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(FAN_OUT_SEPARATOR) {
        Some((stage, item)) => (stage, Some(item)),
        None => (key, None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub status: StageStatus,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<String>,
}

impl StageRecord {
    pub fn pending(stage: impl Into<String>, item: Option<String>) -> Self {
        Self {
            stage: stage.into(),
            item,
            status: StageStatus::Pending,
            attempt: 0,
            failures: 0,
            last_attempt_at: None,
            deadline: None,
            launch_id: None,
            result: None,
            failure_reason: None,
            skipped_because: None,
        }
    }

    pub fn key(&self) -> String {
        stage_key(self.stage.as_str(), self.item.as_deref())
    }

    fn same_outcome(&self, other: &Self) -> bool {
        self.status == other.status
            && self.result == other.result
            && self.failure_reason == other.failure_reason
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Duplicate,
    StaleAttempt { existing: u32, incoming: u32 },
    DowngradeRefused { attempt: u32 },
    AlreadyTerminal { status: StageStatus },
    IllegalTransition { from: StageStatus, to: StageStatus },
}

impl MergeOutcome {
    pub fn anomaly(&self) -> Option<String> {
        match self {
            Self::Applied => None,
            Self::Duplicate => Some(String::from("duplicate update discarded")),
            Self::StaleAttempt { existing, incoming } => Some(format!(
                "stale update for attempt {incoming} discarded (current attempt {existing})"
            )),
            Self::DowngradeRefused { attempt } => Some(format!(
                "failure reported after success for attempt {attempt}; keeping succeeded"
            )),
            Self::AlreadyTerminal { status } => {
                Some(format!("late update discarded; stage already {status}"))
            }
            Self::IllegalTransition { from, to } => {
                Some(format!("illegal transition {from} -> {to} discarded"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checklist {
    pub run_id: RunId,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

impl Checklist {
    pub fn empty(run_id: RunId) -> Self {
        Self {
            run_id,
            version: 0,
            catalog_digest: None,
            created_at: None,
            retired: false,
            retired_at: None,
            stages: BTreeMap::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.created_at.is_some() || !self.stages.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&StageRecord> {
        self.stages.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut StageRecord> {
        self.stages.get_mut(key)
    }

    pub fn status_of(&self, key: &str) -> StageStatus {
        self.stages
            .get(key)
            .map_or(StageStatus::Pending, |record| record.status)
    }

    pub fn is_succeeded(&self, key: &str) -> bool {
        self.status_of(key) == StageStatus::Succeeded
    }

    pub fn record_mut_or_pending(&mut self, stage: &str, item: Option<&str>) -> &mut StageRecord {
        self.stages
            .entry(stage_key(stage, item))
            .or_insert_with(|| StageRecord::pending(stage, item.map(str::to_string)))
    }

    pub fn instances_of<'a>(
        &'a self,
        stage: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a StageRecord)> + 'a {
        self.stages
            .iter()
            .filter(move |(_, record)| record.stage == stage && record.item.is_some())
    }

    pub fn instance_keys(&self, stage: &str) -> Vec<String> {
        self.instances_of(stage).map(|(key, _)| key.clone()).collect()
    }

    pub fn all_records_terminal(&self) -> bool {
        self.stages.values().all(|record| record.status.is_terminal())
    }

    pub fn merge(&mut self, key: &str, update: StageRecord) -> MergeOutcome {
        let Some(existing) = self.stages.get(key) else {
            self.stages.insert(key.to_string(), update);
            return MergeOutcome::Applied;
        };

        if update.attempt < existing.attempt {
            return MergeOutcome::StaleAttempt {
                existing: existing.attempt,
                incoming: update.attempt,
            };
        }

        if update.attempt == existing.attempt {
            if existing.same_outcome(&update) {
                return MergeOutcome::Duplicate;
            }
            if existing.status == StageStatus::Succeeded && update.status == StageStatus::Failed {
                return MergeOutcome::DowngradeRefused {
                    attempt: existing.attempt,
                };
            }
            if existing.status.is_terminal() {
                return MergeOutcome::AlreadyTerminal {
                    status: existing.status,
                };
            }
            if !existing.status.can_transition_to(update.status) {
                return MergeOutcome::IllegalTransition {
                    from: existing.status,
                    to: update.status,
                };
            }
        }

        self.stages.insert(key.to_string(), update);
        MergeOutcome::Applied
    }
}
