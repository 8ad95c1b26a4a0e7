pub mod transport;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Empty,
    Files,
    Transfer,
    ModelRun,
    Products,
    Publication,
}

impl ResultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Files => "files",
            Self::Transfer => "transfer",
            Self::ModelRun => "model_run",
            Self::Products => "products",
            Self::Publication => "publication",
        }
    }

    pub fn fields(self) -> &'static [&'static str] {
        match self {
            Self::Empty => &[],
            Self::Files => &["paths"],
            Self::Transfer => &["host", "paths"],
            Self::ModelRun => &["host", "run_dir"],
            Self::Products => &["items"],
            Self::Publication => &["urls"],
        }
    }

    pub fn list_fields(self) -> &'static [&'static str] {
        match self {
            Self::Empty | Self::ModelRun => &[],
            Self::Files | Self::Transfer => &["paths"],
            Self::Products => &["items"],
            Self::Publication => &["urls"],
        }
    }

    pub fn has_field(self, field: &str) -> bool {
        self.fields().contains(&field)
    }

    pub fn has_list_field(self, field: &str) -> bool {
        self.list_fields().contains(&field)
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageResult {
    Empty,
    Files { paths: Vec<String> },
    Transfer { host: String, paths: Vec<String> },
    ModelRun { host: String, run_dir: String },
    Products { items: Vec<String> },
    Publication { urls: Vec<String> },
}

impl StageResult {
    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Empty => ResultKind::Empty,
            Self::Files { .. } => ResultKind::Files,
            Self::Transfer { .. } => ResultKind::Transfer,
            Self::ModelRun { .. } => ResultKind::ModelRun,
            Self::Products { .. } => ResultKind::Products,
            Self::Publication { .. } => ResultKind::Publication,
        }
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        match (self, name) {
            (Self::Files { paths }, "paths") | (Self::Transfer { paths, .. }, "paths") => {
                Some(string_list(paths))
            }
            (Self::Transfer { host, .. }, "host") | (Self::ModelRun { host, .. }, "host") => {
                Some(Value::String(host.clone()))
            }
            (Self::ModelRun { run_dir, .. }, "run_dir") => Some(Value::String(run_dir.clone())),
            (Self::Products { items }, "items") => Some(string_list(items)),
            (Self::Publication { urls }, "urls") => Some(string_list(urls)),
            _ => None,
        }
    }

    pub fn list_field(&self, name: &str) -> Option<&[String]> {
        match (self, name) {
            (Self::Files { paths }, "paths") | (Self::Transfer { paths, .. }, "paths") => {
                Some(paths.as_slice())
            }
            (Self::Products { items }, "items") => Some(items.as_slice()),
            (Self::Publication { urls }, "urls") => Some(urls.as_slice()),
            _ => None,
        }
    }
}

fn string_list(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub launch_id: Uuid,
    pub run_id: RunId,
    pub stage_key: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub worker: String,
    pub attempt: u32,
    pub args: BTreeMap<String, Value>,
    pub delay_secs: u64,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Success { result: StageResult },
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub run_id: RunId,
    pub stage_key: String,
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: CompletionOutcome,
}

impl CompletionEvent {
    pub fn success(
        run_id: RunId,
        stage_key: impl Into<String>,
        attempt: u32,
        result: StageResult,
    ) -> Self {
        Self {
            run_id,
            stage_key: stage_key.into(),
            attempt,
            outcome: CompletionOutcome::Success { result },
        }
    }

    pub fn failure(
        run_id: RunId,
        stage_key: impl Into<String>,
        attempt: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            stage_key: stage_key.into(),
            attempt,
            outcome: CompletionOutcome::Failure {
                reason: reason.into(),
            },
        }
    }
}
