pub mod catalog;
pub mod checklist;
pub mod checklist_store;
pub mod coordinator;
pub mod notify;
pub mod retry;
pub mod service;
pub mod settings_layer;

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Abandoned,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::Abandoned)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use StageStatus::{Abandoned, Failed, Pending, Running, Skipped, Succeeded};

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Abandoned)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
                | (Running, Abandoned)
                | (Failed, Pending)
                | (Failed, Running)
                | (Failed, Skipped)
                | (Failed, Abandoned)
                | (Abandoned, Pending)
                | (Abandoned, Running)
                | (Skipped, Pending)
                | (Skipped, Running)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    pub run_type: String,
    pub date: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunIdError {
    #[error("run type must not be empty")]
    EmptyRunType,
    #[error("run type '{0}' may only contain ASCII letters, digits, '-' and '_'")]
    InvalidRunType(String),
    #[error("run date '{0}' must be formatted as YYYY-MM-DD")]
    InvalidDate(String),
}

impl RunId {
    pub fn new(run_type: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            run_type: run_type.into(),
            date,
        }
    }

    pub fn parse(run_type: &str, date: &str) -> Result<Self, RunIdError> {
        let run_type = run_type.trim();
        if run_type.is_empty() {
            return Err(RunIdError::EmptyRunType);
        }
        if !run_type
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(RunIdError::InvalidRunType(run_type.to_string()));
        }
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|_| RunIdError::InvalidDate(date.to_string()))?;
        Ok(Self::new(run_type, date))
    }

    pub fn date_str(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_type, self.date.format("%Y-%m-%d"))
    }
}
