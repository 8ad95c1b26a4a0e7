use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::catalog::StageDefinition;
use crate::pipeline::checklist::Checklist;

const MAX_BACKOFF_EXPONENT: i32 = 30;

pub const MAX_BACKOFF_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay_secs: u64,
    },
    Exponential {
        initial_secs: u64,
        multiplier: f64,
        max_secs: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_secs: 60,
            multiplier: 2.0,
            max_secs: 900,
        }
    }
}

impl Backoff {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_delay_secs() > MAX_BACKOFF_SECS {
            return Err(format!(
                "backoff delay of {}s exceeds the {MAX_BACKOFF_SECS}s limit",
                self.max_delay_secs()
            ));
        }
        match self {
            Self::Fixed { .. } => Ok(()),
            Self::Exponential {
                initial_secs,
                multiplier,
                max_secs,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(format!(
                        "exponential backoff multiplier must be >= 1.0, got {multiplier}"
                    ));
                }
                if max_secs < initial_secs {
                    return Err(format!(
                        "exponential backoff max_secs ({max_secs}) must be >= initial_secs ({initial_secs})"
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn max_delay_secs(&self) -> u64 {
        match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Exponential { max_secs, .. } => *max_secs,
        }
    }

    // `retry` is 1 for the first re-launch after the initial attempt.
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay_secs } => Duration::from_secs(*delay_secs),
            Self::Exponential {
                initial_secs,
                multiplier,
                max_secs,
            } => {
                let exp = i32::try_from(retry.saturating_sub(1))
                    .map_or(MAX_BACKOFF_EXPONENT, |e| e.min(MAX_BACKOFF_EXPONENT));
                let base = (*initial_secs as f64) * multiplier.powi(exp);
                let capped = base.min(*max_secs as f64);
                Duration::from_secs(f64_to_secs_saturating(capped, *max_secs))
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn f64_to_secs_saturating(value: f64, ceiling: u64) -> u64 {
    if !value.is_finite() || value < 0.0 {
        0
    } else if value >= ceiling as f64 {
        ceiling
    } else {
        value as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Abandon { escalate: bool },
}

pub fn on_failure(key: &str, checklist: &Checklist, definition: &StageDefinition) -> RetryDecision {
    let (attempt, failures) = checklist
        .get(key)
        .map_or((0, 0), |record| (record.attempt, record.failures));

    if failures <= definition.max_retries {
        RetryDecision::Retry {
            attempt: attempt + 1,
            delay: definition.backoff.delay_for(failures),
        }
    } else {
        RetryDecision::Abandon {
            escalate: definition.critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::checklist::StageRecord;
    use crate::pipeline::{RunId, StageStatus};
    use crate::worker::ResultKind;
    use chrono::NaiveDate;

    fn definition(max_retries: u32, backoff: Backoff, critical: bool) -> StageDefinition {
        StageDefinition {
            name: String::from("download_weather"),
            worker: String::from("download_weather"),
            predecessors: Vec::new(),
            fan_out: None,
            max_retries,
            backoff,
            timeout_secs: 600,
            critical,
            run_types: vec![String::from("nowcast")],
            produces: ResultKind::Files,
            inputs: Vec::new(),
        }
    }

    fn checklist_with_failures(attempt: u32, failures: u32) -> Checklist {
        let mut checklist = Checklist::empty(RunId::new(
            "nowcast",
            NaiveDate::from_ymd_opt(2026, 10, 18).expect("valid date"),
        ));
        checklist.stages.insert(
            String::from("download_weather"),
            StageRecord {
                status: StageStatus::Failed,
                attempt,
                failures,
                ..StageRecord::pending("download_weather", None)
            },
        );
        checklist
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial_secs: 30,
            multiplier: 2.0,
            max_secs: 100,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(100));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(100));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed { delay_secs: 45 };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(45));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(45));
    }

    #[test]
    fn invalid_exponential_backoff_is_rejected() {
        let shrinking = Backoff::Exponential {
            initial_secs: 30,
            multiplier: 0.5,
            max_secs: 100,
        };
        assert!(shrinking.validate().is_err());
        let inverted = Backoff::Exponential {
            initial_secs: 300,
            multiplier: 2.0,
            max_secs: 100,
        };
        assert!(inverted.validate().is_err());
        let endless = Backoff::Fixed {
            delay_secs: MAX_BACKOFF_SECS + 1,
        };
        assert!(endless.validate().is_err());
        let unbounded_cap = Backoff::Exponential {
            initial_secs: 60,
            multiplier: 2.0,
            max_secs: u64::MAX,
        };
        assert!(unbounded_cap.validate().is_err());
        assert!(Backoff::default().validate().is_ok());
    }

    #[test]
    fn retries_until_budget_is_spent() {
        let def = definition(2, Backoff::Fixed { delay_secs: 10 }, false);

        assert_eq!(
            on_failure("download_weather", &checklist_with_failures(1, 1), &def),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            on_failure("download_weather", &checklist_with_failures(2, 2), &def),
            RetryDecision::Retry {
                attempt: 3,
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            on_failure("download_weather", &checklist_with_failures(3, 3), &def),
            RetryDecision::Abandon { escalate: false }
        );
    }

    #[test]
    fn zero_retry_budget_abandons_on_first_failure() {
        let def = definition(0, Backoff::default(), true);
        assert_eq!(
            on_failure("download_weather", &checklist_with_failures(1, 1), &def),
            RetryDecision::Abandon { escalate: true }
        );
    }
}
