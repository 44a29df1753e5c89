//! Score formula and alert-level policy applied to revealed plaintexts.
//!
//! `error = |prediction - ground_truth|`
//! `raw   = 100 - error * 100 / max(input, 1)`   (truncating integer division)
//!
//! The raw value is unbounded below (and above 100 never happens, since the penalty is
//! non-negative). The stored score is clamped into `[0, 100]`; the raw value is kept on the
//! alert state for audit.

use crate::{AnalysisInputs, MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_SCORE: u8 = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    #[default]
    Normal,
    Notice,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Notice => "notice",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Absolute prediction error.
pub fn absolute_error(prediction: u64, ground_truth: u64) -> u64 {
    prediction.abs_diff(ground_truth)
}

/// Unclamped reference score. Division by zero is impossible: the denominator is at least 1.
///
/// Exact for every input: the penalty is at most `100 * u64::MAX`, well inside `i128`.
pub fn raw_score(input: u64, error: u64) -> i128 {
    let denominator = i128::from(input.max(1));
    let penalty = i128::from(error) * 100 / denominator;
    100 - penalty
}

/// Result of applying a [`ScoringPolicy`] to one record's plaintexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub raw_score: i128,
    pub score: u8,
    pub level: AlertLevel,
    pub needs_retraining: bool,
}

/// Fixed thresholds mapping a score to an alert level and a retraining flag.
///
/// A score strictly below `critical_below` is Critical, below `warning_below` Warning, below
/// `notice_below` Notice, otherwise Normal. Retraining is flagged strictly below
/// `retrain_below`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub critical_below: u8,
    pub warning_below: u8,
    pub notice_below: u8,
    pub retrain_below: u8,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            critical_below: 50,
            warning_below: 70,
            notice_below: 85,
            retrain_below: 60,
        }
    }
}

impl ScoringPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.critical_below <= self.warning_below && self.warning_below <= self.notice_below)
        {
            return Err(MonitorError::ConfigError(
                "alert thresholds must satisfy critical <= warning <= notice".into(),
            ));
        }
        if self.notice_below > MAX_SCORE || self.retrain_below > MAX_SCORE {
            return Err(MonitorError::ConfigError(
                "alert thresholds must not exceed 100".into(),
            ));
        }
        Ok(())
    }

    pub fn level_for(&self, score: u8) -> AlertLevel {
        if score < self.critical_below {
            AlertLevel::Critical
        } else if score < self.warning_below {
            AlertLevel::Warning
        } else if score < self.notice_below {
            AlertLevel::Notice
        } else {
            AlertLevel::Normal
        }
    }

    pub fn evaluate(&self, inputs: &AnalysisInputs) -> Verdict {
        let error = absolute_error(inputs.prediction, inputs.ground_truth);
        let raw = raw_score(inputs.input, error);
        let score = raw.clamp(0, i128::from(MAX_SCORE)) as u8;
        Verdict {
            raw_score: raw,
            score,
            level: self.level_for(score),
            needs_retraining: score < self.retrain_below,
        }
    }
}

/// Per-record alert. Everything but `revealed` is meaningful only once `revealed` is true.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub score: u8,
    pub level: AlertLevel,
    pub needs_retraining: bool,
    pub revealed: bool,
    pub raw_score: i128,
}

impl AlertState {
    /// Zeroed state every record starts in.
    pub fn unrevealed() -> Self {
        Self::default()
    }

    pub(crate) fn revealed(verdict: Verdict) -> Self {
        Self {
            score: verdict.score,
            level: verdict.level,
            needs_retraining: verdict.needs_retraining,
            revealed: true,
            raw_score: verdict.raw_score,
        }
    }
}
