//! Budget ceilings and cumulative session usage.

use serde::{Deserialize, Serialize};

use crate::errors::BudgetMetric;
use crate::{AppError, Result};

/// Cumulative usage reported by a running session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Usage {
    /// Total cost so far in US dollars.
    #[serde(default)]
    pub cost_usd: f64,
    /// Completed turns so far.
    #[serde(default)]
    pub turns: u32,
}

/// Usage ceiling attached to a session's execution configuration.
///
/// A `None` field means that dimension is unbounded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Budget {
    /// Maximum cumulative cost in US dollars.
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    /// Maximum number of turns.
    #[serde(default)]
    pub max_turns: Option<u32>,
}

impl Budget {
    /// Budget with neither ceiling set.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_budget_usd: None,
            max_turns: None,
        }
    }

    /// Whether no ceiling is configured.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max_budget_usd.is_none() && self.max_turns.is_none()
    }

    /// Fill unset ceilings from `fallback`.
    #[must_use]
    pub fn or(self, fallback: Self) -> Self {
        Self {
            max_budget_usd: self.max_budget_usd.or(fallback.max_budget_usd),
            max_turns: self.max_turns.or(fallback.max_turns),
        }
    }

    /// Reject non-positive or non-finite ceilings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` describing the offending field.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.max_budget_usd {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(AppError::Validation(format!(
                    "max_budget_usd must be a positive amount, got {limit}"
                )));
            }
        }
        if self.max_turns == Some(0) {
            return Err(AppError::Validation(
                "max_turns must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Compare cumulative usage against the ceilings.
    ///
    /// Usage equal to a ceiling is still within budget; only strictly
    /// greater usage trips it. Cost is checked before turns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BudgetExceeded` for the first ceiling crossed.
    pub fn check(&self, session_id: &str, usage: &Usage) -> Result<()> {
        if let Some(limit) = self.max_budget_usd {
            if usage.cost_usd > limit {
                return Err(AppError::BudgetExceeded {
                    session_id: session_id.to_owned(),
                    metric: BudgetMetric::CostUsd,
                    usage: usage.cost_usd,
                    limit,
                });
            }
        }
        if let Some(limit) = self.max_turns {
            if usage.turns > limit {
                return Err(AppError::BudgetExceeded {
                    session_id: session_id.to_owned(),
                    metric: BudgetMetric::Turns,
                    usage: f64::from(usage.turns),
                    limit: f64::from(limit),
                });
            }
        }
        Ok(())
    }
}
