use std::fmt;

use tracing::{error, info, warn};

use crate::error::Error;

/// What happened to one feed, artifact or table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Succeeded { rows: usize },
    Skipped { reason: String },
    Failed { kind: &'static str, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub unit: String,
    pub status: Status,
}

impl UnitOutcome {
    pub fn succeeded(unit: impl Into<String>, rows: usize) -> Self {
        Self {
            unit: unit.into(),
            status: Status::Succeeded { rows },
        }
    }

    pub fn skipped(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            status: Status::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn failed(unit: impl Into<String>, err: &Error) -> Self {
        Self {
            unit: unit.into(),
            status: Status::Failed {
                kind: err.kind(),
                error: err.to_string(),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, Status::Failed { .. })
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            Status::Succeeded { rows } => write!(f, "{}: ok ({rows} rows)", self.unit),
            Status::Skipped { reason } => write!(f, "{}: skipped ({reason})", self.unit),
            Status::Failed { kind, error } => write!(f, "{}: failed [{kind}] {error}", self.unit),
        }
    }
}

/// Outcomes of one stage, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<UnitOutcome>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `outcome` and logs it at a level matching its status.
    pub fn record(&mut self, outcome: UnitOutcome) {
        match &outcome.status {
            Status::Succeeded { .. } => info!("{outcome}"),
            Status::Skipped { .. } => warn!("{outcome}"),
            Status::Failed { .. } => error!("{outcome}"),
        }
        self.outcomes.push(outcome);
    }

    pub fn extend(&mut self, other: RunReport) {
        self.outcomes.extend(other.outcomes);
    }

    pub fn get(&self, unit: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.unit == unit)
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, Status::Succeeded { .. }))
            .count()
    }

    /// True when there was work and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(UnitOutcome::is_failed)
    }

    pub fn log_summary(&self, stage: &str) {
        let failed = self.failures().count();
        let skipped = self.outcomes.len() - failed - self.succeeded();
        info!(stage, succeeded = self.succeeded(), skipped, failed, "stage finished");
    }
}
