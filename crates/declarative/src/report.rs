//! Run reports
//!
//! One [`ResourceReport`] per declared resource, collected into a
//! [`RunReport`] that serializes to JSON. Every string in a report has
//! already passed through the secret broker.

use crate::secrets::SecretBroker;
use crate::types::ResourceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Changes were applied and verified
    Applied,
    /// Observed state already matched; nothing was done
    AlreadySatisfied,
    /// Dry run: changes would have been applied
    Planned,
    Failed {
        error: String,
    },
    /// A dependency did not succeed
    SkippedDueToDependencyFailure {
        dependency: String,
    },
    /// The run was cancelled before this resource started
    SkippedDueToCancellation,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied | Self::AlreadySatisfied | Self::Planned)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            Self::SkippedDueToDependencyFailure { .. } | Self::SkippedDueToCancellation
        )
    }

    /// Short label for display
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadySatisfied => "already satisfied",
            Self::Planned => "planned",
            Self::Failed { .. } => "failed",
            Self::SkippedDueToDependencyFailure { .. } => "skipped (dependency failed)",
            Self::SkippedDueToCancellation => "skipped (cancelled)",
        }
    }
}

/// What happened to one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub id: String,
    pub resource_type: String,
    pub description: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Apply attempts made, 0 if nothing was applied
    pub attempts: u32,
    /// Attribute changes that motivated the apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
    /// State after the last probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ResourceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ResourceReport {
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        description: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            description: description.into(),
            outcome,
            attempts: 0,
            changes: Vec::new(),
            state: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall-clock duration, if the resource ran
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Mask secret values in every text field
    pub fn redact(&mut self, secrets: &SecretBroker) {
        self.description = secrets.redact(&self.description);
        match &mut self.outcome {
            Outcome::Failed { error } => *error = secrets.redact(error),
            Outcome::SkippedDueToDependencyFailure { dependency } => {
                *dependency = secrets.redact(dependency);
            }
            _ => {}
        }
        for change in &mut self.changes {
            *change = secrets.redact(change);
        }
        if let Some(state) = &mut self.state {
            for value in state.observed.values_mut() {
                *value = secrets.redact_value(value);
            }
            if let Some(error) = &mut state.last_error {
                *error = secrets.redact(error);
            }
        }
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Executing,
    Completed,
    /// The plan could not be built; nothing executed
    Failed { reason: String },
    /// Fail-fast cancelled the remaining plan
    Aborted { reason: String },
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Aborted { .. }
        )
    }
}

/// Outcome counts for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub applied: usize,
    pub already_satisfied: usize,
    pub planned: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn from_reports(reports: &[ResourceReport]) -> Self {
        let mut summary = Self {
            total: reports.len(),
            ..Self::default()
        };
        for report in reports {
            match report.outcome {
                Outcome::Applied => summary.applied += 1,
                Outcome::AlreadySatisfied => summary.already_satisfied += 1,
                Outcome::Planned => summary.planned += 1,
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::SkippedDueToDependencyFailure { .. }
                | Outcome::SkippedDueToCancellation => summary.skipped += 1,
            }
        }
        summary
    }

    /// Number of resources that changed, or would change in a dry run
    pub fn total_changes(&self) -> usize {
        self.applied + self.planned
    }
}

/// Result of one coordinator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub phase: RunPhase,
    /// True when the run completed with no failed or skipped resource
    pub success: bool,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    /// One entry per declared resource, in declaration order
    pub resources: Vec<ResourceReport>,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            phase: RunPhase::Planning,
            success: false,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            summary: RunSummary::default(),
            resources: Vec::new(),
        }
    }

    /// A report for a run that never got past planning
    pub fn planning_failed(dry_run: bool, reason: impl Into<String>) -> Self {
        let mut report = Self::new(dry_run);
        report.finish(RunPhase::Failed {
            reason: reason.into(),
        });
        report
    }

    /// Close the report with its terminal phase
    pub fn finish(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.summary = RunSummary::from_reports(&self.resources);
        self.success = matches!(self.phase, RunPhase::Completed)
            && self.summary.failed == 0
            && self.summary.skipped == 0;
        self.finished_at = Some(Utc::now());
    }

    /// Entry for a resource id
    pub fn get(&self, id: &str) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Process exit code: 0 success, 1 resource failure or abort, 2 planning failure
    pub fn exit_code(&self) -> u8 {
        match self.phase {
            RunPhase::Failed { .. } => 2,
            _ if self.success => 0,
            _ => 1,
        }
    }

    /// Mask secret values in every text field
    pub fn redact(&mut self, secrets: &SecretBroker) {
        match &mut self.phase {
            RunPhase::Failed { reason } | RunPhase::Aborted { reason } => {
                *reason = secrets.redact(reason);
            }
            _ => {}
        }
        for resource in &mut self.resources {
            resource.redact(secrets);
        }
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
