//! Operation state and lifecycle transitions.
//!
//! An `Operation` is owned and mutated by exactly one task (the orchestrator that
//! created it). Everyone else sees snapshots through the registry or events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{OperationKind, OperationStatus};

impl OperationStatus {
    /// Get all valid transitions FROM this status.
    pub fn valid_next(&self) -> &'static [OperationStatus] {
        match self {
            OperationStatus::Pending => &[
                OperationStatus::Running,
                OperationStatus::Failed,
                OperationStatus::Cancelled,
            ],
            OperationStatus::Running => &[
                OperationStatus::Succeeded,
                OperationStatus::Failed,
                OperationStatus::Cancelled,
            ],
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        self.valid_next().contains(&next)
    }
}

/// Rounded share of `total` stages covered once `done` of them have finished.
pub fn stage_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total);
    ((done * 100 + total / 2) / total) as u8
}

/// One tracked unit of long-running work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// 0-100, never decreases
    pub progress: u8,
    pub current_step: String,
    /// Append-only; frozen once terminal
    pub log: Vec<String>,
    /// Set only when `Failed`
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// A new `Pending` operation with a fresh random id.
    pub fn new(kind: OperationKind) -> Self {
        let now = Utc::now();
        Operation {
            id: Uuid::new_v4().to_string(),
            kind,
            status: OperationStatus::Pending,
            progress: 0,
            current_step: String::new(),
            log: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attempt a status transition.
    pub fn transition_to(&mut self, next: OperationStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "Invalid operation transition: {} -> {}",
                self.status, next
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), String> {
        self.transition_to(OperationStatus::Running)
    }

    pub fn succeed(&mut self, step: impl Into<String>) -> Result<(), String> {
        self.transition_to(OperationStatus::Succeeded)?;
        self.progress = 100;
        self.current_step = step.into();
        Ok(())
    }

    /// Terminal failure. Progress stays where it was.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), String> {
        self.transition_to(OperationStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self, step: impl Into<String>) -> Result<(), String> {
        self.transition_to(OperationStatus::Cancelled)?;
        self.current_step = step.into();
        Ok(())
    }

    /// Raise progress. Lower or equal values are ignored; returns whether it changed.
    pub fn set_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if self.is_terminal() || percent <= self.progress {
            return false;
        }
        self.progress = percent;
        self.updated_at = Utc::now();
        true
    }

    pub fn set_step(&mut self, step: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.current_step = step.into();
        self.updated_at = Utc::now();
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.log.push(line.into());
    }
}
