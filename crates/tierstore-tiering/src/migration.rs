//! Data migration records
//!
//! One `DataMigration` is created per rule evaluation that matched
//! objects; it moves through the shared task state machine and is
//! terminal once completed, failed, or cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tierstore_common::{Error, Result, RuleId, TaskId, TaskState, TierId};

/// Why an executable migration was put back in the queue instead of run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueReason {
    /// Target tier cannot currently fit the object set
    InsufficientCapacity,
    /// An enabled backup policy covers the source tier and a verified
    /// backup of the objects does not exist yet
    AwaitingBackup,
}

/// One execution of moving a set of objects between tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMigration {
    pub id: TaskId,
    /// Rule whose evaluation produced this migration
    pub rule: RuleId,
    pub source_tier: TierId,
    pub target_tier: TierId,
    /// Paths relative to the source tier root
    pub paths: Vec<PathBuf>,
    pub state: TaskState,
    pub bytes_moved: u64,
    pub objects_moved: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub requeue_reason: Option<RequeueReason>,
}

impl DataMigration {
    #[must_use]
    pub fn new(
        rule: RuleId,
        source_tier: TierId,
        target_tier: TierId,
        paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            rule,
            source_tier,
            target_tier,
            paths,
            state: TaskState::Pending,
            bytes_moved: 0,
            objects_moved: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
            requeue_reason: None,
        }
    }

    /// Apply a state transition, enforcing the shared state machine
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::TaskState {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            TaskState::Running => self.started_at = Some(Utc::now()),
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                self.finished_at = Some(Utc::now());
            }
            TaskState::Pending => {}
        }
        self.state = next;
        Ok(())
    }

    /// Whether the migration reached a terminal state
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration() -> DataMigration {
        DataMigration::new(
            RuleId::new(),
            TierId::new_unchecked("hot"),
            TierId::new_unchecked("warm"),
            vec![PathBuf::from("a.json")],
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut m = migration();
        assert_eq!(m.state, TaskState::Pending);
        m.transition(TaskState::Running).unwrap();
        assert!(m.started_at.is_some());
        m.transition(TaskState::Completed).unwrap();
        assert!(m.finished_at.is_some());
        assert!(m.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut m = migration();
        m.transition(TaskState::Running).unwrap();
        m.transition(TaskState::Failed).unwrap();
        assert!(m.transition(TaskState::Running).is_err());
        assert!(m.transition(TaskState::Completed).is_err());
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut m = migration();
        assert!(m.transition(TaskState::Completed).is_err());
    }
}
