//! Build outcome and completed-build records.

use crate::actions::{Action, Cause};
use crate::ids::{ExecutableId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal result of an execution, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl Outcome {
    fn severity(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Unstable => 1,
            Outcome::Failure => 2,
            Outcome::NotBuilt => 3,
            Outcome::Aborted => 4,
        }
    }

    /// The more severe of the two.
    pub fn worse_of(self, other: Outcome) -> Outcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_worse_than(&self, other: Outcome) -> bool {
        self.severity() > other.severity()
    }
}

/// Snapshot of a finished execution, handed to queue listeners and
/// dependency evaluators. The queue does not retain these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedBuild {
    pub id: ExecutableId,
    pub task: TaskId,
    pub task_name: String,
    pub outcome: Outcome,
    pub actions: Vec<Action>,
    pub causes: Vec<Cause>,
    /// Log lines, including interruption and disconnect causes
    /// recorded verbatim.
    pub log: Vec<String>,
    pub submitted: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_severity() {
        assert_eq!(Outcome::Success.worse_of(Outcome::Failure), Outcome::Failure);
        assert_eq!(Outcome::Aborted.worse_of(Outcome::Failure), Outcome::Aborted);
        assert!(Outcome::NotBuilt.is_worse_than(Outcome::Unstable));
    }
}
