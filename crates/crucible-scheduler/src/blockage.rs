//! Reasons a queued item cannot run right now.
//!
//! These are values, not errors: the queue attaches one to a blocked
//! item and re-evaluates it on every maintenance pass.

use crucible_core::ids::TaskId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an item cannot currently become buildable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CauseOfBlockage {
    /// Nodes carrying the label exist but none can run the item now.
    LabelBusy { label: String },
    /// The node only accepts tasks tied to it.
    NodeReserved { node: String },
    /// A non-concurrent task already has a build running.
    BuildInProgress { task: TaskId },
    /// A transitive upstream task is building or queued.
    UpstreamInProgress { task: TaskId },
    /// A transitive downstream task is building or queued.
    DownstreamInProgress { task: TaskId },
    /// No currently known node satisfies the label expression.
    LabelMissing { label: String },
    /// The task's identity lacks execute rights on the node.
    LackingPermission { node: String },
    /// A pluggable veto provider refused the item.
    Custom { description: String },
}

impl fmt::Display for CauseOfBlockage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CauseOfBlockage::LabelBusy { label } => {
                write!(f, "Waiting for next available executor on {label}")
            }
            CauseOfBlockage::NodeReserved { node } => {
                write!(f, "{node} is reserved for tasks tied to it")
            }
            CauseOfBlockage::BuildInProgress { task } => {
                write!(f, "A build of {task} is already in progress")
            }
            CauseOfBlockage::UpstreamInProgress { task } => {
                write!(f, "Upstream task {task} is building or queued")
            }
            CauseOfBlockage::DownstreamInProgress { task } => {
                write!(f, "Downstream task {task} is building or queued")
            }
            CauseOfBlockage::LabelMissing { label } => {
                write!(f, "There is no node with the label {label}")
            }
            CauseOfBlockage::LackingPermission { node } => {
                write!(f, "Not authorized to run on {node}")
            }
            CauseOfBlockage::Custom { description } => write!(f, "{description}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_descriptions() {
        let cause = CauseOfBlockage::LabelMissing {
            label: "linux && docker".to_string(),
        };
        assert_eq!(
            cause.to_string(),
            "There is no node with the label linux && docker"
        );

        let cause = CauseOfBlockage::BuildInProgress {
            task: TaskId::new("deploy"),
        };
        assert_eq!(cause.to_string(), "A build of deploy is already in progress");
    }
}
