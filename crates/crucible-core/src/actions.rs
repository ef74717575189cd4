//! Actions and causes attached to queue items.

use crate::ids::{ExecutableId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable contextual data attached to an item (parameters,
/// labels, trigger metadata). Merged append-only when an equivalent
/// task is re-submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub data: serde_json::Value,
}

impl Action {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Why an execution exists. Deduplicated by equality when the same
/// task is re-submitted while still queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cause {
    /// A user asked for the build.
    User { user: String },
    /// An upstream build completed and triggered this one.
    Upstream { task: TaskId, build: ExecutableId },
    /// A timer fired.
    Timer,
    /// Anything else (SCM change, API call, ...).
    Other { description: String },
}

impl Cause {
    pub fn user(user: impl Into<String>) -> Self {
        Cause::User { user: user.into() }
    }

    pub fn other(description: impl Into<String>) -> Self {
        Cause::Other {
            description: description.into(),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::User { user } => write!(f, "Started by user {user}"),
            Cause::Upstream { task, build } => {
                write!(f, "Started by upstream build {build} of {task}")
            }
            Cause::Timer => write!(f, "Started by timer"),
            Cause::Other { description } => write!(f, "{description}"),
        }
    }
}

/// Append causes not already present, preserving order.
pub fn merge_causes(existing: &mut Vec<Cause>, incoming: Vec<Cause>) {
    for cause in incoming {
        if !existing.contains(&cause) {
            existing.push(cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_causes_dedup() {
        let mut causes = vec![Cause::user("alice")];
        merge_causes(&mut causes, vec![Cause::user("alice"), Cause::Timer]);
        assert_eq!(causes, vec![Cause::user("alice"), Cause::Timer]);
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(Cause::user("bob").to_string(), "Started by user bob");
        assert_eq!(Cause::Timer.to_string(), "Started by timer");
    }
}
