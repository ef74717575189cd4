//! Task and executable traits.
//!
//! A `Task` is an opaque unit of schedulable work owned by the caller
//! (e.g. a project). The queue only references tasks; it never owns
//! their lifetime. When a task starts, its factory produces an
//! `Executable` that runs on an executor slot.

use crate::build::Outcome;
use crate::error::Result;
use crate::ids::TaskId;
use crate::label::LabelExpr;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Authenticated identity a task runs as, checked against node
/// execute permissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The implicit identity of unauthenticated submissions.
    pub fn system() -> Self {
        Self("system".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A schedulable unit of work.
pub trait Task: Send + Sync {
    /// Stable identity used for deduplication and graph keys.
    fn id(&self) -> TaskId;

    /// Display name.
    fn name(&self) -> String {
        self.id().to_string()
    }

    /// Placement constraint; `None` means any node.
    fn assigned_label(&self) -> Option<LabelExpr> {
        None
    }

    /// Whether multiple builds of this task may be queued and run at
    /// the same time. Off by default: re-submissions merge.
    fn is_concurrent(&self) -> bool {
        false
    }

    /// Default quiet period applied when the caller does not pass one.
    fn quiet_period(&self) -> Duration {
        Duration::ZERO
    }

    /// Block while any transitive upstream task is building or queued.
    fn blocks_on_upstream(&self) -> bool {
        false
    }

    /// Block while any transitive downstream task is building or queued.
    fn blocks_on_downstream(&self) -> bool {
        false
    }

    /// Identity this task executes as.
    fn identity(&self) -> Identity {
        Identity::system()
    }

    /// Additional executable units claimed and run together with the
    /// main one, in order.
    fn sub_tasks(&self) -> Vec<Arc<dyn SubTask>> {
        Vec::new()
    }

    /// Produce the executable for one build of this task.
    fn create_executable(&self) -> Result<Box<dyn Executable>>;
}

/// A secondary executable unit of a task.
pub trait SubTask: Send + Sync {
    fn name(&self) -> String;
    fn create_executable(&self) -> Result<Box<dyn Executable>>;
}

/// One running build. Observes `ctx.token` for cooperative
/// interruption and writes progress to `ctx.log`.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext) -> Outcome;
}

/// Handed to an executable when it starts.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Cancelled when the execution is interrupted or the node shuts
    /// down. Executables should stop promptly and return `Aborted`.
    pub token: CancellationToken,
    /// The build's log.
    pub log: BuildLog,
}

impl ExecutionContext {
    pub fn new(token: CancellationToken, log: BuildLog) -> Self {
        Self { token, log }
    }
}

/// Shared append-only build log. Interruption and disconnect causes
/// are recorded here verbatim so operators can see why a run stopped.
#[derive(Clone, Default)]
pub struct BuildLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: impl Into<String>) {
        self.lines.lock().unwrap().push(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildLog")
            .field("lines", &self.lines.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_log_append() {
        let log = BuildLog::new();
        log.append("line one");
        log.clone().append("line two");
        assert_eq!(log.snapshot(), vec!["line one", "line two"]);
    }

    #[test]
    fn test_identity() {
        assert_eq!(Identity::system().as_str(), "system");
        assert_eq!(Identity::new("alice").to_string(), "alice");
    }
}
