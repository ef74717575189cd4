//! Queue items: a task's presence in the queue across its lifecycle.
//!
//! An item moves `Waiting -> {Blocked <-> Buildable} -> Left`, with a
//! direct edge to `Left` for cancellation before an executor claims
//! it. Callers observe progress through an [`ItemHandle`], a
//! two-stage future over a watch channel: "started" resolves when an
//! executor claims the item, "completed" when it leaves the queue.

use crate::blockage::CauseOfBlockage;
use crucible_core::actions::{Action, Cause};
use crucible_core::build::{CompletedBuild, Outcome};
use crucible_core::ids::{ItemId, TaskId};
use crucible_core::task::Task;
use crucible_core::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Where an item is in its lifecycle, published to handles.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPhase {
    /// Waiting, blocked, or buildable but not yet claimed.
    Queued,
    /// Claimed by an executor with an executable created.
    Started,
    /// Execution finished with the given outcome.
    Completed(Outcome),
    /// Removed from the queue before execution started.
    Cancelled,
}

impl ItemPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemPhase::Completed(_) | ItemPhase::Cancelled)
    }
}

/// Fields shared by all live lifecycle variants.
pub struct Item {
    pub id: ItemId,
    pub task: Arc<dyn Task>,
    pub submitted: DateTime<Utc>,
    pub actions: Vec<Action>,
    pub causes: Vec<Cause>,
    phase: watch::Sender<ItemPhase>,
}

impl Item {
    pub(crate) fn new(
        id: ItemId,
        task: Arc<dyn Task>,
        actions: Vec<Action>,
        causes: Vec<Cause>,
    ) -> Self {
        let (phase, _) = watch::channel(ItemPhase::Queued);
        Self {
            id,
            task,
            submitted: Utc::now(),
            actions,
            causes,
            phase,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn handle(&self) -> ItemHandle {
        ItemHandle {
            id: self.id,
            task: self.task_id(),
            rx: self.phase.subscribe(),
        }
    }

    pub(crate) fn set_phase(&self, phase: ItemPhase) {
        // send_replace so the update survives having no subscribers
        self.phase.send_replace(phase);
    }

    /// Terminal transition: publish the final phase and produce the
    /// snapshot handed to `on_left` listeners.
    pub(crate) fn into_left(self, cancelled: bool, build: Option<CompletedBuild>) -> LeftItem {
        let phase = if cancelled {
            ItemPhase::Cancelled
        } else {
            ItemPhase::Completed(
                build
                    .as_ref()
                    .map(|b| b.outcome)
                    .unwrap_or(Outcome::Aborted),
            )
        };
        self.set_phase(phase);
        LeftItem {
            id: self.id,
            task: self.task,
            submitted: self.submitted,
            actions: self.actions,
            causes: self.causes,
            cancelled,
            build,
        }
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("task", &self.task_id())
            .field("submitted", &self.submitted)
            .finish()
    }
}

/// Item whose quiet period has not yet expired.
#[derive(Debug)]
pub struct WaitingItem {
    pub item: Item,
    /// Submission time plus quiet period; eligible for promotion once
    /// `due <= now`.
    pub due: DateTime<Utc>,
}

/// Item that cannot run yet, with the current reason.
#[derive(Debug)]
pub struct BlockedItem {
    pub item: Item,
    pub cause: CauseOfBlockage,
}

/// Item ready to run, waiting for an executor to claim it.
#[derive(Debug)]
pub struct BuildableItem {
    pub item: Item,
    /// Name of the node whose executor claimed the item, once claimed.
    pub pending: Option<String>,
}

/// Terminal snapshot handed to listeners; not retained by the queue.
pub struct LeftItem {
    pub id: ItemId,
    pub task: Arc<dyn Task>,
    pub submitted: DateTime<Utc>,
    pub actions: Vec<Action>,
    pub causes: Vec<Cause>,
    pub cancelled: bool,
    /// Present when the item actually executed.
    pub build: Option<CompletedBuild>,
}

impl std::fmt::Debug for LeftItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeftItem")
            .field("id", &self.id)
            .field("task", &self.task.id())
            .field("cancelled", &self.cancelled)
            .field("build", &self.build.as_ref().map(|b| b.outcome))
            .finish()
    }
}

/// Caller-facing view of a scheduled item.
pub struct ItemHandle {
    pub id: ItemId,
    pub task: TaskId,
    rx: watch::Receiver<ItemPhase>,
}

impl ItemHandle {
    /// Current phase without waiting.
    pub fn phase(&self) -> ItemPhase {
        self.rx.borrow().clone()
    }

    /// Resolves once an executor has claimed the item (or the item
    /// reached a terminal phase first, e.g. cancellation).
    pub async fn wait_started(&mut self) -> Result<ItemPhase> {
        let phase = self
            .rx
            .wait_for(|p| !matches!(p, ItemPhase::Queued))
            .await
            .map_err(|_| Error::QueueShutDown)?;
        Ok(phase.clone())
    }

    /// Resolves once the item has left the queue: `Completed` with
    /// the build outcome, or `Cancelled`.
    pub async fn wait_completed(&mut self) -> Result<ItemPhase> {
        let phase = self
            .rx
            .wait_for(|p| p.is_terminal())
            .await
            .map_err(|_| Error::QueueShutDown)?;
        Ok(phase.clone())
    }
}

/// Outcome of a `schedule` call.
pub struct ScheduleResult {
    /// False when the request merged into an existing item.
    pub created: bool,
    pub handle: ItemHandle,
}

/// Read-only snapshot of a live item, for UIs and diagnostics.
#[derive(Debug, Clone)]
pub struct QueueItemView {
    pub id: ItemId,
    pub task: TaskId,
    pub task_name: String,
    pub submitted: DateTime<Utc>,
    pub causes: Vec<Cause>,
    pub state: ItemStateView,
}

#[derive(Debug, Clone)]
pub enum ItemStateView {
    Waiting { due: DateTime<Utc> },
    Blocked { cause: CauseOfBlockage },
    Buildable { pending: Option<String> },
}
