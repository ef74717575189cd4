//! The build queue state machine.
//!
//! Items move `Waiting -> {Blocked <-> Buildable} -> Left`, with
//! cancellation short-circuiting to `Left` any time before an
//! executor claims the item. All mutation happens under one mutex so
//! transitions are linearizable; executors claim work in a short
//! critical section and run it outside the lock.

use crate::blockage::CauseOfBlockage;
use crate::config::SchedulerConfig;
use crate::graph::DependencyGraph;
use crate::item::{
    BlockedItem, BuildableItem, Item, ItemPhase, ItemStateView, LeftItem, QueueItemView,
    ScheduleResult, WaitingItem,
};
use crate::node::{Node, NodeRegistry};
use crucible_core::actions::{merge_causes, Action, Cause};
use crucible_core::build::{CompletedBuild, Outcome};
use crucible_core::ids::{ExecutableId, ItemId, TaskId};
use crucible_core::task::{BuildLog, Executable, Task};
use crucible_core::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observes item state transitions. Callbacks for one item fire in
/// transition order; failures are logged per listener and never
/// abort the maintenance pass. Listeners cannot affect scheduling.
pub trait QueueListener: Send + Sync {
    fn on_enter_waiting(&self, _item: &WaitingItem) -> Result<()> {
        Ok(())
    }
    fn on_leave_waiting(&self, _item: &WaitingItem) -> Result<()> {
        Ok(())
    }
    fn on_enter_blocked(&self, _item: &BlockedItem) -> Result<()> {
        Ok(())
    }
    fn on_leave_blocked(&self, _item: &BlockedItem) -> Result<()> {
        Ok(())
    }
    fn on_enter_buildable(&self, _item: &BuildableItem) -> Result<()> {
        Ok(())
    }
    fn on_leave_buildable(&self, _item: &BuildableItem) -> Result<()> {
        Ok(())
    }
    fn on_left(&self, _item: &LeftItem) -> Result<()> {
        Ok(())
    }
}

/// Pluggable scheduling veto, consulted before anything else during
/// blocking-cause evaluation, in registration order.
pub trait QueueVeto: Send + Sync {
    fn can_run(&self, item: &Item) -> Option<CauseOfBlockage>;
}

/// A claimed item plus everything an executor needs to run it.
pub struct WorkUnit {
    pub item_id: ItemId,
    pub executable_id: ExecutableId,
    pub task: Arc<dyn Task>,
    /// Main executable first, then sub-task executables in order.
    pub executables: Vec<(String, Box<dyn Executable>)>,
    pub actions: Vec<Action>,
    pub causes: Vec<Cause>,
    pub submitted: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub log: BuildLog,
}

/// Queue counters for load statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub scheduled: u64,
    pub merged: u64,
    pub cancelled: u64,
    pub completed: u64,
    pub waiting: usize,
    pub blocked: usize,
    pub buildable: usize,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    scheduled: u64,
    merged: u64,
    cancelled: u64,
    completed: u64,
}

struct QueueState {
    waiting: Vec<WaitingItem>,
    blocked: Vec<BlockedItem>,
    buildables: Vec<BuildableItem>,
    next_id: u64,
    counters: Counters,
}

impl QueueState {
    fn new() -> Self {
        Self {
            waiting: Vec::new(),
            blocked: Vec::new(),
            buildables: Vec::new(),
            next_id: 1,
            counters: Counters::default(),
        }
    }

    /// Existing unclaimed item for the task, if any. Claimed items no
    /// longer absorb re-submissions: the next build queues up behind
    /// the running one.
    fn find_unclaimed_mut(&mut self, task: &TaskId) -> Option<&mut Item> {
        if let Some(i) = self.waiting.iter().position(|w| w.item.task_id() == *task) {
            return Some(&mut self.waiting[i].item);
        }
        if let Some(i) = self.blocked.iter().position(|b| b.item.task_id() == *task) {
            return Some(&mut self.blocked[i].item);
        }
        if let Some(i) = self
            .buildables
            .iter()
            .position(|b| b.pending.is_none() && b.item.task_id() == *task)
        {
            return Some(&mut self.buildables[i].item);
        }
        None
    }

    /// Whether a build of the task has been claimed by an executor.
    fn has_claimed(&self, task: &TaskId) -> bool {
        self.buildables
            .iter()
            .any(|b| b.pending.is_some() && b.item.task_id() == *task)
    }

    /// Whether the task has any live item, claimed or not.
    fn contains_task(&self, task: &TaskId) -> bool {
        self.waiting.iter().any(|w| w.item.task_id() == *task)
            || self.blocked.iter().any(|b| b.item.task_id() == *task)
            || self.buildables.iter().any(|b| b.item.task_id() == *task)
    }
}

/// The build queue. One instance per process, owned by the
/// application root and shared by reference.
pub struct Queue {
    state: Mutex<QueueState>,
    listeners: RwLock<Vec<Arc<dyn QueueListener>>>,
    vetoes: RwLock<Vec<Arc<dyn QueueVeto>>>,
    nodes: Arc<NodeRegistry>,
    graph: RwLock<Arc<DependencyGraph>>,
    work_available: Notify,
    config: SchedulerConfig,
}

impl Queue {
    pub fn new(config: SchedulerConfig, nodes: Arc<NodeRegistry>) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            listeners: RwLock::new(Vec::new()),
            vetoes: RwLock::new(Vec::new()),
            nodes,
            graph: RwLock::new(DependencyGraph::empty()),
            work_available: Notify::new(),
            config,
        }
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn add_veto(&self, veto: Arc<dyn QueueVeto>) {
        self.vetoes.write().unwrap().push(veto);
    }

    /// Current dependency-graph snapshot.
    pub fn graph(&self) -> Arc<DependencyGraph> {
        self.graph.read().unwrap().clone()
    }

    /// Swap in a freshly built graph. Readers holding the previous
    /// snapshot keep a complete, consistent view.
    pub fn install_graph(&self, graph: Arc<DependencyGraph>) {
        *self.graph.write().unwrap() = graph;
    }

    /// Submit a task. If an equivalent unclaimed item already exists
    /// and the task is not concurrent, the request merges into it and
    /// `created` is false. Otherwise a waiting item is created with
    /// `due = now + quiet_period`; `None` falls back to the task's
    /// quiet period, then the configured default.
    pub async fn schedule(
        &self,
        task: Arc<dyn Task>,
        quiet_period: Option<Duration>,
        actions: Vec<Action>,
        causes: Vec<Cause>,
    ) -> ScheduleResult {
        {
            let mut state = self.state.lock().await;

            if !task.is_concurrent()
                && let Some(existing) = state.find_unclaimed_mut(&task.id())
            {
                existing.actions.extend(actions);
                merge_causes(&mut existing.causes, causes);
                let handle = existing.handle();
                debug!(item_id = %existing.id, task = %task.id(), "merged re-submission into existing item");
                state.counters.merged += 1;
                return ScheduleResult {
                    created: false,
                    handle,
                };
            }

            let quiet = quiet_period.unwrap_or_else(|| {
                let task_quiet = task.quiet_period();
                if task_quiet.is_zero() {
                    self.config.default_quiet_period
                } else {
                    task_quiet
                }
            });

            let id = ItemId::from_raw(state.next_id);
            state.next_id += 1;
            let item = Item::new(id, task, actions, causes);
            let due = item
                .submitted
                .checked_add_signed(
                    chrono::Duration::from_std(quiet).unwrap_or(chrono::Duration::MAX),
                )
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let waiting = WaitingItem { item, due };
            let handle = waiting.item.handle();
            info!(item_id = %id, task = %waiting.item.task_id(), due = %due, "task queued");
            self.notify_listeners("on_enter_waiting", |l| l.on_enter_waiting(&waiting));
            state.waiting.push(waiting);
            state.counters.scheduled += 1;
            drop(state);

            self.maintain().await;
            ScheduleResult {
                created: true,
                handle,
            }
        }
    }

    /// Cancel the task's live item, if it has one and no executor has
    /// claimed it yet. Returns false when there is nothing to cancel
    /// (including an already-claimed item, which can only be stopped
    /// by interrupting its executor).
    pub async fn cancel(&self, task: &TaskId) -> bool {
        let mut state = self.state.lock().await;

        if let Some(pos) = state
            .waiting
            .iter()
            .position(|w| w.item.task_id() == *task)
        {
            let w = state.waiting.remove(pos);
            self.notify_listeners("on_leave_waiting", |l| l.on_leave_waiting(&w));
            self.leave_cancelled(&mut state, w.item);
            return true;
        }
        if let Some(pos) = state
            .blocked
            .iter()
            .position(|b| b.item.task_id() == *task)
        {
            let b = state.blocked.remove(pos);
            self.notify_listeners("on_leave_blocked", |l| l.on_leave_blocked(&b));
            self.leave_cancelled(&mut state, b.item);
            return true;
        }
        if let Some(pos) = state
            .buildables
            .iter()
            .position(|b| b.pending.is_none() && b.item.task_id() == *task)
        {
            let b = state.buildables.remove(pos);
            self.notify_listeners("on_leave_buildable", |l| l.on_leave_buildable(&b));
            self.leave_cancelled(&mut state, b.item);
            return true;
        }
        false
    }

    /// Cancel by item id. Same rules as [`Queue::cancel`].
    pub async fn cancel_item(&self, id: ItemId) -> bool {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.waiting.iter().position(|w| w.item.id == id) {
            let w = state.waiting.remove(pos);
            self.notify_listeners("on_leave_waiting", |l| l.on_leave_waiting(&w));
            self.leave_cancelled(&mut state, w.item);
            return true;
        }
        if let Some(pos) = state.blocked.iter().position(|b| b.item.id == id) {
            let b = state.blocked.remove(pos);
            self.notify_listeners("on_leave_blocked", |l| l.on_leave_blocked(&b));
            self.leave_cancelled(&mut state, b.item);
            return true;
        }
        if let Some(pos) = state
            .buildables
            .iter()
            .position(|b| b.pending.is_none() && b.item.id == id)
        {
            let b = state.buildables.remove(pos);
            self.notify_listeners("on_leave_buildable", |l| l.on_leave_buildable(&b));
            self.leave_cancelled(&mut state, b.item);
            return true;
        }
        false
    }

    fn leave_cancelled(&self, state: &mut QueueState, item: Item) {
        info!(item_id = %item.id, task = %item.task_id(), "item cancelled");
        state.counters.cancelled += 1;
        let left = item.into_left(true, None);
        self.notify_listeners("on_left", |l| l.on_left(&left));
    }

    /// The serialized reconciliation pass: promote due waiting items,
    /// re-evaluate blocked ones. Buildable items are left for the
    /// executor pools to claim.
    pub async fn maintain(&self) {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        // Due waiting items, earliest expiry first, submission order
        // as tie-break.
        let mut due = Vec::new();
        let mut i = 0;
        while i < state.waiting.len() {
            if state.waiting[i].due <= now {
                due.push(state.waiting.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by(|a, b| a.due.cmp(&b.due).then(a.item.id.cmp(&b.item.id)));

        for w in due {
            self.notify_listeners("on_leave_waiting", |l| l.on_leave_waiting(&w));
            match self.evaluate(&state, &w.item) {
                Some(cause) => {
                    debug!(item_id = %w.item.id, %cause, "item blocked");
                    let blocked = BlockedItem {
                        item: w.item,
                        cause,
                    };
                    self.notify_listeners("on_enter_blocked", |l| l.on_enter_blocked(&blocked));
                    state.blocked.push(blocked);
                }
                None => {
                    let buildable = BuildableItem {
                        item: w.item,
                        pending: None,
                    };
                    self.notify_listeners("on_enter_buildable", |l| {
                        l.on_enter_buildable(&buildable)
                    });
                    state.buildables.push(buildable);
                }
            }
        }

        // Re-evaluate blocked items; the cause may clear or change.
        let blocked = std::mem::take(&mut state.blocked);
        for mut b in blocked {
            match self.evaluate(&state, &b.item) {
                None => {
                    self.notify_listeners("on_leave_blocked", |l| l.on_leave_blocked(&b));
                    let buildable = BuildableItem {
                        item: b.item,
                        pending: None,
                    };
                    self.notify_listeners("on_enter_buildable", |l| {
                        l.on_enter_buildable(&buildable)
                    });
                    state.buildables.push(buildable);
                }
                Some(cause) => {
                    if cause != b.cause {
                        debug!(item_id = %b.item.id, old = %b.cause, new = %cause, "blocking cause changed");
                        b.cause = cause;
                    }
                    state.blocked.push(b);
                }
            }
        }

        if state.buildables.iter().any(|b| b.pending.is_none()) {
            self.work_available.notify_waiters();
        }
    }

    /// Why the item cannot become buildable right now, or `None`.
    fn evaluate(&self, state: &QueueState, item: &Item) -> Option<CauseOfBlockage> {
        for veto in self.vetoes.read().unwrap().iter() {
            if let Some(cause) = veto.can_run(item) {
                return Some(cause);
            }
        }

        let task_id = item.task_id();

        if !item.task.is_concurrent() && state.has_claimed(&task_id) {
            return Some(CauseOfBlockage::BuildInProgress { task: task_id });
        }

        let graph = self.graph();
        if item.task.blocks_on_upstream() {
            for up in graph.transitive_upstream(&task_id) {
                if state.contains_task(&up) {
                    return Some(CauseOfBlockage::UpstreamInProgress { task: up });
                }
            }
        }
        if item.task.blocks_on_downstream() {
            for down in graph.transitive_downstream(&task_id) {
                if state.contains_task(&down) {
                    return Some(CauseOfBlockage::DownstreamInProgress { task: down });
                }
            }
        }

        self.nodes.evaluate(item)
    }

    /// Claim the first buildable item this node can take. Transitions
    /// it to pending and produces the executables; the executor runs
    /// them outside the queue lock.
    pub async fn claim(&self, node: &Arc<Node>) -> Option<WorkUnit> {
        if !node.is_available() {
            return None;
        }
        let mut state = self.state.lock().await;

        let mut i = 0;
        while i < state.buildables.len() {
            if state.buildables[i].pending.is_some()
                || self
                    .nodes
                    .can_take(node, &state.buildables[i].item)
                    .is_some()
            {
                i += 1;
                continue;
            }

            let task = state.buildables[i].item.task.clone();
            match create_executables(task.as_ref()) {
                Ok(executables) => {
                    let b = &mut state.buildables[i];
                    b.pending = Some(node.name().to_string());
                    b.item.set_phase(ItemPhase::Started);
                    let unit = WorkUnit {
                        item_id: b.item.id,
                        executable_id: ExecutableId::new(),
                        task,
                        executables,
                        actions: b.item.actions.clone(),
                        causes: b.item.causes.clone(),
                        submitted: b.item.submitted,
                        started: Utc::now(),
                        log: BuildLog::new(),
                    };
                    info!(item_id = %unit.item_id, task = %unit.task.id(), node = node.name(), "item claimed");
                    return Some(unit);
                }
                Err(e) => {
                    error!(task = %task.id(), error = %e, "executable creation failed");
                    let b = state.buildables.remove(i);
                    self.notify_listeners("on_leave_buildable", |l| l.on_leave_buildable(&b));
                    let now = Utc::now();
                    let build = CompletedBuild {
                        id: ExecutableId::new(),
                        task: b.item.task_id(),
                        task_name: b.item.task.name(),
                        outcome: Outcome::Failure,
                        actions: b.item.actions.clone(),
                        causes: b.item.causes.clone(),
                        log: vec![format!("Failed to create executable: {e}")],
                        submitted: b.item.submitted,
                        started: now,
                        completed: now,
                    };
                    state.counters.completed += 1;
                    let left = b.item.into_left(false, Some(build));
                    self.notify_listeners("on_left", |l| l.on_left(&left));
                }
            }
        }
        None
    }

    /// Report a claimed item's terminal outcome. Removes the item
    /// (Left), fires listeners, and evaluates downstream dependency
    /// triggers. Safe to call more than once per item: completions
    /// for unknown items are ignored.
    pub async fn on_completed(
        &self,
        item_id: ItemId,
        executable_id: ExecutableId,
        started: DateTime<Utc>,
        outcome: Outcome,
        log: Vec<String>,
    ) {
        let build;
        {
            let mut state = self.state.lock().await;
            let Some(pos) = state.buildables.iter().position(|b| b.item.id == item_id) else {
                debug!(%item_id, "completion for unknown item ignored");
                return;
            };
            let b = state.buildables.remove(pos);
            self.notify_listeners("on_leave_buildable", |l| l.on_leave_buildable(&b));
            build = CompletedBuild {
                id: executable_id,
                task: b.item.task_id(),
                task_name: b.item.task.name(),
                outcome,
                actions: b.item.actions.clone(),
                causes: b.item.causes.clone(),
                log,
                submitted: b.item.submitted,
                started,
                completed: Utc::now(),
            };
            state.counters.completed += 1;
            info!(%item_id, task = %build.task, outcome = ?outcome, "item left the queue");
            let left = b.item.into_left(false, Some(build.clone()));
            self.notify_listeners("on_left", |l| l.on_left(&left));
        }

        self.work_available.notify_waiters();
        let graph = self.graph();
        graph.on_build_completed(&build, self).await;
        // A finished build may unblock items waiting on it.
        self.maintain().await;
    }

    /// Resolves when buildable work may be available. Executors pair
    /// this with a polling fallback.
    pub async fn work_notified(&self) {
        self.work_available.notified().await;
    }

    /// The task's live item, if any.
    pub async fn get_item(&self, task: &TaskId) -> Option<QueueItemView> {
        self.snapshot()
            .await
            .into_iter()
            .find(|v| v.task == *task)
    }

    /// Read-only view of every live item: waiting, blocked, then
    /// buildable, each in queue order.
    pub async fn snapshot(&self) -> Vec<QueueItemView> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for w in &state.waiting {
            out.push(view(&w.item, ItemStateView::Waiting { due: w.due }));
        }
        for b in &state.blocked {
            out.push(view(
                &b.item,
                ItemStateView::Blocked {
                    cause: b.cause.clone(),
                },
            ));
        }
        for b in &state.buildables {
            out.push(view(
                &b.item,
                ItemStateView::Buildable {
                    pending: b.pending.clone(),
                },
            ));
        }
        out
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.waiting.len() + state.blocked.len() + state.buildables.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            scheduled: state.counters.scheduled,
            merged: state.counters.merged,
            cancelled: state.counters.cancelled,
            completed: state.counters.completed,
            waiting: state.waiting.len(),
            blocked: state.blocked.len(),
            buildable: state
                .buildables
                .iter()
                .filter(|b| b.pending.is_none())
                .count(),
            pending: state
                .buildables
                .iter()
                .filter(|b| b.pending.is_some())
                .count(),
        }
    }

    /// Cancel every unclaimed item; used at shutdown. Returns how
    /// many items were cancelled. Claimed items are untouched.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut cancelled = 0;

        for w in std::mem::take(&mut state.waiting) {
            self.notify_listeners("on_leave_waiting", |l| l.on_leave_waiting(&w));
            self.leave_cancelled(&mut state, w.item);
            cancelled += 1;
        }
        for b in std::mem::take(&mut state.blocked) {
            self.notify_listeners("on_leave_blocked", |l| l.on_leave_blocked(&b));
            self.leave_cancelled(&mut state, b.item);
            cancelled += 1;
        }
        let buildables = std::mem::take(&mut state.buildables);
        for b in buildables {
            if b.pending.is_some() {
                state.buildables.push(b);
            } else {
                self.notify_listeners("on_leave_buildable", |l| l.on_leave_buildable(&b));
                self.leave_cancelled(&mut state, b.item);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Periodic maintenance driver; runs until the token cancels.
    pub async fn run_maintenance(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.maintain_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.maintain().await,
            }
        }
    }

    fn notify_listeners<F>(&self, hook: &'static str, f: F)
    where
        F: Fn(&dyn QueueListener) -> Result<()>,
    {
        for listener in self.listeners.read().unwrap().iter() {
            if let Err(e) = f(listener.as_ref()) {
                warn!(hook, error = %e, "queue listener failed");
            }
        }
    }
}

fn view(item: &Item, state: ItemStateView) -> QueueItemView {
    QueueItemView {
        id: item.id,
        task: item.task_id(),
        task_name: item.task.name(),
        submitted: item.submitted,
        causes: item.causes.clone(),
        state,
    }
}

fn create_executables(task: &dyn Task) -> Result<Vec<(String, Box<dyn Executable>)>> {
    let mut out = vec![(task.name(), task.create_executable()?)];
    for sub in task.sub_tasks() {
        out.push((sub.name(), sub.create_executable()?));
    }
    Ok(out)
}
