//! A single execution slot.
//!
//! An executor loops between idle and busy: it claims a buildable
//! item its node can take, runs the executables outside the queue
//! lock, and reports the outcome back. Interruption is cooperative
//! (a cancellation token the executable observes); `kill_hard`
//! forcibly abandons the slot's task and leaves the pool's watchdog
//! to replace it.

use crucible_core::actions::Cause;
use crucible_core::build::Outcome;
use crucible_core::ids::{ExecutableId, ItemId, TaskId};
use crucible_core::task::{BuildLog, ExecutionContext};
use crucible_scheduler::node::Node;
use crucible_scheduler::queue::{Queue, WorkUnit};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a busy executor is running right now.
#[derive(Clone)]
pub struct CurrentWork {
    pub item_id: ItemId,
    pub task: TaskId,
    pub task_name: String,
    pub executable_id: ExecutableId,
    pub started: DateTime<Utc>,
    pub log: BuildLog,
    pub(crate) token: CancellationToken,
}

impl CurrentWork {
    /// How long the work has been running.
    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started
    }
}

struct InterruptRequest {
    outcome: Outcome,
    causes: Vec<Cause>,
}

#[derive(Default)]
struct ExecutorInner {
    current: Option<CurrentWork>,
    interrupt: Option<InterruptRequest>,
    cause_of_death: Option<String>,
}

/// One execution slot bound to a node.
pub struct Executor {
    slot: usize,
    node: Arc<Node>,
    stop: CancellationToken,
    inner: Mutex<ExecutorInner>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Spawn the slot's claim-and-run loop.
    pub(crate) fn spawn(
        slot: usize,
        node: Arc<Node>,
        queue: Arc<Queue>,
        claim_interval: Duration,
        stop: CancellationToken,
    ) -> Arc<Self> {
        let executor = Arc::new(Self {
            slot,
            node,
            stop,
            inner: Mutex::new(ExecutorInner::default()),
            join: Mutex::new(None),
        });
        let handle = tokio::spawn(run_loop(executor.clone(), queue, claim_interval));
        *executor.join.lock().unwrap() = Some(handle);
        executor
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().current.is_some()
    }

    /// Snapshot of the in-progress work, if any.
    pub fn current_work(&self) -> Option<CurrentWork> {
        self.inner.lock().unwrap().current.clone()
    }

    /// Request cooperative cancellation of the in-progress execution.
    /// Repeated calls before the executable notices merge into one
    /// interruption event: the worst requested outcome and the union
    /// of causes, each recorded in the build log once. Returns false
    /// when the slot is idle.
    pub fn interrupt(&self, outcome: Outcome, causes: Vec<Cause>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ExecutorInner {
            current, interrupt, ..
        } = &mut *inner;
        let Some(work) = current.as_ref() else {
            return false;
        };

        let req = interrupt.get_or_insert_with(|| InterruptRequest {
            outcome,
            causes: Vec::new(),
        });
        req.outcome = req.outcome.worse_of(outcome);
        for cause in causes {
            if !req.causes.contains(&cause) {
                work.log.append(format!("Interrupted: {cause}"));
                req.causes.push(cause);
            }
        }
        work.token.cancel();
        warn!(slot = self.slot, item_id = %work.item_id, "interrupt requested");
        true
    }

    /// Forcibly abandon the slot's task without waiting for
    /// cooperative interruption. The slot records its cause of death
    /// and stops accepting work; the pool's watchdog detects it,
    /// reports any abandoned build as aborted, and replaces the slot.
    pub fn kill_hard(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.cause_of_death = Some(reason.clone());
            if let Some(work) = inner.current.as_ref() {
                work.log.append(format!("Executor was forcibly killed: {reason}"));
            }
        }
        if let Some(join) = self.join.lock().unwrap().take() {
            join.abort();
        }
        warn!(slot = self.slot, node = self.node.name(), %reason, "executor killed");
    }

    pub fn cause_of_death(&self) -> Option<String> {
        self.inner.lock().unwrap().cause_of_death.clone()
    }

    /// Stop claiming new work; the current build, if any, finishes.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// A dead slot terminated without being asked to stop and must be
    /// replaced by the pool.
    pub(crate) fn is_dead(&self) -> bool {
        if self.inner.lock().unwrap().cause_of_death.is_some() {
            return true;
        }
        if self.stop.is_cancelled() {
            return false;
        }
        match self.join.lock().unwrap().as_ref() {
            Some(join) => join.is_finished(),
            None => true,
        }
    }

    /// Take the work a dead slot left behind, so its terminal
    /// bookkeeping happens exactly once.
    pub(crate) fn take_abandoned_work(&self) -> Option<CurrentWork> {
        self.inner.lock().unwrap().current.take()
    }

    async fn execute(&self, mut unit: WorkUnit, queue: &Queue) {
        let token = CancellationToken::new();
        let log = unit.log.clone();
        for cause in &unit.causes {
            log.append(cause.to_string());
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.interrupt = None;
            inner.current = Some(CurrentWork {
                item_id: unit.item_id,
                task: unit.task.id(),
                task_name: unit.task.name(),
                executable_id: unit.executable_id,
                started: unit.started,
                log: log.clone(),
                token: token.clone(),
            });
        }

        info!(
            slot = self.slot,
            node = self.node.name(),
            item_id = %unit.item_id,
            task = %unit.task.id(),
            "executing"
        );

        let ctx = ExecutionContext::new(token.clone(), log.clone());
        let mut outcome = Outcome::Success;
        for (name, executable) in std::mem::take(&mut unit.executables) {
            if token.is_cancelled() {
                log.append(format!("Skipped {name}: execution interrupted"));
                outcome = outcome.worse_of(Outcome::Aborted);
                continue;
            }
            outcome = outcome.worse_of(executable.run(&ctx).await);
        }

        let interrupt = {
            let mut inner = self.inner.lock().unwrap();
            inner.current = None;
            inner.interrupt.take()
        };
        let outcome = match interrupt {
            // The executable acknowledged cancellation: the requested
            // outcome stands in for the generic abort.
            Some(req) if outcome == Outcome::Aborted => req.outcome,
            Some(req) => outcome.worse_of(req.outcome),
            None => outcome,
        };

        info!(
            slot = self.slot,
            item_id = %unit.item_id,
            outcome = ?outcome,
            "execution finished"
        );
        queue
            .on_completed(
                unit.item_id,
                unit.executable_id,
                unit.started,
                outcome,
                log.snapshot(),
            )
            .await;
    }
}

async fn run_loop(executor: Arc<Executor>, queue: Arc<Queue>, claim_interval: Duration) {
    debug!(
        slot = executor.slot,
        node = executor.node.name(),
        "executor started"
    );
    loop {
        tokio::select! {
            _ = executor.stop.cancelled() => break,
            _ = queue.work_notified() => {}
            _ = tokio::time::sleep(claim_interval) => {}
        }
        while !executor.stop.is_cancelled() {
            let Some(unit) = queue.claim(&executor.node).await else {
                break;
            };
            executor.execute(unit, &queue).await;
        }
    }
    debug!(slot = executor.slot, "executor stopped");
}
