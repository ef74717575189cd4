//! Per-node executor pools.
//!
//! A pool owns the node's executor slots and keeps their count equal
//! to the node's declared capacity. A watchdog detects slots whose
//! task died (killed hard or panicked), reports any abandoned build
//! as aborted, and replaces the slot with a fresh idle executor.

use crate::executor::Executor;
use crucible_core::actions::Cause;
use crucible_core::build::Outcome;
use crucible_scheduler::config::SchedulerConfig;
use crucible_scheduler::node::Node;
use crucible_scheduler::queue::Queue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The executor pool of one node.
pub struct ExecutorPool {
    node: Arc<Node>,
    queue: Arc<Queue>,
    config: SchedulerConfig,
    slots: Mutex<Vec<Arc<Executor>>>,
    next_slot: AtomicUsize,
    shutdown: CancellationToken,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorPool {
    pub fn new(node: Arc<Node>, queue: Arc<Queue>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            node,
            queue,
            config,
            slots: Mutex::new(Vec::new()),
            next_slot: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            watchdog: Mutex::new(None),
        })
    }

    /// Spawn the node's executors and the watchdog.
    pub fn start(self: &Arc<Self>) {
        {
            let mut slots = self.slots.lock().unwrap();
            while slots.len() < self.node.num_executors() {
                slots.push(self.new_slot());
            }
        }
        info!(
            node = self.node.name(),
            executors = self.node.num_executors(),
            "executor pool started"
        );

        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.watchdog_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = interval.tick() => pool.reconcile().await,
                }
            }
        });
        *self.watchdog.lock().unwrap() = Some(handle);
    }

    fn new_slot(&self) -> Arc<Executor> {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        Executor::spawn(
            slot,
            self.node.clone(),
            self.queue.clone(),
            self.config.claim_interval,
            self.shutdown.child_token(),
        )
    }

    /// Snapshot of the current slots.
    pub fn executors(&self) -> Vec<Arc<Executor>> {
        self.slots.lock().unwrap().clone()
    }

    pub fn size(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Replace dead slots ("yank") and restore the pool to the node's
    /// declared capacity. The abandoned build of a dead slot is
    /// reported aborted exactly once.
    pub async fn reconcile(&self) {
        let dead: Vec<Arc<Executor>> = {
            let mut slots = self.slots.lock().unwrap();
            let mut dead = Vec::new();
            slots.retain(|executor| {
                if executor.is_dead() {
                    dead.push(executor.clone());
                    false
                } else {
                    true
                }
            });
            dead
        };

        for executor in dead {
            let cause = executor
                .cause_of_death()
                .unwrap_or_else(|| "executor task terminated unexpectedly".to_string());
            warn!(
                node = self.node.name(),
                slot = executor.slot(),
                %cause,
                "yanking dead executor"
            );
            if let Some(work) = executor.take_abandoned_work() {
                work.log.append(format!("Build abandoned: {cause}"));
                self.queue
                    .on_completed(
                        work.item_id,
                        work.executable_id,
                        work.started,
                        Outcome::Aborted,
                        work.log.snapshot(),
                    )
                    .await;
            }
        }

        let target = self.node.num_executors();
        let mut slots = self.slots.lock().unwrap();
        while slots.len() < target && !self.shutdown.is_cancelled() {
            slots.push(self.new_slot());
        }
        let mut excess = slots.len().saturating_sub(target);
        if excess > 0 {
            let mut kept = Vec::with_capacity(target);
            for executor in slots.drain(..) {
                if excess > 0 && !executor.is_busy() {
                    executor.stop();
                    excess -= 1;
                } else {
                    kept.push(executor);
                }
            }
            *slots = kept;
        }
    }

    /// Change the node's declared capacity and reconcile to it. Busy
    /// slots above the new target finish their build before retiring.
    pub async fn resize(&self, num_executors: usize) {
        self.node.set_num_executors(num_executors);
        self.reconcile().await;
    }

    /// The node dropped off. Marks it unavailable so nothing claims
    /// work for it and interrupts every busy slot with the disconnect
    /// cause, which lands verbatim in each build's log and outcome.
    pub fn disconnect(&self, reason: &str) {
        self.node.set_available(false);
        warn!(node = self.node.name(), reason, "node disconnected");
        for executor in self.executors() {
            if executor.is_busy() {
                executor.interrupt(
                    Outcome::Failure,
                    vec![Cause::other(format!(
                        "Node {} disconnected: {reason}",
                        self.node.name()
                    ))],
                );
            }
        }
    }

    /// Mark the node available again.
    pub fn reconnect(&self) {
        self.node.set_available(true);
        info!(node = self.node.name(), "node reconnected");
    }

    /// Stop the watchdog and ask every slot to retire after its
    /// current build.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }
        info!(node = self.node.name(), "executor pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crucible_core::ids::TaskId;
    use crucible_core::task::{Executable, ExecutionContext, Task};
    use crucible_core::Result;
    use crucible_scheduler::item::ItemPhase;
    use crucible_scheduler::node::NodeRegistry;
    use std::time::Duration;

    /// Runs until cancelled, then acknowledges the abort.
    struct Cooperative;

    #[async_trait]
    impl Executable for Cooperative {
        async fn run(&self, ctx: &ExecutionContext) -> Outcome {
            ctx.token.cancelled().await;
            Outcome::Aborted
        }
    }

    /// Ignores the cancellation token entirely.
    struct Unresponsive;

    #[async_trait]
    impl Executable for Unresponsive {
        async fn run(&self, _ctx: &ExecutionContext) -> Outcome {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    struct Quick;

    #[async_trait]
    impl Executable for Quick {
        async fn run(&self, _ctx: &ExecutionContext) -> Outcome {
            Outcome::Success
        }
    }

    enum Flavor {
        Cooperative,
        Unresponsive,
        Quick,
    }

    struct TestTask {
        id: &'static str,
        flavor: Flavor,
    }

    impl Task for TestTask {
        fn id(&self) -> TaskId {
            TaskId::new(self.id)
        }

        fn create_executable(&self) -> Result<Box<dyn Executable>> {
            Ok(match self.flavor {
                Flavor::Cooperative => Box::new(Cooperative),
                Flavor::Unresponsive => Box::new(Unresponsive),
                Flavor::Quick => Box::new(Quick),
            })
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            claim_interval: Duration::from_millis(10),
            watchdog_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        }
    }

    fn rig(executors: usize) -> (Arc<Queue>, Arc<Node>) {
        let registry = Arc::new(NodeRegistry::new());
        let node = Arc::new(Node::new("agent-1", executors));
        registry.register(node.clone());
        (Arc::new(Queue::new(test_config(), registry)), node)
    }

    async fn busy_executor(pool: &Arc<ExecutorPool>) -> Arc<Executor> {
        loop {
            if let Some(executor) = pool.executors().into_iter().find(|e| e.is_busy()) {
                return executor;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_runs_work() {
        let (queue, node) = rig(1);
        let pool = ExecutorPool::new(node, queue.clone(), test_config());
        pool.start();

        let mut handle = queue
            .schedule(
                Arc::new(TestTask {
                    id: "quick",
                    flavor: Flavor::Quick,
                }),
                None,
                vec![],
                vec![],
            )
            .await
            .handle;

        assert_eq!(
            handle.wait_completed().await.unwrap(),
            ItemPhase::Completed(Outcome::Success)
        );
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_yank_restores_pool_size() {
        let (queue, node) = rig(1);
        let pool = ExecutorPool::new(node, queue.clone(), test_config());
        pool.start();

        let mut handle = queue
            .schedule(
                Arc::new(TestTask {
                    id: "stuck",
                    flavor: Flavor::Unresponsive,
                }),
                None,
                vec![],
                vec![],
            )
            .await
            .handle;
        handle.wait_started().await.unwrap();

        let stuck = busy_executor(&pool).await;
        stuck.kill_hard("watchdog: no progress");

        // The abandoned build is reported aborted, once.
        let phase = handle.wait_completed().await.unwrap();
        assert_eq!(phase, ItemPhase::Completed(Outcome::Aborted));

        // The pool replaces the dead slot and serves new work.
        let mut handle = queue
            .schedule(
                Arc::new(TestTask {
                    id: "after",
                    flavor: Flavor::Quick,
                }),
                None,
                vec![],
                vec![],
            )
            .await
            .handle;
        assert_eq!(
            handle.wait_completed().await.unwrap(),
            ItemPhase::Completed(Outcome::Success)
        );
        assert_eq!(pool.size(), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_fails_running_build_with_cause() {
        let (queue, node) = rig(1);
        let pool = ExecutorPool::new(node, queue.clone(), test_config());
        pool.start();

        let mut handle = queue
            .schedule(
                Arc::new(TestTask {
                    id: "t1",
                    flavor: Flavor::Cooperative,
                }),
                None,
                vec![],
                vec![],
            )
            .await
            .handle;
        handle.wait_started().await.unwrap();
        busy_executor(&pool).await;

        pool.disconnect("network partition");

        let phase = handle.wait_completed().await.unwrap();
        assert_eq!(phase, ItemPhase::Completed(Outcome::Failure));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_resize_adjusts_capacity() {
        let (queue, node) = rig(2);
        let pool = ExecutorPool::new(node, queue.clone(), test_config());
        pool.start();
        assert_eq!(pool.size(), 2);

        pool.resize(4).await;
        assert_eq!(pool.size(), 4);

        pool.resize(1).await;
        assert_eq!(pool.size(), 1);
        pool.shutdown();
    }
}
