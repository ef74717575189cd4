//! Rig assembly for integration scenarios.

use crucible_executor::ExecutorPool;
use crucible_scheduler::config::SchedulerConfig;
use crucible_scheduler::node::{Node, NodeRegistry};
use crucible_scheduler::queue::Queue;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with intervals short enough for tests.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        maintain_interval: Duration::from_millis(25),
        claim_interval: Duration::from_millis(10),
        watchdog_interval: Duration::from_millis(20),
        ..SchedulerConfig::default()
    }
}

/// A queue wired to a set of nodes, each with a started pool, plus a
/// running maintenance loop.
pub struct Rig {
    pub queue: Arc<Queue>,
    pub registry: Arc<NodeRegistry>,
    pub pools: Vec<Arc<ExecutorPool>>,
    shutdown: CancellationToken,
}

impl Rig {
    /// One pool per node, all started.
    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        init_tracing();
        let registry = Arc::new(NodeRegistry::new());
        let mut registered = Vec::new();
        for node in nodes {
            let node = Arc::new(node);
            registry.register(node.clone());
            registered.push(node);
        }

        let queue = Arc::new(Queue::new(fast_config(), registry.clone()));
        let shutdown = CancellationToken::new();
        tokio::spawn(queue.clone().run_maintenance(shutdown.clone()));
        let pools = registered
            .into_iter()
            .map(|node| {
                let pool = ExecutorPool::new(node, queue.clone(), fast_config());
                pool.start();
                pool
            })
            .collect();

        Self {
            queue,
            registry,
            pools,
            shutdown,
        }
    }

    /// Single node named `agent-1` with the given labels and slots.
    pub fn single_node(labels: &[&str], executors: usize) -> Self {
        Self::with_nodes(vec![
            Node::new("agent-1", executors).with_labels(labels.iter().copied()),
        ])
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for pool in &self.pools {
            pool.shutdown();
        }
    }
}

/// Poll until the condition holds, panicking after the timeout.
pub async fn wait_until<F>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
