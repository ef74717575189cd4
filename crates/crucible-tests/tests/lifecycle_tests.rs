//! End-to-end item lifecycle scenarios across queue and executors.

use crucible_core::build::Outcome;
use crucible_core::ids::TaskId;
use crucible_executor::ExecutorPool;
use crucible_scheduler::item::{ItemPhase, ItemStateView};
use crucible_scheduler::node::Node;
use crucible_tests::fixtures::{Behavior, BuildCapture, TestTask};
use crucible_tests::helpers::{fast_config, wait_until, Rig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_two_stage_future_over_full_lifecycle() {
    let rig = Rig::single_node(&["linux"], 1);

    let result = rig
        .queue
        .schedule(
            Arc::new(TestTask::new("build").with_label("linux")),
            Some(Duration::from_millis(60)),
            vec![],
            vec![],
        )
        .await;
    assert!(result.created);
    let mut handle = result.handle;

    // Still in its quiet period: neither stage resolved.
    assert_eq!(handle.phase(), ItemPhase::Queued);

    let started = handle.wait_started().await.unwrap();
    assert_eq!(started, ItemPhase::Started);

    let completed = handle.wait_completed().await.unwrap();
    assert_eq!(completed, ItemPhase::Completed(Outcome::Success));
    assert!(rig.queue.is_empty().await);
    rig.shutdown();
}

#[tokio::test]
async fn test_label_blocks_until_matching_node_appears() {
    let rig = Rig::single_node(&["windows"], 1);

    let mut handle = rig
        .queue
        .schedule(
            Arc::new(TestTask::new("t1").with_label("linux")),
            None,
            vec![],
            vec![],
        )
        .await
        .handle;

    let view = rig.queue.get_item(&TaskId::new("t1")).await.unwrap();
    assert!(matches!(view.state, ItemStateView::Blocked { .. }));

    // A matching node comes online; the next maintenance pass
    // promotes the item and its pool picks it up.
    let node = Arc::new(Node::new("agent-linux", 1).with_labels(["linux"]));
    rig.registry.register(node.clone());
    let pool = ExecutorPool::new(node, rig.queue.clone(), fast_config());
    pool.start();
    rig.queue.maintain().await;

    assert_eq!(
        handle.wait_completed().await.unwrap(),
        ItemPhase::Completed(Outcome::Success)
    );
    pool.shutdown();
    rig.shutdown();
}

#[tokio::test]
async fn test_sub_tasks_run_in_order_on_one_claim() {
    let rig = Rig::single_node(&[], 1);
    let trace = Arc::new(Mutex::new(Vec::new()));

    let task = TestTask::new("main")
        .with_sub_tasks(&["sub-a", "sub-b"])
        .with_trace(trace.clone());
    let mut handle = rig
        .queue
        .schedule(Arc::new(task), None, vec![], vec![])
        .await
        .handle;

    assert_eq!(
        handle.wait_completed().await.unwrap(),
        ItemPhase::Completed(Outcome::Success)
    );
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["main".to_string(), "sub-a".to_string(), "sub-b".to_string()]
    );

    let stats = rig.queue.stats().await;
    assert_eq!(stats.completed, 1);
    rig.shutdown();
}

#[tokio::test]
async fn test_failed_build_reaches_listeners_with_log() {
    let rig = Rig::single_node(&[], 1);
    let capture = BuildCapture::new();
    rig.queue.add_listener(capture.clone());

    let mut handle = rig
        .queue
        .schedule(
            Arc::new(TestTask::new("flaky").with_behavior(Behavior::Fail)),
            None,
            vec![],
            vec![],
        )
        .await
        .handle;

    assert_eq!(
        handle.wait_completed().await.unwrap(),
        ItemPhase::Completed(Outcome::Failure)
    );

    wait_until("captured build", Duration::from_secs(2), || {
        capture.build_for(&TaskId::new("flaky")).is_some()
    })
    .await;
    let build = capture.build_for(&TaskId::new("flaky")).unwrap();
    assert_eq!(build.outcome, Outcome::Failure);
    assert!(build.log.iter().any(|l| l.contains("flaky failed")));
    rig.shutdown();
}

#[tokio::test]
async fn test_interleaved_tasks_share_one_executor() {
    let rig = Rig::single_node(&[], 1);
    let capture = BuildCapture::new();
    rig.queue.add_listener(capture.clone());

    for name in ["one", "two", "three"] {
        rig.queue
            .schedule(Arc::new(TestTask::new(name)), None, vec![], vec![])
            .await;
    }

    wait_until("all builds done", Duration::from_secs(5), || {
        capture.builds().len() == 3
    })
    .await;
    assert!(rig.queue.is_empty().await);
    rig.shutdown();
}
