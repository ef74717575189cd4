//! Forced executor replacement and node disconnect recovery.

use crucible_core::build::Outcome;
use crucible_core::ids::TaskId;
use crucible_scheduler::item::ItemPhase;
use crucible_tests::fixtures::{Behavior, BuildCapture, TestTask};
use crucible_tests::helpers::{wait_until, Rig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_yank_restores_capacity_and_reports_abandoned_build() {
    let rig = Rig::single_node(&[], 1);
    let pool = rig.pools[0].clone();
    let capture = BuildCapture::new();
    rig.queue.add_listener(capture.clone());

    let mut handle = rig
        .queue
        .schedule(
            Arc::new(TestTask::new("stuck").with_behavior(Behavior::Unresponsive)),
            None,
            vec![],
            vec![],
        )
        .await
        .handle;
    handle.wait_started().await.unwrap();
    wait_until("executor busy", Duration::from_secs(2), || {
        pool.executors().iter().any(|e| e.is_busy())
    })
    .await;

    let stuck = pool
        .executors()
        .into_iter()
        .find(|e| e.is_busy())
        .expect("busy executor");
    stuck.kill_hard("no progress for too long");
    assert_eq!(
        stuck.cause_of_death().as_deref(),
        Some("no progress for too long")
    );

    // The watchdog yanks the dead slot: the abandoned build is
    // reported aborted exactly once, with the cause in its log.
    assert_eq!(
        handle.wait_completed().await.unwrap(),
        ItemPhase::Completed(Outcome::Aborted)
    );
    let build = capture.build_for(&TaskId::new("stuck")).unwrap();
    assert!(build
        .log
        .iter()
        .any(|l| l.contains("no progress for too long")));
    assert!(build.log.iter().any(|l| l.contains("Build abandoned")));

    // Capacity is back to the configured single slot and the fresh
    // executor services new work.
    wait_until("pool back to size", Duration::from_secs(2), || {
        pool.size() == 1
    })
    .await;
    let mut handle = rig
        .queue
        .schedule(Arc::new(TestTask::new("after")), None, vec![], vec![])
        .await
        .handle;
    assert_eq!(
        handle.wait_completed().await.unwrap(),
        ItemPhase::Completed(Outcome::Success)
    );
    assert_eq!(pool.size(), 1);
    assert_eq!(rig.queue.stats().await.completed, 2);
    rig.shutdown();
}

#[tokio::test]
async fn test_disconnect_surfaces_cause_in_build_log() {
    let rig = Rig::single_node(&[], 1);
    let pool = rig.pools[0].clone();
    let capture = BuildCapture::new();
    rig.queue.add_listener(capture.clone());

    let mut handle = rig
        .queue
        .schedule(
            Arc::new(TestTask::new("t1").with_behavior(Behavior::BlockUntilCancelled)),
            None,
            vec![],
            vec![],
        )
        .await
        .handle;
    handle.wait_started().await.unwrap();
    wait_until("executor busy", Duration::from_secs(2), || {
        pool.executors().iter().any(|e| e.is_busy())
    })
    .await;

    pool.disconnect("agent stopped responding");

    assert_eq!(
        handle.wait_completed().await.unwrap(),
        ItemPhase::Completed(Outcome::Failure)
    );
    let build = capture.build_for(&TaskId::new("t1")).unwrap();
    assert!(build
        .log
        .iter()
        .any(|l| l.contains("disconnected: agent stopped responding")));

    // Reconnecting makes the node schedulable again.
    pool.reconnect();
    let mut handle = rig
        .queue
        .schedule(Arc::new(TestTask::new("t2")), None, vec![], vec![])
        .await
        .handle;
    assert_eq!(
        handle.wait_completed().await.unwrap(),
        ItemPhase::Completed(Outcome::Success)
    );
    rig.shutdown();
}
