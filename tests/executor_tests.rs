use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron_lite::scheduler::{ExecutionRecord, Job};
use cron_lite::store::{CoordinationStore, MemStore, JOB_LOCK_DIR};
use cron_lite::worker::{JobExecutor, JobLock};
use cron_lite::CronError;
use tokio::sync::mpsc;

/// Create a test executor over a fresh in-memory store
fn test_executor() -> (JobExecutor, MemStore) {
    let store = MemStore::new();
    (JobExecutor::new(Arc::new(store.clone()), 5), store)
}

fn record(name: &str, command: &str) -> ExecutionRecord {
    let now = Utc::now();
    ExecutionRecord::new(Job::new(name, command, "* * * * * *"), now, now)
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (executor, store) = test_executor();

    let result = executor.execute(record("hello", "echo hello")).await;

    assert_eq!(result.record.job.name, "hello");
    assert!(result.error.is_none());
    assert_eq!(String::from_utf8_lossy(&result.output), "hello\n");
    assert!(result.end_time >= result.start_time);
    // Lock released afterwards.
    assert_eq!(store.lease_count().await, 0);
    assert!(store.get_prefix(JOB_LOCK_DIR).await.unwrap().kvs.is_empty());
}

#[tokio::test]
async fn test_execute_empty_output() {
    let (executor, _store) = test_executor();

    let result = executor.execute(record("quiet", "true")).await;

    assert!(result.error.is_none());
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let (executor, _store) = test_executor();

    let result = executor.execute(record("seq", "seq 1 1000")).await;

    assert!(result.error.is_none());
    let output = String::from_utf8_lossy(&result.output);
    assert_eq!(output.lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let (executor, store) = test_executor();

    let result = executor
        .execute(record("fail", "echo before; echo oops 1>&2; exit 1"))
        .await;

    assert!(matches!(result.error, Some(CronError::CommandFailed(_))));
    assert_eq!(String::from_utf8_lossy(&result.output), "before\noops\n");
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_execute_skips_when_lock_held() {
    let (executor, store) = test_executor();
    let holder = JobLock::new(Arc::new(store.clone()), "busy", 5)
        .try_lock()
        .await
        .unwrap();

    let result = executor
        .execute(record("busy", "echo should-not-run"))
        .await;

    assert!(result.lost_lock());
    assert!(result.output.is_empty());
    holder.release().await;
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_cancel_kills_running_command() {
    let (executor, store) = test_executor();
    let record = record("sleeper", "sleep 600");
    let cancel = record.cancel.clone();

    let handle = tokio::spawn(async move { executor.execute(record).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("killed job should finish promptly")
        .unwrap();

    assert!(matches!(result.error, Some(CronError::Cancelled)));
    assert_eq!(
        result.error.unwrap().to_string(),
        "job killed by request"
    );
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_shutdown_interrupt_is_not_reported_as_kill() {
    let (executor, store) = test_executor();
    let record = record("sleeper", "sleep 600");
    let interrupt = record.interrupt.clone();

    let handle = tokio::spawn(async move { executor.execute(record).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    interrupt.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("interrupted job should finish promptly")
        .unwrap();

    assert!(result.record.cancel.is_cancelled());
    assert!(matches!(result.error, Some(CronError::Interrupted)));
    assert_eq!(
        result.error.unwrap().to_string(),
        "job interrupted by worker shutdown"
    );
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_spawn_posts_result() {
    let (executor, _store) = test_executor();
    let (tx, mut rx) = mpsc::channel(1);

    executor.spawn(record("posted", "echo posted"), tx);

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.record.job.name, "posted");
    assert_eq!(String::from_utf8_lossy(&result.output), "posted\n");
}

#[tokio::test]
async fn test_custom_shell() {
    let store = MemStore::new();
    let executor = JobExecutor::new(Arc::new(store), 5).with_shell("/bin/sh");

    let result = executor.execute(record("shell", "printf '%s' custom")).await;

    assert!(result.error.is_none());
    assert_eq!(String::from_utf8_lossy(&result.output), "custom");
}
