// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work queue scheduling tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use emulator_functions::{ExecutionMode, QueueError, WorkQueue};

/// Tracks how many tasks run at once and the highest value seen.
#[derive(Default)]
struct Overlap {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Overlap {
    async fn run(&self, hold: Duration) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(hold).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Ordering and concurrency
// ============================================================================

#[tokio::test]
async fn test_sequential_never_overlaps() {
    let queue = WorkQueue::new(ExecutionMode::Sequential);
    queue.start();
    let overlap = Arc::new(Overlap::default());
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let overlap = overlap.clone();
            let order = order.clone();
            queue.submit(async move {
                overlap.run(Duration::from_millis(20)).await;
                order.lock().push(i);
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_auto_runs_tasks_concurrently() {
    let queue = WorkQueue::new(ExecutionMode::Auto);
    queue.start();
    let overlap = Arc::new(Overlap::default());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let overlap = overlap.clone();
            queue.submit(async move { overlap.run(Duration::from_millis(200)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(overlap.peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_max_concurrency_caps_parallelism() {
    let queue = WorkQueue::new(ExecutionMode::Auto).with_max_concurrency(2);
    queue.start();
    let overlap = Arc::new(Overlap::default());

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let overlap = overlap.clone();
            queue.submit(async move { overlap.run(Duration::from_millis(50)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(overlap.peak.load(Ordering::SeqCst) <= 2);
}

// ============================================================================
// Flush, stop and failures
// ============================================================================

#[tokio::test]
async fn test_flush_waits_for_running_tasks() {
    let queue = WorkQueue::new(ExecutionMode::Auto);
    queue.start();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let done = done.clone();
        let _ = queue.submit(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    queue.flush().await;
    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn test_flush_on_empty_queue_is_immediate() {
    let queue = WorkQueue::new(ExecutionMode::Sequential);
    tokio::time::timeout(Duration::from_millis(100), queue.flush())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stop_rejects_new_tasks() {
    let queue = WorkQueue::new(ExecutionMode::Sequential);
    queue.start();
    queue.submit(async {}).await.unwrap();

    queue.stop();
    let err = queue.submit(async { 1 }).await.unwrap_err();
    assert_eq!(err, QueueError::Stopped);

    tokio::time::timeout(Duration::from_secs(1), async {
        while queue.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    queue.start();
    assert_eq!(queue.submit(async { 2 }).await.unwrap(), 2);
}

#[tokio::test]
async fn test_panicking_task_is_isolated() {
    let queue = WorkQueue::new(ExecutionMode::Sequential);
    queue.start();

    let failing = queue.submit::<_, ()>(async { panic!("task failure") });
    let following = queue.submit(async { "still running" });

    assert_eq!(failing.await.unwrap_err(), QueueError::TaskPanicked);
    assert_eq!(following.await.unwrap(), "still running");
    assert!(queue.is_running());
}
