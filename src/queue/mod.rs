//! FIFO work queue between pipeline stages.
//!
//! The oldest `mem_capacity` items live in memory. Once memory is full every
//! later push is appended to an on-disk [`Segment`], and keeps going there
//! until the segment drains, so all disk items are younger than all memory
//! items. `pop` serves memory first and refills it from disk in write order
//! when it runs dry.

pub mod segment;

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::{self, JoinError};
use tracing::{debug, error};

use crate::model::Stage;

pub use segment::Segment;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{stage} queue is closed")]
    Closed { stage: Stage },

    #[error("{stage} queue overflow segment failed: {source}")]
    Disk {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} queue could not encode item: {source}")]
    Encode {
        stage: Stage,
        #[source]
        source: serde_json::Error,
    },

    #[error("{stage} queue could not decode overflow record: {source}")]
    Decode {
        stage: Stage,
        #[source]
        source: serde_json::Error,
    },

    #[error("{stage} queue is unusable after an earlier disk failure")]
    Failed { stage: Stage },
}

impl QueueError {
    /// A queue that lost items can no longer honor its ordering contract.
    pub fn is_stage_fatal(&self) -> bool {
        !matches!(self, QueueError::Closed { .. } | QueueError::Encode { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pushed: u64,
    pub spilled: u64,
    pub rehydrated: u64,
    pub compactions: u64,
}

struct Inner<T> {
    memory: VecDeque<T>,
    /// Taken out while a blocking task works on it; the lock stays held.
    segment: Option<Segment>,
    failed: bool,
    segments_created: u64,
}

/// Records read back from disk by one refill.
struct Refill {
    segment: Option<Segment>,
    records: Vec<String>,
    compacted: bool,
    outcome: io::Result<()>,
}

fn blocking_failed(e: JoinError) -> io::Error {
    io::Error::other(format!("overflow segment task failed: {e}"))
}

pub struct StageQueue<T> {
    stage: Stage,
    mem_capacity: usize,
    spill_dir: PathBuf,
    inner: Mutex<Inner<T>>,
    depth: AtomicUsize,
    disk_depth: AtomicUsize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
    pushed: AtomicU64,
    spilled: AtomicU64,
    rehydrated: AtomicU64,
    compactions: AtomicU64,
}

impl<T> StageQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn open(stage: Stage, mem_capacity: usize, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            mem_capacity: mem_capacity.max(1),
            spill_dir: spill_dir.into(),
            inner: Mutex::new(Inner {
                memory: VecDeque::new(),
                segment: None,
                failed: false,
                segments_created: 0,
            }),
            depth: AtomicUsize::new(0),
            disk_depth: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            pushed: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
            rehydrated: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn mem_capacity(&self) -> usize {
        self.mem_capacity
    }

    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed { stage: self.stage });
        }
        let mut inner = self.inner.lock().await;
        if inner.failed {
            return Err(QueueError::Failed { stage: self.stage });
        }

        let disk_backlog = inner.segment.as_ref().map(Segment::unread).unwrap_or(0);
        if disk_backlog == 0 && inner.memory.len() < self.mem_capacity {
            inner.memory.push_back(item);
        } else {
            let record = serde_json::to_string(&item).map_err(|e| QueueError::Encode {
                stage: self.stage,
                source: e,
            })?;
            if let Err(e) = self.append_to_disk(&mut inner, record).await {
                inner.failed = true;
                error!(stage = %self.stage, error = %e, "overflow segment write failed");
                return Err(QueueError::Disk {
                    stage: self.stage,
                    source: e,
                });
            }
            self.spilled.fetch_add(1, Ordering::Relaxed);
            self.disk_depth.fetch_add(1, Ordering::Release);
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.depth.fetch_add(1, Ordering::Release);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn append_to_disk(&self, inner: &mut Inner<T>, record: String) -> io::Result<()> {
        let existing = inner.segment.take();
        if existing.is_none() {
            inner.segments_created += 1;
        }
        let path = self.spill_dir.join(format!(
            "{}-{}-{}.seg",
            self.stage,
            std::process::id(),
            inner.segments_created
        ));
        if existing.is_none() {
            debug!(stage = %self.stage, path = %path.display(), "opening overflow segment");
        }

        let (segment, outcome) = task::spawn_blocking(move || {
            let mut segment = match existing {
                Some(segment) => segment,
                None => match Segment::create(&path) {
                    Ok(segment) => segment,
                    Err(e) => return (None, Err(e)),
                },
            };
            let outcome = segment.append(&record);
            (Some(segment), outcome)
        })
        .await
        .map_err(blocking_failed)?;
        inner.segment = segment;
        outcome
    }

    /// Pops without waiting for a push. `Ok(None)` means nothing is
    /// available right now.
    pub async fn try_pop(&self) -> Result<Option<T>, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.memory.is_empty() {
            self.refill(&mut inner).await?;
        }
        let item = inner.memory.pop_front();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(item)
    }

    async fn refill(&self, inner: &mut Inner<T>) -> Result<(), QueueError> {
        let Some(mut segment) = inner.segment.take() else {
            return Ok(());
        };
        let stage = self.stage;
        let limit = self.mem_capacity;
        let refill = task::spawn_blocking(move || {
            let mut records = Vec::new();
            let mut outcome = Ok(());
            while records.len() < limit {
                match segment.read_next() {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => break,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            let mut compacted = false;
            if outcome.is_ok() && segment.unread() > 0 && segment.should_compact() {
                outcome = segment.compact();
                compacted = outcome.is_ok();
            }
            Refill {
                // a drained segment is dropped here, off the runtime threads
                segment: (segment.unread() > 0).then_some(segment),
                records,
                compacted,
                outcome,
            }
        })
        .await;
        let refill = match refill {
            Ok(refill) => refill,
            Err(e) => {
                inner.failed = true;
                return Err(QueueError::Disk {
                    stage,
                    source: blocking_failed(e),
                });
            }
        };
        inner.segment = refill.segment;

        let moved = refill.records.len();
        for record in refill.records {
            self.disk_depth.fetch_sub(1, Ordering::AcqRel);
            match serde_json::from_str::<T>(&record) {
                Ok(item) => inner.memory.push_back(item),
                Err(e) => {
                    inner.failed = true;
                    return Err(QueueError::Decode { stage, source: e });
                }
            }
        }
        self.rehydrated.fetch_add(moved as u64, Ordering::Relaxed);

        if let Err(e) = refill.outcome {
            inner.failed = true;
            return Err(QueueError::Disk { stage, source: e });
        }
        if refill.compacted {
            self.compactions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Waits for the next item. Returns `Ok(None)` once the queue is closed
    /// and fully drained.
    pub async fn pop(&self) -> Result<Option<T>, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop().await? {
                return Ok(Some(item));
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            notified.await;
        }
    }

    /// Marks one popped item as fully handled.
    pub fn task_done(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn disk_depth(&self) -> usize {
        self.disk_depth.load(Ordering::Acquire)
    }

    pub fn mem_depth(&self) -> usize {
        self.depth().saturating_sub(self.disk_depth())
    }

    /// Items pushed and not yet acknowledged with [`StageQueue::task_done`].
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(stage = %self.stage, depth = self.depth(), "queue closed");
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            rehydrated: self.rehydrated.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::model::FetchRequest;

    fn req(n: usize) -> FetchRequest {
        FetchRequest::get(&format!("http://example.com/{n}")).unwrap()
    }

    #[tokio::test]
    async fn third_item_comes_back_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let q = StageQueue::open(Stage::Crawl, 2, dir.path());
        for i in 0..3 {
            q.push(req(i)).await.unwrap();
        }
        assert_eq!(q.depth(), 3);
        assert_eq!(q.disk_depth(), 1);
        assert_eq!(q.mem_depth(), 2);

        assert_eq!(q.pop().await.unwrap(), Some(req(0)));
        assert_eq!(q.pop().await.unwrap(), Some(req(1)));
        assert_eq!(q.stats().rehydrated, 0);
        assert_eq!(q.pop().await.unwrap(), Some(req(2)));
        assert_eq!(q.stats().rehydrated, 1);
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn pushes_during_backlog_stay_behind_disk() {
        let dir = tempfile::tempdir().unwrap();
        let q = StageQueue::open(Stage::Audit, 2, dir.path());
        for i in 0..5 {
            q.push(i as u64).await.unwrap();
        }
        assert_eq!(q.pop().await.unwrap(), Some(0));
        assert_eq!(q.pop().await.unwrap(), Some(1));
        // memory is empty but disk still holds 2..5
        q.push(5).await.unwrap();
        let mut out = Vec::new();
        while let Some(v) = q.try_pop().await.unwrap() {
            out.push(v);
        }
        assert_eq!(out, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn close_drains_then_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let q = StageQueue::open(Stage::Grep, 1, dir.path());
        q.push(1u32).await.unwrap();
        q.push(2u32).await.unwrap();
        q.close();
        assert!(matches!(q.push(3).await, Err(QueueError::Closed { .. })));
        assert_eq!(q.pop().await.unwrap(), Some(1));
        assert_eq!(q.pop().await.unwrap(), Some(2));
        assert_eq!(q.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let q = Arc::new(StageQueue::<u32>::open(Stage::Output, 4, dir.path()));
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.pop().await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(7).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(7));

        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.pop().await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn outstanding_tracks_task_done() {
        let dir = tempfile::tempdir().unwrap();
        let q = StageQueue::open(Stage::Crawl, 4, dir.path());
        q.push(1u8).await.unwrap();
        q.push(2u8).await.unwrap();
        assert_eq!(q.outstanding(), 2);
        q.try_pop().await.unwrap();
        assert_eq!(q.outstanding(), 2);
        q.task_done();
        assert_eq!(q.outstanding(), 1);
        q.task_done();
        q.task_done();
        assert_eq!(q.outstanding(), 0);
    }

    #[tokio::test]
    async fn disk_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let q = StageQueue::open(Stage::Crawl, 1, &blocker);
        q.push(1u8).await.unwrap();
        let err = q.push(2u8).await.unwrap_err();
        assert!(matches!(err, QueueError::Disk { .. }));
        assert!(err.is_stage_fatal());
        assert!(matches!(q.push(3u8).await, Err(QueueError::Failed { .. })));
        assert_eq!(q.try_pop().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn large_backlog_compacts_without_reordering() {
        let dir = tempfile::tempdir().unwrap();
        let q = StageQueue::open(Stage::Crawl, 64, dir.path());
        let total = 130 * 100;
        let mut next_push = 0usize;
        let mut next_pop = 0usize;
        while next_push < total {
            for _ in 0..100 {
                q.push(next_push).await.unwrap();
                next_push += 1;
            }
            for _ in 0..60 {
                assert_eq!(q.try_pop().await.unwrap(), Some(next_pop));
                next_pop += 1;
            }
        }
        while let Some(v) = q.try_pop().await.unwrap() {
            assert_eq!(v, next_pop);
            next_pop += 1;
        }
        assert_eq!(next_pop, total);
        assert!(q.stats().compactions > 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn spilling_does_not_starve_other_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let q = StageQueue::open(Stage::Grep, 1, dir.path());
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            }
        });
        // one thread, and this loop never yields on its own
        for i in 0..200u32 {
            q.push(i).await.unwrap();
        }
        assert_eq!(q.disk_depth(), 199);
        assert!(ticks.load(Ordering::Relaxed) > 0);
        ticker.abort();
    }

    proptest! {
        #[test]
        fn fifo_across_overflow(
            cap in 1usize..8,
            ops in proptest::collection::vec(any::<bool>(), 1..200),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let dir = tempfile::tempdir().unwrap();
            let q = StageQueue::open(Stage::Grep, cap, dir.path());
            let (popped, pushed) = rt.block_on(async {
                let mut pushed = 0u32;
                let mut popped = Vec::new();
                for push in ops {
                    if push {
                        q.push(pushed).await.unwrap();
                        pushed += 1;
                    } else if let Some(v) = q.try_pop().await.unwrap() {
                        popped.push(v);
                    }
                }
                while let Some(v) = q.try_pop().await.unwrap() {
                    popped.push(v);
                }
                (popped, pushed)
            });
            prop_assert_eq!(popped, (0..pushed).collect::<Vec<_>>());
        }
    }
}
