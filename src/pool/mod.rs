pub mod resize;

pub use resize::{ResizeAction, ResizeConfig, ResizePolicy};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::ErrorClass;
use crate::queue::{QueueError, StageQueue};

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The item failed; the worker moves on.
    #[error("{0}")]
    Item(String),

    /// The stage cannot continue.
    #[error("{0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{pool} pool could not keep any worker alive after {crashes} consecutive crashes")]
    NoWorkers { pool: String, crashes: u32 },

    #[error("{pool} pool halted: {message}")]
    Fatal { pool: String, message: String },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PoolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PoolError::Queue(e) if !e.is_stage_fatal() => ErrorClass::ItemLocal,
            _ => ErrorClass::StageFatal,
        }
    }
}

/// Processes one item. Returning an error never kills the worker; a panic
/// does, and the worker is respawned.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T) -> Result<(), HandlerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolBounds {
    pub min: usize,
    pub max: usize,
}

impl PoolBounds {
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn clamp(&self, size: usize) -> usize {
        size.clamp(self.min, self.max)
    }
}

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub initial: usize,
    pub item_timeout: Duration,
    pub max_consecutive_crashes: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            initial: 1,
            item_timeout: Duration::from_secs(60),
            max_consecutive_crashes: 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolSample {
    pub target: usize,
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub depth: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub handled: u64,
    pub item_errors: u64,
    pub timeouts: u64,
    pub crashes: u64,
    pub spawned: u64,
    pub retired: u64,
    pub resizes: u64,
}

enum WorkerExit {
    Retired,
    Drained,
    Halted,
}

struct Shared<T> {
    name: String,
    queue: Arc<StageQueue<T>>,
    handler: Arc<dyn Handler<T>>,
    bounds: PoolBounds,
    item_timeout: Duration,
    max_consecutive_crashes: u32,
    target: AtomicUsize,
    live: AtomicUsize,
    idle: AtomicUsize,
    busy: AtomicUsize,
    shrink: Notify,
    grow: Notify,
    halt: CancellationToken,
    fatal: StdMutex<Option<String>>,
    finished: AtomicBool,
    consecutive_crashes: AtomicU32,
    handled: AtomicU64,
    item_errors: AtomicU64,
    timeouts: AtomicU64,
    crashes: AtomicU64,
    spawned: AtomicU64,
    retired: AtomicU64,
    resizes: AtomicU64,
}

impl<T> Shared<T> {
    /// Gives up one live slot if the pool is above target.
    fn try_retire(&self) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        loop {
            if live <= self.target.load(Ordering::Acquire) {
                return false;
            }
            match self.live.compare_exchange_weak(
                live,
                live - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    fn set_fatal(&self, message: String) {
        if let Ok(mut fatal) = self.fatal.lock() {
            if fatal.is_none() {
                error!(pool = %self.name, error = %message, "worker pool halted");
                *fatal = Some(message);
            }
        }
        self.halt.cancel();
    }
}

/// Acknowledges the item even if the handler panics.
struct InFlight<'a, T: Serialize + DeserializeOwned> {
    shared: &'a Shared<T>,
}

impl<T: Serialize + DeserializeOwned> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        self.shared.busy.fetch_sub(1, Ordering::AcqRel);
        self.shared.queue.task_done();
    }
}

async fn worker_loop<T>(shared: Arc<Shared<T>>, id: u64) -> WorkerExit
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    loop {
        if shared.try_retire() {
            debug!(pool = %shared.name, worker = id, "worker retired");
            return WorkerExit::Retired;
        }

        shared.idle.fetch_add(1, Ordering::AcqRel);
        let next = tokio::select! {
            biased;
            _ = shared.halt.cancelled() => None,
            _ = shared.shrink.notified() => Some(Ok(None)),
            popped = shared.queue.pop() => Some(popped.map(Some)),
        };
        shared.idle.fetch_sub(1, Ordering::AcqRel);

        let item = match next {
            None => return WorkerExit::Halted,
            // woken to re-check the target
            Some(Ok(None)) => continue,
            Some(Ok(Some(Some(item)))) => item,
            Some(Ok(Some(None))) => return WorkerExit::Drained,
            Some(Err(e)) => {
                shared.set_fatal(e.to_string());
                return WorkerExit::Halted;
            }
        };

        shared.busy.fetch_add(1, Ordering::AcqRel);
        let _in_flight = InFlight { shared: &shared };
        match tokio::time::timeout(shared.item_timeout, shared.handler.handle(item)).await {
            Ok(Ok(())) => {
                shared.handled.fetch_add(1, Ordering::Relaxed);
                shared.consecutive_crashes.store(0, Ordering::Relaxed);
            }
            Ok(Err(HandlerError::Item(message))) => {
                shared.handled.fetch_add(1, Ordering::Relaxed);
                shared.item_errors.fetch_add(1, Ordering::Relaxed);
                shared.consecutive_crashes.store(0, Ordering::Relaxed);
                debug!(pool = %shared.name, worker = id, error = %message, "item failed");
            }
            Ok(Err(HandlerError::Fatal(message))) => {
                shared.set_fatal(message);
                return WorkerExit::Halted;
            }
            Err(_) => {
                shared.handled.fetch_add(1, Ordering::Relaxed);
                shared.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pool = %shared.name,
                    worker = id,
                    timeout_ms = shared.item_timeout.as_millis() as u64,
                    "item exceeded its deadline"
                );
            }
        }
    }
}

async fn supervise<T>(shared: Arc<Shared<T>>)
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let mut workers = JoinSet::new();
    let mut next_id = 0u64;
    let mut draining = false;

    loop {
        if !draining && !shared.halt.is_cancelled() {
            while shared.live.load(Ordering::Acquire) < shared.target.load(Ordering::Acquire) {
                shared.live.fetch_add(1, Ordering::AcqRel);
                shared.spawned.fetch_add(1, Ordering::Relaxed);
                next_id += 1;
                workers.spawn(worker_loop(shared.clone(), next_id));
            }
        }
        if workers.is_empty() && (draining || shared.halt.is_cancelled()) {
            break;
        }

        tokio::select! {
            _ = shared.grow.notified() => {}
            joined = workers.join_next(), if !workers.is_empty() => match joined {
                Some(Ok(WorkerExit::Retired)) => {
                    shared.retired.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(WorkerExit::Drained)) => {
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    draining = true;
                }
                Some(Ok(WorkerExit::Halted)) => {
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                }
                Some(Err(e)) => {
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    if e.is_cancelled() {
                        continue;
                    }
                    shared.crashes.fetch_add(1, Ordering::Relaxed);
                    let crashes = shared.consecutive_crashes.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(pool = %shared.name, crashes, error = %e, "worker crashed, respawning");
                    if crashes >= shared.max_consecutive_crashes {
                        let err = PoolError::NoWorkers {
                            pool: shared.name.clone(),
                            crashes,
                        };
                        shared.set_fatal(err.to_string());
                    }
                }
                None => {}
            },
        }
    }
    shared.finished.store(true, Ordering::Release);
    debug!(pool = %shared.name, "supervisor finished");
}

/// Dynamically sized group of workers draining one stage queue.
///
/// Size changes apply between items: extra workers retire when they next
/// look for work and new ones are spawned right away.
pub struct WorkerPool<T> {
    shared: Arc<Shared<T>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T> WorkerPool<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn start(
        name: &str,
        queue: Arc<StageQueue<T>>,
        handler: Arc<dyn Handler<T>>,
        bounds: PoolBounds,
        options: PoolOptions,
    ) -> Self {
        let initial = bounds.clamp(options.initial);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue,
            handler,
            bounds,
            item_timeout: options.item_timeout,
            max_consecutive_crashes: options.max_consecutive_crashes.max(1),
            target: AtomicUsize::new(initial),
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            shrink: Notify::new(),
            grow: Notify::new(),
            halt: CancellationToken::new(),
            fatal: StdMutex::new(None),
            finished: AtomicBool::new(false),
            consecutive_crashes: AtomicU32::new(0),
            handled: AtomicU64::new(0),
            item_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
        });
        info!(pool = name, min = bounds.min, max = bounds.max, initial, "worker pool started");
        let supervisor = tokio::spawn(supervise(shared.clone()));
        Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn queue(&self) -> &Arc<StageQueue<T>> {
        &self.shared.queue
    }

    pub fn bounds(&self) -> PoolBounds {
        self.shared.bounds
    }

    pub async fn submit(&self, item: T) -> Result<(), PoolError> {
        if let Some(message) = self.fatal_error() {
            return Err(PoolError::Fatal {
                pool: self.shared.name.clone(),
                message,
            });
        }
        self.shared.queue.push(item).await?;
        Ok(())
    }

    /// Sets the target size, clamped to the pool bounds. Returns the
    /// applied target.
    pub fn resize(&self, target: usize) -> usize {
        let target = self.shared.bounds.clamp(target);
        let previous = self.shared.target.swap(target, Ordering::AcqRel);
        if target != previous {
            self.shared.resizes.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.shared.name, from = previous, to = target, "resizing pool");
        }
        if target > previous {
            self.shared.grow.notify_one();
        } else if target < previous {
            self.shared.shrink.notify_waiters();
        }
        target
    }

    pub fn apply(&self, action: ResizeAction) -> usize {
        let size = self.size();
        match action {
            ResizeAction::Grow => self.resize(size + 1),
            ResizeAction::Shrink => self.resize(size.saturating_sub(1)),
        }
    }

    /// Target size.
    pub fn size(&self) -> usize {
        self.shared.target.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.shared.idle.load(Ordering::Acquire)
    }

    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Items submitted and not yet handled, queued or in flight.
    pub fn pending(&self) -> usize {
        self.shared.queue.outstanding()
    }

    pub fn sample(&self) -> PoolSample {
        PoolSample {
            target: self.size(),
            live: self.live(),
            idle: self.idle(),
            busy: self.busy(),
            depth: self.shared.queue.depth(),
        }
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().ok().and_then(|f| f.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Stops handing out items. In-flight items keep running until
    /// [`WorkerPool::abort`] or completion.
    pub fn halt(&self) {
        self.shared.halt.cancel();
    }

    /// Force-cancels every worker, in-flight items included.
    pub async fn abort(&self) {
        self.shared.halt.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.finished.store(true, Ordering::Release);
    }

    /// Waits until every worker has exited. Workers exit once the queue is
    /// closed and drained or the pool is halted.
    ///
    /// The supervisor handle stays in place until it resolves, so a join
    /// abandoned by a timeout can still be followed by [`abort`](Self::abort).
    pub async fn join(&self) {
        let mut supervisor = self.supervisor.lock().await;
        let Some(handle) = supervisor.as_mut() else {
            return;
        };
        let outcome = handle.await;
        *supervisor = None;
        if let Err(e) = outcome {
            if e.is_panic() {
                self.shared.set_fatal(format!("supervisor panicked: {e}"));
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.shared;
        PoolStats {
            handled: s.handled.load(Ordering::Relaxed),
            item_errors: s.item_errors.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            crashes: s.crashes.load(Ordering::Relaxed),
            spawned: s.spawned.load(Ordering::Relaxed),
            retired: s.retired.load(Ordering::Relaxed),
            resizes: s.resizes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::model::Stage;

    struct Sleepy {
        delay: Duration,
        seen: AtomicUsize,
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Sleepy {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                seen: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Handler<u32> for Sleepy {
        async fn handle(&self, item: u32) -> Result<(), HandlerError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.seen.fetch_add(1, Ordering::SeqCst);
            match item {
                7 => Err(HandlerError::Item("seven".to_string())),
                13 => panic!("unlucky"),
                _ => Ok(()),
            }
        }
    }

    fn queue(dir: &TempDir, cap: usize) -> Arc<StageQueue<u32>> {
        Arc::new(StageQueue::open(Stage::Audit, cap, dir.path()))
    }

    fn options(initial: usize) -> PoolOptions {
        PoolOptions {
            initial,
            item_timeout: Duration::from_secs(5),
            max_consecutive_crashes: 4,
        }
    }

    #[tokio::test]
    async fn drains_queue_and_survives_errors_and_panics() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir, 4);
        let h = Sleepy::new(Duration::from_millis(1));
        let pool = WorkerPool::start("audit", q.clone(), h.clone(), PoolBounds::new(1, 4), options(3));
        for i in 0..40 {
            pool.submit(i).await.unwrap();
        }
        q.close();
        pool.join().await;

        assert_eq!(h.seen.load(Ordering::SeqCst), 40);
        assert_eq!(pool.pending(), 0, "panicking item is still acknowledged");
        let stats = pool.stats();
        assert_eq!(stats.item_errors, 1);
        assert_eq!(stats.crashes, 1);
        assert!(pool.fatal_error().is_none());
        assert!(pool.is_finished());
    }

    #[tokio::test]
    async fn shrinking_never_preempts_in_flight_items() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir, 64);
        let h = Sleepy::new(Duration::from_millis(30));
        let pool = WorkerPool::start("grep", q.clone(), h.clone(), PoolBounds::new(1, 4), options(4));
        for i in 0..8 {
            pool.submit(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.resize(1), 1);
        q.close();
        pool.join().await;
        assert_eq!(h.seen.load(Ordering::SeqCst), 8);
        assert!(h.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(pool.live(), 0);
    }

    #[tokio::test]
    async fn idle_workers_retire_on_shrink_and_spawn_on_grow() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir, 8);
        let h = Sleepy::new(Duration::from_millis(1));
        let pool = WorkerPool::start("crawl", q.clone(), h, PoolBounds::new(1, 6), options(4));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.live(), 4);

        pool.resize(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.stats().retired, 2);

        assert_eq!(pool.resize(100), 6, "clamped to max");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.live(), 6);
        assert_eq!(pool.sample().idle, 6);

        q.close();
        pool.join().await;
    }

    struct AlwaysPanics;

    #[async_trait]
    impl Handler<u32> for AlwaysPanics {
        async fn handle(&self, _item: u32) -> Result<(), HandlerError> {
            panic!("broken plugin")
        }
    }

    #[tokio::test]
    async fn crash_loop_becomes_stage_fatal() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir, 8);
        let pool = WorkerPool::start("audit", q.clone(), Arc::new(AlwaysPanics), PoolBounds::new(1, 1), options(1));
        for i in 0..10 {
            pool.submit(i).await.unwrap();
        }
        pool.join().await;
        let fatal = pool.fatal_error().unwrap();
        assert!(fatal.contains("4 consecutive crashes"), "{fatal}");
        assert!(matches!(pool.submit(99).await, Err(PoolError::Fatal { .. })));
    }

    struct Fails;

    #[async_trait]
    impl Handler<u32> for Fails {
        async fn handle(&self, _item: u32) -> Result<(), HandlerError> {
            Err(HandlerError::Fatal("disk gone".to_string()))
        }
    }

    #[tokio::test]
    async fn fatal_handler_error_halts_pool() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir, 8);
        let pool = WorkerPool::start("output", q.clone(), Arc::new(Fails), PoolBounds::new(2, 2), options(2));
        pool.submit(1).await.unwrap();
        pool.join().await;
        assert_eq!(pool.fatal_error().as_deref(), Some("disk gone"));
        assert_eq!(pool.live(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn target_stays_within_bounds(
            min in 1usize..5,
            extra in 0usize..5,
            steps in proptest::collection::vec(0usize..20, 1..20),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let dir = TempDir::new().unwrap();
                let q = queue(&dir, 4);
                let bounds = PoolBounds::new(min, min + extra);
                let pool = WorkerPool::start("p", q.clone(), Sleepy::new(Duration::ZERO), bounds, options(min));
                for step in steps {
                    let applied = pool.resize(step);
                    assert!(applied >= bounds.min && applied <= bounds.max);
                    tokio::task::yield_now().await;
                    assert!(pool.live() <= bounds.max);
                }
                q.close();
                pool.join().await;
            });
        }
    }
}
