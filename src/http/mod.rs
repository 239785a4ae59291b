pub mod fetcher;
pub mod timeout;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::model::Authority;

pub use fetcher::{FetchError, Fetcher, FetcherConfig};
pub use timeout::{AdaptiveTimeout, ExchangeOutcome, TimeoutPolicy};
pub use transport::{ReqwestTransport, Transport, TransportError};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub max_requests_per_connection: u32,
    pub idle_timeout: Duration,
    pub timeout: TimeoutPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 50,
            max_requests_per_connection: 100,
            idle_timeout: Duration::from_secs(30),
            timeout: TimeoutPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("timed out after {waited:?} waiting for a connection to {authority}")]
    Timeout {
        authority: Authority,
        waited: Duration,
    },

    #[error("connection pool for {authority} is shut down")]
    Closed { authority: Authority },
}

/// A leased connection. Owned by exactly one worker until released.
#[derive(Debug)]
pub struct ConnectionSlot {
    id: u64,
    authority: Authority,
    requests_served: u32,
    waited: Duration,
    /// Transport-owned connection state, built lazily on first use.
    pub client: Option<reqwest::Client>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    /// Time spent in `acquire` before this slot became free.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

#[derive(Debug)]
struct IdleConnection {
    id: u64,
    requests_served: u32,
    client: Option<reqwest::Client>,
    idle_since: Instant,
}

#[derive(Debug)]
struct AuthorityPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub acquired: u64,
    pub waited: u64,
    pub wait_timeouts: u64,
    pub created: u64,
    pub reused: u64,
    pub destroyed: u64,
    pub retired: u64,
    pub expired: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    waited: AtomicU64,
    wait_timeouts: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    destroyed: AtomicU64,
    retired: AtomicU64,
    expired: AtomicU64,
}

/// Fixed-size set of reusable connections per target authority.
///
/// Each authority has its own semaphore and idle list, so a slow target
/// never serializes requests to another one.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    authorities: DashMap<Authority, Arc<AuthorityPool>>,
    timeout: AdaptiveTimeout,
    next_id: AtomicU64,
    counters: Counters,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let timeout = AdaptiveTimeout::new(config.timeout);
        Self {
            config,
            authorities: DashMap::new(),
            timeout,
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn authority_pool(&self, authority: &Authority) -> Arc<AuthorityPool> {
        if let Some(pool) = self.authorities.get(authority) {
            return pool.clone();
        }
        self.authorities
            .entry(authority.clone())
            .or_insert_with(|| {
                debug!(%authority, pool_size = self.config.pool_size, "creating connection pool");
                Arc::new(AuthorityPool {
                    permits: Arc::new(Semaphore::new(self.config.pool_size.max(1))),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    pub async fn acquire(
        &self,
        authority: &Authority,
        timeout: Duration,
    ) -> Result<ConnectionSlot, AcquireError> {
        let pool = self.authority_pool(authority);
        let started = Instant::now();

        let (permit, waited) = match pool.permits.clone().try_acquire_owned() {
            Ok(permit) => (permit, Duration::ZERO),
            Err(_) => {
                self.counters.waited.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(timeout, pool.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => {
                        let waited = started.elapsed();
                        self.timeout.record_wait(waited);
                        (permit, waited)
                    }
                    Ok(Err(_)) => {
                        return Err(AcquireError::Closed {
                            authority: authority.clone(),
                        })
                    }
                    Err(_) => {
                        let waited = started.elapsed();
                        self.counters.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                        self.timeout.record_wait(waited);
                        return Err(AcquireError::Timeout {
                            authority: authority.clone(),
                            waited,
                        });
                    }
                }
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);

        let reusable = {
            let mut idle = lock(&pool.idle);
            let before = idle.len();
            let idle_timeout = self.config.idle_timeout;
            idle.retain(|c| c.idle_since.elapsed() < idle_timeout);
            let expired = before - idle.len();
            if expired > 0 {
                self.counters
                    .expired
                    .fetch_add(expired as u64, Ordering::Relaxed);
            }
            idle.pop()
        };

        let slot = match reusable {
            Some(conn) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                ConnectionSlot {
                    id: conn.id,
                    authority: authority.clone(),
                    requests_served: conn.requests_served,
                    waited,
                    client: conn.client,
                    _permit: permit,
                }
            }
            None => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                ConnectionSlot {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    authority: authority.clone(),
                    requests_served: 0,
                    waited,
                    client: None,
                    _permit: permit,
                }
            }
        };
        trace!(%authority, slot = slot.id, waited_ms = waited.as_millis() as u64, "leased connection");
        Ok(slot)
    }

    /// Returns a slot. Failed slots are destroyed; clean ones are reused until
    /// they reach the per-connection request limit.
    pub fn release(&self, slot: ConnectionSlot, outcome: ExchangeOutcome) {
        self.timeout.record_outcome(outcome);
        let ConnectionSlot {
            id,
            authority,
            requests_served,
            client,
            _permit,
            ..
        } = slot;

        if !matches!(outcome, ExchangeOutcome::Success { .. }) {
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            debug!(%authority, slot = id, ?outcome, "destroying failed connection");
            return;
        }

        let served = requests_served.saturating_add(1);
        if served >= self.config.max_requests_per_connection {
            self.counters.retired.fetch_add(1, Ordering::Relaxed);
            trace!(%authority, slot = id, served, "retiring connection");
            return;
        }

        if let Some(pool) = self.authorities.get(&authority).map(|p| p.clone()) {
            lock(&pool.idle).push(IdleConnection {
                id,
                requests_served: served,
                client,
                idle_since: Instant::now(),
            });
        }
        // permit drops here, after the connection is back on the idle list
        drop(_permit);
    }

    pub fn current_timeout(&self) -> Duration {
        self.timeout.current()
    }

    pub fn adaptive_timeout(&self) -> &AdaptiveTimeout {
        &self.timeout
    }

    pub fn idle_connections(&self, authority: &Authority) -> usize {
        self.authorities
            .get(authority)
            .map(|p| lock(&p.idle).len())
            .unwrap_or(0)
    }

    pub fn available_permits(&self, authority: &Authority) -> usize {
        self.authorities
            .get(authority)
            .map(|p| p.permits.available_permits())
            .unwrap_or(self.config.pool_size)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            acquired: c.acquired.load(Ordering::Relaxed),
            waited: c.waited.load(Ordering::Relaxed),
            wait_timeouts: c.wait_timeouts.load(Ordering::Relaxed),
            created: c.created.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            destroyed: c.destroyed.load(Ordering::Relaxed),
            retired: c.retired.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn authority() -> Authority {
        Authority {
            scheme: "http".to_string(),
            host: "example.com".to_string(),
            port: 80,
        }
    }

    fn ok() -> ExchangeOutcome {
        ExchangeOutcome::Success {
            rtt: Duration::from_millis(5),
        }
    }

    fn pool(size: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(PoolConfig {
            pool_size: size,
            max_requests_per_connection: 3,
            ..PoolConfig::default()
        }))
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let pool = pool(1);
        let first = pool.acquire(&authority(), Duration::from_secs(5)).await.unwrap();
        assert!(first.waited().is_zero());

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(&authority(), Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(first, ok());
        let second = waiter.await.unwrap().unwrap();
        assert!(second.waited() > Duration::ZERO);
        assert_eq!(pool.stats().waited, 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let pool = pool(1);
        let _held = pool.acquire(&authority(), Duration::from_secs(1)).await.unwrap();
        let err = pool
            .acquire(&authority(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Timeout { .. }));
        assert_eq!(pool.stats().wait_timeouts, 1);
    }

    #[tokio::test]
    async fn failed_slot_is_destroyed() {
        let pool = pool(2);
        let slot = pool.acquire(&authority(), Duration::from_secs(1)).await.unwrap();
        let id = slot.id();
        pool.release(slot, ExchangeOutcome::Failed);
        assert_eq!(pool.idle_connections(&authority()), 0);
        let next = pool.acquire(&authority(), Duration::from_secs(1)).await.unwrap();
        assert_ne!(next.id(), id);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn clean_slot_is_reused_until_request_limit() {
        let pool = pool(1);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let slot = pool.acquire(&authority(), Duration::from_secs(1)).await.unwrap();
            ids.push(slot.id());
            pool.release(slot, ok());
        }
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[1], ids[2]);
        assert_ne!(ids[2], ids[3]);
        assert_eq!(pool.stats().retired, 1);
    }

    #[tokio::test]
    async fn authorities_do_not_share_slots() {
        let pool = pool(1);
        let other = Authority {
            host: "other.test".to_string(),
            ..authority()
        };
        let _a = pool.acquire(&authority(), Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(&other, Duration::from_millis(50)).await;
        assert!(b.is_ok());
        assert_eq!(pool.available_permits(&authority()), 0);
    }

    #[tokio::test]
    async fn never_more_slots_than_pool_size() {
        let pool = pool(3);
        let mut handles = Vec::new();
        let live = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..12 {
            let pool = pool.clone();
            let live = live.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let slot = pool.acquire(&authority(), Duration::from_secs(5)).await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                pool.release(slot, ok());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.idle_connections(&authority()) <= 3);
    }
}
