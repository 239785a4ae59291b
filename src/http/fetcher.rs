use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use super::{AcquireError, ConnectionPool, ExchangeOutcome, Transport, TransportError};
use crate::errors::ErrorClass;
use crate::model::{FetchRequest, FetchResponse, FetchResult};
use crate::utils::{self, RetryPolicy};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no target authority in URL: {url}")]
    NoAuthority { url: String },
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Acquire(AcquireError::Timeout { .. }) => ErrorClass::ResourceExhaustion,
            _ => ErrorClass::ItemLocal,
        }
    }
}

/// Receives every exchange fetched for the scan (probes excluded).
///
/// `fetch` returns only after the observer is done, so work it queues is
/// visible before the caller acknowledges its own item.
#[async_trait]
pub trait ExchangeObserver: Send + Sync {
    async fn on_exchange(&self, result: &FetchResult);
}

#[derive(Clone, Debug)]
pub struct FetcherConfig {
    /// Requests per second across all targets. Zero disables limiting.
    pub rate: u32,
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            rate: 0,
            acquire_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub requests: u64,
    pub probes: u64,
    pub failures: u64,
    pub retries_exhausted: u64,
}

pub struct Fetcher {
    pool: Arc<ConnectionPool>,
    transport: Arc<dyn Transport>,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: FetcherConfig,
    observer: OnceLock<Arc<dyn ExchangeObserver>>,
    next_id: AtomicU64,
    requests: AtomicU64,
    probes: AtomicU64,
    failures: AtomicU64,
    retries_exhausted: AtomicU64,
}

impl Fetcher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        transport: Arc<dyn Transport>,
        config: FetcherConfig,
    ) -> Self {
        let limiter = NonZeroU32::new(config.rate).map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        Self {
            pool,
            transport,
            limiter,
            config,
            observer: OnceLock::new(),
            next_id: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            probes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Installs the exchange observer. Only the first call has an effect.
    pub fn set_observer(&self, observer: Arc<dyn ExchangeObserver>) -> bool {
        self.observer.set(observer).is_ok()
    }

    /// Fetches `request` and reports the exchange to the observer.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResult, FetchError> {
        let result = self.fetch_quiet(request).await?;
        if let Some(observer) = self.observer.get() {
            observer.on_exchange(&result).await;
        }
        Ok(result)
    }

    /// Fetches without notifying the observer; used for not-found probes.
    pub async fn probe(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        self.fetch_quiet(request).await.map(|r| r.response)
    }

    async fn fetch_quiet(&self, request: FetchRequest) -> Result<FetchResult, FetchError> {
        let outcome = utils::retry_with_backoff(
            &self.config.retry,
            "fetch",
            || self.fetch_once(&request),
            |e: &FetchError| e.class().is_retryable(),
        )
        .await;
        match outcome {
            Ok((response, elapsed)) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Ok(FetchResult::new(id, request, response, elapsed))
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if e.class().is_retryable() {
                    self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
                }
                debug!(url = %request.url, error = %e, "fetch failed");
                Err(e)
            }
        }
    }

    async fn fetch_once(
        &self,
        request: &FetchRequest,
    ) -> Result<(FetchResponse, Duration), FetchError> {
        let authority = request.authority().ok_or_else(|| FetchError::NoAuthority {
            url: request.url.clone(),
        })?;
        if let Some(limiter) = self.limiter.as_ref() {
            limiter.until_ready().await;
        }

        let mut slot = self
            .pool
            .acquire(&authority, self.config.acquire_timeout)
            .await?;
        let timeout = self.pool.current_timeout();
        let started = Instant::now();
        self.requests.fetch_add(1, Ordering::Relaxed);
        let result = self.transport.send(request, &mut slot, timeout).await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                self.pool
                    .release(slot, ExchangeOutcome::Success { rtt: elapsed });
                Ok((response, elapsed))
            }
            Err(e) => {
                let outcome = if e.is_timeout() {
                    ExchangeOutcome::TimedOut
                } else {
                    ExchangeOutcome::Failed
                };
                self.pool.release(slot, outcome);
                Err(e.into())
            }
        }
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            requests: self.requests.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::http::{ConnectionSlot, PoolConfig};

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn send(
            &self,
            request: &FetchRequest,
            _slot: &mut ConnectionSlot,
            _timeout: Duration,
        ) -> Result<FetchResponse, TransportError> {
            if request.url.contains("broken") {
                return Err(TransportError::Connect {
                    url: request.url.clone(),
                    message: "reset".to_string(),
                });
            }
            Ok(FetchResponse::new(200, request.url.clone()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u64>>);

    #[async_trait]
    impl ExchangeObserver for Recorder {
        async fn on_exchange(&self, result: &FetchResult) {
            self.0.lock().unwrap().push(result.id);
        }
    }

    fn fetcher() -> Fetcher {
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            pool_size: 2,
            ..PoolConfig::default()
        }));
        Fetcher::new(pool, Arc::new(Echo), FetcherConfig::default())
    }

    #[tokio::test]
    async fn fetch_assigns_ids_and_notifies_observer() {
        let f = fetcher();
        let rec = Arc::new(Recorder::default());
        assert!(f.set_observer(rec.clone()));
        let a = f.fetch(FetchRequest::get("http://t.test/a").unwrap()).await.unwrap();
        let b = f.fetch(FetchRequest::get("http://t.test/b").unwrap()).await.unwrap();
        assert_eq!((a.id, b.id), (0, 1));
        assert_eq!(b.response.body, "http://t.test/b");
        f.probe(FetchRequest::get("http://t.test/c").unwrap()).await.unwrap();
        assert_eq!(*rec.0.lock().unwrap(), vec![0, 1]);
        assert_eq!(f.stats().requests, 3);
        assert_eq!(f.stats().probes, 1);
    }

    #[tokio::test]
    async fn transport_errors_are_item_local_and_destroy_slot() {
        let f = fetcher();
        let err = f
            .fetch(FetchRequest::get("http://t.test/broken").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ItemLocal);
        assert_eq!(f.stats().failures, 1);
        assert_eq!(f.stats().requests, 1);
        assert_eq!(f.pool().stats().destroyed, 1);
    }
}
