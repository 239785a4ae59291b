mod shape;

pub use shape::{clean_body, mutate_filename, probe_url, url_shape};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{FetchError, Fetcher};
use crate::model::{FetchRequest, FetchResponse};
use crate::utils::body_similarity;

/// Bodies at least this similar (after cleaning) are considered equal.
pub const IS_EQUAL_RATIO: f64 = 0.90;

/// Seeds tried before giving up on producing a probe distinct from the input.
const MAX_PROBE_SEEDS: u64 = 25;

/// Sends the probe requests the cache needs.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn probe(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

#[async_trait]
impl ProbeClient for Fetcher {
    async fn probe(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        Fetcher::probe(self, request).await
    }
}

#[derive(Clone, Debug)]
pub struct NotFoundConfig {
    /// Agreeing probes required before a fingerprint is frozen.
    pub confirmations: usize,
    pub similarity: f64,
    /// Failed learning attempts before a shape is left unresolved for good.
    pub max_learn_attempts: u32,
}

impl Default for NotFoundConfig {
    fn default() -> Self {
        Self {
            confirmations: 2,
            similarity: IS_EQUAL_RATIO,
            max_learn_attempts: 3,
        }
    }
}

/// What a missing resource of one shape looks like.
#[derive(Clone, Debug, PartialEq)]
pub struct NotFoundFingerprint {
    pub status: u16,
    /// Cleaned body of the first probe.
    pub body: String,
    pub confirmations: usize,
}

impl NotFoundFingerprint {
    /// Deterministic in (fingerprint, url, response).
    fn matches(&self, url: &Url, response: &FetchResponse, similarity: f64) -> bool {
        if self.status == 404 {
            return response.status == 404;
        }
        if response.status != self.status {
            return false;
        }
        let cleaned = clean_body(&response.body, url);
        body_similarity(&cleaned, &self.body) >= similarity
    }
}

#[derive(Clone, Debug)]
enum ShapeState {
    Unknown { failed_attempts: u32 },
    Frozen(NotFoundFingerprint),
    /// Probes disagreed with each other or kept failing.
    Unresolvable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NotFoundStats {
    pub hits: u64,
    pub misses: u64,
    pub probes: u64,
    pub probe_failures: u64,
    pub invalidations: u64,
    pub shapes: u64,
}

impl NotFoundStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-shape cache of learned "not found" fingerprints.
///
/// The first query for a shape holds that shape's lock while probing, so
/// concurrent queries for the same shape wait for a single probe set.
/// Different shapes never block each other.
pub struct NotFoundCache {
    client: Arc<dyn ProbeClient>,
    config: NotFoundConfig,
    shapes: DashMap<String, Arc<Mutex<ShapeState>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    probes: AtomicU64,
    probe_failures: AtomicU64,
    invalidations: AtomicU64,
}

impl NotFoundCache {
    pub fn new(client: Arc<dyn ProbeClient>, config: NotFoundConfig) -> Self {
        Self {
            client,
            config,
            shapes: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            probes: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub async fn is_not_found(&self, url: &str, response: &FetchResponse) -> bool {
        self.is_not_found_with_hint(url, response, false).await
    }

    /// Like [`is_not_found`](Self::is_not_found), with a hint that the
    /// resource should exist (e.g. it was linked from another page). A
    /// positive verdict under the hint is re-verified with a fresh probe.
    pub async fn is_not_found_with_hint(
        &self,
        url: &str,
        response: &FetchResponse,
        should_exist: bool,
    ) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(key) = url_shape(&parsed) else {
            return false;
        };

        let entry = self
            .shapes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ShapeState::Unknown { failed_attempts: 0 })))
            .clone();
        let mut state = entry.lock().await;

        let fingerprint = match &*state {
            ShapeState::Frozen(fp) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                fp.clone()
            }
            ShapeState::Unresolvable => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            ShapeState::Unknown { failed_attempts } => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let failed_attempts = *failed_attempts;
                match self.learn(&parsed).await {
                    Learned::Frozen(fp) => {
                        info!(shape = %key, status = fp.status, "not-found fingerprint frozen");
                        *state = ShapeState::Frozen(fp.clone());
                        fp
                    }
                    Learned::Disagree => {
                        warn!(shape = %key, "not-found probes disagree, shape left unresolved");
                        *state = ShapeState::Unresolvable;
                        return false;
                    }
                    Learned::Failed => {
                        let failed_attempts = failed_attempts + 1;
                        *state = if failed_attempts >= self.config.max_learn_attempts {
                            ShapeState::Unresolvable
                        } else {
                            ShapeState::Unknown { failed_attempts }
                        };
                        return false;
                    }
                }
            }
        };

        let verdict = fingerprint.matches(&parsed, response, self.config.similarity);
        if !(verdict && should_exist) {
            return verdict;
        }

        // linked resource looks missing: confirm against a fresh probe
        match self.send_probe(&parsed, self.probes.load(Ordering::Relaxed)).await {
            Some((probe, probe_resp)) => {
                if !fingerprint.matches(&probe, &probe_resp, self.config.similarity) {
                    debug!(shape = %key, "not-found fingerprint contradicted, invalidating");
                    self.invalidations.fetch_add(1, Ordering::Relaxed);
                    *state = ShapeState::Unknown { failed_attempts: 0 };
                    return false;
                }
                response.status == probe_resp.status
                    && body_similarity(
                        &clean_body(&response.body, &parsed),
                        &clean_body(&probe_resp.body, &probe),
                    ) >= self.config.similarity
            }
            None => false,
        }
    }

    async fn learn(&self, url: &Url) -> Learned {
        let mut samples: Vec<(Url, FetchResponse)> = Vec::new();
        let mut seed = 0;
        while samples.len() < self.config.confirmations.max(1) {
            match self.send_probe(url, seed).await {
                Some(sample) => samples.push(sample),
                None => return Learned::Failed,
            }
            seed += 1;
        }

        let (first_url, first) = &samples[0];
        let reference = clean_body(&first.body, first_url);
        let agree = samples[1..].iter().all(|(u, r)| {
            r.status == first.status
                && (first.status == 404
                    || body_similarity(&clean_body(&r.body, u), &reference)
                        >= self.config.similarity)
        });
        if !agree {
            return Learned::Disagree;
        }
        Learned::Frozen(NotFoundFingerprint {
            status: first.status,
            body: reference,
            confirmations: samples.len(),
        })
    }

    /// Fetches a probe URL derived from `url`, skipping seeds that would
    /// request `url` itself.
    async fn send_probe(&self, url: &Url, start_seed: u64) -> Option<(Url, FetchResponse)> {
        let probe = (start_seed..start_seed + MAX_PROBE_SEEDS)
            .filter_map(|seed| probe_url(url, hash_seed(url, seed)))
            .find(|p| p.path() != url.path())?;
        let request = FetchRequest::get(probe.as_str()).ok()?;
        self.probes.fetch_add(1, Ordering::Relaxed);
        match self.client.probe(request).await {
            Ok(response) => Some((probe, response)),
            Err(e) => {
                self.probe_failures.fetch_add(1, Ordering::Relaxed);
                debug!(probe = %probe, error = %e, "not-found probe failed");
                None
            }
        }
    }

    pub fn fingerprint(&self, url: &str) -> Option<NotFoundFingerprint> {
        let key = url_shape(&Url::parse(url).ok()?)?;
        let entry = self.shapes.get(&key)?.clone();
        let state = entry.try_lock().ok()?;
        match &*state {
            ShapeState::Frozen(fp) => Some(fp.clone()),
            _ => None,
        }
    }

    pub fn stats(&self) -> NotFoundStats {
        NotFoundStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            shapes: self.shapes.len() as u64,
        }
    }
}

enum Learned {
    Frozen(NotFoundFingerprint),
    Disagree,
    Failed,
}

fn hash_seed(url: &Url, seed: u64) -> u64 {
    crate::utils::hash_one(url.path(), seed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::http::TransportError;

    /// Serves a soft-404 page for every path not listed in `existing`.
    struct FakeSite {
        existing: Vec<&'static str>,
        probes: AtomicU64,
        fail: AtomicBool,
        soft_status: u16,
        random_bodies: bool,
        delay: Duration,
    }

    impl FakeSite {
        fn new(existing: Vec<&'static str>) -> Self {
            Self {
                existing,
                probes: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                soft_status: 200,
                random_bodies: false,
                delay: Duration::ZERO,
            }
        }

        fn page(&self, url: &str) -> FetchResponse {
            let path = Url::parse(url).unwrap().path().to_string();
            if self.existing.contains(&path.as_str()) {
                return FetchResponse::new(200, format!("<html>real content for {path} with a long body</html>"));
            }
            if self.random_bodies {
                let n = self.probes.load(Ordering::SeqCst);
                return FetchResponse::new(self.soft_status, "x".repeat(10 + 40 * n as usize));
            }
            FetchResponse::new(
                self.soft_status,
                format!("<html><h1>Oops</h1><p>We could not find {path} on this server.</p></html>"),
            )
        }
    }

    #[async_trait]
    impl ProbeClient for FakeSite {
        async fn probe(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Transport(TransportError::Connect {
                    url: request.url,
                    message: "refused".to_string(),
                }));
            }
            Ok(self.page(&request.url))
        }
    }

    fn cache(site: Arc<FakeSite>) -> NotFoundCache {
        NotFoundCache::new(site, NotFoundConfig::default())
    }

    #[tokio::test]
    async fn learns_soft_404_and_answers_from_cache() {
        let site = Arc::new(FakeSite::new(vec!["/app/login.php"]));
        let c = cache(site.clone());

        let missing = site.page("http://t.test/app/nothere.php");
        assert!(c.is_not_found("http://t.test/app/nothere.php", &missing).await);
        assert_eq!(site.probes.load(Ordering::SeqCst), 2);

        let real = site.page("http://t.test/app/login.php");
        assert!(!c.is_not_found("http://t.test/app/login.php", &real).await);
        assert_eq!(site.probes.load(Ordering::SeqCst), 2, "frozen shape sends no probes");

        let stats = c.stats();
        assert_eq!((stats.hits, stats.misses, stats.shapes), (1, 1, 1));
        assert!(c.fingerprint("http://t.test/app/other.php").is_some());
    }

    #[tokio::test]
    async fn real_404_status_is_compared_by_status() {
        let mut site = FakeSite::new(vec!["/index.html"]);
        site.soft_status = 404;
        let site = Arc::new(site);
        let c = cache(site.clone());
        let missing = FetchResponse::new(404, "totally different body");
        assert!(c.is_not_found("http://t.test/foo.html", &missing).await);
        let real = site.page("http://t.test/index.html");
        assert!(!c.is_not_found("http://t.test/index.html", &real).await);
    }

    #[tokio::test]
    async fn probe_failure_leaves_shape_unresolved() {
        let site = Arc::new(FakeSite::new(vec![]));
        site.fail.store(true, Ordering::SeqCst);
        let c = cache(site.clone());
        let resp = site.page("http://t.test/x/a.jsp");
        for _ in 0..5 {
            assert!(!c.is_not_found("http://t.test/x/a.jsp", &resp).await);
        }
        // three attempts, then the shape is given up on
        assert_eq!(site.probes.load(Ordering::SeqCst), 3);
        assert_eq!(c.stats().probe_failures, 3);
        assert!(c.fingerprint("http://t.test/x/a.jsp").is_none());
    }

    #[tokio::test]
    async fn disagreeing_probes_do_not_freeze() {
        let mut site = FakeSite::new(vec![]);
        site.random_bodies = true;
        let site = Arc::new(site);
        let c = cache(site.clone());
        let resp = FetchResponse::new(200, "whatever");
        assert!(!c.is_not_found("http://t.test/r/a.php", &resp).await);
        assert!(!c.is_not_found("http://t.test/r/b.php", &resp).await);
        assert_eq!(site.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_first_queries_share_one_probe_set() {
        let mut site = FakeSite::new(vec![]);
        site.delay = Duration::from_millis(20);
        let site = Arc::new(site);
        let c = Arc::new(cache(site.clone()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let c = c.clone();
            let site = site.clone();
            handles.push(tokio::spawn(async move {
                let url = format!("http://t.test/d/file{i}.asp");
                let resp = site.page(&url);
                c.is_not_found(&url, &resp).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        assert_eq!(site.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn linked_hint_reverifies_and_invalidates_stale_fingerprint() {
        let site = Arc::new(FakeSite::new(vec![]));
        let c = cache(site.clone());
        let url = "http://t.test/s/gone.php";
        let resp = site.page(url);
        assert!(c.is_not_found(url, &resp).await);

        // still consistent: hint costs one probe and keeps the fingerprint
        assert!(c.is_not_found_with_hint(url, &resp, true).await);
        assert_eq!(site.probes.load(Ordering::SeqCst), 3);
        assert_eq!(c.stats().invalidations, 0);

        // target changed: the probe now gets a server error
        let stale = NotFoundCache::new(
            Arc::new(FakeSite {
                soft_status: 500,
                ..FakeSite::new(vec![])
            }),
            NotFoundConfig::default(),
        );
        let fp = c.fingerprint(url).unwrap();
        stale.shapes.insert(
            url_shape(&Url::parse(url).unwrap()).unwrap(),
            Arc::new(Mutex::new(ShapeState::Frozen(fp))),
        );
        assert!(!stale.is_not_found_with_hint(url, &resp, true).await);
        assert_eq!(stale.stats().invalidations, 1);
        assert!(stale.fingerprint(url).is_none());
    }
}
