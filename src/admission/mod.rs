use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use crate::model::FetchResult;
use crate::utils::{hash_one, SeenFilter};

/// Headers that differ between otherwise identical responses.
const VOLATILE_HEADERS: &[&str] = &[
    "date",
    "expires",
    "last-modified",
    "etag",
    "set-cookie",
    "content-length",
    "age",
    "x-request-id",
    "x-runtime",
    "x-amz-request-id",
    "cf-ray",
];

const STATS_EVERY: u64 = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdmissionReason {
    Accept,
    LoadShed,
    SeenUrl,
    SeenBody,
    OutOfScope,
}

impl AdmissionReason {
    pub const ALL: [AdmissionReason; 5] = [
        AdmissionReason::Accept,
        AdmissionReason::LoadShed,
        AdmissionReason::SeenUrl,
        AdmissionReason::SeenBody,
        AdmissionReason::OutOfScope,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionReason::Accept => "accept",
            AdmissionReason::LoadShed => "reject-load-shed",
            AdmissionReason::SeenUrl => "reject-seen-url",
            AdmissionReason::SeenBody => "reject-seen-body",
            AdmissionReason::OutOfScope => "reject-out-of-scope",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub admitted: bool,
    pub reason: AdmissionReason,
}

impl AdmissionDecision {
    fn new(reason: AdmissionReason) -> Self {
        Self {
            admitted: reason == AdmissionReason::Accept,
            reason,
        }
    }
}

/// Load signal the decision is based on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineLoad {
    pub grep_depth: usize,
}

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub low_watermark: usize,
    pub high_watermark: usize,
    /// Hosts whose exchanges may be grepped. Empty admits every host.
    pub scope: Vec<String>,
    pub dedupe: bool,
    pub seen_filter_bits: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            low_watermark: 500,
            high_watermark: 2000,
            scope: Vec::new(),
            dedupe: true,
            seen_filter_bits: 1 << 22,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub accepted: u64,
    pub load_shed: u64,
    pub seen_url: u64,
    pub seen_body: u64,
    pub out_of_scope: u64,
}

impl AdmissionStats {
    pub fn rejected(&self) -> u64 {
        self.load_shed + self.seen_url + self.seen_body + self.out_of_scope
    }

    pub fn count(&self, reason: AdmissionReason) -> u64 {
        match reason {
            AdmissionReason::Accept => self.accepted,
            AdmissionReason::LoadShed => self.load_shed,
            AdmissionReason::SeenUrl => self.seen_url,
            AdmissionReason::SeenBody => self.seen_body,
            AdmissionReason::OutOfScope => self.out_of_scope,
        }
    }
}

/// Decides which exchanges reach the grep stage.
///
/// Filters run in order: scope, seen URL, seen body, then load shedding.
/// Shedding is a pure function of the result id and the grep depth, so a
/// replayed load trace yields the same decisions.
pub struct AdmissionController {
    config: AdmissionConfig,
    scope: HashSet<String>,
    seen_urls: SeenFilter,
    seen_bodies: SeenFilter,
    counts: [AtomicU64; 5],
    decisions: AtomicU64,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let scope = config
            .scope
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            seen_urls: SeenFilter::with_bits(config.seen_filter_bits, 4),
            seen_bodies: SeenFilter::with_bits(config.seen_filter_bits, 4),
            scope,
            config,
            counts: Default::default(),
            decisions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Percentage of results admitted at `depth`, in [0, 100].
    pub fn admit_percent(&self, depth: usize) -> u64 {
        let (low, high) = (self.config.low_watermark, self.config.high_watermark);
        if depth < low {
            return 100;
        }
        if depth >= high {
            return 0;
        }
        ((high - depth) as u64 * 100) / (high - low) as u64
    }

    fn sheds(&self, result: &FetchResult, load: PipelineLoad) -> bool {
        result.id % 100 >= self.admit_percent(load.grep_depth)
    }

    pub fn admit(&self, result: &FetchResult, load: PipelineLoad) -> AdmissionDecision {
        let reason = self.decide(result, load);
        self.counts[reason.index()].fetch_add(1, Ordering::Relaxed);
        let n = self.decisions.fetch_add(1, Ordering::Relaxed) + 1;
        if n % STATS_EVERY == 0 {
            let stats = self.stats();
            info!(
                accepted = stats.accepted,
                load_shed = stats.load_shed,
                seen_url = stats.seen_url,
                seen_body = stats.seen_body,
                out_of_scope = stats.out_of_scope,
                grep_depth = load.grep_depth,
                "grep admission"
            );
        }
        debug!(id = result.id, url = %result.request.url, reason = %reason, "admission decision");
        AdmissionDecision::new(reason)
    }

    fn decide(&self, result: &FetchResult, load: PipelineLoad) -> AdmissionReason {
        if !self.in_scope(result) {
            return AdmissionReason::OutOfScope;
        }
        let url_key = self.config.dedupe.then(|| result.request.dedup_key());
        if let Some(key) = url_key.as_ref() {
            if self.seen_urls.contains(key) {
                return AdmissionReason::SeenUrl;
            }
        }
        let body_key = self.config.dedupe.then(|| body_hash(result));
        if let Some(key) = body_key {
            if self.seen_bodies.contains(&key) {
                return AdmissionReason::SeenBody;
            }
        }
        if self.sheds(result, load) {
            return AdmissionReason::LoadShed;
        }
        if let Some(key) = url_key {
            self.seen_urls.insert(&key);
        }
        if let Some(key) = body_key {
            self.seen_bodies.insert(&key);
        }
        AdmissionReason::Accept
    }

    fn in_scope(&self, result: &FetchResult) -> bool {
        if self.scope.is_empty() {
            return true;
        }
        match result.request.host() {
            Some(host) => self.scope.contains(&host),
            None => false,
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let c = |r: AdmissionReason| self.counts[r.index()].load(Ordering::Relaxed);
        AdmissionStats {
            accepted: c(AdmissionReason::Accept),
            load_shed: c(AdmissionReason::LoadShed),
            seen_url: c(AdmissionReason::SeenUrl),
            seen_body: c(AdmissionReason::SeenBody),
            out_of_scope: c(AdmissionReason::OutOfScope),
        }
    }
}

/// Hash of status, stable headers and body.
fn body_hash(result: &FetchResult) -> u64 {
    let mut headers: Vec<(String, &str)> = result
        .response
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .filter(|(k, _)| !VOLATILE_HEADERS.contains(&k.as_str()))
        .collect();
    headers.sort();
    hash_one(&(result.response.status, headers, &result.response.body), 0)
}
