use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use distance::sift3;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()))
    }
}

/// Runs `operation` until it succeeds, fails with an error `retryable`
/// rejects, or the attempt budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let backoff = policy.backoff(attempt);
                debug!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Similarity in [0, 1] derived from the sift3 edit distance.
pub fn body_similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let d = f64::from(sift3(a, b));
    (1.0 - d / longest as f64).clamp(0.0, 1.0)
}

pub fn parse_csv_list(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in value.split(',') {
        let item = part.trim();
        if item.is_empty() || out.iter().any(|o| o == item) {
            continue;
        }
        out.push(item.to_string());
    }
    out
}

/// Parses `Name: value` header lines separated by `;` or newlines.
pub fn parse_header_lines(value: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for line in value.split(|c| c == ';' || c == '\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, val) = line
            .split_once(':')
            .ok_or_else(|| format!("invalid header '{line}', expected 'Name: value'"))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(format!("invalid header name in '{line}'"));
        }
        out.push((name.to_string(), val.trim().to_string()));
    }
    Ok(out)
}

pub fn parse_range_usize(value: &str) -> Result<(usize, usize), String> {
    let (lo, hi) = value
        .trim()
        .split_once('-')
        .ok_or_else(|| "expected format MIN-MAX".to_string())?;
    let lo: usize = lo.trim().parse().map_err(|_| "invalid MIN value".to_string())?;
    let hi: usize = hi.trim().parse().map_err(|_| "invalid MAX value".to_string())?;
    if lo > hi {
        return Err("MIN must not exceed MAX".to_string());
    }
    Ok((lo, hi))
}

pub fn hash_one<T: Hash + ?Sized>(value: &T, seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Fixed-size probabilistic set. Never reports a seen key as unseen; may
/// report an unseen key as seen once heavily loaded.
#[derive(Debug)]
pub struct SeenFilter {
    words: Vec<AtomicU64>,
    bits: u64,
    hashes: u32,
}

impl SeenFilter {
    pub fn with_bits(bits: usize, hashes: u32) -> Self {
        let words = bits.max(64).div_ceil(64);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits: (words * 64) as u64,
            hashes: hashes.max(1),
        }
    }

    fn positions<T: Hash + ?Sized>(&self, key: &T) -> impl Iterator<Item = (usize, u64)> + '_ {
        let h1 = hash_one(key, 0x9e37_79b9_7f4a_7c15);
        let h2 = hash_one(key, 0xc2b2_ae3d_27d4_eb4f) | 1;
        (0..u64::from(self.hashes)).map(move |i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.bits;
            ((bit / 64) as usize, 1u64 << (bit % 64))
        })
    }

    pub fn contains<T: Hash + ?Sized>(&self, key: &T) -> bool {
        self.positions(key)
            .all(|(w, mask)| self.words[w].load(Ordering::Relaxed) & mask != 0)
    }

    /// Returns true when the key was not already present.
    pub fn insert<T: Hash + ?Sized>(&self, key: &T) -> bool {
        let mut fresh = false;
        for (w, mask) in self.positions(key) {
            let prev = self.words[w].fetch_or(mask, Ordering::Relaxed);
            if prev & mask == 0 {
                fresh = true;
            }
        }
        fresh
    }
}
