use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

/// Round-trip samples between RTT-driven adjustments.
pub const RTT_ADJUST_EVERY: u32 = 50;
/// Multiplier applied to the average round trip when raising the timeout.
pub const RTT_TIMEOUT_MULTIPLIER: f64 = 6.5;

#[derive(Clone, Copy, Debug)]
pub struct TimeoutPolicy {
    pub initial: Duration,
    pub floor: Duration,
    pub ceiling: Duration,
    /// A pool wait longer than this counts as a slow wait.
    pub slow_wait: Duration,
    /// Slow waits needed before the timeout is raised one step.
    pub slow_waits_to_raise: u32,
    /// Outcomes per error-rate evaluation window.
    pub error_window: u32,
    pub error_rate_threshold: f64,
    pub raise_factor: f64,
    pub lower_factor: f64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            floor: Duration::from_secs(2),
            ceiling: Duration::from_secs(60),
            slow_wait: Duration::from_millis(500),
            slow_waits_to_raise: 5,
            error_window: 20,
            error_rate_threshold: 0.5,
            raise_factor: 1.5,
            lower_factor: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Success { rtt: Duration },
    TimedOut,
    Failed,
}

#[derive(Debug)]
struct State {
    current: Duration,
    slow_waits: u32,
    window_total: u32,
    window_errors: u32,
    rtt_ema_ms: Option<f64>,
    rtt_samples: u32,
    raised: u64,
    lowered: u64,
}

/// Read timeout that follows how the target behaves: slow pool waits push it
/// up, a burst of errors pulls it down.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    policy: TimeoutPolicy,
    state: Mutex<State>,
}

impl AdaptiveTimeout {
    pub fn new(policy: TimeoutPolicy) -> Self {
        let current = clamp(policy.initial, policy.floor, policy.ceiling);
        Self {
            policy,
            state: Mutex::new(State {
                current,
                slow_waits: 0,
                window_total: 0,
                window_errors: 0,
                rtt_ema_ms: None,
                rtt_samples: 0,
                raised: 0,
                lowered: 0,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn current(&self) -> Duration {
        self.with_state(|s| s.current)
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// (raised, lowered) adjustment counts.
    pub fn adjustments(&self) -> (u64, u64) {
        self.with_state(|s| (s.raised, s.lowered))
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.with_state(|s| s.rtt_ema_ms.map(|ms| Duration::from_secs_f64(ms / 1000.0)))
    }

    pub fn record_wait(&self, wait: Duration) {
        if wait <= self.policy.slow_wait {
            return;
        }
        let p = self.policy;
        self.with_state(|s| {
            s.slow_waits += 1;
            if s.slow_waits >= p.slow_waits_to_raise {
                s.slow_waits = 0;
                let next = clamp(s.current.mul_f64(p.raise_factor), p.floor, p.ceiling);
                if next > s.current {
                    info!(
                        from_ms = s.current.as_millis() as u64,
                        to_ms = next.as_millis() as u64,
                        "raising request timeout after slow pool waits"
                    );
                    s.current = next;
                    s.raised += 1;
                }
            }
        });
    }

    pub fn record_outcome(&self, outcome: ExchangeOutcome) {
        let p = self.policy;
        self.with_state(|s| {
            s.window_total += 1;
            match outcome {
                ExchangeOutcome::Success { rtt } => {
                    let ms = rtt.as_secs_f64() * 1000.0;
                    s.rtt_ema_ms = Some(match s.rtt_ema_ms {
                        Some(prev) => prev * 0.7 + ms * 0.3,
                        None => ms,
                    });
                    s.rtt_samples += 1;
                    if s.rtt_samples >= RTT_ADJUST_EVERY {
                        s.rtt_samples = 0;
                        if let Some(avg) = s.rtt_ema_ms {
                            let wanted = Duration::from_secs_f64(
                                avg * RTT_TIMEOUT_MULTIPLIER / 1000.0,
                            );
                            let next = clamp(wanted, p.floor, p.ceiling);
                            if next > s.current {
                                info!(
                                    from_ms = s.current.as_millis() as u64,
                                    to_ms = next.as_millis() as u64,
                                    avg_rtt_ms = avg as u64,
                                    "raising request timeout to follow round-trip time"
                                );
                                s.current = next;
                                s.raised += 1;
                            }
                        }
                    }
                }
                ExchangeOutcome::TimedOut | ExchangeOutcome::Failed => s.window_errors += 1,
            }

            if s.window_total >= p.error_window {
                let rate = f64::from(s.window_errors) / f64::from(s.window_total);
                if rate > p.error_rate_threshold {
                    let next = clamp(s.current.mul_f64(p.lower_factor), p.floor, p.ceiling);
                    if next < s.current {
                        info!(
                            from_ms = s.current.as_millis() as u64,
                            to_ms = next.as_millis() as u64,
                            error_rate = rate,
                            "lowering request timeout to fail fast"
                        );
                        s.current = next;
                        s.lowered += 1;
                    }
                }
                s.window_total = 0;
                s.window_errors = 0;
            }
        });
    }
}

fn clamp(value: Duration, floor: Duration, ceiling: Duration) -> Duration {
    if ceiling < floor {
        return floor;
    }
    value.max(floor).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TimeoutPolicy {
        TimeoutPolicy {
            initial: Duration::from_secs(4),
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(8),
            slow_wait: Duration::from_millis(100),
            slow_waits_to_raise: 2,
            error_window: 4,
            error_rate_threshold: 0.5,
            raise_factor: 1.5,
            lower_factor: 0.5,
        }
    }

    #[test]
    fn slow_waits_raise_up_to_ceiling() {
        let t = AdaptiveTimeout::new(policy());
        t.record_wait(Duration::from_millis(50));
        t.record_wait(Duration::from_millis(200));
        assert_eq!(t.current(), Duration::from_secs(4));
        t.record_wait(Duration::from_millis(200));
        assert_eq!(t.current(), Duration::from_secs(6));
        for _ in 0..10 {
            t.record_wait(Duration::from_secs(1));
        }
        assert_eq!(t.current(), Duration::from_secs(8));
    }

    #[test]
    fn error_bursts_lower_toward_floor() {
        let t = AdaptiveTimeout::new(policy());
        for _ in 0..4 {
            t.record_outcome(ExchangeOutcome::TimedOut);
        }
        assert_eq!(t.current(), Duration::from_secs(2));
        for _ in 0..8 {
            t.record_outcome(ExchangeOutcome::Failed);
        }
        assert_eq!(t.current(), Duration::from_secs(1));
        assert_eq!(t.adjustments().1, 2);
    }

    #[test]
    fn mostly_successful_window_keeps_timeout() {
        let t = AdaptiveTimeout::new(policy());
        t.record_outcome(ExchangeOutcome::Failed);
        for _ in 0..3 {
            t.record_outcome(ExchangeOutcome::Success {
                rtt: Duration::from_millis(10),
            });
        }
        assert_eq!(t.current(), Duration::from_secs(4));
    }

    #[test]
    fn slow_round_trips_raise_timeout() {
        let t = AdaptiveTimeout::new(policy());
        for _ in 0..RTT_ADJUST_EVERY {
            t.record_outcome(ExchangeOutcome::Success {
                rtt: Duration::from_millis(2000),
            });
        }
        // 2s * 6.5 clamps to the 8s ceiling
        assert_eq!(t.current(), Duration::from_secs(8));
        assert!(t.average_rtt().unwrap() >= Duration::from_millis(1999));
    }
}
