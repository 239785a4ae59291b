use std::collections::VecDeque;

use super::{PoolBounds, PoolSample};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeAction {
    Grow,
    Shrink,
}

#[derive(Clone, Debug)]
pub struct ResizeConfig {
    /// Samples averaged into the idle fraction.
    pub window: usize,
    pub shrink_idle_fraction: f64,
    pub grow_idle_fraction: f64,
    /// Consecutive over-idle samples before shrinking.
    pub shrink_after: u32,
    pub high_watermark: usize,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            window: 5,
            shrink_idle_fraction: 0.7,
            grow_idle_fraction: 0.1,
            shrink_after: 3,
            high_watermark: 100,
        }
    }
}

/// Hysteresis between idle-worker ratio and queue depth, one step at a time.
#[derive(Clone, Debug)]
pub struct ResizePolicy {
    config: ResizeConfig,
    history: VecDeque<f64>,
    over_idle: u32,
}

impl ResizePolicy {
    pub fn new(config: ResizeConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.window.max(1)),
            config,
            over_idle: 0,
        }
    }

    pub fn idle_fraction(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }

    pub fn observe(&mut self, sample: &PoolSample, bounds: PoolBounds) -> Option<ResizeAction> {
        let fraction = sample.idle as f64 / sample.live.max(1) as f64;
        if self.history.len() == self.config.window.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(fraction.clamp(0.0, 1.0));
        let idle = self.idle_fraction();

        if idle > self.config.shrink_idle_fraction {
            self.over_idle += 1;
        } else {
            self.over_idle = 0;
        }

        if self.over_idle >= self.config.shrink_after && sample.target > bounds.min {
            self.over_idle = 0;
            self.history.clear();
            return Some(ResizeAction::Shrink);
        }
        if idle < self.config.grow_idle_fraction
            && sample.depth > self.config.high_watermark
            && sample.target < bounds.max
        {
            self.history.clear();
            return Some(ResizeAction::Grow);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(target: usize, idle: usize, depth: usize) -> PoolSample {
        PoolSample {
            target,
            live: target,
            idle,
            busy: target - idle,
            depth,
        }
    }

    const BOUNDS: PoolBounds = PoolBounds { min: 1, max: 8 };

    #[test]
    fn shrinks_only_after_consecutive_idle_samples() {
        let mut p = ResizePolicy::new(ResizeConfig::default());
        assert_eq!(p.observe(&sample(4, 4, 0), BOUNDS), None);
        assert_eq!(p.observe(&sample(4, 4, 0), BOUNDS), None);
        assert_eq!(p.observe(&sample(4, 4, 0), BOUNDS), Some(ResizeAction::Shrink));
        // history restarts after an action
        assert_eq!(p.observe(&sample(3, 3, 0), BOUNDS), None);
    }

    #[test]
    fn busy_sample_resets_shrink_streak() {
        let mut p = ResizePolicy::new(ResizeConfig {
            window: 1,
            ..ResizeConfig::default()
        });
        p.observe(&sample(4, 4, 0), BOUNDS);
        p.observe(&sample(4, 4, 0), BOUNDS);
        p.observe(&sample(4, 0, 0), BOUNDS);
        assert_eq!(p.observe(&sample(4, 4, 0), BOUNDS), None);
    }

    #[test]
    fn grows_when_busy_and_deep() {
        let mut p = ResizePolicy::new(ResizeConfig::default());
        assert_eq!(p.observe(&sample(4, 0, 50), BOUNDS), None);
        assert_eq!(p.observe(&sample(4, 0, 500), BOUNDS), Some(ResizeAction::Grow));
        assert_eq!(p.observe(&sample(8, 0, 500), BOUNDS), None, "at max");
    }

    #[test]
    fn never_shrinks_below_min() {
        let mut p = ResizePolicy::new(ResizeConfig::default());
        for _ in 0..10 {
            assert_eq!(p.observe(&sample(1, 1, 0), BOUNDS), None);
        }
    }
}
