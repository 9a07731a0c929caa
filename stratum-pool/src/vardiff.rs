//! Variable difficulty.
//!
//! Each session owns a [`VardiffController`]. Accepted shares are recorded
//! into a sliding window; on every retarget tick the observed rate is
//! compared with the configured band and, when outside it, difficulty moves
//! multiplicatively toward the middle of the band.
//!
//! Uses `tokio::time::Instant` so paused-clock tests drive it directly.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::config::VardiffConfig;
use crate::types::{RateBand, ShareRate};

/// Upper bound on remembered share timestamps.
const MAX_SAMPLES: usize = 4096;

pub struct VardiffController {
    config: VardiffConfig,
    band: RateBand,
    difficulty: f64,
    accepted: VecDeque<Instant>,
    first_accepted: Option<Instant>,
    last_retarget: Instant,
    last_change: Instant,
}

impl VardiffController {
    pub fn new(config: &VardiffConfig, initial_difficulty: f64, now: Instant) -> Self {
        Self {
            config: config.clone(),
            band: RateBand::per_minute(
                config.target_min_per_minute,
                config.target_max_per_minute,
            ),
            difficulty: config.clamp(initial_difficulty),
            accepted: VecDeque::new(),
            first_accepted: None,
            last_retarget: now,
            last_change: now,
        }
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    /// Force a difficulty (e.g. `mining.suggest_difficulty`). The value is
    /// clamped to the configured bounds and the window restarts.
    pub fn set_difficulty(&mut self, difficulty: f64, now: Instant) -> f64 {
        self.difficulty = self.config.clamp(difficulty);
        self.accepted.clear();
        self.last_change = now;
        self.difficulty
    }

    pub fn record_accepted(&mut self, at: Instant) {
        self.first_accepted.get_or_insert(at);
        self.prune_before(at.checked_sub(self.config.window()).unwrap_or(at));
        self.accepted.push_back(at);
        while self.accepted.len() > MAX_SAMPLES {
            self.accepted.pop_front();
        }
    }

    /// Accepted-share rate since the last difficulty change, over at most
    /// one window.
    pub fn observed_rate(&mut self, now: Instant) -> Option<ShareRate> {
        let window = self.config.window();
        self.prune_before(now.checked_sub(window).unwrap_or(now));
        let span = now.duration_since(self.last_change).min(window);
        ShareRate::observed(self.accepted.len(), span)
    }

    /// Evaluate a retarget. Returns the new difficulty when it changed.
    pub fn retarget(&mut self, now: Instant) -> Option<f64> {
        if now.duration_since(self.last_retarget) < self.config.retarget_interval() {
            return None;
        }
        self.last_retarget = now;

        let first = self.first_accepted?;
        if now.duration_since(first) < self.config.warmup() {
            return None;
        }
        let rate = self.observed_rate(now)?;
        if self.accepted.len() < self.config.min_shares || self.band.contains(rate) {
            return None;
        }

        let factor = (rate.as_per_minute() / self.band.midpoint_per_minute())
            .clamp(self.config.min_step_down, self.config.max_step_up);
        let proposed = self.config.clamp(self.difficulty * factor);
        let relative = ((proposed - self.difficulty) / self.difficulty).abs();
        if relative < self.config.min_relative_change {
            return None;
        }

        self.difficulty = proposed;
        self.accepted.clear();
        self.last_change = now;
        Some(proposed)
    }

    fn prune_before(&mut self, cutoff: Instant) {
        while let Some(&t) = self.accepted.front() {
            if t >= cutoff {
                break;
            }
            self.accepted.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn config() -> VardiffConfig {
        VardiffConfig::default()
    }

    /// Feed shares at `per_minute` for `duration`, starting at `start`.
    fn feed(
        vardiff: &mut VardiffController,
        start: Instant,
        duration: Duration,
        per_minute: f64,
    ) -> Instant {
        let spacing = Duration::from_secs_f64(60.0 / per_minute);
        let mut t = start + spacing;
        while t <= start + duration {
            vardiff.record_accepted(t);
            t += spacing;
        }
        start + duration
    }

    #[test]
    fn test_no_retarget_during_warmup() {
        let config = config();
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 1.0, start);
        let now = feed(&mut vardiff, start, Duration::from_secs(45), 600.0);
        // 45s of shares, but warmup is 60s from the first one
        assert_eq!(vardiff.retarget(now), None);
    }

    #[test]
    fn test_no_retarget_below_min_shares() {
        let mut config = config();
        config.warmup_secs = 0;
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 1.0, start);
        vardiff.record_accepted(start + Duration::from_secs(1));
        assert_eq!(vardiff.retarget(start + Duration::from_secs(30)), None);
    }

    #[test]
    fn test_in_band_is_left_alone() {
        let config = config();
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 8.0, start);
        let now = feed(&mut vardiff, start, Duration::from_secs(120), 15.0);
        assert_eq!(vardiff.retarget(now), None);
        assert_eq!(vardiff.difficulty(), 8.0);
    }

    #[test]
    fn test_step_up_is_clamped() {
        let config = config();
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 1.0, start);
        let now = feed(&mut vardiff, start, Duration::from_secs(120), 600.0);
        // 600/15 = 40x, limited to max_step_up
        assert_eq!(vardiff.retarget(now), Some(4.0));
    }

    #[test]
    fn test_step_down_is_clamped() {
        let config = config();
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 1000.0, start);
        let now = feed(&mut vardiff, start, Duration::from_secs(300), 1.0);
        assert_eq!(vardiff.retarget(now), Some(250.0));
    }

    #[test]
    fn test_result_respects_bounds() {
        let mut config = config();
        config.max_difficulty = 2.0;
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 1.0, start);
        let now = feed(&mut vardiff, start, Duration::from_secs(120), 600.0);
        assert_eq!(vardiff.retarget(now), Some(2.0));

        // Already at the ceiling: nothing to do
        let now = feed(&mut vardiff, now, Duration::from_secs(120), 600.0);
        assert_eq!(vardiff.retarget(now), None);
    }

    #[test]
    fn test_small_changes_suppressed() {
        let mut config = config();
        config.min_relative_change = 0.5;
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 10.0, start);
        // 21/min against a midpoint of 15 is a 40% step
        let now = feed(&mut vardiff, start, Duration::from_secs(120), 21.0);
        assert_eq!(vardiff.retarget(now), None);
    }

    #[test]
    fn test_retarget_respects_interval() {
        let mut config = config();
        config.warmup_secs = 0;
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, 1.0, start);
        feed(&mut vardiff, start, Duration::from_secs(10), 600.0);
        assert_eq!(vardiff.retarget(start + Duration::from_secs(10)), None);
        assert!(vardiff.retarget(start + Duration::from_secs(30)).is_some());
    }

    #[test]
    fn test_suggested_difficulty_is_clamped() {
        let config = config();
        let now = Instant::now();
        let mut vardiff = VardiffController::new(&config, 1.0, now);
        assert_eq!(vardiff.set_difficulty(1e20, now), config.max_difficulty);
        assert_eq!(vardiff.set_difficulty(0.0, now), config.min_difficulty);
    }

    /// A miner whose share rate is inversely proportional to difficulty.
    struct SimulatedMiner {
        hashpower: f64,
        next_share: Instant,
    }

    impl SimulatedMiner {
        fn new(hashpower: f64, start: Instant, difficulty: f64) -> Self {
            let mut miner = Self {
                hashpower,
                next_share: start,
            };
            miner.next_share += miner.spacing(difficulty);
            miner
        }

        fn spacing(&self, difficulty: f64) -> Duration {
            Duration::from_secs_f64(60.0 * difficulty / self.hashpower)
        }

        fn run_until(&mut self, vardiff: &mut VardiffController, until: Instant) {
            while self.next_share <= until {
                vardiff.record_accepted(self.next_share);
                self.next_share += self.spacing(vardiff.difficulty());
            }
        }
    }

    fn simulate(hashpower: f64, initial: f64, ticks: usize) -> (VardiffConfig, f64) {
        let config = config();
        let start = Instant::now();
        let mut vardiff = VardiffController::new(&config, initial, start);
        let mut miner = SimulatedMiner::new(hashpower, start, initial);

        let mut now = start;
        for _ in 0..ticks {
            now += config.retarget_interval();
            miner.run_until(&mut vardiff, now);
            vardiff.retarget(now);
            let d = vardiff.difficulty();
            assert!(d >= config.min_difficulty && d <= config.max_difficulty);
        }
        (config, hashpower / vardiff.difficulty())
    }

    #[test]
    fn test_converges_from_below() {
        let (config, rate) = simulate(1000.0, 1.0, 60);
        assert!(
            (config.target_min_per_minute..=config.target_max_per_minute).contains(&rate),
            "settled at {} shares/min",
            rate
        );
    }

    #[test]
    fn test_converges_from_above() {
        let (config, rate) = simulate(3000.0, 2000.0, 60);
        assert!(
            (config.target_min_per_minute..=config.target_max_per_minute).contains(&rate),
            "settled at {} shares/min",
            rate
        );
    }
}
