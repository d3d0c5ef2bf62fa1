//! Reconnection policy: exponential backoff with symmetric jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for the reconnection loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Negative means unlimited.
    pub max_attempts: i32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the pre-cap delay, clamped to [0, 1].
    pub jitter: f64,
    /// Growth factor per attempt, clamped to >= 1.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            true,
            60,
            Duration::from_millis(100),
            Duration::from_secs(5),
            0.10,
            2.0,
        )
    }
}

impl ReconnectPolicy {
    pub fn new(
        enabled: bool,
        max_attempts: i32,
        initial_delay: Duration,
        max_delay: Duration,
        jitter: f64,
        multiplier: f64,
    ) -> Self {
        Self {
            enabled,
            max_attempts,
            initial_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
            multiplier: multiplier.max(1.0),
        }
    }

    /// No reconnection at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Unlimited fast retries; for ephemeral workloads that must come
    /// back quickly.
    pub fn aggressive() -> Self {
        Self::new(
            true,
            -1,
            Duration::from_millis(50),
            Duration::from_secs(2),
            0.2,
            2.0,
        )
    }

    /// Few, slow retries.
    pub fn conservative() -> Self {
        Self::new(
            true,
            10,
            Duration::from_secs(1),
            Duration::from_secs(30),
            0.1,
            2.0,
        )
    }

    /// Whether another attempt should be made. `attempt` is the number
    /// of attempts already performed.
    pub fn should_continue(&self, attempt: u32) -> bool {
        if !self.enabled {
            return false;
        }
        if self.max_attempts < 0 {
            return true;
        }
        attempt < self.max_attempts as u32
    }

    /// Delay before attempt `n` (1-indexed):
    /// `clamp(base + uniform(-jitter, jitter) * base, 0, max)` where
    /// `base = initial * multiplier^(n-1)`.
    pub fn next_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exp = attempt.saturating_sub(1);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp as i32);
        let jittered = if self.jitter > 0.0 {
            base + rng.gen_range(-self.jitter..=self.jitter) * base
        } else {
            base
        };
        Duration::try_from_secs_f64(jittered.max(0.0))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Mutable attempt accounting carried across one reconnection episode.
#[derive(Debug, Default, Clone)]
pub struct ReconnectState {
    attempt: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts performed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record the start of an attempt and return its 1-indexed number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// A connection came back up; the episode is over.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy::new(
            true,
            60,
            Duration::from_millis(100),
            Duration::from_secs(5),
            0.0,
            2.0,
        )
    }

    #[test]
    fn doubling_series_caps_at_max() {
        let policy = no_jitter();
        let mut rng = SmallRng::seed_from_u64(7);
        let delays: Vec<_> = (1..=8).map(|n| policy.next_delay(n, &mut rng)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_millis(3200),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = ReconnectPolicy::default();
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..1000 {
            let d = policy.next_delay(1, &mut rng).as_secs_f64();
            assert!((0.09..=0.11).contains(&d), "{d}");
        }
    }

    #[test]
    fn jittered_delay_is_deterministic_under_a_seed() {
        let policy = ReconnectPolicy::default();
        let a = policy.next_delay(3, &mut SmallRng::seed_from_u64(9));
        let b = policy.next_delay(3, &mut SmallRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn should_continue_matrix() {
        let disabled = ReconnectPolicy::disabled();
        assert!(!disabled.should_continue(0));

        let unlimited = ReconnectPolicy::aggressive();
        assert!(unlimited.should_continue(0));
        assert!(unlimited.should_continue(1_000_000));

        let bounded = ReconnectPolicy::default();
        assert!(bounded.should_continue(0));
        assert!(bounded.should_continue(59));
        assert!(!bounded.should_continue(60));
        assert!(!bounded.should_continue(61));
    }

    #[test]
    fn constructor_clamps_pathological_inputs() {
        let p = ReconnectPolicy::new(
            true,
            1,
            Duration::from_millis(10),
            Duration::from_secs(1),
            7.5,
            0.1,
        );
        assert_eq!(p.jitter, 1.0);
        assert_eq!(p.multiplier, 1.0);
    }

    #[test]
    fn presets() {
        assert!(!ReconnectPolicy::disabled().enabled);
        let aggressive = ReconnectPolicy::aggressive();
        assert_eq!(aggressive.max_attempts, -1);
        assert_eq!(aggressive.initial_delay, Duration::from_millis(50));
        assert_eq!(aggressive.max_delay, Duration::from_secs(2));
        let conservative = ReconnectPolicy::conservative();
        assert_eq!(conservative.max_attempts, 10);
        assert_eq!(conservative.initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn attempt_accounting() {
        let mut state = ReconnectState::new();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.begin_attempt(), 1);
        assert_eq!(state.begin_attempt(), 2);
        state.reset();
        assert_eq!(state.attempt(), 0);
    }
}
