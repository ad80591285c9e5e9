use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::io::error::IoError;

/// Backoff parameters for persistent connections.
///
/// `max_attempts == 0` retries forever. Attempts are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl ReconnectPolicy {
    pub const DEFAULT: ReconnectPolicy = ReconnectPolicy {
        max_attempts: 0,
        initial_delay_ms: 1_000,
        max_delay_ms: 60_000,
        multiplier: 2.0,
        jitter: 0.2,
    };

    pub const FAST: ReconnectPolicy = ReconnectPolicy {
        max_attempts: 0,
        initial_delay_ms: 250,
        max_delay_ms: 5_000,
        multiplier: 1.5,
        jitter: 0.1,
    };

    pub const NONE: ReconnectPolicy = ReconnectPolicy {
        max_attempts: 1,
        initial_delay_ms: 1,
        max_delay_ms: 1,
        multiplier: 1.0,
        jitter: 0.0,
    };

    pub fn new(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        jitter: f64,
    ) -> Result<Self, IoError> {
        let policy = Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            multiplier,
            jitter,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), IoError> {
        if self.initial_delay_ms == 0 {
            return Err(IoError::InvalidInput("initial delay must be positive".into()));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(IoError::InvalidInput("max delay must be >= initial delay".into()));
        }
        if !(self.multiplier >= 1.0) {
            return Err(IoError::InvalidInput("multiplier must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(IoError::InvalidInput("jitter must be within [0, 1]".into()));
        }
        Ok(())
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }

    /// The un-jittered delay: `min(initial * multiplier^(attempt-1), max)` in ms.
    pub fn base_delay_ms(&self, attempt: u32) -> Result<f64, IoError> {
        if attempt == 0 {
            return Err(IoError::InvalidInput("attempt is 1-based".into()));
        }
        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        Ok(raw.min(self.max_delay_ms as f64))
    }

    pub fn delay_for(&self, attempt: u32) -> Result<Duration, IoError> {
        let base = self.base_delay_ms(attempt)?;
        let jittered = if self.jitter > 0.0 {
            let spread: f64 = rand::rng().random_range(-1.0..=1.0);
            base + base * self.jitter * spread
        } else {
            base
        };
        Ok(Duration::from_millis(jittered.max(0.0).round() as u64))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// WebSocket ping/pong timing. A zero ping interval disables keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
}

impl KeepAliveConfig {
    pub const DISABLED: KeepAliveConfig = KeepAliveConfig {
        ping_interval_ms: 0,
        pong_timeout_ms: 0,
    };

    pub fn new(ping_interval_ms: u64, pong_timeout_ms: u64) -> Result<Self, IoError> {
        if ping_interval_ms > 0 && (pong_timeout_ms == 0 || pong_timeout_ms >= ping_interval_ms) {
            return Err(IoError::InvalidInput(
                "pong timeout must be positive and shorter than the ping interval".into(),
            ));
        }
        Ok(Self {
            ping_interval_ms,
            pong_timeout_ms,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.ping_interval_ms > 0
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_without_jitter() {
        let policy = ReconnectPolicy::new(0, 100, 1000, 2.0, 0.0).unwrap();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_for(n).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReconnectPolicy::new(0, 100, 10_000, 2.0, 0.5).unwrap();
        for attempt in 1..=6 {
            let base = policy.base_delay_ms(attempt).unwrap();
            for _ in 0..50 {
                let d = policy.delay_for(attempt).unwrap().as_millis() as f64;
                assert!(d >= (base * 0.5).floor() && d <= (base * 1.5).ceil(), "{d} vs {base}");
            }
        }
    }

    #[test]
    fn attempt_zero_is_rejected() {
        assert!(ReconnectPolicy::DEFAULT.delay_for(0).is_err());
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let unbounded = ReconnectPolicy::DEFAULT;
        assert!(unbounded.should_retry(1));
        assert!(unbounded.should_retry(u32::MAX));

        let three = ReconnectPolicy::new(3, 10, 100, 2.0, 0.0).unwrap();
        assert!(three.should_retry(3));
        assert!(!three.should_retry(4));
        assert!(ReconnectPolicy::NONE.should_retry(1));
        assert!(!ReconnectPolicy::NONE.should_retry(2));
    }

    #[test]
    fn invalid_policies() {
        assert!(ReconnectPolicy::new(0, 0, 10, 2.0, 0.0).is_err());
        assert!(ReconnectPolicy::new(0, 100, 10, 2.0, 0.0).is_err());
        assert!(ReconnectPolicy::new(0, 10, 100, 0.5, 0.0).is_err());
        assert!(ReconnectPolicy::new(0, 10, 100, 2.0, 1.5).is_err());
        for preset in [ReconnectPolicy::DEFAULT, ReconnectPolicy::FAST, ReconnectPolicy::NONE] {
            assert!(preset.validate().is_ok());
        }
    }

    #[test]
    fn keep_alive_validation() {
        assert!(KeepAliveConfig::default().is_enabled());
        assert!(!KeepAliveConfig::DISABLED.is_enabled());
        assert!(KeepAliveConfig::new(0, 0).is_ok());
        assert!(KeepAliveConfig::new(1000, 1000).is_err());
        assert!(KeepAliveConfig::new(1000, 0).is_err());
        assert!(KeepAliveConfig::new(1000, 500).is_ok());
    }
}
