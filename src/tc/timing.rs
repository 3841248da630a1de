//! Adaptive timing parameters (§4.3 "Adaptive timing").
//!
//! All four knobs scale together by the same multiplicative factor on
//! transport error / malformed reply / keep-alive-only reply, and scale back
//! down on any reply that delivers new data, bounded by configured min/max.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde")]
    pub ack_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retransmission_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub sliding_window_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub max_retransmissions: u32,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    pub max_transport_errors: u32,
    /// Multiplicative factor applied by `increase`/`decrease`.
    pub scale_factor: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ack_delay: Duration::from_millis(100),
            retransmission_interval: Duration::from_millis(1500),
            sliding_window_wait: Duration::from_millis(300),
            keepalive_interval: Duration::from_secs(5),
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            max_retransmissions: 300,
            max_lifetime: Duration::from_secs(3600),
            max_transport_errors: 50,
            scale_factor: 1.5,
        }
    }
}

impl TimingConfig {
    /// Invoked on transport error, malformed reply, or a reply carrying only
    /// `KeepAlive` — backs off so a lossy or slow path doesn't get hammered.
    pub fn increase(&mut self) {
        self.ack_delay = scale(self.ack_delay, self.scale_factor, self.min_interval, self.max_interval);
        self.retransmission_interval = scale(
            self.retransmission_interval,
            self.scale_factor,
            self.min_interval,
            self.max_interval,
        );
        self.sliding_window_wait = scale(
            self.sliding_window_wait,
            self.scale_factor,
            self.min_interval,
            self.max_interval,
        );
        self.keepalive_interval = scale(
            self.keepalive_interval,
            self.scale_factor,
            self.min_interval,
            self.max_interval,
        );
    }

    /// Invoked when a reply delivers new data — tightens timing back up
    /// toward the configured minimums.
    pub fn decrease(&mut self) {
        self.ack_delay = scale(self.ack_delay, 1.0 / self.scale_factor, self.min_interval, self.max_interval);
        self.retransmission_interval = scale(
            self.retransmission_interval,
            1.0 / self.scale_factor,
            self.min_interval,
            self.max_interval,
        );
        self.sliding_window_wait = scale(
            self.sliding_window_wait,
            1.0 / self.scale_factor,
            self.min_interval,
            self.max_interval,
        );
        self.keepalive_interval = scale(
            self.keepalive_interval,
            1.0 / self.scale_factor,
            self.min_interval,
            self.max_interval,
        );
    }
}

fn scale(current: Duration, factor: f64, min: Duration, max: Duration) -> Duration {
    let scaled_millis = (current.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(scaled_millis).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increase_then_decrease_is_bounded() {
        let mut timing = TimingConfig::default();
        let original = timing.ack_delay;
        for _ in 0..20 {
            timing.increase();
        }
        assert_eq!(timing.ack_delay, timing.max_interval);
        for _ in 0..20 {
            timing.decrease();
        }
        assert!(timing.ack_delay >= timing.min_interval);
        assert!(timing.ack_delay <= original.max(timing.min_interval) || timing.ack_delay == timing.min_interval);
    }
}
