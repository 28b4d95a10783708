use std::time::Duration;

use tokio::time::Instant;

use crate::config::{AreaOptions, AGGRESSIVE_COMMIT_DELAY};

/// Rate accounting window.
pub const RATE_QUANTUM: Duration = Duration::from_secs(60 * 60);

/// Counts samples against an allowed rate per time quantum.
///
/// Given everything recorded since the map was created, the limiter answers
/// how long the caller must wait so that the average rate stays within
/// `rate` samples per `quantum`.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    rate: f64,
    samples: f64,
    quantum: Duration,
}

impl RateLimiter {
    pub fn new(rate: u64, quantum: Duration) -> Self {
        Self {
            rate: rate.max(1) as f64,
            samples: 0.0,
            quantum,
        }
    }

    pub fn add_samples(&mut self, samples: u64) {
        self.samples += samples as f64;
    }

    pub fn samples(&self) -> f64 {
        self.samples
    }

    /// Time the recorded samples are entitled to at the configured rate.
    pub fn time_needed(&self) -> Duration {
        self.quantum.mul_f64(self.samples / self.rate)
    }

    /// How long to wait, `elapsed` after the limiter started, before the
    /// next sample keeps the average within the rate. Never negative.
    pub fn delay_needed(&self, elapsed: Duration) -> Duration {
        self.time_needed().saturating_sub(elapsed)
    }
}

/// Decides when a map's pending batch is flushed.
///
/// Two limiters run per map: one over commits and one over committed bytes.
/// The flush delay is the largest of the default delay and what either
/// limiter demands.
#[derive(Clone, Debug)]
pub struct CommitScheduler {
    start: Instant,
    default_delay: Duration,
    commits: RateLimiter,
    data: RateLimiter,
}

impl CommitScheduler {
    pub fn new(options: &AreaOptions) -> Self {
        Self::starting_at(options, Instant::now())
    }

    pub fn starting_at(options: &AreaOptions, start: Instant) -> Self {
        Self {
            start,
            default_delay: options.default_commit_delay,
            commits: RateLimiter::new(options.max_commits_per_hour, RATE_QUANTUM),
            data: RateLimiter::new(options.max_bytes_per_hour, RATE_QUANTUM),
        }
    }

    /// Record one commit carrying `bytes` of keys and values.
    pub fn record_commit(&mut self, bytes: usize) {
        self.commits.add_samples(1);
        self.data.add_samples(bytes as u64);
    }

    /// Delay before flushing a batch created at `now`.
    pub fn commit_delay(&self, now: Instant, aggressive: bool) -> Duration {
        if aggressive {
            return AGGRESSIVE_COMMIT_DELAY;
        }
        let elapsed = now.saturating_duration_since(self.start);
        self.default_delay
            .max(self.commits.delay_needed(elapsed))
            .max(self.data.delay_needed(elapsed))
    }
}
