//! Exponential backoff with jitter for the CAS retry loop (spec: §4.4,
//! §6.1 `retryBackoffInitial`/`retryBackoffJitter`).
//!
//! Mirrors the teacher's reconnect backoff in `pool.rs` (double the
//! wait on each attempt, cap the total), generalized with
//! multiplicative jitter so many racing writers don't lock-step retry
//! against each other.

use std::time::{Duration, Instant};

use rand::Rng;

/// Tracks one operation's retry budget (spec §4.4 step 7: "retries are
/// bounded by both `maxRetries` and `maxRetryElapsed`, whichever is
/// reached first").
pub struct RetryBudget {
    attempt: u32,
    max_retries: u32,
    start: Instant,
    deadline: Instant,
    backoff: Duration,
    jitter: f64,
}

/// Why a [`RetryBudget`] has no more attempts left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    MaxRetries,
    MaxElapsed,
}

impl RetryBudget {
    pub fn new(max_retries: u32, max_elapsed: Duration, initial_backoff: Duration, jitter: f64) -> Self {
        let start = Instant::now();
        Self {
            attempt: 0,
            max_retries,
            start,
            deadline: start + max_elapsed,
            backoff: initial_backoff,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Call after a retryable failure. Returns `Ok(())` having already
    /// slept for the next backoff interval, or `Err(Exhausted)` if the
    /// budget is spent (the caller does not sleep in that case).
    pub async fn wait(&mut self) -> Result<(), Exhausted> {
        if self.attempt >= self.max_retries {
            return Err(Exhausted::MaxRetries);
        }
        if Instant::now() >= self.deadline {
            return Err(Exhausted::MaxElapsed);
        }

        let jittered = jittered_delay(self.backoff, self.jitter);
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(jittered.min(remaining)).await;

        self.attempt += 1;
        self.backoff *= 2;
        Ok(())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis().min(u64::MAX as u128) as u64
    }
}

fn jittered_delay(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let mut budget = RetryBudget::new(2, Duration::from_secs(10), Duration::from_millis(1), 0.0);
        assert!(budget.wait().await.is_ok());
        assert!(budget.wait().await.is_ok());
        assert_eq!(budget.wait().await, Err(Exhausted::MaxRetries));
    }

    #[tokio::test]
    async fn exhausts_after_elapsed_budget() {
        let mut budget = RetryBudget::new(1000, Duration::from_millis(5), Duration::from_millis(20), 0.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(budget.wait().await, Err(Exhausted::MaxElapsed));
    }

    #[tokio::test]
    async fn jitter_stays_non_negative() {
        let mut budget = RetryBudget::new(5, Duration::from_secs(10), Duration::from_millis(1), 0.9);
        for _ in 0..5 {
            assert!(budget.wait().await.is_ok());
        }
    }
}
