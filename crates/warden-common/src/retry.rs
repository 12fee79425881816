//! Retrying optimistic writes
//!
//! Status and finalizer edits read the latest object, change it and write it
//! back with its `resourceVersion`. When another writer got there first the
//! API server answers 409 and the whole read-modify-write has to run again.
//! [`retry_if`] runs that loop with jittered exponential backoff, retrying
//! only the failures its predicate accepts:
//!
//! ```ignore
//! retry_if(&RetryConfig::conflicts(5), "set_condition", Error::is_conflict, || async {
//!     let latest = store.get_latest(&key).await?;
//!     // mutate, write
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Attempt budget and backoff curve
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, the first one included (0 = unbounded)
    pub max_attempts: u32,
    /// Pause after the first failure
    pub initial_delay: Duration,
    /// Upper bound of the pause
    pub max_delay: Duration,
    /// Growth factor of the pause per failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A few quick attempts, enough to ride out concurrent writers
    pub fn conflicts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}

/// Pause sequence of one retry loop
struct Backoff<'a> {
    config: &'a RetryConfig,
    next: Duration,
}

impl<'a> Backoff<'a> {
    fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            next: config.initial_delay,
        }
    }

    /// Current pause scaled by a random factor in [0.5, 1.5), then grow it
    fn pause(&mut self) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let pause = self.next.mul_f64(factor);
        self.next = self
            .next
            .mul_f64(self.config.backoff_multiplier)
            .min(self.config.max_delay);
        pause
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempt budget is spent
///
/// The last error is returned unchanged in the latter two cases.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(operation = %operation_name, attempt, error = %err, "not retrying");
            return Err(err);
        }
        if config.exhausted(attempt) {
            warn!(operation = %operation_name, attempt, error = %err, "giving up after retries");
            return Err(err);
        }

        let pause = backoff.pause();
        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            retry_in_ms = pause.as_millis() as u64,
            "retrying"
        );
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    fn counted(
        failures: u32,
        count: &Arc<AtomicU32>,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, &'static str>> {
        let count = count.clone();
        move || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures { Err("conflict") } else { Ok(n) })
        }
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let count = Arc::new(AtomicU32::new(0));
        let result = retry_if(&fast(5), "op", |_| true, counted(2, &count)).await;
        assert_eq!(result, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_counts_first_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let result = retry_if(&fast(3), "op", |_| true, counted(u32::MAX, &count)).await;
        assert_eq!(result, Err("conflict"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: only conflicts are worth re-fetching; anything else surfaces
    /// on the first attempt
    #[tokio::test]
    async fn story_predicate_stops_on_first_rejected_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> =
            retry_if(&fast(5), "op", |e: &&str| *e == "conflict", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("conflict")
                    } else {
                        Err("forbidden")
                    }
                }
            })
            .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
        };
        let mut backoff = Backoff::new(&config);
        let first = backoff.pause();
        assert!(first >= Duration::from_millis(50) && first < Duration::from_millis(150));
        backoff.pause();
        let capped = backoff.pause();
        assert!(capped >= Duration::from_millis(150) && capped < Duration::from_millis(450));
    }

    #[test]
    fn test_conflict_budget_is_never_unbounded() {
        assert_eq!(RetryConfig::conflicts(0).max_attempts, 1);
        assert_eq!(RetryConfig::conflicts(5).max_attempts, 5);
        assert!(!RetryConfig::default().exhausted(1_000));
    }
}
