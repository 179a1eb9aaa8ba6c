use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{CalsyncError, CalsyncResult};

/// Minimum spacing between successive calls sharing a key
const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(100);
/// First backoff step when the server suggests no delay
const BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Ceiling on any single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type SharedOutcome<T> = watch::Receiver<Option<CalsyncResult<T>>>;

struct LimiterState<T> {
    in_flight: HashMap<String, SharedOutcome<T>>,
    last_call: HashMap<String, Instant>,
}

/// What a caller found under its key: an in-flight call to join, or
/// leadership of a fresh one
enum CallRole<T> {
    Join(SharedOutcome<T>),
    Lead(watch::Sender<Option<CalsyncResult<T>>>, Option<Duration>),
}

/// Removes the key's in-flight registration on drop, so a leader cancelled
/// mid-call cannot leave a dead entry that every later caller joins
struct Registration<'a, T> {
    state: &'a Mutex<LimiterState<T>>,
    key: &'a str,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(self.key);
    }
}

/// Serializes and backoff-retries calls to a rate-limited remote endpoint,
/// keyed by a caller-supplied string (e.g. endpoint name).
///
/// Invariant: at most one in-flight operation per key, retries included.
/// Concurrent callers with the same key join the in-flight result instead of
/// issuing a duplicate call.
pub struct RateLimiter<T: Clone> {
    state: Mutex<LimiterState<T>>,
    min_spacing: Duration,
}

impl<T: Clone> RateLimiter<T> {
    pub fn new() -> Self {
        Self::with_min_spacing(DEFAULT_MIN_SPACING)
    }

    pub fn with_min_spacing(min_spacing: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                in_flight: HashMap::new(),
                last_call: HashMap::new(),
            }),
            min_spacing,
        }
    }

    /// Run `operation` under the per-key rate-limit policy.
    ///
    /// Rate-limit failures (429) are retried after the server-suggested delay
    /// when one is present, otherwise with exponential backoff, up to
    /// `max_retries` retries beyond the initial attempt. Any other failure
    /// propagates immediately.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        operation: F,
        max_retries: u32,
    ) -> CalsyncResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CalsyncResult<T>>,
    {
        // Lock scope kept free of awaits so the returned future stays Send
        let role = {
            let mut state = self.state.lock();
            match state.in_flight.get(key) {
                Some(rx) => CallRole::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.in_flight.insert(key.to_string(), rx);

                    let spacing_delay = state
                        .last_call
                        .get(key)
                        .map(|last| {
                            (*last + self.min_spacing).saturating_duration_since(Instant::now())
                        })
                        .filter(|delay| !delay.is_zero());
                    CallRole::Lead(tx, spacing_delay)
                }
            }
        };

        let (tx, spacing_delay) = match role {
            CallRole::Join(rx) => {
                debug!("Joining in-flight call for key '{}'", key);
                return Self::join(rx).await;
            }
            CallRole::Lead(tx, spacing_delay) => (tx, spacing_delay),
        };

        let registration = Registration {
            state: &self.state,
            key,
        };

        if let Some(delay) = spacing_delay {
            debug!("Delaying call for key '{}' by {:?} to respect spacing", key, delay);
            tokio::time::sleep(delay).await;
        }

        let mut attempt: u32 = 0;
        let result = loop {
            self.state
                .lock()
                .last_call
                .insert(key.to_string(), Instant::now());

            match operation().await {
                Ok(value) => break Ok(value),
                Err(err) if err.is_rate_limited() && attempt < max_retries => {
                    let delay = match &err {
                        CalsyncError::RateLimited {
                            retry_after_secs: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => BASE_BACKOFF * 2u32.saturating_pow(attempt),
                    }
                    .min(MAX_BACKOFF);

                    attempt += 1;
                    warn!(
                        "Rate limited on key '{}', retry {}/{} in {:?}",
                        key, attempt, max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        // Unregister before publishing so a caller woken by the result can
        // immediately start a fresh call.
        drop(registration);
        let _ = tx.send(Some(result.clone()));
        result
    }

    async fn join(mut rx: SharedOutcome<T>) -> CalsyncResult<T> {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing: the leading call was
                // cancelled mid-flight.
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                return Err(CalsyncError::Internal {
                    message: "in-flight call was cancelled before completing".to_string(),
                });
            }
        }
    }
}

impl<T: Clone> Default for RateLimiter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn rate_limited(retry_after_secs: Option<u64>) -> CalsyncError {
        CalsyncError::RateLimited { retry_after_secs }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_invocation() {
        let limiter = Arc::new(RateLimiter::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(
                        "events",
                        || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok(42)
                            }
                        },
                        3,
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_suggested_delay_is_honored() {
        let limiter = RateLimiter::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let result = limiter
            .execute(
                "events",
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(rate_limited(Some(2)))
                        } else {
                            Ok(7)
                        }
                    }
                },
                3,
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_without_server_hint() {
        let limiter = RateLimiter::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let result = limiter
            .execute(
                "events",
                || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(rate_limited(None))
                        } else {
                            Ok(1)
                        }
                    }
                },
                5,
            )
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rate_limit_error_is_not_retried() {
        let limiter = RateLimiter::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result = limiter
            .execute(
                "events",
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<u32, _>(CalsyncError::Network {
                            message: "connection refused".to_string(),
                        })
                    }
                },
                5,
            )
            .await;

        assert!(matches!(result, Err(CalsyncError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_and_propagate() {
        let limiter = RateLimiter::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result = limiter
            .execute(
                "events",
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<u32, _>(rate_limited(Some(1)))
                    }
                },
                2,
            )
            .await;

        assert!(matches!(result, Err(CalsyncError::RateLimited { .. })));
        // Initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_spacing_between_sequential_calls() {
        let limiter = RateLimiter::<u32>::new();
        let op = || async { Ok(0) };

        limiter.execute("events", op, 0).await.unwrap();
        let before_second = Instant::now();
        limiter.execute("events", op, 0).await.unwrap();

        assert!(before_second.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_execute_future_is_send() {
        fn require_send<F: Send>(_: F) {}

        let limiter = RateLimiter::<u32>::new();
        require_send(limiter.execute("events", || async { Ok(0) }, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_releases_its_key() {
        let limiter = Arc::new(RateLimiter::<u32>::new());

        let leader = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .execute(
                        "events",
                        || async { std::future::pending::<CalsyncResult<u32>>().await },
                        0,
                    )
                    .await
            })
        };
        // Let the leader register its in-flight entry, then drop it mid-call
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        leader.abort();
        let _ = leader.await;

        // The key must be free again: a new call runs its own operation
        let result = limiter.execute("events", || async { Ok(2) }, 0).await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_coalesce() {
        let limiter = Arc::new(RateLimiter::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for key in ["a", "b"] {
            let limiter = limiter.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(
                        key,
                        || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok(0)
                            }
                        },
                        0,
                    )
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
