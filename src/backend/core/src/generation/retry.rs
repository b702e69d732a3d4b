//! Retry with exponential backoff and jitter around generation calls.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use super::{GeneratedImage, GenerationRequest, ImageGenerator, RateLimiter};
use crate::config::GenerationConfig;
use crate::error::AtelierError;

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff configuration for retryable generation failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per unit (first call included)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Jitter factor: each delay is scaled by a random value in
    /// `[1 - jitter, 1 + jitter]` to avoid synchronized retry storms across
    /// concurrently retrying units.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given failed attempt (1-based).
    ///
    /// `initial × 2^(attempt-1)`, capped at `max_backoff`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        if self.jitter <= 0.0 {
            return base;
        }

        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-Unit Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one unit after rate limiting, timeout, and retries.
///
/// Unit failures are data, not errors: the worker aggregates them into a
/// partial result instead of aborting the job.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    /// Original request index of the unit
    pub index: usize,
    /// Attempts spent
    pub attempts: u32,
    /// The generated image, or the final failure reason
    pub result: std::result::Result<GeneratedImage, String>,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate-limited, retrying generation client.
///
/// Shared process-wide: one limiter, one policy, regardless of how many jobs
/// or workers call in.
pub struct GenerationClient {
    generator: Arc<dyn ImageGenerator>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl GenerationClient {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            generator,
            limiter,
            policy,
            call_timeout,
        }
    }

    /// Build a client from configuration around an existing generator.
    pub fn from_config(generator: Arc<dyn ImageGenerator>, cfg: &GenerationConfig) -> Self {
        Self::new(
            generator,
            Arc::new(RateLimiter::new(
                cfg.rate_capacity,
                cfg.rate_refill,
                cfg.rate_interval,
            )),
            RetryPolicy {
                max_attempts: cfg.max_attempts,
                initial_backoff: cfg.initial_backoff,
                max_backoff: cfg.max_backoff,
                jitter: 0.2,
            },
            cfg.call_timeout,
        )
    }

    /// The shared rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Generate one unit, never returning an error.
    ///
    /// Each attempt acquires a rate-limiter token and runs under the hard
    /// call timeout. Wrapping the call in `tokio::time::timeout` drops the
    /// request future on expiry, which aborts the in-flight HTTP request —
    /// a hung upstream call cannot pin a concurrency slot.
    ///
    /// Network errors, timeouts, HTTP 429, and 5xx are retried with
    /// exponential backoff and jitter; other 4xx and auth failures fail
    /// fast.
    pub async fn generate_unit(&self, index: usize, request: &GenerationRequest) -> UnitOutcome {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            self.limiter.acquire().await;

            let outcome = tokio::time::timeout(self.call_timeout, self.generator.generate(request))
                .await;

            let error = match outcome {
                Ok(Ok(image)) => {
                    return UnitOutcome {
                        index,
                        attempts: attempt,
                        result: Ok(image),
                    };
                }
                Ok(Err(e)) => e,
                Err(elapsed) => AtelierError::from(elapsed),
            };

            let retryable = error.is_retryable();
            if !retryable || attempt >= self.policy.max_attempts {
                tracing::warn!(
                    unit = index,
                    attempts = attempt,
                    retryable = retryable,
                    error = %error,
                    "Generation unit failed"
                );
                return UnitOutcome {
                    index,
                    attempts: attempt,
                    result: Err(format!("[{}] {}", error.code(), error.user_message())),
                };
            }

            let delay = self.policy.delay_for_attempt(attempt);
            tracing::debug!(
                unit = index,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying generation unit"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AtelierError, ErrorCode, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedGenerator {
        /// Number of failures to emit before succeeding
        failures: u32,
        code: ErrorCode,
        calls: AtomicU32,
    }

    impl ScriptedGenerator {
        fn new(failures: u32, code: ErrorCode) -> Self {
            Self {
                failures,
                code,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageGenerator for ScriptedGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(AtelierError::new(self.code, "scripted failure"))
            } else {
                Ok(GeneratedImage {
                    url: "https://cdn.example/img.png".to_string(),
                })
            }
        }
    }

    fn test_client(generator: Arc<dyn ImageGenerator>) -> GenerationClient {
        GenerationClient::new(
            generator,
            Arc::new(RateLimiter::new(100, 100, Duration::from_secs(1))),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                jitter: 0.0,
            },
            Duration::from_secs(5),
        )
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a lighthouse at dusk".to_string(),
            reference_images: vec![],
            size: "1024x1024".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        // Capped
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
            jitter: 0.2,
        };

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(8), "delay {:?} below -20%", delay);
            assert!(delay <= Duration::from_secs(12), "delay {:?} above +20%", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_then_success() {
        let generator = Arc::new(ScriptedGenerator::new(2, ErrorCode::ProviderRateLimited));
        let client = test_client(generator.clone());

        let outcome = client.generate_unit(0, &request()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_failure_not_error() {
        let generator = Arc::new(ScriptedGenerator::new(10, ErrorCode::ProviderUnavailable));
        let client = test_client(generator.clone());

        let outcome = client.generate_unit(3, &request()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.index, 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        assert!(outcome.result.unwrap_err().contains("ProviderUnavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_fails_fast() {
        let generator = Arc::new(ScriptedGenerator::new(10, ErrorCode::ProviderRejected));
        let client = test_client(generator.clone());

        let outcome = client.generate_unit(0, &request()).await;

        assert!(!outcome.is_success());
        // 4xx rejection: exactly one attempt, no retries.
        assert_eq!(outcome.attempts, 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    struct HangingGenerator;

    #[async_trait]
    impl ImageGenerator for HangingGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedImage> {
            // Far longer than the call timeout.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("the timeout must abort this call");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_is_aborted_and_retried() {
        let client = GenerationClient::new(
            Arc::new(HangingGenerator),
            Arc::new(RateLimiter::new(100, 100, Duration::from_secs(1))),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                jitter: 0.0,
            },
            Duration::from_millis(200),
        );

        let outcome = client.generate_unit(0, &request()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.unwrap_err().contains("ProviderTimeout"));
    }
}
