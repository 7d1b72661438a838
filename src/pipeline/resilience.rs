//! Retry and rate limiting for model calls.
//!
//! Both concerns are policy objects wrapped around a backend, so the
//! conversion loop never sees a sleep or a retry counter:
//!
//! * [`RetryPolicy`] decides how often and how long to back off.
//! * [`RateLimiter`] is a sliding-window limiter shared by every model call
//!   of a run (page conversion and LaTeX fixes alike).
//! * [`ResilientConverter`] and [`ResilientFixer`] apply both to a
//!   [`PageConverter`] / [`LatexFixer`].
//!
//! All waiting goes through `tokio::time`, so tests run on a paused clock.
//!
//! ## Retry Strategy
//!
//! Only [`BackendError::Transient`] failures are retried. A permanent
//! failure (bad key, refused request) is returned after the first attempt.

use crate::error::BackendError;
use crate::pipeline::compile::{Diagnostic, LatexFixer};
use crate::pipeline::llm::PageConverter;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Delay growth between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base × n` before the n-th retry.
    Linear,
    /// `base × 2^(n-1)` before the n-th retry.
    #[default]
    Exponential,
}

impl std::str::FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Backoff::Linear),
            "exponential" | "exp" => Ok(Backoff::Exponential),
            other => Err(format!(
                "unknown backoff '{other}' (expected 'linear' or 'exponential')"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before the `retry`-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let n = retry.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(n),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow((n - 1).min(31))),
        };
        delay.min(self.max_delay)
    }
}

/// A call that failed terminally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    /// Attempts made, including the first.
    pub attempts: u32,
    pub error: BackendError,
}

/// Snapshot of a [`RateLimiter`]'s window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub requests_made: usize,
    pub max_requests: usize,
    pub remaining: usize,
    pub window: Duration,
}

/// Sliding-window limiter: at most `max_requests` calls per `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    buffer: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Safety margin added to every computed wait.
    pub const BUFFER: Duration = Duration::from_millis(100);

    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            buffer: Self::BUFFER,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a request fits in the window, then record it.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let mut requests = self.requests.lock().await;
        let mut waited = Duration::ZERO;

        let now = Instant::now();
        self.prune(&mut requests, now);
        if requests.len() >= self.max_requests {
            if let Some(&oldest) = requests.front() {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                if !wait.is_zero() {
                    info!(
                        "Rate limit reached ({} per {:?}); waiting {:.1}s",
                        self.max_requests,
                        self.window,
                        wait.as_secs_f64()
                    );
                    waited = wait + self.buffer;
                    sleep(waited).await;
                }
            }
            self.prune(&mut requests, Instant::now());
        }

        requests.push_back(Instant::now());
        waited
    }

    pub async fn status(&self) -> RateLimitStatus {
        let mut requests = self.requests.lock().await;
        self.prune(&mut requests, Instant::now());
        RateLimitStatus {
            requests_made: requests.len(),
            max_requests: self.max_requests,
            remaining: self.max_requests.saturating_sub(requests.len()),
            window: self.window,
        }
    }

    fn prune(&self, requests: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = requests.front() {
            if now.duration_since(front) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Retry policy plus an optional shared limiter.
#[derive(Debug, Clone)]
pub struct Resilience {
    pub policy: RetryPolicy,
    pub limiter: Option<Arc<RateLimiter>>,
}

impl Resilience {
    pub fn new(policy: RetryPolicy, limiter: Option<Arc<RateLimiter>>) -> Self {
        Self { policy, limiter }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    /// Every attempt passes through the rate limiter first.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    label,
                    attempt,
                    self.policy.max_retries,
                    delay.as_millis()
                );
                sleep(delay).await;
            }

            if let Some(limiter) = &self.limiter {
                let status = limiter.status().await;
                debug!(
                    "{}: rate limit {}/{} used, {} remaining",
                    label, status.requests_made, status.max_requests, status.remaining
                );
                limiter.acquire().await;
            }

            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    warn!("{}: attempt {} failed: {}", label, attempt, error);
                    if !error.is_retryable() || attempt > self.policy.max_retries {
                        return Err(RetryFailure {
                            attempts: attempt,
                            error,
                        });
                    }
                }
            }
        }
    }
}

/// [`PageConverter`] decorator applying retry and rate limiting.
pub struct ResilientConverter {
    inner: Arc<dyn PageConverter>,
    resilience: Resilience,
}

impl ResilientConverter {
    pub fn new(inner: Arc<dyn PageConverter>, resilience: Resilience) -> Self {
        Self { inner, resilience }
    }

    /// Convert `page`, reporting the attempt count on failure.
    pub async fn convert_page(&self, page: usize, image: &Path) -> Result<String, RetryFailure> {
        let label = format!("Page {page} ({})", self.inner.name());
        self.resilience
            .run(&label, || self.inner.convert(page, image))
            .await
    }
}

impl PageConverter for ResilientConverter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn convert<'a>(
        &'a self,
        page: usize,
        image: &'a Path,
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            self.convert_page(page, image)
                .await
                .map_err(|failure| failure.error)
        })
    }
}

/// [`LatexFixer`] decorator applying retry and rate limiting.
pub struct ResilientFixer {
    inner: Arc<dyn LatexFixer>,
    resilience: Resilience,
}

impl ResilientFixer {
    pub fn new(inner: Arc<dyn LatexFixer>, resilience: Resilience) -> Self {
        Self { inner, resilience }
    }
}

impl LatexFixer for ResilientFixer {
    fn fix<'a>(
        &'a self,
        code: &'a str,
        diagnostics: &'a [Diagnostic],
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            self.resilience
                .run("LaTeX fix", || self.inner.fix(code, diagnostics))
                .await
                .map_err(|failure| failure.error)
        })
    }
}
