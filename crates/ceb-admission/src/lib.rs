//! Admission control (C4): a token-bucket rate limiter keyed by caller
//! identity, and circuit breakers wrapping external dependencies
//! (metadata-store back end, language runtimes).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ceb_core::CircuitState;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub points: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 100,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
        }
    }
}

struct Bucket {
    remaining: u32,
    window_started_at: Instant,
    blocked_until: Option<Instant>,
}

/// Token bucket keyed by caller identity (remote address or forwarded
/// header). `consume` is atomic per identity via an internal mutex.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to consume `cost` points for `identity`. Returns `Ok(())` on
    /// success, or `Err(remaining_block)` — the duration until the caller
    /// may try again — when blocked or exhausted.
    pub fn consume(&self, identity: &str, cost: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");

        let bucket = buckets.entry(identity.to_string()).or_insert_with(|| Bucket {
            remaining: self.config.points,
            window_started_at: now,
            blocked_until: None,
        });

        if let Some(blocked_until) = bucket.blocked_until {
            if now < blocked_until {
                return Err(blocked_until - now);
            }
            bucket.blocked_until = None;
            bucket.remaining = self.config.points;
            bucket.window_started_at = now;
        } else if now.duration_since(bucket.window_started_at) >= self.config.window {
            bucket.remaining = self.config.points;
            bucket.window_started_at = now;
        }

        if bucket.remaining < cost {
            bucket.blocked_until = Some(now + self.config.block_duration);
            warn!(identity, "rate limit exceeded; blocking");
            return Err(self.config.block_duration);
        }

        bucket.remaining -= cost;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub recover_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            recover_successes: 3,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

/// One breaker per external dependency name. Only failures the caller
/// classifies as "expected" (connection refused, timeout, 5xx-equivalent)
/// count toward `failure_threshold` — callers report outcomes via
/// [`CircuitBreaker::record_success`]/[`CircuitBreaker::record_failure`].
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Whether a call should be allowed through right now. Transitions
    /// `open` → `half-open` once `reset_timeout` has elapsed.
    pub fn allow(&self) -> bool {
        let mut state = self.inner.lock().expect("breaker mutex poisoned");
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    debug!("circuit breaker entering half-open probe state");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.inner.lock().expect("breaker mutex poisoned");
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.recover_successes {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.inner.lock().expect("breaker mutex poisoned");
        state.last_failure_at = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    warn!("circuit breaker opening after consecutive failures");
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit breaker re-opening after probe failure");
                state.state = CircuitState::Open;
                state.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker mutex poisoned").failure_count
    }
}
