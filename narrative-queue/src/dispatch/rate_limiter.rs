//! Per-provider rate limiting.
//!
//! Token bucket per provider, consulted before every external call so a
//! worker never outruns the provider's published request rate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::database::models::ProviderKind;

/// Configuration for a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum tokens (burst capacity).
    pub max_tokens: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Initial tokens.
    pub initial_tokens: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2,
            refill_rate: 1.0,
            initial_tokens: 2,
        }
    }
}

impl RateLimiterConfig {
    /// Config for a requests-per-second limit, with a burst of twice the rate.
    pub fn with_rps(rps: f64) -> crate::Result<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return Err(crate::Error::config(format!(
                "rate limit must be a positive finite number, got {}",
                rps
            )));
        }

        let max_tokens = (rps * 2.0).ceil().max(1.0) as u32;
        Ok(Self {
            max_tokens,
            refill_rate: rps,
            initial_tokens: max_tokens,
        })
    }
}

/// Token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    tokens: f64,
    max_tokens: u32,
    refill_rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: &RateLimiterConfig) -> Self {
        Self {
            tokens: config.initial_tokens as f64,
            max_tokens: config.max_tokens,
            refill_rate: config.refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Take a token if one is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token becomes available.
    pub fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens as f64);
        self.last_refill = now;
    }
}

/// Rate limiters keyed by provider.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterManager {
    limiters: Arc<Mutex<HashMap<ProviderKind, RateLimiter>>>,
    configs: HashMap<ProviderKind, RateLimiterConfig>,
}

impl RateLimiterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit `provider`. Providers without a config are not limited.
    pub fn set_config(&mut self, provider: ProviderKind, config: RateLimiterConfig) {
        self.configs.insert(provider, config);
    }

    pub fn is_limited(&self, provider: ProviderKind) -> bool {
        self.configs.contains_key(&provider)
    }

    /// Wait for a token for `provider`. Returns the time spent waiting.
    ///
    /// The lock is never held across a sleep, so concurrent callers for other
    /// providers are not blocked.
    pub async fn acquire(&self, provider: ProviderKind) -> Duration {
        let Some(config) = self.configs.get(&provider) else {
            return Duration::ZERO;
        };

        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut limiters = self.limiters.lock().await;
                let limiter = limiters
                    .entry(provider)
                    .or_insert_with(|| RateLimiter::new(config));
                if limiter.try_acquire() {
                    return waited;
                }
                limiter.time_until_available()
            };

            debug!(provider = %provider, "Rate limited, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Take a token without waiting.
    pub async fn try_acquire(&self, provider: ProviderKind) -> bool {
        let Some(config) = self.configs.get(&provider) else {
            return true;
        };
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(provider)
            .or_insert_with(|| RateLimiter::new(config))
            .try_acquire()
    }
}
