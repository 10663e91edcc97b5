//! The abstract `Provider` interface the router consumes (spec §6.1).
//!
//! Concrete provider HTTP shims are explicitly out of scope (spec §1); this
//! module only defines the contract and the rate-limit bookkeeping every
//! implementation is expected to carry.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::ProviderError;
use crate::models::{ProviderCapabilities, ProviderConfig, ProviderHealth, Request, Response};

/// `MockProvider` is also needed from the crate's own `tests/` integration
/// suite, which links against a normal (non-`cfg(test)`) build of this
/// library — so it is gated behind the `test-util` feature rather than
/// `cfg(test)` alone, with `test-util` enabled via a self dev-dependency.
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

/// A single upstream LLM endpoint.
///
/// Implementations own their transport; the router only ever calls through
/// this trait, never touches HTTP directly (spec §1 Out-of-scope).
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn capabilities(&self) -> ProviderCapabilities;
    fn priority(&self) -> i32;
    fn enabled(&self) -> bool;
    fn config(&self) -> &ProviderConfig;

    /// True iff enabled and `required_tokens` fits within this provider's
    /// token budget. This covers the budget half of spec §6.1's
    /// `canHandle`; the capability-subset half is checked by the registry
    /// against `Requirements` directly (see `registry::ProviderRegistry`).
    fn fits_token_budget(&self, required_tokens: u64) -> bool {
        self.enabled() && required_tokens <= self.capabilities().max_tokens as u64
    }

    async fn make_request(&self, request: &Request) -> Result<Response, ProviderError>;

    async fn health_check(&self, full: bool) -> ProviderHealth;

    /// Release transport resources. Default no-op for providers with
    /// nothing to tear down.
    async fn cleanup(&self) {}

    /// Rate limiter this provider enforces, if any (spec §5).
    fn rate_limiter(&self) -> Option<&RateLimiter> {
        None
    }
}

/// Per-minute request/token budget enforced inside a Provider handle
/// (spec §5). A request that would exceed either budget fails fast with
/// `ProviderError::RateLimit`, which classifies as `Temporary` so the
/// Failover Manager tries another provider instead of waiting.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: u32,
    tokens_per_minute: u32,
    remaining_requests: AtomicU32,
    remaining_tokens: AtomicU32,
    window_started_at: AtomicI64,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            remaining_requests: AtomicU32::new(requests_per_minute),
            remaining_tokens: AtomicU32::new(tokens_per_minute),
            window_started_at: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    fn maybe_refill(&self) {
        let now = Utc::now().timestamp();
        let started = self.window_started_at.load(Ordering::Relaxed);
        if now - started >= 60 {
            self.remaining_requests
                .store(self.requests_per_minute, Ordering::Relaxed);
            self.remaining_tokens
                .store(self.tokens_per_minute, Ordering::Relaxed);
            self.window_started_at.store(now, Ordering::Relaxed);
        }
    }

    /// Attempt to reserve one request and `tokens` tokens from the current
    /// minute window. Returns `false` (without partial reservation) if
    /// either budget would go negative. Both counters are CAS'd against the
    /// values just read, so two concurrent reservations can't both pass a
    /// stale check and over-subtract; a lost race on either counter rolls
    /// back and retries against fresh values.
    pub fn try_reserve(&self, tokens: u32) -> bool {
        self.maybe_refill();
        loop {
            let reqs = self.remaining_requests.load(Ordering::Relaxed);
            let toks = self.remaining_tokens.load(Ordering::Relaxed);
            if reqs == 0 || toks < tokens {
                return false;
            }
            if self
                .remaining_tokens
                .compare_exchange(toks, toks - tokens, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            if self
                .remaining_requests
                .compare_exchange(reqs, reqs - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            self.remaining_tokens.fetch_add(tokens, Ordering::Relaxed);
        }
    }
}
