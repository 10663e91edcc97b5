//! Circuit Breaker Bank (C3, spec §3 CircuitState / §4.4 state machine).
//!
//! One `CircuitBreaker` per provider, lazily created on first recorded
//! failure, keyed by provider id in `CircuitBreakerBank`. State machine and
//! metrics snapshot are grounded on the teacher's `circuit_breaker.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;

use crate::models::CircuitState;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_time: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
}

/// A single provider's breaker. Cheaply clonable (`Arc` inside); methods
/// take `&self` and serialize through an internal lock, matching the
/// teacher's `CircuitBreaker { state: Arc<RwLock<_>> }` shape.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(BreakerState::default())),
        }
    }

    /// True if a request is currently allowed through. As a side effect,
    /// transitions OPEN → HALF_OPEN once the recovery timer has elapsed
    /// (spec: "OPEN + now ≥ nextAttemptTime → HALF_OPEN (on next check)").
    pub async fn can_execute(&self) -> bool {
        let mut guard = self.state.write().await;
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if guard
                    .next_attempt_time
                    .is_some_and(|t| Utc::now() >= t)
                {
                    guard.state = CircuitState::HalfOpen;
                    tracing::info!("circuit transitioning to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn on_success(&self) {
        let mut guard = self.state.write().await;
        if !matches!(guard.state, CircuitState::Closed) {
            tracing::info!("circuit closing after success");
        }
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.next_attempt_time = None;
    }

    pub async fn on_failure(&self) {
        let mut guard = self.state.write().await;
        guard.failure_count += 1;
        guard.last_failure_time = Some(Utc::now());

        let should_open = match guard.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => guard.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            guard.state = CircuitState::Open;
            guard.next_attempt_time =
                Some(Utc::now() + ChronoDuration::milliseconds(self.config.recovery_timeout_ms as i64));
            tracing::warn!(failures = guard.failure_count, "circuit opened");
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn next_attempt_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.next_attempt_time
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let guard = self.state.read().await;
        CircuitBreakerMetrics {
            state: guard.state,
            failure_count: guard.failure_count,
        }
    }

    pub async fn force_open(&self) {
        let mut guard = self.state.write().await;
        guard.state = CircuitState::Open;
        guard.next_attempt_time =
            Some(Utc::now() + ChronoDuration::milliseconds(self.config.recovery_timeout_ms as i64));
    }

    pub async fn force_closed(&self) {
        let mut guard = self.state.write().await;
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.next_attempt_time = None;
    }
}

/// Owns one `CircuitBreaker` per provider id, creating it lazily.
pub struct CircuitBreakerBank {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerBank {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    async fn breaker_for(&self, provider_id: &str) -> CircuitBreaker {
        if let Some(b) = self.breakers.read().await.get(provider_id) {
            return b.clone();
        }
        let mut guard = self.breakers.write().await;
        guard
            .entry(provider_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config))
            .clone()
    }

    pub async fn can_execute(&self, provider_id: &str) -> bool {
        self.breaker_for(provider_id).await.can_execute().await
    }

    pub async fn on_success(&self, provider_id: &str) {
        self.breaker_for(provider_id).await.on_success().await;
    }

    pub async fn on_failure(&self, provider_id: &str) {
        self.breaker_for(provider_id).await.on_failure().await;
    }

    pub async fn state(&self, provider_id: &str) -> CircuitState {
        self.breaker_for(provider_id).await.state().await
    }

    pub async fn metrics(&self, provider_id: &str) -> Option<CircuitBreakerMetrics> {
        if !self.breakers.read().await.contains_key(provider_id) {
            return None;
        }
        Some(self.breaker_for(provider_id).await.metrics().await)
    }

    pub async fn force_open(&self, provider_id: &str) {
        self.breaker_for(provider_id).await.force_open().await;
    }

    pub async fn force_closed(&self, provider_id: &str) {
        self.breaker_for(provider_id).await.force_closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn closed_state_allows_execution() {
        let cb = CircuitBreaker::new(fast_config());
        assert!(cb.can_execute().await);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.on_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.can_execute().await);
    }

    #[tokio::test]
    async fn recovers_to_half_open_then_closed() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.on_failure().await;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(60)).await;
        assert!(cb.can_execute().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        cb.on_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.on_failure().await;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(60)).await;
        assert!(cb.can_execute().await);
        cb.on_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn bank_creates_independent_breakers() {
        let bank = CircuitBreakerBank::new(fast_config());
        for _ in 0..3 {
            bank.on_failure("p1").await;
        }
        assert_eq!(bank.state("p1").await, CircuitState::Open);
        assert_eq!(bank.state("p2").await, CircuitState::Closed);
    }
}
