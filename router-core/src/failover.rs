//! Failover Manager (C5, spec §4.4).
//!
//! Orchestrates retry across providers: classify the triggering error,
//! apply backoff with jitter, consult the circuit breaker bank, and
//! re-select via either the intelligent scorer (§4.4.1) or plain fallback
//! (§4.4.2). Grounded on the teacher's `execute_with_enhanced_retry`
//! (`client.rs`) for the retry loop shape and `error_handling.rs`'s
//! `retry_with_backoff` for the delay computation.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use tokio::time::Instant as TokioInstant;

use crate::circuit_breaker::CircuitBreakerBank;
use crate::error::{classify, ErrorCategory, ProviderError, RouterError};
use crate::models::{ErrorCategoryWire, FailoverAttempt, Request, Response};
use crate::performance::PerformanceCache;
use crate::providers::Provider;
use crate::registry::ProviderRegistry;
use crate::routing::RoutingEngine;

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub max_retries_per_provider: u32,
    pub max_total_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub enable_jitter: bool,
    pub jitter_factor: f64,
    pub enable_circuit_breaker: bool,
    pub enable_intelligent_failover: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries_per_provider: 1,
            max_total_retries: 5,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_jitter: true,
            jitter_factor: 0.2,
            enable_circuit_breaker: true,
            enable_intelligent_failover: true,
        }
    }
}

#[derive(Debug)]
pub struct FailoverOutcome {
    pub response: Response,
    pub attempts: Vec<FailoverAttempt>,
    pub provider_id: String,
}

pub struct FailoverManager {
    config: FailoverConfig,
    routing: Arc<RoutingEngine>,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerBank>,
    performance: Arc<PerformanceCache>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        routing: Arc<RoutingEngine>,
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakerBank>,
        performance: Arc<PerformanceCache>,
    ) -> Self {
        Self {
            config,
            routing,
            registry,
            breakers,
            performance,
        }
    }

    /// `handleFailover` (spec §4.4). `already_failed` seeds the exclusion
    /// set; `original_error`, if any, is classified up front — a
    /// `CLIENT_ERROR`/`PERMANENT` original error fails immediately with no
    /// retry. An external deadline (spec §5, `request.metadata.timeout`)
    /// races the outstanding provider call and is also checked between
    /// attempts; either firing aborts the loop with no further retries.
    pub async fn handle_failover(
        &self,
        request: &Request,
        already_failed: &[String],
        original_error: Option<&ProviderError>,
    ) -> Result<FailoverOutcome, RouterError> {
        if let Some(err) = original_error {
            let category = classify(err);
            if !category.is_retryable() {
                return Err(terminal_error(category, err));
            }
        }

        let deadline = request
            .metadata
            .as_ref()
            .and_then(|m| m.timeout)
            .map(|ms| TokioInstant::now() + tokio::time::Duration::from_millis(ms));

        let mut excluded: Vec<String> = already_failed.to_vec();
        let mut attempts: Vec<FailoverAttempt> = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let mut recent_categories: Vec<ErrorCategory> = Vec::new();
        let mut attempt_number: u32 = 0;

        while attempt_number < self.config.max_total_retries {
            if deadline.is_some_and(|dl| TokioInstant::now() >= dl) {
                tracing::warn!("deadline exceeded between attempts, cancelling failover");
                return Err(RouterError::Cancelled);
            }

            let Some(provider) = self.select_next(request, &excluded, &recent_categories).await else {
                break;
            };

            if self.config.enable_circuit_breaker {
                let breaker_open = !self.breakers.can_execute(provider.id()).await;
                if breaker_open {
                    excluded.push(provider.id().to_string());
                    tracing::debug!(provider = provider.id(), "breaker open, skipping without delay");
                    continue;
                }
            }

            attempt_number += 1;
            let delay_ms = if attempt_number == 1 {
                0
            } else {
                self.compute_delay_ms(attempt_number)
            };
            if delay_ms > 0 {
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }

            let start_time = Utc::now();
            let started = Instant::now();
            let result = match deadline {
                Some(dl) => {
                    tokio::select! {
                        r = provider.make_request(request) => r,
                        _ = tokio::time::sleep_until(dl) => {
                            let cancel_error = ProviderError::Cancelled;
                            attempts.push(FailoverAttempt {
                                attempt_number,
                                provider_id: provider.id().to_string(),
                                provider_name: provider.display_name().to_string(),
                                error: Some(cancel_error.to_string()),
                                error_category: Some(ErrorCategoryWire::from(classify(&cancel_error))),
                                retry_delay_ms: delay_ms,
                                start_time,
                                duration_ms: None,
                                success: false,
                            });
                            tracing::warn!(provider = provider.id(), "deadline exceeded mid-request, cancelling failover");
                            return Err(RouterError::Cancelled);
                        }
                    }
                }
                None => provider.make_request(request).await,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    self.breakers.on_success(provider.id()).await;
                    self.performance
                        .update_provider_performance(provider.id(), duration_ms, true, None)
                        .await;
                    attempts.push(FailoverAttempt {
                        attempt_number,
                        provider_id: provider.id().to_string(),
                        provider_name: provider.display_name().to_string(),
                        error: None,
                        error_category: None,
                        retry_delay_ms: delay_ms,
                        start_time,
                        duration_ms: Some(duration_ms),
                        success: true,
                    });
                    return Ok(FailoverOutcome {
                        response,
                        provider_id: provider.id().to_string(),
                        attempts,
                    });
                }
                Err(error) => {
                    let category = classify(&error);
                    self.breakers.on_failure(provider.id()).await;
                    self.performance
                        .update_provider_performance(
                            provider.id(),
                            duration_ms,
                            false,
                            Some(&format!("{category:?}")),
                        )
                        .await;
                    attempts.push(FailoverAttempt {
                        attempt_number,
                        provider_id: provider.id().to_string(),
                        provider_name: provider.display_name().to_string(),
                        error: Some(error.to_string()),
                        error_category: Some(ErrorCategoryWire::from(category)),
                        retry_delay_ms: delay_ms,
                        start_time,
                        duration_ms: Some(duration_ms),
                        success: false,
                    });
                    recent_categories.push(category);
                    if !category.is_retryable() {
                        tracing::warn!(provider = provider.id(), "non-retryable failure, aborting failover");
                        return Err(terminal_error(category, &error));
                    }
                    last_error = Some(error);
                }
            }
        }

        tracing::error!(attempts = attempts.len(), "failover exhausted");
        match last_error {
            Some(last_cause) => Err(RouterError::RetryExhausted {
                attempts: attempts.len(),
                last_cause,
            }),
            None => Err(RouterError::NoCandidateProvider),
        }
    }

    async fn select_next(
        &self,
        request: &Request,
        excluded: &[String],
        recent_categories: &[ErrorCategory],
    ) -> Option<Arc<dyn Provider>> {
        if self.config.enable_intelligent_failover {
            self.intelligent_select(request, excluded, recent_categories).await
        } else {
            self.routing
                .select_provider(request, excluded)
                .await
                .map(|d| d.provider)
        }
    }

    /// §4.4.1 intelligent selection score (higher better). Candidates come
    /// from the routing engine's normal filtering; this re-scores and
    /// re-orders them rather than duplicating registry/capability logic.
    async fn intelligent_select(
        &self,
        request: &Request,
        excluded: &[String],
        recent_categories: &[ErrorCategory],
    ) -> Option<Arc<dyn Provider>> {
        let requirements = crate::analyzer::analyze(request);

        // Score the full capability-eligible candidate pool (not just the
        // routing engine's single pick) so intelligent failover can prefer
        // a healthier also-ran under sustained single-provider failures.
        let pool: Vec<Arc<dyn Provider>> = self
            .registry
            .get_for_request(request)
            .await
            .into_iter()
            .filter(|p| !excluded.iter().any(|id| id == p.id()))
            .collect();

        let mut best: Option<(Arc<dyn Provider>, f64)> = None;
        for provider in pool {
            let score = self.score_candidate(&provider, &requirements, recent_categories).await;
            let replace = match &best {
                Some((_, s)) => score > *s,
                None => true,
            };
            if replace {
                best = Some((provider, score));
            }
        }
        best.map(|(p, _)| p)
    }

    async fn score_candidate(
        &self,
        provider: &Arc<dyn Provider>,
        requirements: &crate::models::Requirements,
        recent_categories: &[ErrorCategory],
    ) -> f64 {
        let caps = provider.capabilities();
        let matched = requirements
            .capabilities
            .iter()
            .filter(|c| caps.supports(**c))
            .count();
        let total_required = requirements.capabilities.len().max(1);
        let capability_score = 4.0 * (matched as f64 / total_required as f64);

        let headroom = 1.0 - (requirements.estimated_tokens as f64 / caps.max_tokens.max(1) as f64);
        let headroom_score = 2.0 * headroom.clamp(0.0, 1.0);

        let health = provider.health_check(false).await;
        let health_score = match health.status {
            crate::models::HealthStatus::Healthy => 2.0,
            crate::models::HealthStatus::Degraded => 1.0,
            crate::models::HealthStatus::Unhealthy => 0.0,
            crate::models::HealthStatus::Unknown => 1.0,
        };

        let perf_score = match self.performance.metrics_for(provider.id()).await {
            Some(m) => {
                let success_component = m.success_rate_percent / 100.0 * 1.5;
                let latency_component = (1.0 - (m.avg_response_time_ms - 500.0) / 2000.0).clamp(0.0, 0.5);
                success_component + latency_component
            }
            None => 0.0,
        };

        let priority_score = provider.priority() as f64 / 10.0;

        let mut score = capability_score + headroom_score + health_score + perf_score + priority_score;

        if matches!(health.status, crate::models::HealthStatus::Unhealthy) {
            score -= 5.0;
        }
        if self.config.enable_circuit_breaker
            && matches!(self.breakers.state(provider.id()).await, crate::models::CircuitState::Open)
        {
            score -= 20.0;
        }

        let recent_failures = self.performance.recent_failure_count(provider.id()).await;
        score -= 2.0 * recent_failures as f64;

        let consecutive_similar = count_trailing_same_category(recent_categories);
        score -= 3.0 * consecutive_similar as f64;

        score
    }

    /// `delay = min(initial × multiplier^(attempt-1), maxDelay)`, jittered
    /// by `±delay × jitterFactor` (spec §4.4 step 2d). `attempt` is the
    /// 1-indexed attempt about to be made.
    fn compute_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.config.initial_retry_delay_ms as f64
            * self.config.backoff_multiplier.powi(exponent);
        let capped = base.min(self.config.max_retry_delay_ms as f64);

        let delay = if self.config.enable_jitter {
            let jitter_range = capped * self.config.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        delay.round() as u64
    }
}

/// How many trailing entries in `categories` share the same
/// `ErrorCategory` as the last one (spec §4.4.1's "consecutive-similar-error
/// -category count").
fn count_trailing_same_category(categories: &[ErrorCategory]) -> usize {
    let Some(last) = categories.last() else {
        return 0;
    };
    categories.iter().rev().take_while(|c| **c == *last).count()
}

fn terminal_error(category: ErrorCategory, error: &ProviderError) -> RouterError {
    match category {
        ErrorCategory::ClientError => RouterError::ClientError(clone_minimal(error)),
        ErrorCategory::Permanent => RouterError::PermanentProviderError(clone_minimal(error)),
        _ => unreachable!("terminal_error only called for non-retryable categories"),
    }
}

/// `ProviderError` intentionally does not derive `Clone` (it wraps
/// `serde_json::Error`, which doesn't implement it); this reconstructs an
/// equivalent error from its `Display` text for the one path that needs to
/// both record and return the original cause.
fn clone_minimal(error: &ProviderError) -> ProviderError {
    ProviderError::Api {
        code: 0,
        message: error.to_string(),
    }
}
