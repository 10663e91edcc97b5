//! Capability-aware routing, failover, and Claude-family response
//! normalization for a multi-provider LLM request router.
//!
//! The three load-bearing subsystems are [`routing::RoutingEngine`]
//! (provider selection), [`failover::FailoverManager`] (retry with
//! classified errors and circuit breaking), and [`prettifier::Prettifier`]
//! (Claude-family tool-call and reasoning extraction). [`Router`] wires
//! them together behind the single [`Router::route`] entry point
//! (spec §6.2).

pub mod analyzer;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod failover;
pub mod models;
pub mod performance;
pub mod prettifier;
pub mod providers;
pub mod registry;
pub mod routing;

use std::sync::Arc;

use error::RouterError;
use failover::{FailoverConfig, FailoverManager};
use models::{NormalizedEnvelope, Request};
use performance::PerformanceCache;
use prettifier::{Prettifier, PrettifierConfig, ProcessingContext};
use registry::ProviderRegistry;
use routing::{RoutingEngine, RoutingEngineConfig};

/// Top-level facade: `route(Request) -> NormalizedEnvelope` (spec §6.2).
/// Internally: Analyzer → Routing Engine → `Provider::make_request` → on
/// error, Failover Manager → Prettifier → return. The Failover Manager
/// owns the whole attempt sequence, including the first try, so `route`
/// never calls a provider directly.
pub struct Router {
    registry: Arc<ProviderRegistry>,
    failover: Arc<FailoverManager>,
    prettifier: Prettifier,
}

impl Router {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        routing_config: RoutingEngineConfig,
        failover_config: FailoverConfig,
        circuit_breaker_config: circuit_breaker::CircuitBreakerConfig,
        prettifier_config: PrettifierConfig,
    ) -> Self {
        let performance = Arc::new(PerformanceCache::new());
        let routing = Arc::new(RoutingEngine::new(
            routing_config,
            registry.clone(),
            performance.clone(),
        ));
        let breakers = Arc::new(circuit_breaker::CircuitBreakerBank::new(circuit_breaker_config));
        let failover = Arc::new(FailoverManager::new(
            failover_config,
            routing,
            registry.clone(),
            breakers,
            performance,
        ));

        Self {
            registry,
            failover,
            prettifier: Prettifier::new(prettifier_config),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// `route(Request) -> NormalizedEnvelope` (spec §6.2). On prettifier
    /// failure the router does not fail the overall request: it falls back
    /// to a minimal envelope carrying the raw content and an error note
    /// (spec §7).
    pub async fn route(&self, request: &Request) -> Result<NormalizedEnvelope, RouterError> {
        let outcome = self.failover.handle_failover(request, &[], None).await?;

        let provider_id = outcome.provider_id.clone();
        let attempts_len = outcome.attempts.len();
        let mut envelope = self.prettify(outcome.response, &provider_id)?;

        if attempts_len > 1 {
            if let serde_json::Value::Object(map) = &mut envelope.metadata {
                map.insert("fallback_used".to_string(), serde_json::json!(true));
                map.insert(
                    "routing_decision".to_string(),
                    serde_json::json!(format!("failover:{provider_id}")),
                );
                map.insert("failover_attempts".to_string(), serde_json::json!(attempts_len));
            }
        }

        Ok(envelope)
    }

    fn prettify(&self, response: models::Response, provider_id: &str) -> Result<NormalizedEnvelope, RouterError> {
        // The raw text handed to the Prettifier is the provider's completion
        // body itself (where embedded <thinking>/<function_calls>/tool_use
        // markup lives), not our wire-level `Response` envelope around it.
        let raw_content = response
            .choices
            .first()
            .and_then(|c| c.message.as_ref().or(c.delta.as_ref()))
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        let ctx = ProcessingContext {
            model_name: response.model.clone(),
            streaming_mode: false,
        };
        match self.prettifier.postprocess_response(&raw_content, &ctx, provider_id) {
            Ok(envelope) => Ok(envelope),
            Err(err) => Ok(NormalizedEnvelope::error_fallback(
                provider_id,
                raw_content,
                err.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{all_capabilities, MockProvider, ScriptedOutcome};
    use crate::error::ProviderError;

    fn request() -> Request {
        Request {
            model: "m".into(),
            messages: vec![models::Message::user("hello")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            stop: None,
            tools: None,
            tool_choice: None,
            metadata: None,
        }
    }

    async fn router_with(providers: Vec<MockProvider>) -> Router {
        let registry = Arc::new(ProviderRegistry::new());
        for p in providers {
            registry.register(Arc::new(p)).await.unwrap();
        }
        Router::new(
            registry,
            RoutingEngineConfig::default(),
            FailoverConfig {
                initial_retry_delay_ms: 1,
                max_retry_delay_ms: 2,
                ..FailoverConfig::default()
            },
            circuit_breaker::CircuitBreakerConfig::default(),
            PrettifierConfig::default(),
        )
    }

    #[tokio::test]
    async fn simple_routing_returns_envelope() {
        let router = router_with(vec![MockProvider::healthy("p1", 10)]).await;
        let envelope = router.route(&request()).await.unwrap();
        assert_eq!(envelope.provider, "p1");
    }

    #[tokio::test]
    async fn failover_path_marks_fallback_metadata() {
        let p1 = MockProvider::new(
            "p1",
            10,
            all_capabilities(),
            vec![ScriptedOutcome::Fail(ProviderError::ServiceUnavailable)],
        );
        let p2 = MockProvider::healthy("p2", 5);
        let router = router_with(vec![p1, p2]).await;

        let envelope = router.route(&request()).await.unwrap();
        assert_eq!(envelope.provider, "p2");
        assert_eq!(envelope.metadata["fallback_used"], true);
        assert_eq!(envelope.metadata["failover_attempts"], 2);
    }

    #[tokio::test]
    async fn client_error_has_no_retry() {
        let p1 = MockProvider::new(
            "p1",
            10,
            all_capabilities(),
            vec![ScriptedOutcome::Fail(ProviderError::InvalidApiKey)],
        );
        let router = router_with(vec![p1]).await;
        let err = router.route(&request()).await.unwrap_err();
        assert!(matches!(err, RouterError::ClientError(_)));
    }
}
