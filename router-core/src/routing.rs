//! Routing Engine (C4, spec §4.3).
//!
//! Candidate filtering, custom rules, capability routing, performance
//! routing and priority fallback, in the strategy order spec §4.3 defines.
//! Grounded on the teacher's `Router`/`RoutingStrategy` (`routing.rs`),
//! generalized from the teacher's enum-of-strategies shape to the spec's
//! first-hit-wins ladder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::analyzer;
use crate::models::{Capability, Request};
use crate::performance::PerformanceCache;
use crate::providers::Provider;
use crate::registry::ProviderRegistry;

/// A host-supplied custom rule (spec §4.3). `condition`/`selector` are
/// plain closures rather than trait objects with names, matching the
/// teacher's `Condition`/selector-as-function approach in `routing.rs`.
pub struct Rule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub condition: Box<dyn Fn(&Request) -> bool + Send + Sync>,
    pub selector: Box<dyn Fn(&[Arc<dyn Provider>]) -> Option<Arc<dyn Provider>> + Send + Sync>,
}

#[derive(Default)]
pub struct RoutingEngineConfig {
    pub enable_performance_routing: bool,
    pub enable_cost_routing: bool,
    pub enable_health_routing: bool,
    pub enable_fallback: bool,
    pub max_provider_attempts: u32,
    pub capability_preferences: HashMap<Capability, Vec<String>>,
    pub custom_rules: Vec<Rule>,
}

pub struct RoutingDecision {
    pub provider: Arc<dyn Provider>,
    pub decision: String,
    pub reason: String,
}

pub struct RoutingEngine {
    config: RoutingEngineConfig,
    registry: Arc<ProviderRegistry>,
    performance: Arc<PerformanceCache>,
}

impl RoutingEngine {
    pub fn new(
        config: RoutingEngineConfig,
        registry: Arc<ProviderRegistry>,
        performance: Arc<PerformanceCache>,
    ) -> Self {
        Self {
            config,
            registry,
            performance,
        }
    }

    /// `selectProvider` (spec §4.3). `exclude` holds provider ids the
    /// caller (Failover Manager) has already ruled out.
    pub async fn select_provider(
        &self,
        request: &Request,
        exclude: &[String],
    ) -> Option<RoutingDecision> {
        let started = Instant::now();
        let requirements = analyzer::analyze(request);

        let mut candidates: Vec<Arc<dyn Provider>> = self
            .registry
            .get_for_request(request)
            .await
            .into_iter()
            .filter(|p| !exclude.iter().any(|id| id == p.id()))
            .collect();

        if self.config.enable_performance_routing {
            let mut kept = Vec::with_capacity(candidates.len());
            for p in candidates {
                let below_floor = self
                    .performance
                    .metrics_for(p.id())
                    .await
                    .is_some_and(|m| m.success_rate_percent < 50.0);
                if !below_floor {
                    kept.push(p);
                }
            }
            candidates = kept;
        }

        if self.config.enable_health_routing {
            let mut kept = Vec::with_capacity(candidates.len());
            for p in candidates {
                let health = p.health_check(false).await;
                if !matches!(health.status, crate::models::HealthStatus::Unhealthy) {
                    kept.push(p);
                }
            }
            candidates = kept;
        }

        let candidate_count = candidates.len();
        let selection = self.run_strategies(request, &candidates).await;

        let routing_time_ms = started.elapsed().as_millis() as u64;
        let entry = crate::models::RoutingHistoryEntry {
            timestamp: chrono::Utc::now(),
            request_id: Uuid::new_v4().to_string(),
            request_type: requirements.kind,
            required_capabilities: requirements.capabilities.iter().copied().collect(),
            candidate_count,
            selected_provider_id: selection.as_ref().map(|s| s.provider.id().to_string()),
            decision: selection
                .as_ref()
                .map(|s| s.decision.clone())
                .unwrap_or_else(|| "none".to_string()),
            reason: selection
                .as_ref()
                .map(|s| s.reason.clone())
                .unwrap_or_else(|| "no candidate survived filtering".to_string()),
            routing_time_ms,
            success: selection.is_some(),
        };
        self.performance.append_routing_history(entry).await;

        selection
    }

    async fn run_strategies(
        &self,
        request: &Request,
        candidates: &[Arc<dyn Provider>],
    ) -> Option<RoutingDecision> {
        if candidates.is_empty() {
            return None;
        }

        if let Some(decision) = self.custom_rule_selection(request, candidates) {
            return Some(decision);
        }

        let requirements = analyzer::analyze(request);
        if let Some(decision) = self.capability_selection(&requirements, candidates) {
            return Some(decision);
        }

        if self.config.enable_performance_routing {
            if let Some(decision) = self.performance_selection(candidates).await {
                return Some(decision);
            }
        }

        self.priority_fallback(candidates)
    }

    fn custom_rule_selection(
        &self,
        request: &Request,
        candidates: &[Arc<dyn Provider>],
    ) -> Option<RoutingDecision> {
        let mut rules: Vec<&Rule> = self.config.custom_rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.priority);

        for rule in rules {
            if (rule.condition)(request) {
                if let Some(selected) = (rule.selector)(candidates) {
                    if candidates.iter().any(|c| Arc::ptr_eq(c, &selected)) {
                        return Some(RoutingDecision {
                            provider: selected,
                            decision: format!("custom-rule:{}", rule.id),
                            reason: format!("matched custom rule \"{}\"", rule.name),
                        });
                    }
                }
            }
        }
        None
    }

    fn capability_selection(
        &self,
        requirements: &crate::models::Requirements,
        candidates: &[Arc<dyn Provider>],
    ) -> Option<RoutingDecision> {
        const ORDER: [Capability; 3] = [Capability::Thinking, Capability::Vision, Capability::Tools];

        for capability in ORDER {
            if !requirements.capabilities.contains(&capability) {
                continue;
            }

            if let Some(preferred_ids) = self.config.capability_preferences.get(&capability) {
                for id in preferred_ids {
                    if let Some(p) = candidates.iter().find(|c| {
                        c.id() == id && c.capabilities().supports(capability)
                    }) {
                        return Some(RoutingDecision {
                            provider: p.clone(),
                            decision: format!("capability:{}", p.id()),
                            reason: format!("configured preference for {capability:?} capability"),
                        });
                    }
                }
            }

            if let Some(p) = candidates
                .iter()
                .find(|c| c.capabilities().supports(capability))
            {
                return Some(RoutingDecision {
                    provider: p.clone(),
                    decision: format!("capability:{}", p.id()),
                    reason: format!("first candidate supporting {capability:?} capability"),
                });
            }
        }
        None
    }

    async fn performance_selection(&self, candidates: &[Arc<dyn Provider>]) -> Option<RoutingDecision> {
        if candidates.is_empty() {
            return None;
        }
        let mut scored = Vec::with_capacity(candidates.len());
        for p in candidates {
            let score = match self.performance.metrics_for(p.id()).await {
                Some(m) if m.success_rate_percent > 0.0 => {
                    Some(m.avg_response_time_ms / (m.success_rate_percent / 100.0))
                }
                _ => None,
            };
            scored.push((p.clone(), score));
        }
        scored.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        scored.into_iter().next().map(|(p, _)| RoutingDecision {
            decision: format!("performance:{}", p.id()),
            reason: "lowest weighted latency/success-rate score".to_string(),
            provider: p,
        })
    }

    fn priority_fallback(&self, candidates: &[Arc<dyn Provider>]) -> Option<RoutingDecision> {
        candidates.first().cloned().map(|p| RoutingDecision {
            decision: format!("priority:{}", p.id()),
            reason: "highest-priority candidate; no other strategy matched".to_string(),
            provider: p,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;

    async fn setup(providers: Vec<MockProvider>) -> (Arc<ProviderRegistry>, Arc<PerformanceCache>) {
        let registry = Arc::new(ProviderRegistry::new());
        for p in providers {
            registry.register(Arc::new(p)).await.unwrap();
        }
        (registry, Arc::new(PerformanceCache::new()))
    }

    fn request(text: &str) -> Request {
        Request {
            model: "m".into(),
            messages: vec![crate::models::Message::user(text)],
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

    #[tokio::test]
    async fn priority_fallback_picks_highest_priority() {
        let (registry, perf) = setup(vec![
            MockProvider::healthy("p1", 10),
            MockProvider::healthy("p2", 5),
        ])
        .await;
        let engine = RoutingEngine::new(RoutingEngineConfig::default(), registry, perf);
        let decision = engine.select_provider(&request("hello"), &[]).await.unwrap();
        assert_eq!(decision.provider.id(), "p1");
        assert!(decision.decision.starts_with("priority:") || decision.decision.starts_with("capability:"));
    }

    #[tokio::test]
    async fn exclusion_respected() {
        let (registry, perf) = setup(vec![
            MockProvider::healthy("p1", 10),
            MockProvider::healthy("p2", 5),
        ])
        .await;
        let engine = RoutingEngine::new(RoutingEngineConfig::default(), registry, perf);
        let decision = engine
            .select_provider(&request("hello"), &["p1".to_string()])
            .await
            .unwrap();
        assert_eq!(decision.provider.id(), "p2");
    }
}
