//! Provider Registry (C2, spec §4.2).
//!
//! Owns the set of provider handles. Readers see a consistent snapshot via
//! a `tokio::sync::RwLock`, matching the teacher's approach to the shared
//! circuit-breaker/routing state (`Arc<RwLock<_>>` throughout
//! `circuit_breaker.rs` and `routing.rs`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::analyzer;
use crate::error::RegistryError;
use crate::models::{Capability, Request};
use crate::providers::Provider;

pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    capability_index: RwLock<HashMap<Capability, HashSet<String>>>,
    insertion_order: RwLock<Vec<String>>,
    health_monitor: RwLock<Option<JoinHandle<()>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            capability_index: RwLock::new(HashMap::new()),
            insertion_order: RwLock::new(Vec::new()),
            health_monitor: RwLock::new(None),
        }
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        let id = provider.id().to_string();
        let mut providers = self.providers.write().await;
        if providers.contains_key(&id) {
            return Err(RegistryError::DuplicateId { id });
        }

        let caps = provider.capabilities();
        let mut index = self.capability_index.write().await;
        for (capability, supported) in [
            (Capability::Thinking, caps.thinking),
            (Capability::Vision, caps.vision),
            (Capability::Tools, caps.tools),
            (Capability::Streaming, caps.streaming),
            (Capability::SystemMessages, caps.system_messages),
            (Capability::Temperature, caps.temperature),
            (Capability::TopP, caps.top_p),
        ] {
            if supported {
                index.entry(capability).or_default().insert(id.clone());
            }
        }

        self.insertion_order.write().await.push(id.clone());
        providers.insert(id, provider);
        tracing::info!("provider registered");
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut providers = self.providers.write().await;
        let provider = providers
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        drop(providers);

        provider.cleanup().await;

        let mut index = self.capability_index.write().await;
        for ids in index.values_mut() {
            ids.remove(id);
        }
        self.insertion_order.write().await.retain(|x| x != id);
        tracing::info!("provider unregistered");
        Ok(())
    }

    /// Enabled providers whose capabilities are a superset of the
    /// request's derived requirements, sorted by priority descending with
    /// insertion order as the tiebreak (spec §4.2 invariant).
    pub async fn get_for_request(&self, request: &Request) -> Vec<Arc<dyn Provider>> {
        let requirements = analyzer::analyze(request);
        let providers = self.providers.read().await;
        let order = self.insertion_order.read().await;

        let mut candidates: Vec<Arc<dyn Provider>> = providers
            .values()
            .filter(|p| {
                p.enabled()
                    && p.capabilities().supports_all(&requirements.capabilities)
                    && p.fits_token_budget(requirements.estimated_tokens)
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.priority().cmp(&a.priority()).then_with(|| {
                let ai = order.iter().position(|id| id == a.id()).unwrap_or(usize::MAX);
                let bi = order.iter().position(|id| id == b.id()).unwrap_or(usize::MAX);
                ai.cmp(&bi)
            })
        });

        candidates
    }

    pub async fn get_by_capability(&self, capability: Capability) -> Vec<Arc<dyn Provider>> {
        let index = self.capability_index.read().await;
        let providers = self.providers.read().await;
        let Some(ids) = index.get(&capability) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| providers.get(id))
            .filter(|p| p.enabled())
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.read().await.values().cloned().collect()
    }

    /// Concurrently health-check every enabled provider. Individual
    /// failures are swallowed into an `unhealthy` status; this never
    /// returns an error to the caller (spec §4.2).
    pub async fn check_all_health(&self, full: bool) -> HashMap<String, crate::models::ProviderHealth> {
        let providers: Vec<_> = self.providers.read().await.values().cloned().collect();
        let checks = providers.into_iter().filter(|p| p.enabled()).map(|p| async move {
            let id = p.id().to_string();
            let health = p.health_check(full).await;
            (id, health)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }

    /// Spawn a background task issuing a light health check on `interval`.
    /// Cancellable via `stop_health_monitoring`.
    pub async fn start_health_monitoring(self: &Arc<Self>, interval: Duration)
    where
        Self: 'static,
    {
        self.stop_health_monitoring().await;
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.check_all_health(false).await;
                tracing::debug!("health monitoring tick complete");
            }
        });
        *self.health_monitor.write().await = Some(handle);
    }

    pub async fn stop_health_monitoring(&self) {
        if let Some(handle) = self.health_monitor.write().await.take() {
            handle.abort();
        }
    }
}
