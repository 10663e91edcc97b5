//! Router configuration (spec §10.3).
//!
//! A plain serde-backed aggregate, layered defaults → TOML file →
//! environment via the `config` crate, mirroring the teacher's gateway
//! `config.rs` minus the CLI flag layer and interactive wizard (out of
//! scope per spec §1). No file discovery, no watch/reload.

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::failover::FailoverConfig;
use crate::prettifier::PrettifierConfig;
use crate::routing::RoutingEngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEngineSettings {
    pub enable_performance_routing: bool,
    pub enable_cost_routing: bool,
    pub enable_health_routing: bool,
    pub enable_fallback: bool,
    pub max_provider_attempts: u32,
}

impl Default for RoutingEngineSettings {
    fn default() -> Self {
        Self {
            enable_performance_routing: true,
            enable_cost_routing: false,
            enable_health_routing: true,
            enable_fallback: true,
            max_provider_attempts: 3,
        }
    }
}

impl From<RoutingEngineSettings> for RoutingEngineConfig {
    /// `capability_preferences` and `custom_rules` have no serializable
    /// representation (the latter holds closures) — a host loading
    /// `RouterConfig` from file/env sets those on the resulting
    /// `RoutingEngineConfig` itself after this conversion.
    fn from(s: RoutingEngineSettings) -> Self {
        RoutingEngineConfig {
            enable_performance_routing: s.enable_performance_routing,
            enable_cost_routing: s.enable_cost_routing,
            enable_health_routing: s.enable_health_routing,
            enable_fallback: s.enable_fallback,
            max_provider_attempts: s.max_provider_attempts,
            ..RoutingEngineConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverSettings {
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

impl Default for FailoverSettings {
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

impl From<FailoverSettings> for FailoverConfig {
    fn from(s: FailoverSettings) -> Self {
        FailoverConfig {
            max_retries_per_provider: s.max_retries_per_provider,
            max_total_retries: s.max_total_retries,
            initial_retry_delay_ms: s.initial_retry_delay_ms,
            max_retry_delay_ms: s.max_retry_delay_ms,
            backoff_multiplier: s.backoff_multiplier,
            enable_jitter: s.enable_jitter,
            jitter_factor: s.jitter_factor,
            enable_circuit_breaker: s.enable_circuit_breaker,
            enable_intelligent_failover: s.enable_intelligent_failover,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: s.failure_threshold,
            recovery_timeout_ms: s.recovery_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrettifierSettings {
    pub max_thinking_length: usize,
    pub strip_html_entities: bool,
    pub validate_xml: bool,
}

impl Default for PrettifierSettings {
    fn default() -> Self {
        Self {
            max_thinking_length: 10_000,
            strip_html_entities: true,
            validate_xml: true,
        }
    }
}

impl From<PrettifierSettings> for PrettifierConfig {
    fn from(s: PrettifierSettings) -> Self {
        PrettifierConfig {
            max_thinking_length: s.max_thinking_length,
            strip_html_entities: s.strip_html_entities,
            validate_xml: s.validate_xml,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    pub routing: RoutingEngineSettings,
    pub failover: FailoverSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub prettifier: PrettifierSettings,
}

impl RouterConfig {
    /// Splits the aggregate into the four subsystem configs `Router::new`
    /// takes. `RoutingEngineConfig::capability_preferences`/`custom_rules`
    /// come back at their defaults (empty) — set them on the returned
    /// value if the host needs them.
    pub fn into_engine_configs(
        self,
    ) -> (RoutingEngineConfig, FailoverConfig, CircuitBreakerConfig, PrettifierConfig) {
        (
            self.routing.into(),
            self.failover.into(),
            self.circuit_breaker.into(),
            self.prettifier.into(),
        )
    }

    /// Layered defaults → environment (`ROUTER_*`, double-underscore
    /// nested keys, e.g. `ROUTER_FAILOVER__MAX_TOTAL_RETRIES`). No file
    /// discovery: a config file path, if any, is supplied by the host.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_env_with_file(None)
    }

    pub fn from_env_with_file(file_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("routing.enable_performance_routing", defaults.routing.enable_performance_routing)?
            .set_default("routing.enable_cost_routing", defaults.routing.enable_cost_routing)?
            .set_default("routing.enable_health_routing", defaults.routing.enable_health_routing)?
            .set_default("routing.enable_fallback", defaults.routing.enable_fallback)?
            .set_default("routing.max_provider_attempts", defaults.routing.max_provider_attempts as i64)?
            .set_default("failover.max_retries_per_provider", defaults.failover.max_retries_per_provider as i64)?
            .set_default("failover.max_total_retries", defaults.failover.max_total_retries as i64)?
            .set_default("failover.initial_retry_delay_ms", defaults.failover.initial_retry_delay_ms as i64)?
            .set_default("failover.max_retry_delay_ms", defaults.failover.max_retry_delay_ms as i64)?
            .set_default("failover.backoff_multiplier", defaults.failover.backoff_multiplier)?
            .set_default("failover.enable_jitter", defaults.failover.enable_jitter)?
            .set_default("failover.jitter_factor", defaults.failover.jitter_factor)?
            .set_default("failover.enable_circuit_breaker", defaults.failover.enable_circuit_breaker)?
            .set_default("failover.enable_intelligent_failover", defaults.failover.enable_intelligent_failover)?
            .set_default("circuit_breaker.failure_threshold", defaults.circuit_breaker.failure_threshold as i64)?
            .set_default("circuit_breaker.recovery_timeout_ms", defaults.circuit_breaker.recovery_timeout_ms as i64)?
            .set_default("prettifier.max_thinking_length", defaults.prettifier.max_thinking_length as i64)?
            .set_default("prettifier.strip_html_entities", defaults.prettifier.strip_html_entities)?
            .set_default("prettifier.validate_xml", defaults.prettifier.validate_xml)?;

        if let Some(path) = file_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder
            .add_source(config::Environment::with_prefix("ROUTER").separator("__"))
            .build()?
            .try_deserialize()
    }
}
