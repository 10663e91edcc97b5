//! Performance Cache (C7, spec §4.7).
//!
//! Per-provider EMA metrics, a bounded routing-history ring, and
//! per-provider failure timestamps retained for one hour. Grounded on the
//! teacher's `ProviderStats`/`ProviderMetrics` (`routing.rs`,
//! `providers/mod.rs`) — this module merges the two into the single cache
//! spec §4.7 describes.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::models::{PerformanceMetrics, RoutingHistoryEntry};

const EMA_ALPHA: f64 = 0.3;
const HISTORY_CAPACITY: usize = 1000;
const FAILURE_RETENTION: ChronoDuration = ChronoDuration::hours(1);
const RECENT_WINDOW: ChronoDuration = ChronoDuration::minutes(5);

pub struct PerformanceCache {
    metrics: RwLock<HashMap<String, PerformanceMetrics>>,
    routing_history: RwLock<VecDeque<RoutingHistoryEntry>>,
    failure_history: RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl Default for PerformanceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCache {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            routing_history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            failure_history: RwLock::new(HashMap::new()),
        }
    }

    /// `updateProviderPerformance` (spec §4.3): create-or-fetch metrics,
    /// bump counters, EMA the response time (first sample sets it
    /// directly), recompute success rate, bucket the error type on
    /// failure.
    pub async fn update_provider_performance(
        &self,
        provider_id: &str,
        response_time_ms: u64,
        success: bool,
        error_type: Option<&str>,
    ) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(provider_id.to_string()).or_default();

        entry.total += 1;
        if success {
            entry.success += 1;
        } else {
            entry.fail += 1;
            if let Some(err) = error_type {
                *entry.error_types.entry(err.to_string()).or_insert(0) += 1;
            }
            self.record_failure(provider_id).await;
        }

        entry.avg_response_time_ms = if entry.total == 1 || entry.avg_response_time_ms == 0.0 {
            response_time_ms as f64
        } else {
            EMA_ALPHA * response_time_ms as f64 + (1.0 - EMA_ALPHA) * entry.avg_response_time_ms
        };

        entry.success_rate_percent =
            (entry.success as f64 / entry.total as f64 * 100.0).clamp(0.0, 100.0);
        entry.last_updated = Utc::now();

        debug_assert!(entry.avg_response_time_ms >= 0.0);
        tracing::debug!(provider = provider_id, avg_ms = entry.avg_response_time_ms, "performance updated");
    }

    pub async fn metrics_for(&self, provider_id: &str) -> Option<PerformanceMetrics> {
        self.metrics.read().await.get(provider_id).cloned()
    }

    async fn record_failure(&self, provider_id: &str) {
        let mut history = self.failure_history.write().await;
        let entry = history.entry(provider_id.to_string()).or_default();
        let now = Utc::now();
        entry.push_back(now);
        while entry
            .front()
            .is_some_and(|t| now.signed_duration_since(*t) > FAILURE_RETENTION)
        {
            entry.pop_front();
        }
    }

    /// Failures in the last 5 minutes, used by the failover intelligent
    /// selection score (spec §4.4.1).
    pub async fn recent_failure_count(&self, provider_id: &str) -> u32 {
        let now = Utc::now();
        self.failure_history
            .read()
            .await
            .get(provider_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|t| now.signed_duration_since(**t) <= RECENT_WINDOW)
                    .count() as u32
            })
            .unwrap_or(0)
    }

    pub async fn append_routing_history(&self, entry: RoutingHistoryEntry) {
        let mut history = self.routing_history.write().await;
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
    }

    pub async fn routing_history_snapshot(&self) -> Vec<RoutingHistoryEntry> {
        self.routing_history.read().await.iter().cloned().collect()
    }

    /// Aggregate counts, averages, per-provider usage and a sample of
    /// recent failures (spec §4.7).
    pub async fn get_statistics(&self) -> Value {
        let metrics = self.metrics.read().await;
        let history = self.routing_history.read().await;
        let failures = self.failure_history.read().await;

        let per_provider: HashMap<String, Value> = metrics
            .iter()
            .map(|(id, m)| {
                (
                    id.clone(),
                    json!({
                        "total": m.total,
                        "success": m.success,
                        "fail": m.fail,
                        "avgResponseTimeMs": m.avg_response_time_ms,
                        "successRatePercent": m.success_rate_percent,
                    }),
                )
            })
            .collect();

        let recent_failures: HashMap<String, usize> = failures
            .iter()
            .map(|(id, entries)| (id.clone(), entries.len()))
            .collect();

        json!({
            "providers": per_provider,
            "routingHistoryCount": history.len(),
            "recentFailureCounts": recent_failures,
        })
    }

    pub async fn clear_cache(&self) {
        self.metrics.write().await.clear();
        self.routing_history.write().await.clear();
        self.failure_history.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sample_sets_ema_directly() {
        let cache = PerformanceCache::new();
        cache
            .update_provider_performance("p1", 200, true, None)
            .await;
        let m = cache.metrics_for("p1").await.unwrap();
        assert_eq!(m.avg_response_time_ms, 200.0);
        assert_eq!(m.success_rate_percent, 100.0);
    }

    #[tokio::test]
    async fn ema_bounds_hold_after_mixed_updates() {
        let cache = PerformanceCache::new();
        cache.update_provider_performance("p1", 100, true, None).await;
        cache
            .update_provider_performance("p1", 900, false, Some("timeout"))
            .await;
        let m = cache.metrics_for("p1").await.unwrap();
        assert!(m.success_rate_percent >= 0.0 && m.success_rate_percent <= 100.0);
        assert!(m.avg_response_time_ms >= 0.0);
        assert_eq!(m.error_types.get("timeout"), Some(&1));
    }

    #[tokio::test]
    async fn routing_history_is_fifo_bounded() {
        let cache = PerformanceCache::new();
        for i in 0..(HISTORY_CAPACITY + 10) {
            cache
                .append_routing_history(RoutingHistoryEntry {
                    timestamp: Utc::now(),
                    request_id: format!("r{i}"),
                    request_type: crate::models::RequestType::Regular,
                    required_capabilities: vec![],
                    candidate_count: 1,
                    selected_provider_id: Some("p1".to_string()),
                    decision: "priority:p1".to_string(),
                    reason: "highest-priority candidate; no other strategy matched".to_string(),
                    routing_time_ms: 1,
                    success: true,
                })
                .await;
        }
        let snapshot = cache.routing_history_snapshot().await;
        assert_eq!(snapshot.len(), HISTORY_CAPACITY);
        assert_eq!(snapshot.first().unwrap().request_id, "r10");
    }
}
