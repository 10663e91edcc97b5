//! Hand-rolled `Provider` used by tests, in place of an HTTP-mocking crate
//! (no concrete HTTP client ships in this crate — see spec §1). Scripted
//! to return a fixed response queue, analogous to the teacher's
//! `CustomProvider` test fixture in `ultrafast-models-sdk`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::ProviderError;
use crate::models::{
    Choice, HealthStatus, ProviderCapabilities, ProviderConfig, ProviderHealth, Request, Response,
};
use crate::providers::Provider;

pub enum ScriptedOutcome {
    Success(Response),
    Fail(ProviderError),
}

pub struct MockProvider {
    id: String,
    priority: i32,
    enabled: bool,
    capabilities: ProviderCapabilities,
    config: ProviderConfig,
    script: Mutex<Vec<ScriptedOutcome>>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
}

impl MockProvider {
    /// A provider that always succeeds and advertises every capability.
    pub fn healthy(id: &str, priority: i32) -> Self {
        Self::new(id, priority, all_capabilities(), Vec::new())
    }

    pub fn new(
        id: &str,
        priority: i32,
        capabilities: ProviderCapabilities,
        script: Vec<ScriptedOutcome>,
    ) -> Self {
        Self {
            id: id.to_string(),
            priority,
            enabled: true,
            capabilities,
            config: ProviderConfig {
                api_key: "test-key".to_string(),
                base_url: None,
                models_url: None,
                timeout_ms: 5_000,
                max_retries: 0,
                retry_delay_ms: 0,
            },
            script: Mutex::new(script),
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn all_capabilities() -> ProviderCapabilities {
    ProviderCapabilities {
        thinking: true,
        vision: true,
        tools: true,
        streaming: true,
        system_messages: true,
        temperature: true,
        top_p: true,
        max_tokens: 128_000,
        max_output_tokens: Some(4096),
    }
}

fn default_success(provider_id: &str, model: &str) -> Response {
    Response {
        id: "resp-1".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(crate::models::ResponseMessage {
                role: Some("assistant".to_string()),
                content: Some("ok".to_string()),
                tool_calls: None,
            }),
            delta: None,
            finish_reason: Some("stop".to_string()),
        }],
        usage: None,
        provider: provider_id.to_string(),
        response_time_ms: Some(1),
        metadata: None,
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn make_request(&self, request: &Request) -> Result<Response, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if index < script.len() {
            match std::mem::replace(&mut script[index], ScriptedOutcome::Fail(ProviderError::Cancelled)) {
                ScriptedOutcome::Success(r) => Ok(r),
                ScriptedOutcome::Fail(e) => Err(e),
            }
        } else {
            Ok(default_success(&self.id, &request.model))
        }
    }

    async fn health_check(&self, _full: bool) -> ProviderHealth {
        ProviderHealth {
            status: if self.enabled {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            response_time_ms: Some(1),
            last_check: Utc::now(),
            error_rate: Some(0.0),
            error_message: None,
            uptime_percent: Some(100.0),
            capability_status: None,
        }
    }
}
