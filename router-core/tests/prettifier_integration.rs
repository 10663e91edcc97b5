//! End-to-end exercises of `Router::route` through to the Prettifier,
//! confirming the provider's completion body (not the wire-level
//! `Response` envelope) is what reaches tool-call/thinking extraction
//! (spec §4.6, §6.2).

use std::sync::Arc;

use router_core::circuit_breaker::CircuitBreakerConfig;
use router_core::failover::FailoverConfig;
use router_core::models::{Choice, Message, Request, Response, ResponseMessage};
use router_core::prettifier::PrettifierConfig;
use router_core::providers::mock::{all_capabilities, MockProvider, ScriptedOutcome};
use router_core::registry::ProviderRegistry;
use router_core::routing::RoutingEngineConfig;
use router_core::Router;

fn request() -> Request {
    Request {
        model: "claude-3".into(),
        messages: vec![Message::user("what's the weather")],
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

fn response_with_content(content: &str) -> Response {
    Response {
        id: "resp-1".into(),
        object: "chat.completion".into(),
        created: 0,
        model: "claude-3".into(),
        choices: vec![Choice {
            index: 0,
            message: Some(ResponseMessage {
                role: Some("assistant".into()),
                content: Some(content.to_string()),
                tool_calls: None,
            }),
            delta: None,
            finish_reason: Some("stop".into()),
        }],
        usage: None,
        provider: "anthropic".into(),
        response_time_ms: Some(5),
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
        CircuitBreakerConfig::default(),
        PrettifierConfig::default(),
    )
}

/// Embedded XML `<function_calls>` markup in the completion body is
/// extracted into structured tool calls, and stripped from the visible
/// content — never the serialized `Response` wrapper around it.
#[tokio::test]
async fn xml_tool_call_in_completion_body_is_extracted() {
    let body = r#"Let me check that.
<function_calls><invoke name="get_weather"><parameter name="city">"Paris"</parameter></invoke></function_calls>
Done."#;
    let provider = MockProvider::new(
        "anthropic",
        10,
        all_capabilities(),
        vec![ScriptedOutcome::Success(response_with_content(body))],
    );
    let router = router_with(vec![provider]).await;

    let envelope = router.route(&request()).await.unwrap();
    let calls = envelope.tool_calls.expect("expected extracted tool call");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "get_weather");
    assert_eq!(calls[0].parameters["city"], "Paris");
    assert!(envelope.content.contains("Let me check that."));
    assert!(envelope.content.contains("Done."));
    assert!(!envelope.content.contains("<function_calls>"));
    // The wire-level envelope fields must never leak into the normalized
    // content — this is the exact shape the raw-content bug would have
    // produced if `Response` itself were serialized and handed in.
    assert!(!envelope.content.contains("chat.completion"));
    assert!(!envelope.content.contains("resp-1"));
}

/// A bare JSON `tool_use` envelope in the completion body is preferred
/// over XML, and `<thinking>` content nested inside a text part is pulled
/// into `reasoning` separately from the visible answer.
#[tokio::test]
async fn json_tool_use_in_completion_body_is_extracted() {
    let body = r#"{"content":[{"type":"tool_use","id":"call_1","name":"lookup","input":{"q":"rust"}},{"type":"text","text":"<thinking>searching docs</thinking>here you go"}]}"#;
    let provider = MockProvider::new(
        "anthropic",
        10,
        all_capabilities(),
        vec![ScriptedOutcome::Success(response_with_content(body))],
    );
    let router = router_with(vec![provider]).await;

    let envelope = router.route(&request()).await.unwrap();
    let calls = envelope.tool_calls.expect("expected extracted tool call");
    assert_eq!(calls[0].id.as_deref(), Some("call_1"));
    assert_eq!(calls[0].parameters["q"], "rust");
    assert_eq!(envelope.reasoning.as_deref(), Some("searching docs"));
    assert_eq!(envelope.content, "here you go");
}

/// Plain prose with no embedded markup passes through unchanged, with no
/// tool calls or reasoning reported.
#[tokio::test]
async fn plain_prose_passes_through_unchanged() {
    let provider = MockProvider::new(
        "anthropic",
        10,
        all_capabilities(),
        vec![ScriptedOutcome::Success(response_with_content(
            "just a normal answer, nothing embedded",
        ))],
    );
    let router = router_with(vec![provider]).await;

    let envelope = router.route(&request()).await.unwrap();
    assert!(envelope.tool_calls.is_none());
    assert!(envelope.reasoning.is_none());
    assert_eq!(envelope.content, "just a normal answer, nothing embedded");
}

/// When the completion body is missing entirely (no `message`/`delta`),
/// the router still produces an envelope rather than panicking, with an
/// empty content string flowing through extraction.
#[tokio::test]
async fn missing_completion_body_falls_back_to_empty_content() {
    let empty = Response {
        id: "resp-2".into(),
        object: "chat.completion".into(),
        created: 0,
        model: "claude-3".into(),
        choices: vec![Choice {
            index: 0,
            message: None,
            delta: None,
            finish_reason: Some("stop".into()),
        }],
        usage: None,
        provider: "anthropic".into(),
        response_time_ms: Some(1),
        metadata: None,
    };
    let provider = MockProvider::new(
        "anthropic",
        10,
        all_capabilities(),
        vec![ScriptedOutcome::Success(empty)],
    );
    let router = router_with(vec![provider]).await;

    let envelope = router.route(&request()).await.unwrap();
    assert_eq!(envelope.content, "");
}
