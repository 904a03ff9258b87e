//! End-to-end tests for the blocking chat loop against stub servers:
//! tool rounds, guardrails, caching, and resource auto-injection.

mod common;

use serde_json::{json, Value};

use common::{
    build_proxy, chat_request, spawn_backend, spawn_mcp_echo, text_response, tool_call_response,
};
use heddle::guardrails::GuardrailConfig;

fn echo_call(id: &str, text: &str) -> Value {
    json!([{
        "id": id,
        "type": "function",
        "function": {"name": "mcp.srv.echo", "arguments": json!({"text": text}).to_string()}
    }])
}

/// One tool round: the model calls `mcp.srv.echo`, the result is fed back,
/// and the second backend call sees the `role:"tool"` message.
#[tokio::test]
async fn tool_round_feeds_result_back_to_backend() {
    let mcp = spawn_mcp_echo(None).await;
    let backend = spawn_backend(vec![
        tool_call_response(echo_call("c1", "x")),
        text_response("done"),
    ])
    .await;
    let fixture = build_proxy(&backend.url, Some(&mcp), GuardrailConfig::default()).await;

    let outcome = fixture
        .proxy
        .completion(chat_request("hi"))
        .await
        .unwrap();
    assert!(!outcome.cached);

    let body: Value = serde_json::from_str(&outcome.body).unwrap();
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["choices"][0]["message"]["content"], "done");

    assert_eq!(backend.request_count(), 2);
    // First call attached the registry's tool schema.
    let first = backend.request(0);
    assert_eq!(first["tools"][0]["function"]["name"], "mcp.srv.echo");
    // Second call carries assistant tool_calls followed by the tool result.
    let second = backend.request(1);
    let messages = second["messages"].as_array().unwrap();
    let tool_msg = messages
        .iter()
        .find(|m| m["role"] == "tool")
        .expect("tool message in second backend call");
    assert_eq!(tool_msg["tool_call_id"], "c1");
    assert_eq!(tool_msg["content"], "x");
    let assistant_idx = messages.iter().position(|m| m["role"] == "assistant").unwrap();
    assert_eq!(
        messages[assistant_idx]["tool_calls"][0]["function"]["name"],
        "mcp.srv.echo"
    );

    // The echo call actually reached the MCP server.
    assert!(mcp.methods().iter().any(|m| m == "tools/call"));
}

/// Tool results keep the order of the originating calls.
#[tokio::test]
async fn tool_results_preserve_call_order() {
    let mcp = spawn_mcp_echo(None).await;
    let calls = json!([
        {"id": "c1", "type": "function", "function": {"name": "mcp.srv.echo", "arguments": "{\"text\":\"first\"}"}},
        {"id": "c2", "type": "function", "function": {"name": "mcp.srv.echo", "arguments": "{\"text\":\"second\"}"}}
    ]);
    let backend = spawn_backend(vec![tool_call_response(calls), text_response("ok")]).await;
    let fixture = build_proxy(&backend.url, Some(&mcp), GuardrailConfig::default()).await;

    fixture.proxy.completion(chat_request("go")).await.unwrap();

    let second = backend.request(1);
    let tool_messages: Vec<&Value> = second["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["role"] == "tool")
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0]["tool_call_id"], "c1");
    assert_eq!(tool_messages[0]["content"], "first");
    assert_eq!(tool_messages[1]["tool_call_id"], "c2");
    assert_eq!(tool_messages[1]["content"], "second");
}

/// Denied tools never reach the server; the model sees the denial text.
#[tokio::test]
async fn denylist_blocks_dispatch_before_any_rpc() {
    let mcp = spawn_mcp_echo(None).await;
    let backend = spawn_backend(vec![
        tool_call_response(echo_call("c1", "x")),
        text_response("understood"),
    ])
    .await;
    let fixture = build_proxy(
        &backend.url,
        Some(&mcp),
        GuardrailConfig {
            deny_tools: vec!["mcp.srv.*".into()],
            ..GuardrailConfig::default()
        },
    )
    .await;

    fixture.proxy.completion(chat_request("hi")).await.unwrap();

    // Setup traffic only; no tools/call.
    assert!(!mcp.methods().iter().any(|m| m == "tools/call"));
    let second = backend.request(1);
    let tool_msg = second["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "tool")
        .unwrap()
        .clone();
    assert!(tool_msg["content"].as_str().unwrap().contains("denied"));
}

/// The round cap ends the conversation with the guardrail text, HTTP-wise a
/// normal 200 completion.
#[tokio::test]
async fn round_cap_yields_guardrail_message() {
    let mcp = spawn_mcp_echo(None).await;
    // The backend asks for a tool in every round.
    let backend = spawn_backend(vec![tool_call_response(echo_call("c1", "x"))]).await;
    let fixture = build_proxy(
        &backend.url,
        Some(&mcp),
        GuardrailConfig {
            max_rounds: 2,
            ..GuardrailConfig::default()
        },
    )
    .await;

    let outcome = fixture.proxy.completion(chat_request("hi")).await.unwrap();
    let body: Value = serde_json::from_str(&outcome.body).unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "maximum tool rounds (2) exceeded"
    );
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    // Exactly two backend rounds ran before the cap hit.
    assert_eq!(backend.request_count(), 2);
}

/// The total-calls cap counts across rounds.
#[tokio::test]
async fn total_call_cap_ends_the_conversation() {
    let mcp = spawn_mcp_echo(None).await;
    let backend = spawn_backend(vec![tool_call_response(echo_call("c1", "x"))]).await;
    let fixture = build_proxy(
        &backend.url,
        Some(&mcp),
        GuardrailConfig {
            max_rounds: 100,
            max_total_calls: 2,
            ..GuardrailConfig::default()
        },
    )
    .await;

    let outcome = fixture.proxy.completion(chat_request("hi")).await.unwrap();
    let body: Value = serde_json::from_str(&outcome.body).unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "maximum total tool calls (2) exceeded"
    );
    // Round 0 dispatched one call; round 1's call would reach the cap.
    assert_eq!(backend.request_count(), 2);
}

/// An unknown namespaced name is a tool error the model can react to, not a
/// request failure.
#[tokio::test]
async fn unknown_tool_becomes_tool_error_message() {
    let mcp = spawn_mcp_echo(None).await;
    let calls = json!([{
        "id": "c1",
        "type": "function",
        "function": {"name": "mcp.srv.missing", "arguments": "{}"}
    }]);
    let backend = spawn_backend(vec![tool_call_response(calls), text_response("ok")]).await;
    let fixture = build_proxy(&backend.url, Some(&mcp), GuardrailConfig::default()).await;

    let outcome = fixture.proxy.completion(chat_request("hi")).await.unwrap();
    let body: Value = serde_json::from_str(&outcome.body).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "ok");

    let second = backend.request(1);
    let tool_msg = second["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "tool")
        .unwrap()
        .clone();
    assert_eq!(tool_msg["content"], "unknown tool: mcp.srv.missing");
}

/// Identical requests are served from the cache; the backend runs once.
#[tokio::test]
async fn repeated_request_hits_the_cache() {
    let backend = spawn_backend(vec![text_response("cached answer")]).await;
    let fixture = build_proxy(&backend.url, None, GuardrailConfig::default()).await;

    let first = fixture.proxy.completion(chat_request("hi")).await.unwrap();
    let second = fixture.proxy.completion(chat_request("hi")).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.body.as_str(), second.body.as_str());
    assert_eq!(backend.request_count(), 1);
    assert_eq!(fixture.cache.size(), 1);

    // A different message is a different fingerprint.
    fixture.proxy.completion(chat_request("bye")).await.unwrap();
    assert_eq!(backend.request_count(), 2);
}

/// `mcp://` references in assistant text are read and injected before the
/// tool results, once per unique URI.
#[tokio::test]
async fn resource_references_are_injected() {
    let mcp = spawn_mcp_echo(None).await;
    let with_uri = json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "m",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "Consulting mcp://srv/doc://greeting and mcp://srv/doc://greeting again",
                "tool_calls": echo_call("c1", "x")
            },
            "finish_reason": "tool_calls"
        }]
    });
    let backend = spawn_backend(vec![with_uri, text_response("done")]).await;
    let fixture = build_proxy(&backend.url, Some(&mcp), GuardrailConfig::default()).await;

    fixture.proxy.completion(chat_request("hi")).await.unwrap();

    let second = backend.request(1);
    let messages = second["messages"].as_array().unwrap();
    let injected: Vec<&Value> = messages
        .iter()
        .filter(|m| {
            m["role"] == "system"
                && m["content"]
                    .as_str()
                    .is_some_and(|c| c.starts_with("Resource mcp://srv/doc://greeting"))
        })
        .collect();
    // Duplicate reference, single injection.
    assert_eq!(injected.len(), 1);
    assert!(injected[0]["content"]
        .as_str()
        .unwrap()
        .contains("contents of doc://greeting"));
    assert!(mcp.methods().iter().any(|m| m == "resources/read"));
}

/// Backend failures surface as errors (the HTTP layer maps them to 502/503).
#[tokio::test]
async fn backend_unreachable_is_an_error() {
    let fixture = build_proxy("http://127.0.0.1:9", None, GuardrailConfig::default()).await;
    let err = fixture.proxy.completion(chat_request("hi")).await.unwrap_err();
    assert!(matches!(err, heddle::ProxyError::Backend(e) if e.is_unreachable()));
}

/// Oversized tool results are truncated with the marker before reaching the
/// conversation.
#[tokio::test]
async fn oversized_tool_results_are_truncated() {
    let mcp = spawn_mcp_echo(None).await;
    let big = "z".repeat(500);
    let backend = spawn_backend(vec![
        tool_call_response(echo_call("c1", &big)),
        text_response("ok"),
    ])
    .await;
    let fixture = build_proxy(
        &backend.url,
        Some(&mcp),
        GuardrailConfig {
            max_result_bytes: 100,
            ..GuardrailConfig::default()
        },
    )
    .await;

    fixture.proxy.completion(chat_request("hi")).await.unwrap();
    let second = backend.request(1);
    let content = second["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "tool")
        .unwrap()["content"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(content.ends_with(heddle::TRUNCATION_MARKER));
    assert!(content.len() <= 100 + heddle::TRUNCATION_MARKER.len());
}
