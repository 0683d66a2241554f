//! Integration tests: the Ollama adapter against a mock server serving canned NDJSON.

mod common;

use codepilot::history::ConversationTurn;
use codepilot::llm::{
    ChatRequest, Endpoint, GenerateRequest, LlmBackend, LlmError, ModelOptions, OllamaClient,
    RequestSettings, StopTokens, ToolDefinition,
};
use mockito::Matcher;
use serde_json::json;

fn settings(url: String, num_predict: u32) -> RequestSettings {
    RequestSettings {
        endpoint: Endpoint::new(url),
        model: "qwen2.5-coder:7b".to_string(),
        options: ModelOptions {
            num_ctx: 4096,
            num_predict,
            ..ModelOptions::default()
        },
        stop: StopTokens {
            model_stop: vec!["<|endoftext|>".into()],
            user_stop: vec!["\n\n\n".into()],
        },
    }
}

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines.iter().map(|l| format!("{}\n", l)).collect()
}

#[tokio::test]
async fn chat_streams_text_and_collects_tool_calls() {
    let mut server = mockito::Server::new_async().await;
    let body = ndjson(&[
        json!({"message": {"role": "assistant", "content": "", "thinking": "need the file"}, "done": false}),
        json!({"message": {"role": "assistant", "content": "Let me "}, "done": false}),
        json!({"message": {"role": "assistant", "content": "look."}, "done": false}),
        json!({"message": {"role": "assistant", "content": "", "tool_calls": [
            {"function": {"name": "readFile", "arguments": {"path": "a.ts"}}}
        ]}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true, "eval_count": 12, "prompt_eval_count": 40}),
    ]);
    let mock = server
        .mock("POST", "/api/chat")
        .match_body(Matcher::PartialJson(json!({
            "model": "qwen2.5-coder:7b",
            "stream": true,
            "think": true,
            "options": {"num_ctx": 4096, "num_predict": 64, "stop": ["<|endoftext|>", "\n\n\n"]},
            "tools": [{"type": "function", "function": {"name": "readFile", "parameters": {"type": "object"}}}]
        })))
        .with_status(200)
        .with_header("content-type", "application/x-ndjson")
        .with_body(body)
        .create_async()
        .await;

    let settings = settings(server.url(), 64);
    let messages = vec![ConversationTurn::user("what is in a.ts?")];
    let tools = vec![ToolDefinition::function("readFile", None, Some(json!({"type": "object"})))];
    let mut chunks = Vec::new();
    let result = OllamaClient::default()
        .chat(
            ChatRequest {
                settings: &settings,
                messages: &messages,
                tools: &tools,
                think: true,
            },
            &mut |s: &str| chunks.push(s.to_string()),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(chunks, vec!["Let me ", "look."]);
    assert_eq!(result.content, "Let me look.");
    assert_eq!(result.thinking_text.as_deref(), Some("need the file"));
    assert!(!result.truncated);
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].name, "readFile");
    assert_eq!(result.tool_calls[0].arguments_json, r#"{"path":"a.ts"}"#);
    assert!(!result.tool_calls[0].id.is_empty());
}

#[tokio::test]
async fn chat_sends_bearer_token() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/chat")
        .match_header("authorization", "Bearer secret-token")
        .with_status(200)
        .with_body(ndjson(&[json!({"message": {"role": "assistant", "content": "hi"}, "done": true})]))
        .create_async()
        .await;

    let mut settings = settings(server.url(), 64);
    settings.endpoint = settings.endpoint.with_token(Some("secret-token".into()));
    let messages = vec![ConversationTurn::user("hello")];
    let result = OllamaClient::default()
        .chat(
            ChatRequest {
                settings: &settings,
                messages: &messages,
                tools: &[],
                think: false,
            },
            &mut |_: &str| {},
        )
        .await
        .unwrap();
    mock.assert_async().await;
    assert_eq!(result.content, "hi");
    assert!(result.tool_calls.is_empty());
}

#[tokio::test]
async fn generate_normalizes_fenced_truncated_output() {
    let mut server = mockito::Server::new_async().await;
    let body = ndjson(&[
        json!({"response": "```ts\n", "done": false}),
        json!({"response": "const a = 1;\n", "done": false}),
        json!({"response": "const b = ", "done": false}),
        json!({"response": "", "done": true, "eval_count": 32}),
    ]);
    server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({"prompt": "complete me", "system": "code only"})))
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let settings = settings(server.url(), 32);
    let out = OllamaClient::default()
        .generate(GenerateRequest {
            settings: &settings,
            prompt: "complete me",
            system: Some("code only"),
        })
        .await
        .unwrap();
    assert!(out.truncated);
    assert_eq!(out.text, "const a = 1;");
}

#[tokio::test]
async fn http_error_status_is_fatal() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(404)
        .with_body(r#"{"error":"model 'missing' not found"}"#)
        .create_async()
        .await;

    let settings = settings(server.url(), 64);
    let err = OllamaClient::default()
        .chat(
            ChatRequest {
                settings: &settings,
                messages: &[],
                tools: &[],
                think: false,
            },
            &mut |_: &str| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Api(msg) if msg.starts_with("404") && msg.contains("not found")));
}

#[tokio::test]
async fn error_line_mid_stream_keeps_emitted_text() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(ndjson(&[
            json!({"message": {"role": "assistant", "content": "partial"}, "done": false}),
            json!({"error": "model runner crashed"}),
        ]))
        .create_async()
        .await;

    let settings = settings(server.url(), 64);
    let mut chunks = Vec::new();
    let err = OllamaClient::default()
        .chat(
            ChatRequest {
                settings: &settings,
                messages: &[],
                tools: &[],
                think: false,
            },
            &mut |s: &str| chunks.push(s.to_string()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Api(msg) if msg == "model runner crashed"));
    assert_eq!(chunks, vec!["partial"]);
}

#[tokio::test]
async fn dropped_connection_is_a_request_error_after_partial_output() {
    let url = common::server_dropping_after(
        "{\"message\":{\"role\":\"assistant\",\"content\":\"half an \"},\"done\":false}\n",
    )
    .await;

    let settings = settings(url, 64);
    let messages = vec![ConversationTurn::user("explain")];
    let mut chunks = Vec::new();
    let err = OllamaClient::default()
        .chat(
            ChatRequest {
                settings: &settings,
                messages: &messages,
                tools: &[],
                think: false,
            },
            &mut |s: &str| chunks.push(s.to_string()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Request(_)), "got {:?}", err);
    assert_eq!(chunks, vec!["half an "]);
}
