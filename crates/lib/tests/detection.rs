//! Integration tests: backend detection and factory routing against mock servers.

use std::sync::Arc;

use codepilot::history::ConversationTurn;
use codepilot::llm::{
    detect_backend, BackendKind, ChatRequest, ClientFactory, DetectionCache, Detected, Endpoint,
    GenerateRequest, LlmBackend, LlmError, ModelOptions, RequestCategory, RequestSettings,
};
use serde_json::json;

#[tokio::test]
async fn ollama_is_detected_with_context_length() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/version")
        .with_status(200)
        .with_body(r#"{"version":"0.5.7"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/api/show")
        .with_status(200)
        .with_body(
            json!({"model_info": {"general.architecture": "qwen2", "qwen2.context_length": 32768}})
                .to_string(),
        )
        .create_async()
        .await;

    let cache = DetectionCache::new();
    let detected = cache
        .detect(
            &reqwest::Client::new(),
            RequestCategory::Completion,
            &Endpoint::new(server.url()),
            "qwen2.5-coder:1.5b",
        )
        .await
        .unwrap();
    assert_eq!(detected.backend, BackendKind::Ollama);
    assert_eq!(detected.context_length, Some(32768));
    assert_eq!(cache.get(RequestCategory::Completion), Some(detected));
    assert!(cache.get(RequestCategory::Instruction).is_none());
}

#[tokio::test]
async fn openai_style_server_is_detected_through_models() {
    let mut server = mockito::Server::new_async().await;
    // /api/version is not mocked, so the mock server answers 501 for it
    server
        .mock("GET", "/models")
        .with_status(200)
        .with_body(
            json!({"object": "list", "data": [
                {"id": "other", "max_model_len": 4096},
                {"id": "coder", "max_model_len": 16384}
            ]})
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    let cache = DetectionCache::new();
    let detected = cache
        .detect(
            &reqwest::Client::new(),
            RequestCategory::Instruction,
            &Endpoint::new(server.url()),
            "coder",
        )
        .await
        .unwrap();
    assert_eq!(detected.backend, BackendKind::OpenAi);
    assert_eq!(detected.context_length, Some(16384));
}

#[tokio::test]
async fn unknown_server_is_an_error() {
    let server = mockito::Server::new_async().await;
    let err = detect_backend(&reqwest::Client::new(), &Endpoint::new(server.url()))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Api(_)));
}

#[tokio::test]
async fn factory_routes_by_cache_and_follows_invalidation() {
    let mut server = mockito::Server::new_async().await;
    let ollama = server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body("{\"message\":{\"role\":\"assistant\",\"content\":\"from ollama\"},\"done\":true}\n")
        .create_async()
        .await;
    let openai = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"from openai\"}}]}\n\ndata: [DONE]\n\n")
        .create_async()
        .await;

    let cache = Arc::new(DetectionCache::new());
    let factory = ClientFactory::new(RequestCategory::Instruction, Arc::clone(&cache));
    let settings = RequestSettings {
        endpoint: Endpoint::new(server.url()),
        model: "m".into(),
        ..RequestSettings::default()
    };
    let messages = [ConversationTurn::user("who are you")];
    let request = ChatRequest {
        settings: &settings,
        messages: &messages,
        tools: &[],
        think: false,
    };

    let err = factory.chat(request, &mut |_: &str| {}).await.unwrap_err();
    assert!(matches!(err, LlmError::BackendNotDetected(RequestCategory::Instruction)));

    cache.set(RequestCategory::Instruction, Detected::new(BackendKind::Ollama));
    let r = factory.chat(request, &mut |_: &str| {}).await.unwrap();
    assert_eq!(r.content, "from ollama");

    cache.invalidate(RequestCategory::Instruction);
    cache.set(RequestCategory::Instruction, Detected::new(BackendKind::OpenAi));
    let r = factory.chat(request, &mut |_: &str| {}).await.unwrap();
    assert_eq!(r.content, "from openai");

    ollama.assert_async().await;
    openai.assert_async().await;
}

#[tokio::test]
async fn generate_respects_detected_context_length() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/generate")
        .with_status(200)
        .with_body("{\"response\":\"x = 1\",\"done\":true,\"eval_count\":3}\n")
        .expect(1)
        .create_async()
        .await;

    let cache = Arc::new(DetectionCache::new());
    let factory = ClientFactory::new(RequestCategory::Completion, Arc::clone(&cache));
    let settings = RequestSettings {
        endpoint: Endpoint::new(server.url()),
        model: "m".into(),
        options: ModelOptions {
            num_ctx: 8192,
            num_predict: 100,
            ..ModelOptions::default()
        },
        ..RequestSettings::default()
    };
    // 400 chars ~ 100 prompt tokens; output needs ceil(100 * 1.01) + 20 = 121
    let prompt = "a".repeat(400);
    let request = GenerateRequest {
        settings: &settings,
        prompt: &prompt,
        system: None,
    };

    cache.set(
        RequestCategory::Completion,
        Detected {
            context_length: Some(200),
            ..Detected::new(BackendKind::Ollama)
        },
    );
    let err = factory.generate(request).await.unwrap_err();
    assert!(matches!(err, LlmError::ContextOverflow { required: 121, available: 100 }));

    cache.set(
        RequestCategory::Completion,
        Detected {
            context_length: Some(4096),
            ..Detected::new(BackendKind::Ollama)
        },
    );
    let out = factory.generate(request).await.unwrap();
    assert_eq!(out.text, "x = 1");
    mock.assert_async().await;
}
