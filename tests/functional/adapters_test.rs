//! Functional tests for the synchronous JSON and multipart adapters

use gen_broker::backend::openai::OpenAiBackend;
use gen_broker::backend::stability::StabilityBackend;
use gen_broker::backend::{
    GenerationConfig, Payload, ProgressEvent, ProviderAdapter, ProviderKind, SourceImage,
};
use gen_broker::config::ProviderConfig;
use gen_broker::error::AppError;
use gen_broker::response::base64;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D];
const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];

fn provider(endpoint: &str) -> ProviderConfig {
    ProviderConfig {
        enabled: true,
        api_key: Some("sk-test".to_string()),
        endpoint: Some(endpoint.to_string()),
        timeout_ms: 5_000,
        ..Default::default()
    }
}

fn openai(server: &MockServer) -> OpenAiBackend {
    OpenAiBackend::new(ProviderKind::OpenAi, &provider(&server.uri())).unwrap()
}

fn stability(server: &MockServer) -> StabilityBackend {
    StabilityBackend::new(&provider(&server.uri())).unwrap()
}

fn completion(message: serde_json::Value) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{ "index": 0, "message": message, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12 }
    })
}

#[tokio::test]
async fn test_openai_text_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [
                { "role": "system", "content": "Be brief." },
                { "role": "user", "content": "Say hi" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(json!({
            "role": "assistant",
            "content": "Hi!"
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let config = GenerationConfig {
        system_prompt: Some("Be brief.".to_string()),
        ..Default::default()
    };
    let result = openai(&server)
        .generate_text("Say hi", "gpt-4o-mini", &config)
        .await
        .unwrap();

    assert_eq!(result.payload, Payload::Text("Hi!".to_string()));
    assert_eq!(result.backend, ProviderKind::OpenAi);
    assert_eq!(result.usage.map(|u| u.total_tokens), Some(12));
}

#[tokio::test]
async fn test_openai_image_from_embedded_data_uri() {
    let server = MockServer::start().await;
    let data_uri = base64::create_data_uri(PNG, "image/png");
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "modalities": ["image", "text"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(json!({
            "role": "assistant",
            "content": "Here is your image.",
            "images": [{ "type": "image_url", "image_url": { "url": data_uri } }]
        }))))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::channel(4);
    let result = openai(&server)
        .generate_image("a red fox", "gpt-image", &GenerationConfig::default(), Some(&tx))
        .await
        .unwrap();

    assert_eq!(
        result.payload,
        Payload::Image {
            bytes: PNG.to_vec(),
            mime: "image/png".to_string()
        }
    );
    assert_eq!(rx.recv().await, Some(ProgressEvent::Finalizing));
}

#[tokio::test]
async fn test_openai_image_downloaded_from_url() {
    let server = MockServer::start().await;
    let image_url = format!("{}/files/fox.jpg", server.uri());
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(json!({
            "role": "assistant",
            "content": format!("![fox]({})", image_url)
        }))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/fox.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(JPEG.to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let result = openai(&server)
        .generate_image("a red fox", "gpt-image", &GenerationConfig::default(), None)
        .await
        .unwrap();

    match result.payload {
        Payload::Image { bytes, mime } => {
            assert_eq!(bytes, JPEG);
            assert_eq!(mime, "image/jpeg");
        }
        other => panic!("expected an image, got {other:?}"),
    }
}

#[tokio::test]
async fn test_openai_completion_without_image_is_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(json!({
            "role": "assistant",
            "content": "I can only describe foxes."
        }))))
        .mount(&server)
        .await;

    let err = openai(&server)
        .generate_image("a red fox", "gpt-image", &GenerationConfig::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Upstream { status: 200, .. }));
}

#[tokio::test]
async fn test_openai_streaming_forwards_deltas() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::channel(16);
    let result = openai(&server)
        .generate_text_streaming("Say hello", "gpt-4o-mini", &GenerationConfig::default(), tx)
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
    assert_eq!(result.payload, Payload::Text("Hello".to_string()));
    assert_eq!(result.usage.map(|u| u.total_tokens), Some(4));
}

#[tokio::test]
async fn test_openai_error_categories() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "busy" })))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "Rate limit reached", "type": "requests" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "broke" })))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "You exceeded your current quota", "code": "insufficient_quota" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "careful" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "Your request was rejected by our safety system", "code": "content_policy_violation" }
        })))
        .mount(&server)
        .await;

    let backend = openai(&server);
    let config = GenerationConfig::default();

    let busy = backend.generate_text("hi", "busy", &config).await.unwrap_err();
    assert!(matches!(busy, AppError::UpstreamRateLimited(ref m) if m == "Rate limit reached"));

    let broke = backend.generate_text("hi", "broke", &config).await.unwrap_err();
    assert!(matches!(broke, AppError::ProviderMisconfigured(_)));

    let careful = backend.generate_text("hi", "careful", &config).await.unwrap_err();
    assert!(matches!(careful, AppError::ContentRejected(_)));
}

#[tokio::test]
async fn test_openai_refusal_is_content_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(json!({
            "role": "assistant",
            "content": null,
            "refusal": "I can't help with that."
        }))))
        .mount(&server)
        .await;

    let err = openai(&server)
        .generate_text("something bad", "gpt-4o-mini", &GenerationConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ContentRejected(ref m) if m == "I can't help with that."));
}

#[tokio::test]
async fn test_unreachable_backend_is_transport_error() {
    let backend =
        OpenAiBackend::new(ProviderKind::LocalAi, &provider("http://127.0.0.1:1")).unwrap();

    let err = backend
        .generate_text("hi", "llama", &GenerationConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Transport(_)));
    assert_eq!(backend.kind(), ProviderKind::LocalAi);
}

#[tokio::test]
async fn test_stability_multipart_text_to_image() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/sd3"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("accept", "application/json"))
        .and(body_string_contains("a misty harbor"))
        .and(body_string_contains("sd3-large"))
        .and(body_string_contains("text-to-image"))
        .and(body_string_contains("16:9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::encode(PNG),
            "seed": 42,
            "finish_reason": "SUCCESS"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = GenerationConfig {
        width: Some(1344),
        height: Some(768),
        ..Default::default()
    };
    let (tx, mut rx) = mpsc::channel(4);
    let result = stability(&server)
        .generate_image("a misty harbor", "sd3-large", &config, Some(&tx))
        .await
        .unwrap();

    assert_eq!(result.backend, ProviderKind::Stability);
    assert_eq!(result.seed, Some(42));
    assert_eq!(
        result.payload,
        Payload::Image {
            bytes: PNG.to_vec(),
            mime: "image/png".to_string()
        }
    );
    assert_eq!(rx.recv().await, Some(ProgressEvent::Finalizing));
}

#[tokio::test]
async fn test_stability_image_to_image_uses_model_route() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/ultra"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::encode(PNG),
            "finish_reason": "SUCCESS"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = GenerationConfig {
        seed: Some(7),
        source_image: Some(SourceImage {
            data: PNG.to_vec(),
            strength: 0.6,
        }),
        ..Default::default()
    };
    let result = stability(&server)
        .generate_image("repaint it", "stable-image-ultra", &config, None)
        .await
        .unwrap();

    // The request seed is kept when the response has none
    assert_eq!(result.seed, Some(7));
}

#[tokio::test]
async fn test_stability_content_filtered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/sd3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "image": base64::encode(PNG),
            "seed": 1,
            "finish_reason": "CONTENT_FILTERED"
        })))
        .mount(&server)
        .await;

    let err = stability(&server)
        .generate_image("anything", "sd3-large", &GenerationConfig::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ContentRejected(_)));
}

#[tokio::test]
async fn test_stability_error_rewrites() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/sd3"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "name": "payment_required",
            "errors": ["You lack sufficient credits to make this request"]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2beta/stable-image/generate/core"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "name": "internal_error",
            "errors": ["worker crashed", "please retry"]
        })))
        .mount(&server)
        .await;

    let backend = stability(&server);
    let config = GenerationConfig::default();

    let credits = backend.generate_image("x", "sd3-large", &config, None).await.unwrap_err();
    assert!(matches!(credits, AppError::ProviderMisconfigured(_)));

    let crashed = backend.generate_image("x", "core", &config, None).await.unwrap_err();
    match crashed {
        AppError::Upstream { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "worker crashed; please retry");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
