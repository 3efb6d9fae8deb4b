//! OpenAI-compatible generator against a local stub server

use evalboard_core::{GenerationError, GenerationRequest, ResponseGenerator};
use evalboard_server::OpenAiCompatibleGenerator;
use serde_json::{json, Value};
use std::net::SocketAddr;
use warp::http::StatusCode;
use warp::Filter;

/// Serve `/v1/chat/completions`, echoing the prompt unless it is `fail`
async fn stub_server() -> SocketAddr {
    let completions = warp::path!("v1" / "chat" / "completions")
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::json())
        .map(|auth: Option<String>, body: Value| {
            let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
            if prompt == "fail" {
                return warp::reply::with_status(
                    warp::reply::json(&json!({ "error": "overloaded" })),
                    StatusCode::SERVICE_UNAVAILABLE,
                );
            }
            let content = format!(
                "{} says {prompt} (auth: {})",
                body["model"].as_str().unwrap_or_default(),
                auth.is_some()
            );
            warp::reply::with_status(
                warp::reply::json(&json!({
                    "choices": [{ "message": { "role": "assistant", "content": content } }],
                    "usage": { "total_tokens": 12 }
                })),
                StatusCode::OK,
            )
        });

    let (addr, server) = warp::serve(completions).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn request(input: &str) -> GenerationRequest {
    GenerationRequest {
        input: input.into(),
        provider_id: "local".into(),
        model_id: "tiny".into(),
    }
}

#[tokio::test]
async fn completes_chat_request() {
    let addr = stub_server().await;
    let generator =
        OpenAiCompatibleGenerator::new(&format!("http://{addr}/v1"), Some("secret".into()));

    let out = generator.generate(&request("hello")).await.unwrap();
    assert_eq!(out.output, "tiny says hello (auth: true)");
    assert_eq!(out.token_count, Some(12));
}

#[tokio::test]
async fn error_status_becomes_retryable_http_error() {
    let addr = stub_server().await;
    let generator = OpenAiCompatibleGenerator::new(&format!("http://{addr}/v1/"), None);

    let err = generator.generate(&request("fail")).await.unwrap_err();
    match &err {
        GenerationError::Http { status, body } => {
            assert_eq!(*status, 503);
            assert!(body.contains("overloaded"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unreachable_server_is_transport_error() {
    let generator = OpenAiCompatibleGenerator::new("http://127.0.0.1:9", None);
    let err = generator.generate(&request("hello")).await.unwrap_err();
    assert!(matches!(err, GenerationError::Transport(_)));
}
