//! Chat-stream client tests against a local SSE server

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;

use vox_bridge::chat::{ChatClient, StreamChat};
use vox_bridge::config::GatewayConfig;
use vox_bridge::Error;

#[derive(Clone, Default)]
struct Captured {
    headers: Arc<Mutex<Vec<(String, String)>>>,
    body: Arc<Mutex<String>>,
}

async fn sse_reply(State(captured): State<Captured>, headers: HeaderMap, body: String) -> String {
    let mut seen = captured.headers.lock().unwrap();
    for name in ["authorization", "x-openclaw-agent-id", "x-openclaw-session-key"] {
        if let Some(value) = headers.get(name) {
            seen.push((name.to_string(), value.to_str().unwrap_or("").to_string()));
        }
    }
    *captured.body.lock().unwrap() = body;

    concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi \"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"there. \"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"How are you?\"}}]}\n",
        "data: [DONE]\n",
    )
    .to_string()
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn gateway_config(url: String) -> GatewayConfig {
    GatewayConfig {
        url,
        token: "secret-token".to_string(),
        session_key: "voice:test".to_string(),
        agent_id: "voice".to_string(),
        model: "openclaw".to_string(),
    }
}

#[tokio::test]
async fn streams_sentences_in_order_with_gateway_headers() {
    let captured = Captured::default();
    let url = serve(
        Router::new()
            .route("/v1/chat/completions", post(sse_reply))
            .with_state(captured.clone()),
    )
    .await;

    let client = ChatClient::new(reqwest::Client::new(), gateway_config(url));
    let cancel = CancellationToken::new();
    let sentences = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&sentences);
    let mut on_sentence = move |sentence: String| -> vox_bridge::chat::SentenceFuture {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().unwrap().push(sentence);
        })
    };

    let full = client
        .stream_reply("hello", &cancel, &mut on_sentence)
        .await
        .unwrap();

    assert_eq!(full, "Hi there. How are you?");
    assert_eq!(
        *sentences.lock().unwrap(),
        vec!["Hi there.".to_string(), "How are you?".to_string()]
    );

    let headers = captured.headers.lock().unwrap();
    assert!(headers.contains(&("authorization".to_string(), "Bearer secret-token".to_string())));
    assert!(headers.contains(&("x-openclaw-agent-id".to_string(), "voice".to_string())));
    assert!(headers.contains(&("x-openclaw-session-key".to_string(), "voice:test".to_string())));

    let body = captured.body.lock().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["model"], "openclaw");
    assert_eq!(parsed["stream"], true);
    assert_eq!(parsed["messages"][0]["role"], "user");
    assert_eq!(parsed["messages"][0]["content"], "hello");
}

#[tokio::test]
async fn non_2xx_is_a_chat_error() {
    let url = serve(Router::new().route(
        "/v1/chat/completions",
        post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream sad") }),
    ))
    .await;

    let client = ChatClient::new(reqwest::Client::new(), gateway_config(url));
    let cancel = CancellationToken::new();
    let mut on_sentence = |_s: String| -> vox_bridge::chat::SentenceFuture { Box::pin(async {}) };

    let err = client
        .stream_reply("hello", &cancel, &mut on_sentence)
        .await
        .unwrap_err();
    match err {
        Error::Chat(message) => {
            assert!(message.contains("502"));
            assert!(message.contains("upstream sad"));
        }
        other => panic!("expected chat error, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_reply_is_an_error() {
    let url = serve(Router::new().route(
        "/v1/chat/completions",
        post(|| async { "data: [DONE]\n".to_string() }),
    ))
    .await;

    let client = ChatClient::new(reqwest::Client::new(), gateway_config(url));
    let cancel = CancellationToken::new();
    let mut on_sentence = |_s: String| -> vox_bridge::chat::SentenceFuture { Box::pin(async {}) };

    let err = client
        .stream_reply("hello", &cancel, &mut on_sentence)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Chat(m) if m == "Empty response"));
}

#[tokio::test]
async fn pre_cancelled_token_aborts_immediately() {
    let url = serve(Router::new().route(
        "/v1/chat/completions",
        post(|| async { "data: [DONE]\n".to_string() }),
    ))
    .await;

    let client = ChatClient::new(reqwest::Client::new(), gateway_config(url));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut on_sentence = |_s: String| -> vox_bridge::chat::SentenceFuture { Box::pin(async {}) };

    let err = client
        .stream_reply("hello", &cancel, &mut on_sentence)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}
