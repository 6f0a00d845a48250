//! OpenAI-compatible backend against a fake chat completions server

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use beacon_voice::generation::{
    ChatMessage, GenerationBackend, GenerationFragment, GenerationRequest, OpenAiBackend,
    OpenAiConfig, ToolCall,
};
use beacon_voice::{Error, ErrorKind};

#[derive(Clone)]
enum Reply {
    Events(String),
    Body(Value),
    Status(StatusCode, &'static str),
}

struct Fake {
    reply: Reply,
    requests: Mutex<Vec<(Option<String>, Value)>>,
}

async fn chat(State(fake): State<Arc<Fake>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    fake.requests.lock().unwrap().push((auth, body));

    match fake.reply.clone() {
        Reply::Events(events) => ([(header::CONTENT_TYPE, "text/event-stream")], events).into_response(),
        Reply::Body(body) => Json(body).into_response(),
        Reply::Status(status, text) => (status, text).into_response(),
    }
}

async fn fake_server(reply: Reply) -> (SocketAddr, Arc<Fake>) {
    let fake = Arc::new(Fake {
        reply,
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .with_state(Arc::clone(&fake));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (addr, fake)
}

fn backend(addr: SocketAddr) -> OpenAiBackend {
    OpenAiBackend::new(
        "openai",
        OpenAiConfig {
            api_key: Some("sk-test".to_string()),
            base_url: format!("http://{addr}/v1"),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 200,
            temperature: None,
            streamable: true,
            connect_timeout: Duration::from_secs(2),
        },
    )
    .unwrap()
}

fn request() -> GenerationRequest {
    GenerationRequest {
        messages: vec![
            ChatMessage::system("Answer briefly."),
            ChatMessage::user("what time is it"),
        ],
        tools: Vec::new(),
    }
}

fn events(chunks: &[Value], done: bool) -> String {
    let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

fn delta(content: &str) -> Value {
    json!({"choices": [{"delta": {"content": content}}]})
}

#[tokio::test]
async fn streams_content_fragments() {
    let (addr, fake) = fake_server(Reply::Events(events(
        &[delta("It is "), delta("noon.")],
        true,
    )))
    .await;

    let fragments: Vec<GenerationFragment> = backend(addr)
        .stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(
        fragments,
        vec![
            GenerationFragment::Content("It is ".into()),
            GenerationFragment::Content("noon.".into()),
        ]
    );

    let requests = fake.requests.lock().unwrap();
    let (auth, body) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 200);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "what time is it");
    assert!(body.get("tools").is_none());
}

#[tokio::test]
async fn streams_tool_calls() {
    let (addr, _fake) = fake_server(Reply::Events(events(
        &[
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "set_timer", "arguments": "{\"minutes\":"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "5}"}}
            ]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ],
        true,
    )))
    .await;

    let fragments: Vec<GenerationFragment> = backend(addr)
        .stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(
        fragments,
        vec![GenerationFragment::ToolCall(ToolCall {
            id: "call_a".into(),
            name: "set_timer".into(),
            arguments: "{\"minutes\":5}".into(),
        })]
    );
}

#[tokio::test]
async fn truncated_stream_is_a_transport_error() {
    let (addr, _fake) = fake_server(Reply::Events(events(&[delta("It is")], false))).await;

    let items: Vec<_> = backend(addr)
        .stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert_eq!(
        items[0].as_ref().unwrap(),
        &GenerationFragment::Content("It is".into())
    );
    assert_eq!(items[1].as_ref().unwrap_err().kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn error_status_fails_the_request() {
    let (addr, _fake) = fake_server(Reply::Status(
        StatusCode::TOO_MANY_REQUESTS,
        "rate limited",
    ))
    .await;

    match backend(addr)
        .stream(request(), CancellationToken::new())
        .await
    {
        Err(Error::Generation(message)) => {
            assert!(message.contains("429"));
            assert!(message.contains("rate limited"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("request should fail"),
    }
}

#[tokio::test]
async fn single_shot_completion_strips_reasoning() {
    let (addr, fake) = fake_server(Reply::Body(json!({
        "choices": [{"message": {"content": "<think>noon?</think> It is noon."}}]
    })))
    .await;

    let completion = backend(addr)
        .complete(request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(completion.content, "It is noon.");
    assert!(completion.tool_calls.is_empty());
    assert_eq!(fake.requests.lock().unwrap()[0].1["stream"], false);
}

#[tokio::test]
async fn empty_completion_is_an_error() {
    let (addr, _fake) = fake_server(Reply::Body(json!({
        "choices": [{"message": {"content": "  "}}]
    })))
    .await;

    let err = backend(addr)
        .complete(request(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Generation(_)));
}
