#![cfg(feature = "remote")]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use robata::engine::{GenerationParams, InferenceEngine};
use robata::remote::RemoteClient;
use robata::EngineError;

const DEFAULT_REPLY: &str = "hello wEND orld";

type Received = Arc<Mutex<Vec<Value>>>;

/// A `/generate` endpoint that echoes the prompt and then streams `reply` one
/// character at a time, as cumulative frames split across chunk boundaries.
async fn generate(State(received): State<Received>, Json(body): Json<Value>) -> Response {
    received.lock().unwrap().push(body.clone());

    let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
    let reply = body["reply"].as_str().unwrap_or(DEFAULT_REPLY).to_string();
    let frames: Vec<String> = reply
        .char_indices()
        .map(|(i, c)| format!("{prompt}{}", &reply[..i + c.len_utf8()]))
        .collect();

    if body["stream"] == true {
        let mut chunks = vec![];
        for frame in frames {
            let encoded = format!("{}\0", json!({ "text": [frame] }));
            let (head, tail) = encoded.split_at(encoded.len() / 2);
            chunks.push(head.to_string());
            chunks.push(tail.to_string());
        }
        Body::from_stream(stream::iter(chunks.into_iter().map(Ok::<_, Infallible>))).into_response()
    } else {
        let last = frames.last().cloned().unwrap_or_default();
        json!({ "text": [last] }).to_string().into_response()
    }
}

async fn unavailable() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn malformed() -> &'static str {
    "{\"text\": [\"ok\"]}\0{\"output\": [\"oops\"]}\0{\"text\": [\"never\"]}\0"
}

async fn trailing() -> &'static str {
    "{\"text\": [\"partial\"]}\0{\"text\": [\"final answer\"]}"
}

async fn start_server() -> (SocketAddr, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/generate", post(generate))
        .route("/down/generate", post(unavailable))
        .route("/malformed/generate", post(malformed))
        .route("/trailing/generate", post(trailing))
        .with_state(received.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, received)
}

async fn collect(client: &RemoteClient, prompt: &str, params: &GenerationParams) -> Vec<String> {
    let stream = client.generate_stream(prompt, params).await.unwrap();
    stream.map(|item| item.unwrap()).collect().await
}

#[tokio::test]
async fn test_stream_trims_echo_and_suppresses_stop() {
    let (addr, _) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}/"));
    let params = GenerationParams::default().with_stop("END");

    let emitted = collect(&client, "Q: ", &params).await;
    assert_eq!(emitted.first().map(String::as_str), Some("h"));
    assert_eq!(emitted.last().map(String::as_str), Some("hello w"));
    for text in &emitted {
        assert!(!text.starts_with("Q: "));
        assert!(!text.ends_with('E') && !text.ends_with("EN") && !text.contains("END"));
        assert!(!text.contains("orld"));
    }
}

#[tokio::test]
async fn test_stream_keeps_prompt_when_echo_requested() {
    let (addr, _) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}"));
    let params = GenerationParams::default().with_echo_prompt(true);

    let emitted = collect(&client, "Q: ", &params).await;
    assert_eq!(emitted.first().map(String::as_str), Some("Q: h"));
    assert_eq!(emitted.last().map(String::as_str), Some("Q: hello wEND orld"));
}

#[tokio::test]
async fn test_withheld_fragment_released_when_disproven() {
    let (addr, _) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}"));
    let params = GenerationParams::default()
        .with_stop("END")
        .with_param("reply", "wEN continues");

    let emitted = collect(&client, "", &params).await;
    assert!(!emitted.iter().any(|text| text == "wE" || text == "wEN"));
    assert!(emitted.contains(&"wEN ".to_string()));
    assert_eq!(emitted.last().map(String::as_str), Some("wEN continues"));
}

#[tokio::test]
async fn test_request_body_on_the_wire() {
    let (addr, received) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}"));
    let params = GenerationParams::default()
        .with_max_new_tokens(32)
        .with_stop("END")
        .with_param("temperature", 0.5);

    collect(&client, "Q: ", &params).await;

    let body = received.lock().unwrap()[0].clone();
    assert_eq!(body["prompt"], "Q: ");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 32);
    assert_eq!(body["stop"], json!(["END"]));
    assert_eq!(body["temperature"], 0.5);
}

#[tokio::test]
async fn test_generate_returns_final_visible_answer() {
    let (addr, received) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}"));
    let params = GenerationParams::default().with_stop(vec!["END"]);

    let answer = client.generate("Q: ", &params).await.unwrap();
    assert_eq!(answer, "hello w");
    assert_eq!(received.lock().unwrap()[0]["stream"], false);
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let (addr, _) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}/down"));

    let result = client.generate_stream("q", &GenerationParams::default()).await;
    assert!(matches!(result, Err(EngineError::Status(503))));
}

#[tokio::test]
async fn test_malformed_frame_aborts_stream() {
    let (addr, _) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}/malformed"));

    let items: Vec<_> = client
        .generate_stream("", &GenerationParams::default())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "ok");
    assert!(matches!(items[1], Err(EngineError::Protocol(_))));
}

#[tokio::test]
async fn test_generate_prefers_undelimited_final_frame() {
    let (addr, _) = start_server().await;
    let client = RemoteClient::new(format!("http://{addr}/trailing"));

    let answer = client.generate("", &GenerationParams::default()).await.unwrap();
    assert_eq!(answer, "final answer");
}
