//! Mock OpenAI-compatible inference server with an admin endpoint, for integration tests.
//! Each server runs on its own thread and runtime, on a free port, and is left running when the test ends.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib::config::ServerConfig;
use lib::llm::InferenceClient;

/// What the mock does; tests adjust it between requests.
#[derive(Debug, Clone)]
pub struct Plan {
    pub tokens: Vec<String>,
    /// Raw text sent after the tokens instead of `data: [DONE]`.
    pub tail: Option<String>,
    /// Delay before each streamed line.
    pub line_delay: Duration,
    /// Answer completions with this status and a plain body.
    pub fail_status: Option<u16>,
    pub summary: String,
    pub model: String,
    /// `/v1/models` answers 503 while set.
    pub models_down: bool,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            tokens: vec!["t1".into(), "t2".into(), "t3".into()],
            tail: None,
            line_delay: Duration::ZERO,
            fail_status: None,
            summary: "SUMMARY".into(),
            model: "m1".into(),
            models_down: false,
        }
    }
}

#[derive(Default)]
struct Shared {
    plan: Plan,
    requests: Vec<Value>,
    switches: Vec<String>,
}

#[derive(Clone)]
pub struct MockServer {
    pub url: String,
    shared: Arc<Mutex<Shared>>,
}

impl MockServer {
    pub fn start(plan: Plan) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            plan,
            ..Default::default()
        }));
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .route("/v1/models", get(models))
            .route("/admin/switch_model", post(switch_model))
            .with_state(shared.clone());

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("mock runtime");
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind free port");
                tx.send(listener.local_addr().expect("local_addr"))
                    .expect("send addr");
                axum::serve(listener, app).await.expect("serve");
            });
        });
        let addr = rx.recv().expect("mock server address");
        Self {
            url: format!("http://{}", addr),
            shared,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Plan)) {
        f(&mut self.shared.lock().unwrap().plan);
    }

    /// Request bodies received on /v1/chat/completions, oldest first.
    pub fn requests(&self) -> Vec<Value> {
        self.shared.lock().unwrap().requests.clone()
    }

    pub fn switches(&self) -> Vec<String> {
        self.shared.lock().unwrap().switches.clone()
    }

    pub fn model(&self) -> String {
        self.shared.lock().unwrap().plan.model.clone()
    }

    /// Client using this server as both inference and admin root, with short polling.
    pub fn client(&self) -> InferenceClient {
        InferenceClient::new(&self.url, &self.url, fast_server_config())
    }
}

pub fn fast_server_config() -> ServerConfig {
    ServerConfig {
        stream_timeout_secs: 10,
        summary_timeout_secs: 10,
        admin_timeout_secs: 2,
        poll_timeout_secs: 1,
        ready_timeout_secs: 1,
        poll_interval_ms: 20,
        ..ServerConfig::default()
    }
}

pub fn temp_data_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("palaver-it-{}-{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Roles and contents of a recorded request's `messages`.
pub fn wire_messages(request: &Value) -> Vec<(String, String)> {
    request["messages"]
        .as_array()
        .map(|a| {
            a.iter()
                .map(|m| {
                    (
                        m["role"].as_str().unwrap_or_default().to_string(),
                        m["content"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn sse(value: Value) -> String {
    format!("data: {}\n\n", value)
}

async fn completions(
    State(shared): State<Arc<Mutex<Shared>>>,
    Json(body): Json<Value>,
) -> Response {
    let plan = {
        let mut s = shared.lock().unwrap();
        s.requests.push(body.clone());
        s.plan.clone()
    };
    if let Some(status) = plan.fail_status {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "model exploded").into_response();
    }
    if !body["stream"].as_bool().unwrap_or(false) {
        return Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": plan.summary } }]
        }))
        .into_response();
    }

    let mut lines = vec![
        ": keep-alive\n\n".to_string(),
        sse(json!({ "choices": [{ "delta": { "role": "assistant" } }] })),
    ];
    for t in &plan.tokens {
        lines.push(sse(json!({ "choices": [{ "delta": { "content": t } }] })));
    }
    lines.push(plan.tail.unwrap_or_else(|| "data: [DONE]\n\n".to_string()));

    let delay = plan.line_delay;
    let stream = futures_util::stream::iter(lines).then(move |line| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, std::io::Error>(line)
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn models(State(shared): State<Arc<Mutex<Shared>>>) -> Response {
    let s = shared.lock().unwrap();
    if s.plan.models_down {
        return (StatusCode::SERVICE_UNAVAILABLE, "loading").into_response();
    }
    Json(json!({ "object": "list", "data": [{ "id": s.plan.model, "object": "model" }] }))
        .into_response()
}

async fn switch_model(
    State(shared): State<Arc<Mutex<Shared>>>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let Some(model) = q.get("model") else {
        return (StatusCode::BAD_REQUEST, "missing model").into_response();
    };
    let mut s = shared.lock().unwrap();
    s.switches.push(model.clone());
    s.plan.model = model.clone();
    Json(json!({ "ok": true })).into_response()
}
