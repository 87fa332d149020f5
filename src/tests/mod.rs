//! Cross-module scenarios. Remote providers are served by an in-process
//! axum server on a random local port.


use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::app::App;
use crate::config::ProviderKind;

/// Request as seen by the mock embedding server.
#[derive(Debug, Clone)]
pub struct Captured {
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct MockState {
    dimensions: usize,
    requests: Arc<Mutex<Vec<Captured>>>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Captured>>>,
}

impl MockServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn captured(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }
}

/// Serve `POST /v1/embeddings`.
///
/// Token `bad` gets a 401, `boom` a 500 and `short` one vector too few.
/// Otherwise every input gets a `dimensions`-long vector derived from its
/// text, listed in reverse order with `index` fields.
pub async fn mock_embedding_server(dimensions: usize) -> MockServer {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        dimensions,
        requests: requests.clone(),
    };

    let router = Router::new()
        .route("/v1/embeddings", post(embeddings))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    MockServer { addr, requests }
}

async fn embeddings(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push(Captured {
        authorization: authorization.clone(),
        body: body.clone(),
    });

    match authorization.as_deref() {
        Some("Bearer bad") => {
            return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "invalid token"})));
        }
        Some("Bearer boom") => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": "overloaded"})));
        }
        _ => {}
    }

    let inputs: Vec<String> = body["input"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let mut data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(index, text)| json!({"index": index, "embedding": text_vector(text, state.dimensions)}))
        .collect();
    data.reverse();

    if authorization.as_deref() == Some("Bearer short") {
        data.pop();
    }

    (StatusCode::OK, Json(json!({"object": "list", "data": data})))
}

/// Vector the mock server returns for `text`.
pub fn text_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    for (i, c) in text.to_lowercase().chars().enumerate() {
        vector[i % dimensions] += (c as u32 % 31) as f32;
    }
    vector
}

/// App in a fresh data directory using `provider`.
pub fn test_app(provider: ProviderKind) -> (tempfile::TempDir, App) {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(dir.path());
    app.settings.set_active_provider(provider).unwrap();
    (dir, app)
}
