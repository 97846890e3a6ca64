//! Scripted upstream for adapter tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use tokio::net::TcpListener;

use crate::constants::API_KEY_HEADER;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub api_key: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Default)]
struct Script {
    responses: VecDeque<(u16, String)>,
    recorded: Vec<RecordedRequest>,
}

/// Answers every request with the next queued response, 500 once the queue is empty.
pub struct MockUpstream {
    url: String,
    script: Arc<Mutex<Script>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let script = Arc::new(Mutex::new(Script::default()));

        let shared = script.clone();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(move |request: Request<Body>| {
                let shared = shared.clone();
                async move {
                    let method = request.method().to_string();
                    let path = request.uri().path().to_string();
                    let api_key = request
                        .headers()
                        .get(API_KEY_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                        .await
                        .unwrap();
                    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);

                    let mut script = shared.lock().unwrap();
                    script.recorded.push(RecordedRequest {
                        method,
                        path,
                        api_key,
                        body,
                    });
                    let (status, body) = script
                        .responses
                        .pop_front()
                        .unwrap_or((500, "script exhausted".to_string()));
                    (StatusCode::from_u16(status).unwrap(), body).into_response()
                }
            });
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, script }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn push(&self, status: u16, body: &str) {
        self.script
            .lock()
            .unwrap()
            .responses
            .push_back((status, body.to_string()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script.lock().unwrap().recorded.clone()
    }
}
