//! Mock servers shared by the integration tests: a capture-everything APM
//! server and a scripted Lambda Extensions API.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn capture_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

/// Mock APM server capturing intake requests, with a switchable response
/// status to simulate outages.
#[derive(Clone)]
pub struct MockApmServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    response_status: Arc<AtomicU16>,
}

impl MockApmServer {
    pub async fn start() -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let response_status = Arc::new(AtomicU16::new(202));

        let state = (Arc::clone(&requests), Arc::clone(&response_status));
        let router = Router::new()
            .route("/intake/v2/events", post(Self::intake_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock APM server");
        let addr = listener.local_addr().expect("failed to get local addr");
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock APM server failed");
        });

        Self {
            addr,
            requests,
            response_status,
        }
    }

    async fn intake_handler(
        State((requests, status)): State<(Arc<Mutex<Vec<ReceivedRequest>>>, Arc<AtomicU16>)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        requests.lock().unwrap().push(ReceivedRequest {
            path: "/intake/v2/events".to_string(),
            headers: capture_headers(&headers),
            body: body.to_vec(),
        });
        let code = StatusCode::from_u16(status.load(Ordering::Relaxed)).unwrap_or(StatusCode::OK);
        (code, "{}").into_response()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_response_status(&self, status: u16) {
        self.response_status.store(status, Ordering::Relaxed);
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Events the scripted Extensions API hands out, in order. Once the script
/// runs dry, `next` blocks forever like the real long poll.
#[derive(Clone, Debug)]
pub enum ScriptedEvent {
    Invoke {
        request_id: &'static str,
        duration_ms: i64,
    },
    Shutdown,
}

type ApiState = (
    Arc<Mutex<VecDeque<ScriptedEvent>>>,
    Arc<Mutex<Vec<ReceivedRequest>>>,
    Arc<AtomicU16>,
);

/// Mock of the host's lifecycle and logs APIs.
#[derive(Clone)]
pub struct MockExtensionsApi {
    pub addr: SocketAddr,
    events: Arc<Mutex<VecDeque<ScriptedEvent>>>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    logs_status: Arc<AtomicU16>,
}

pub const MOCK_EXTENSION_ID: &str = "mock-extension-id";
pub const MOCK_FUNCTION_ARN: &str =
    "arn:aws:lambda:us-east-2:123456789012:function:custom-runtime";

impl MockExtensionsApi {
    pub async fn start(script: Vec<ScriptedEvent>) -> Self {
        let events = Arc::new(Mutex::new(VecDeque::from(script)));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let logs_status = Arc::new(AtomicU16::new(200));

        let state: ApiState = (
            Arc::clone(&events),
            Arc::clone(&requests),
            Arc::clone(&logs_status),
        );
        let router = Router::new()
            .route("/2020-01-01/extension/register", post(Self::register_handler))
            .route("/2020-01-01/extension/event/next", get(Self::next_handler))
            .route(
                "/2020-01-01/extension/init/error",
                post(Self::error_handler),
            )
            .route(
                "/2020-01-01/extension/exit/error",
                post(Self::error_handler),
            )
            .route("/2020-08-15/logs", put(Self::logs_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock extensions API");
        let addr = listener.local_addr().expect("failed to get local addr");
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock extensions API failed");
        });

        Self {
            addr,
            events,
            requests,
            logs_status,
        }
    }

    /// Value for `AWS_LAMBDA_RUNTIME_API`.
    pub fn runtime_api(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn set_logs_status(&self, status: u16) {
        self.logs_status.store(status, Ordering::Relaxed);
    }

    pub fn requests_for(&self, path: &str) -> Vec<ReceivedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    async fn register_handler(
        State((_, requests, _)): State<ApiState>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        requests.lock().unwrap().push(ReceivedRequest {
            path: "/2020-01-01/extension/register".to_string(),
            headers: capture_headers(&headers),
            body: body.to_vec(),
        });
        (
            [("Lambda-Extension-Identifier", MOCK_EXTENSION_ID)],
            Json(json!({
                "functionName": "custom-runtime",
                "functionVersion": "$LATEST",
                "handler": "index.handler"
            })),
        )
            .into_response()
    }

    async fn next_handler(State((events, requests, _)): State<ApiState>, headers: HeaderMap) -> Response {
        requests.lock().unwrap().push(ReceivedRequest {
            path: "/2020-01-01/extension/event/next".to_string(),
            headers: capture_headers(&headers),
            body: Vec::new(),
        });
        let event = events.lock().unwrap().pop_front();
        match event {
            Some(ScriptedEvent::Invoke {
                request_id,
                duration_ms,
            }) => Json(json!({
                "eventType": "INVOKE",
                "deadlineMs": now_ms() + duration_ms,
                "requestId": request_id,
                "invokedFunctionArn": MOCK_FUNCTION_ARN,
                "tracing": {"type": "None", "value": "None"}
            }))
            .into_response(),
            Some(ScriptedEvent::Shutdown) => Json(json!({
                "eventType": "SHUTDOWN",
                "deadlineMs": now_ms() + 2000
            }))
            .into_response(),
            None => {
                // Script exhausted: emulate the long poll by never answering.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn error_handler(State((_, requests, _)): State<ApiState>, body: Bytes) -> StatusCode {
        requests.lock().unwrap().push(ReceivedRequest {
            path: "error".to_string(),
            headers: Vec::new(),
            body: body.to_vec(),
        });
        StatusCode::ACCEPTED
    }

    async fn logs_handler(
        State((_, requests, logs_status)): State<ApiState>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        requests.lock().unwrap().push(ReceivedRequest {
            path: "/2020-08-15/logs".to_string(),
            headers: capture_headers(&headers),
            body: body.to_vec(),
        });
        let code = StatusCode::from_u16(logs_status.load(Ordering::Relaxed))
            .unwrap_or(StatusCode::OK);
        (code, "{}").into_response()
    }
}

pub fn now_ms() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_millis(),
    )
    .expect("milliseconds overflow")
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).expect("gzip write failed");
    encoder.finish().expect("gzip finish failed")
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .expect("gunzip failed");
    out
}

pub fn header_value<'a>(request: &'a ReceivedRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
