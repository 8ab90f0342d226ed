//! Agent data receiver.
//!
//! Loopback HTTP server the in-function APM agent posts its intake payloads
//! to. Payloads are enqueued into the transport without blocking the agent;
//! the response goes out before any forwarding work happens. A `flushed=true`
//! query marker on the intake route doubles as the agent's end-of-invocation
//! signal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::CONTENT_ENCODING, HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, warn};

use crate::config::ExtensionConfig;
use crate::error::ExtensionError;
use crate::metadata::{self, MetadataCache};
use crate::transport::{AgentData, ApmServerTransport, ContentEncoding};

const INTAKE_PATH: &str = "/intake/v2/events";

#[derive(Clone)]
struct ReceiverState {
    transport: Arc<ApmServerTransport>,
    metadata: Arc<MetadataCache>,
    decode_failures: Arc<AtomicU64>,
}

/// Handle to the running receiver, mainly useful to tests.
pub struct AgentDataReceiver {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
    decode_failures: Arc<AtomicU64>,
}

impl AgentDataReceiver {
    /// Number of payloads dropped because their body failed to decode.
    #[must_use]
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

/// Bind the agent data receiver on the configured loopback port and serve it
/// until the shutdown token fires.
pub async fn start_receiver(
    config: &ExtensionConfig,
    transport: Arc<ApmServerTransport>,
    metadata: Arc<MetadataCache>,
    shutdown: CancellationToken,
) -> Result<AgentDataReceiver, ExtensionError> {
    let decode_failures = Arc::new(AtomicU64::new(0));
    let state = ReceiverState {
        transport,
        metadata,
        decode_failures: Arc::clone(&decode_failures),
    };

    let router = Router::new()
        .route(INTAKE_PATH, post(handle_intake))
        .route("/", get(handle_health))
        .layer(TimeoutLayer::new(config.data_receiver_timeout))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.data_receiver_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    debug!("Agent data receiver listening on {addr}");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            warn!("Agent data receiver error: {e}");
        }
    });

    Ok(AgentDataReceiver {
        addr,
        handle,
        decode_failures,
    })
}

async fn handle_health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Intake handler. Always answers 202 so the agent is never slowed down by
/// the state of the backend; undecodable payloads are counted and dropped.
async fn handle_intake(
    State(state): State<ReceiverState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if params.get("flushed").map(String::as_str) == Some("true") {
        debug!("Agent signalled end of invocation");
        state.transport.signal_agent_done();
    }

    if body.is_empty() {
        return StatusCode::ACCEPTED;
    }

    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentEncoding::from_header);
    let data = AgentData::new(body, encoding);

    // Every payload gets its first line decoded: this both validates the
    // body's declared encoding and surfaces the metadata line. Corrupt
    // bodies are dropped here rather than bounced off the APM server later.
    let first_line = match metadata::extract_metadata_line(&data) {
        Ok(first_line) => first_line,
        Err(err) => {
            let failures = state.decode_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Dropping undecodable agent payload ({failures} so far): {err}");
            return StatusCode::ACCEPTED;
        }
    };
    if let Some(line) = first_line {
        // First writer wins; later metadata lines are ignored.
        if state.metadata.set(line) {
            debug!("Captured agent metadata line");
        }
    }

    state.transport.enqueue(data);
    StatusCode::ACCEPTED
}
