//! Logs receiver and dispatch.
//!
//! A second embedded HTTP server, separate from the agent data receiver,
//! where the Logs API delivers batches of platform records. Dispatch happens
//! inline in the handler: this way a `platform.report` that trails the
//! invocation (they are delivered after `platform.runtimeDone`, sometimes
//! once the coordinator has already moved on) is still turned into metrics.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ExtensionConfig;
use crate::error::ExtensionError;
use crate::lifecycle::NextEventResponse;
use crate::logsapi::{build_platform_metrics_doc, LogEvent, LogEventType, LogRecord};
use crate::metadata::MetadataCache;
use crate::transport::ApmServerTransport;

struct CurrentInvocation {
    event: NextEventResponse,
    runtime_done: CancellationToken,
}

/// Tracks which invocation platform records should be matched against.
///
/// The coordinator registers each invocation as it starts; the previous one
/// stays registered until then so late-arriving reports are not lost.
#[derive(Default)]
pub struct LogsDispatch {
    current: RwLock<Option<CurrentInvocation>>,
}

impl LogsDispatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new invocation and hand back its runtime-done signal.
    /// The signal is one-shot; redundant fires are no-ops.
    #[must_use]
    pub fn begin_invocation(&self, event: NextEventResponse) -> CancellationToken {
        let runtime_done = CancellationToken::new();
        *self
            .current
            .write()
            .expect("logs dispatch lock poisoned") = Some(CurrentInvocation {
            event,
            runtime_done: runtime_done.clone(),
        });
        runtime_done
    }

    fn dispatch(
        &self,
        log_event: &LogEvent,
        transport: &ApmServerTransport,
        metadata: &MetadataCache,
    ) {
        let guard = self.current.read().expect("logs dispatch lock poisoned");
        let Some(current) = guard.as_ref() else {
            return;
        };
        if log_event.request_id() != Some(current.event.request_id.as_str()) {
            debug!("Ignoring log event for another invocation");
            return;
        }

        match log_event.event_type {
            LogEventType::RuntimeDone => {
                debug!(
                    "Runtime done for request {} ({})",
                    current.event.request_id,
                    runtime_done_status(log_event)
                );
                current.runtime_done.cancel();
            }
            LogEventType::PlatformReport => {
                handle_platform_report(log_event, &current.event, transport, metadata);
            }
            other => debug!("Ignoring log event {other:?}"),
        }
    }
}

/// Handle to the running logs receiver.
pub struct LogsReceiver {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
    /// Destination URI advertised to the Logs API. The host reaches the
    /// sandbox through the `sandbox` hostname rather than loopback.
    pub destination_uri: String,
}

#[derive(Clone)]
struct LogsReceiverState {
    dispatch: Arc<LogsDispatch>,
    transport: Arc<ApmServerTransport>,
    metadata: Arc<MetadataCache>,
}

/// Bind the logs receiver and serve it until the shutdown token fires.
pub async fn start_logs_receiver(
    config: &ExtensionConfig,
    dispatch: Arc<LogsDispatch>,
    transport: Arc<ApmServerTransport>,
    metadata: Arc<MetadataCache>,
    shutdown: CancellationToken,
) -> Result<LogsReceiver, ExtensionError> {
    let state = LogsReceiverState {
        dispatch,
        transport,
        metadata,
    };
    let router = Router::new()
        .route("/", post(handle_log_batch))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.logs_receiver_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    debug!("Logs receiver listening on {addr}");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            warn!("Logs receiver error: {e}");
        }
    });

    Ok(LogsReceiver {
        addr,
        handle,
        destination_uri: format!("http://sandbox:{}", addr.port()),
    })
}

/// Accept one delivery batch, iterating the records in order. Malformed
/// batches are logged and acknowledged; the Logs API would otherwise retry
/// them forever.
async fn handle_log_batch(State(state): State<LogsReceiverState>, body: Bytes) -> StatusCode {
    let events: Vec<LogEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(err) => {
            error!("Dropping malformed logs batch: {err}");
            return StatusCode::OK;
        }
    };

    for event in &events {
        state
            .dispatch
            .dispatch(event, &state.transport, &state.metadata);
    }
    StatusCode::OK
}

fn runtime_done_status(log_event: &LogEvent) -> &str {
    match &log_event.record {
        LogRecord::Platform(record) => record.status.as_deref().unwrap_or("unknown"),
        LogRecord::Text(_) => "unknown",
    }
}

fn handle_platform_report(
    log_event: &LogEvent,
    event: &NextEventResponse,
    transport: &ApmServerTransport,
    metadata: &MetadataCache,
) {
    let LogRecord::Platform(record) = &log_event.record else {
        return;
    };
    let Some(metrics) = &record.metrics else {
        warn!("platform.report without metrics, skipping");
        return;
    };
    let Some(metadata_line) = metadata.get() else {
        warn!("No agent metadata captured yet, skipping platform metrics");
        return;
    };

    match build_platform_metrics_doc(
        &metadata_line,
        event,
        &event.request_id,
        metrics,
        log_event.timestamp_us(),
    ) {
        Ok(doc) => {
            debug!(
                "Enqueueing platform metrics for request {}",
                event.request_id
            );
            transport.enqueue(doc);
        }
        Err(err) => error!("Failed to serialize platform metrics: {err}"),
    }
}
