//! Backend transport to the APM server.
//!
//! Buffers agent payloads in a bounded in-memory queue and ships them with
//! `Content-Encoding: gzip`. Backend health is tracked by a small state
//! machine with a quadratic reconnection backoff so a flaky or absent APM
//! server can never wedge the function:
//!
//! ```text
//! Healthy --post fails--> Failing --grace--> Pending --post ok--> Healthy
//!                                            Pending --post fails--> Failing
//! ```
//!
//! While `Failing`, posts short-circuit with an error without touching the
//! network. While `Pending`, the next post acts as the probe whose outcome
//! decides the following state.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::Compression;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ExtensionConfig;
use crate::error::TransportError;

/// Maximum number of buffered payloads. When the queue is full the oldest
/// payload is evicted; telemetry is best-effort by policy.
const QUEUE_CAPACITY: usize = 100;

/// Content encodings accepted from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` header value. Unknown encodings are treated
    /// as uncompressed.
    #[must_use]
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "gzip" => Some(ContentEncoding::Gzip),
            "deflate" => Some(ContentEncoding::Deflate),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
        }
    }
}

/// One agent payload as received on the intake endpoint. The body bytes are
/// forwarded unchanged; the encoding tag records how they were compressed.
#[derive(Debug, Clone)]
pub struct AgentData {
    pub data: Bytes,
    pub content_encoding: Option<ContentEncoding>,
}

impl AgentData {
    #[must_use]
    pub fn new(data: Bytes, content_encoding: Option<ContentEncoding>) -> Self {
        Self {
            data,
            content_encoding,
        }
    }
}

/// Health of the connection to the APM server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Last post was acknowledged; requests flow freely.
    Healthy,
    /// Last post failed; requests short-circuit until the grace period ends.
    Failing,
    /// Grace period elapsed; one probe request is permitted.
    Pending,
}

/// Grace period before a failing transport is allowed a probe request.
#[must_use]
pub fn grace_period(reconnection_count: i32) -> Duration {
    let n = u64::try_from(reconnection_count.clamp(0, 6)).unwrap_or(0);
    Duration::from_secs(n * n)
}

#[derive(Debug)]
struct HealthInner {
    status: TransportStatus,
    reconnection_count: i32,
    last_transition: Instant,
}

/// Serialized transport state. All transitions go through [`BackendHealth::set`],
/// which ignores illegal transitions instead of failing.
#[derive(Debug, Clone)]
pub struct BackendHealth(Arc<Mutex<HealthInner>>);

impl Default for BackendHealth {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(HealthInner {
            status: TransportStatus::Healthy,
            reconnection_count: -1,
            last_transition: Instant::now(),
        })))
    }
}

impl BackendHealth {
    #[must_use]
    pub fn status(&self) -> TransportStatus {
        self.0.lock().expect("transport state lock poisoned").status
    }

    #[must_use]
    pub fn reconnection_count(&self) -> i32 {
        self.0
            .lock()
            .expect("transport state lock poisoned")
            .reconnection_count
    }

    /// Time elapsed since the last state transition.
    #[must_use]
    pub fn last_transition_age(&self) -> Duration {
        self.0
            .lock()
            .expect("transport state lock poisoned")
            .last_transition
            .elapsed()
    }

    /// Apply a state transition.
    ///
    /// `Healthy` resets the reconnection count. `Failing` bumps it and
    /// schedules the `Failing -> Pending` promotion after the grace period.
    /// `Pending` can only be reached through that timer; requesting it
    /// directly is ignored.
    pub fn set(&self, status: TransportStatus) {
        let grace = {
            let mut inner = self.0.lock().expect("transport state lock poisoned");
            match status {
                TransportStatus::Healthy => {
                    inner.status = TransportStatus::Healthy;
                    inner.reconnection_count = -1;
                    inner.last_transition = Instant::now();
                    return;
                }
                TransportStatus::Failing => {
                    inner.status = TransportStatus::Failing;
                    inner.reconnection_count = (inner.reconnection_count + 1).max(1);
                    inner.last_transition = Instant::now();
                    grace_period(inner.reconnection_count)
                }
                TransportStatus::Pending => {
                    warn!("Ignoring illegal explicit transition to Pending");
                    return;
                }
            }
        };

        debug!(
            "APM server transport failing, probing again in {}s",
            grace.as_secs()
        );
        let health = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            health.promote_to_pending();
        });
    }

    /// Timer-driven `Failing -> Pending` promotion. A transition that
    /// happened in the meantime wins.
    pub(crate) fn promote_to_pending(&self) {
        let mut inner = self.0.lock().expect("transport state lock poisoned");
        if inner.status == TransportStatus::Failing {
            inner.status = TransportStatus::Pending;
            inner.last_transition = Instant::now();
        }
    }
}

/// Stateful client shipping buffered agent payloads to the APM server.
pub struct ApmServerTransport {
    config: Arc<ExtensionConfig>,
    client: reqwest::Client,
    intake_url: String,
    queue: Mutex<VecDeque<AgentData>>,
    queued: Notify,
    dropped: AtomicU64,
    health: BackendHealth,
    agent_done: Mutex<CancellationToken>,
}

impl ApmServerTransport {
    #[must_use]
    pub fn new(config: Arc<ExtensionConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.data_forwarder_timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to build APM server HTTP client: {e}, using defaults");
                reqwest::Client::new()
            });
        let intake_url = config.intake_url();
        Self {
            config,
            client,
            intake_url,
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            queued: Notify::new(),
            dropped: AtomicU64::new(0),
            health: BackendHealth::default(),
            agent_done: Mutex::new(CancellationToken::new()),
        }
    }

    #[must_use]
    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    /// Number of payloads evicted because the queue was full.
    #[must_use]
    pub fn dropped_payloads(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Add a payload to the send queue without blocking. When the queue is
    /// full the oldest payload is evicted and counted.
    pub fn enqueue(&self, data: AgentData) {
        {
            let mut queue = self.queue.lock().expect("transport queue lock poisoned");
            if queue.len() >= QUEUE_CAPACITY {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Transport queue full, dropped oldest payload ({dropped} dropped so far)");
            }
            queue.push_back(data);
        }
        self.queued.notify_one();
    }

    fn try_dequeue(&self) -> Option<AgentData> {
        self.queue
            .lock()
            .expect("transport queue lock poisoned")
            .pop_front()
    }

    #[must_use]
    pub fn queue_is_empty(&self) -> bool {
        self.queue
            .lock()
            .expect("transport queue lock poisoned")
            .is_empty()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .expect("transport queue lock poisoned")
            .len()
    }

    /// Reset the agent-done signal for a new invocation and return the handle
    /// the coordinator waits on.
    #[must_use]
    pub fn begin_invocation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .agent_done
            .lock()
            .expect("agent done lock poisoned") = token.clone();
        token
    }

    /// Read-only handle to the current invocation's agent-done signal.
    #[must_use]
    pub fn agent_done_signal(&self) -> CancellationToken {
        self.agent_done
            .lock()
            .expect("agent done lock poisoned")
            .clone()
    }

    /// Fire the agent-done signal. One-shot per invocation; redundant fires
    /// are no-ops.
    pub fn signal_agent_done(&self) {
        self.agent_done
            .lock()
            .expect("agent done lock poisoned")
            .cancel();
    }

    /// POST one payload to the APM server intake.
    ///
    /// Uncompressed payloads are gzipped first; already-compressed payloads
    /// are sent byte-for-byte with their original encoding. A 2xx answer
    /// marks the transport `Healthy`; anything else marks it `Failing` and
    /// returns an error. Callers do not retry within the invocation.
    pub async fn post_to_apm_server(&self, data: &AgentData) -> Result<(), TransportError> {
        if self.health.status() == TransportStatus::Failing {
            return Err(TransportError::Unavailable);
        }

        let (body, encoding) = match data.content_encoding {
            Some(encoding) => (data.data.to_vec(), encoding.as_str()),
            None => (gzip_compress(&data.data)?, ContentEncoding::Gzip.as_str()),
        };

        let mut request = self
            .client
            .post(&self.intake_url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header(CONTENT_ENCODING, encoding);
        if let Some(token) = &self.config.secret_token {
            request = request.bearer_auth(token);
        } else if let Some(key) = &self.config.api_key {
            request = request.header(AUTHORIZATION, format!("ApiKey {key}"));
        }

        match request.body(body).send().await {
            Ok(response) if response.status().is_success() => {
                self.health.set(TransportStatus::Healthy);
                Ok(())
            }
            Ok(response) => {
                self.health.set(TransportStatus::Failing);
                Err(TransportError::Status(response.status().as_u16()))
            }
            Err(err) => {
                self.health.set(TransportStatus::Failing);
                Err(TransportError::Request(err))
            }
        }
    }

    /// Background forwarder for one invocation.
    ///
    /// Dequeues and posts until the invocation is cancelled, or until the
    /// agent has signalled done and the queue is drained. A payload in flight
    /// when cancellation lands is dropped rather than holding up the return
    /// to the runtime.
    pub async fn forward_agent_data(self: Arc<Self>, invocation: CancellationToken) {
        let agent_done = self.agent_done_signal();
        loop {
            if let Some(data) = self.try_dequeue() {
                tokio::select! {
                    biased;
                    () = invocation.cancelled() => {
                        debug!("Invocation ended with a payload in flight, dropping it");
                        return;
                    }
                    result = self.post_to_apm_server(&data) => {
                        if let Err(err) = result {
                            warn!("Failed to forward agent payload: {err}");
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                () = invocation.cancelled() => return,
                () = agent_done.cancelled() => {
                    if self.queue_is_empty() {
                        debug!("Agent done and queue drained, forwarder exiting");
                        return;
                    }
                }
                () = self.queued.notified() => {}
            }
        }
    }

    /// Drain the queue synchronously. Returns when the queue is empty or the
    /// given scope is cancelled; individual post failures are logged and the
    /// affected payloads are dropped.
    pub async fn flush(&self, ctx: &CancellationToken) {
        let mut flushed = 0usize;
        while let Some(data) = self.try_dequeue() {
            tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    warn!("Flush interrupted with {} payloads still queued", self.queue_len() + 1);
                    return;
                }
                result = self.post_to_apm_server(&data) => {
                    match result {
                        Ok(()) => flushed += 1,
                        Err(err) => warn!("Dropping payload during flush: {err}"),
                    }
                }
            }
        }
        if flushed > 0 {
            debug!("Flushed {flushed} queued payloads");
        }
    }
}

fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;

    fn test_config() -> Arc<ExtensionConfig> {
        Arc::new(ExtensionConfig {
            apm_server_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn grace_period_is_squared_and_capped() {
        let expected = [0, 1, 4, 9, 16, 25, 36, 36, 36];
        for (n, want) in expected.iter().enumerate() {
            assert_eq!(
                grace_period(i32::try_from(n).unwrap()),
                Duration::from_secs(*want),
                "grace({n})"
            );
        }
        assert_eq!(grace_period(-1), Duration::from_secs(0));
        assert_eq!(grace_period(100), Duration::from_secs(36));
    }

    #[tokio::test]
    async fn healthy_resets_reconnection_count() {
        let health = BackendHealth::default();
        health.set(TransportStatus::Failing);
        health.set(TransportStatus::Healthy);
        assert_eq!(health.status(), TransportStatus::Healthy);
        assert_eq!(health.reconnection_count(), -1);
        assert!(health.last_transition_age() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failing_bumps_reconnection_count() {
        let health = BackendHealth::default();
        health.set(TransportStatus::Failing);
        assert_eq!(health.status(), TransportStatus::Failing);
        assert_eq!(health.reconnection_count(), 1);
    }

    #[tokio::test]
    async fn explicit_pending_is_ignored() {
        let health = BackendHealth::default();
        health.set(TransportStatus::Pending);
        assert_eq!(health.status(), TransportStatus::Healthy);
        assert_eq!(health.reconnection_count(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_promotes_to_pending_after_grace() {
        let health = BackendHealth::default();
        health.set(TransportStatus::Failing);
        assert_eq!(health.status(), TransportStatus::Failing);

        // grace(1) = 1s; the paused clock auto-advances past it.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(health.status(), TransportStatus::Pending);
        assert_eq!(health.reconnection_count(), 1);
    }

    #[tokio::test]
    async fn escalating_failures_walk_the_backoff_table() {
        let health = BackendHealth::default();
        for expected_count in 1..=7 {
            health.set(TransportStatus::Failing);
            assert_eq!(health.reconnection_count(), expected_count);
            let expected_grace = [1, 4, 9, 16, 25, 36, 36][usize::try_from(expected_count).unwrap() - 1];
            assert_eq!(
                grace_period(health.reconnection_count()),
                Duration::from_secs(expected_grace)
            );
            health.promote_to_pending();
            assert_eq!(health.status(), TransportStatus::Pending);
        }
    }

    #[tokio::test]
    async fn post_short_circuits_while_failing() {
        let transport = ApmServerTransport::new(test_config());
        transport.health().set(TransportStatus::Failing);

        let data = AgentData::new(Bytes::from_static(b"{}"), None);
        let err = transport.post_to_apm_server(&data).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable));
        // The short-circuit itself must not count as another failure.
        assert_eq!(transport.health().reconnection_count(), 1);
    }

    #[tokio::test]
    async fn enqueue_evicts_oldest_when_full() {
        let transport = ApmServerTransport::new(test_config());
        for i in 0..=QUEUE_CAPACITY {
            transport.enqueue(AgentData::new(Bytes::from(format!("{i}")), None));
        }
        assert_eq!(transport.queue_len(), QUEUE_CAPACITY);
        assert_eq!(transport.dropped_payloads(), 1);
        // Payload "0" was the evicted one.
        assert_eq!(&transport.try_dequeue().unwrap().data[..], b"1");
    }

    #[tokio::test]
    async fn agent_done_signal_is_idempotent_per_invocation() {
        let transport = ApmServerTransport::new(test_config());
        let signal = transport.begin_invocation();
        assert!(!signal.is_cancelled());
        transport.signal_agent_done();
        transport.signal_agent_done();
        assert!(signal.is_cancelled());

        // A new invocation gets a fresh, unfired signal.
        let next = transport.begin_invocation();
        assert!(!next.is_cancelled());
    }

    #[test]
    fn gzip_compress_round_trips() {
        let body = b"A long time ago in a galaxy far, far away...";
        let compressed = gzip_compress(body).unwrap();
        let uncompressed =
            metadata::uncompress(&compressed, Some(ContentEncoding::Gzip)).unwrap();
        assert_eq!(uncompressed, body);
    }
}
