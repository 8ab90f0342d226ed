//! Lambda Logs API integration.
//!
//! Subscribes to the host's platform log stream and ingests the delivered
//! batches on a dedicated HTTP receiver. Two records matter per invocation:
//! `platform.runtimeDone`, which signals that the function finished, and
//! `platform.report`, from which a metricset document is synthesized.

mod metrics;
mod receiver;

pub use metrics::{build_platform_metrics_doc, PlatformMetrics};
pub use receiver::{start_logs_receiver, LogsDispatch, LogsReceiver};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::error::ExtensionError;
use crate::lifecycle::EXTENSION_ID_HEADER;

const LOGS_API_SCHEMA_VERSION: &str = "2021-03-18";
const BUFFERING_MAX_ITEMS: u32 = 10_000;
const BUFFERING_MAX_BYTES: u32 = 262_144;
/// Deliberately below the documented 100 ms minimum to cut per-invocation
/// coalescing lag; see `subscribe` for the fallback when the host rejects it.
const BUFFERING_TIMEOUT_MS: u32 = 25;
const BUFFERING_FALLBACK_TIMEOUT_MS: u32 = 100;

/// Log stream categories offered by the Logs API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Platform,
    Function,
    Extension,
}

/// Record types within the platform stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LogEventType {
    #[serde(rename = "platform.start")]
    PlatformStart,
    #[serde(rename = "platform.runtimeDone")]
    RuntimeDone,
    #[serde(rename = "platform.report")]
    PlatformReport,
    #[serde(rename = "platform.fault")]
    PlatformFault,
    #[serde(other)]
    Other,
}

/// Structured payload of platform records. Fields are optional because the
/// host varies them by record type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRecord {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metrics: Option<PlatformMetrics>,
}

/// A log record is either a structured platform record or a plain string
/// (function/extension output).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LogRecord {
    Platform(PlatformRecord),
    Text(String),
}

/// One entry of a Logs API delivery batch.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(rename = "type")]
    pub event_type: LogEventType,
    pub record: LogRecord,
}

impl LogEvent {
    /// Request id carried by a structured record, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match &self.record {
            LogRecord::Platform(record) => record.request_id.as_deref(),
            LogRecord::Text(_) => None,
        }
    }

    /// The event's wall-clock time in microseconds since the epoch.
    #[must_use]
    pub fn timestamp_us(&self) -> i64 {
        i64::try_from(self.time.unix_timestamp_nanos() / 1_000).unwrap_or(0)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferingCfg {
    max_items: u32,
    max_bytes: u32,
    timeout_ms: u32,
}

#[derive(Serialize)]
struct Destination<'a> {
    protocol: &'static str,
    #[serde(rename = "URI")]
    uri: &'a str,
    method: &'static str,
    encoding: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest<'a> {
    schema_version: &'static str,
    types: &'a [EventType],
    buffering: BufferingCfg,
    destination: Destination<'a>,
}

/// Subscribe to the host's platform log stream, pointing deliveries at our
/// logs receiver.
///
/// A 202 answer means the Logs API is unavailable in this environment (e.g.
/// local emulators); the caller downgrades that to a warning. If the host
/// rejects the 25 ms buffering timeout, the subscription is retried once
/// with the documented 100 ms minimum.
pub async fn subscribe(
    runtime_api: &str,
    extension_id: &str,
    types: &[EventType],
    destination_uri: &str,
) -> Result<(), ExtensionError> {
    let client = reqwest::Client::new();
    let url = format!("http://{runtime_api}/2020-08-15/logs");

    match send_subscription(
        &client,
        &url,
        extension_id,
        types,
        destination_uri,
        BUFFERING_TIMEOUT_MS,
    )
    .await
    {
        Err(ExtensionError::LogsSubscription(msg)) if msg.starts_with("status 400") => {
            warn!(
                "Logs API rejected buffering timeout of {BUFFERING_TIMEOUT_MS}ms ({msg}), \
                 retrying with {BUFFERING_FALLBACK_TIMEOUT_MS}ms"
            );
            send_subscription(
                &client,
                &url,
                extension_id,
                types,
                destination_uri,
                BUFFERING_FALLBACK_TIMEOUT_MS,
            )
            .await
        }
        result => result,
    }
}

async fn send_subscription(
    client: &reqwest::Client,
    url: &str,
    extension_id: &str,
    types: &[EventType],
    destination_uri: &str,
    timeout_ms: u32,
) -> Result<(), ExtensionError> {
    let request = SubscribeRequest {
        schema_version: LOGS_API_SCHEMA_VERSION,
        types,
        buffering: BufferingCfg {
            max_items: BUFFERING_MAX_ITEMS,
            max_bytes: BUFFERING_MAX_BYTES,
            timeout_ms,
        },
        destination: Destination {
            protocol: "HTTP",
            uri: destination_uri,
            method: "POST",
            encoding: "JSON",
        },
    };

    let response = client
        .put(url)
        .header(EXTENSION_ID_HEADER, extension_id)
        .json(&request)
        .send()
        .await?;

    match response.status().as_u16() {
        200 => Ok(()),
        202 => Err(ExtensionError::LogsNotSupported),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(ExtensionError::LogsSubscription(format!(
                "status {status}: {body}"
            )))
        }
    }
}
