//! Platform metrics synthesis.
//!
//! Turns a `platform.report` record into an intake metricset document. The
//! host reports its metrics with float32 precision, so the fields here are
//! `f32` and widen to `f64` on serialization; the emitted values match the
//! report byte-for-byte semantics rather than the "pretty" decimal.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::lifecycle::NextEventResponse;
use crate::transport::AgentData;

/// Metrics block of a `platform.report` record.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct PlatformMetrics {
    #[serde(rename = "durationMs")]
    pub duration_ms: f32,
    #[serde(rename = "billedDurationMs")]
    pub billed_duration_ms: u64,
    #[serde(rename = "memorySizeMB")]
    pub memory_size_mb: u64,
    #[serde(rename = "maxMemoryUsedMB")]
    pub max_memory_used_mb: u64,
    #[serde(rename = "initDurationMs")]
    pub init_duration_ms: f32,
}

#[derive(Serialize)]
#[serde(untagged)]
enum SampleValue {
    Int(u64),
    Float(f64),
}

#[derive(Serialize)]
struct Sample {
    value: SampleValue,
}

#[derive(Serialize)]
struct Samples {
    #[serde(rename = "aws.lambda.metrics.coldstart_duration")]
    coldstart_duration: Sample,
    #[serde(rename = "aws.lambda.metrics.timeout")]
    timeout: Sample,
    #[serde(rename = "system.memory.total")]
    memory_total: Sample,
    #[serde(rename = "system.memory.actual.free")]
    memory_free: Sample,
    #[serde(rename = "aws.lambda.metrics.duration")]
    duration: Sample,
    #[serde(rename = "aws.lambda.metrics.billed_duration")]
    billed_duration: Sample,
}

#[derive(Serialize)]
struct Faas<'a> {
    coldstart: bool,
    execution: &'a str,
    id: &'a str,
}

#[derive(Serialize)]
struct Metricset<'a> {
    samples: Samples,
    timestamp: i64,
    faas: Faas<'a>,
}

#[derive(Serialize)]
struct MetricsetDoc<'a> {
    metricset: Metricset<'a>,
}

/// The invocation's time budget in milliseconds, rounded up to whole seconds
/// the way the platform advertises function timeouts.
fn invocation_timeout_ms(event: &NextEventResponse) -> u64 {
    let start_ms = event
        .received_at
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    let remaining = u64::try_from(event.deadline_ms.saturating_sub(start_ms)).unwrap_or(0);
    remaining.div_ceil(1000) * 1000
}

/// Build the two-line `metadata \n metricset` document posted to the APM
/// server when a `platform.report` arrives for the current invocation.
pub fn build_platform_metrics_doc(
    metadata: &Bytes,
    event: &NextEventResponse,
    request_id: &str,
    metrics: &PlatformMetrics,
    timestamp_us: i64,
) -> Result<AgentData, serde_json::Error> {
    const BYTES_PER_MB: u64 = 1024 * 1024;

    let coldstart = metrics.init_duration_ms > 0.0;
    let doc = MetricsetDoc {
        metricset: Metricset {
            samples: Samples {
                coldstart_duration: Sample {
                    value: SampleValue::Float(f64::from(metrics.init_duration_ms)),
                },
                timeout: Sample {
                    value: SampleValue::Int(invocation_timeout_ms(event)),
                },
                memory_total: Sample {
                    value: SampleValue::Int(metrics.memory_size_mb * BYTES_PER_MB),
                },
                memory_free: Sample {
                    value: SampleValue::Int(
                        metrics.memory_size_mb.saturating_sub(metrics.max_memory_used_mb)
                            * BYTES_PER_MB,
                    ),
                },
                duration: Sample {
                    value: SampleValue::Float(f64::from(metrics.duration_ms)),
                },
                billed_duration: Sample {
                    value: SampleValue::Int(metrics.billed_duration_ms),
                },
            },
            timestamp: timestamp_us,
            faas: Faas {
                coldstart,
                execution: request_id,
                id: &event.invoked_function_arn,
            },
        },
    };

    let json = serde_json::to_vec(&doc)?;
    let mut body = Vec::with_capacity(metadata.len() + json.len() + 2);
    body.extend_from_slice(metadata);
    body.push(b'\n');
    body.extend_from_slice(&json);
    body.push(b'\n');
    Ok(AgentData::new(Bytes::from(body), None))
}
