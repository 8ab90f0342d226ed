//! Extension configuration from environment variables.
//!
//! All tunables come from `ELASTIC_APM_*` environment variables plus the
//! `AWS_LAMBDA_RUNTIME_API` address injected by the Lambda service. Invalid
//! values fall back to defaults with a startup warning; only a missing APM
//! server URL is fatal.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ExtensionError;

const DEFAULT_DATA_RECEIVER_PORT: u16 = 8200;
const DEFAULT_LOGS_RECEIVER_PORT: u16 = 8205;
const DEFAULT_DATA_RECEIVER_TIMEOUT_SECS: u64 = 15;
const DEFAULT_DATA_FORWARDER_TIMEOUT_SECS: u64 = 3;

/// When telemetry is shipped relative to the invocation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    /// Drain the transport queue before returning control to the runtime.
    /// Guarantees delivery at the cost of a little billed time per invocation.
    SyncFlush,
    /// Forward in the background and let payloads land across invocation
    /// boundaries. Lowest latency, best-effort delivery.
    Background,
}

impl FromStr for SendStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "syncflush" => Ok(SendStrategy::SyncFlush),
            "background" => Ok(SendStrategy::Background),
            _ => Err(()),
        }
    }
}

/// Runtime configuration for the extension.
#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    /// Base URL of the APM server intake (`ELASTIC_APM_LAMBDA_APM_SERVER`).
    pub apm_server_url: String,
    /// Secret token for `Authorization: Bearer`. Takes precedence over the
    /// API key when both are set.
    pub secret_token: Option<String>,
    /// API key for `Authorization: ApiKey`.
    pub api_key: Option<String>,
    /// Flush policy at the end of each invocation.
    pub send_strategy: SendStrategy,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Read/write timeout of the agent data receiver.
    pub data_receiver_timeout: Duration,
    /// Per-request timeout for POSTs to the APM server.
    pub data_forwarder_timeout: Duration,
    /// Loopback port the agent data receiver binds to.
    pub data_receiver_port: u16,
    /// Port the platform-logs receiver binds to.
    pub logs_receiver_port: u16,
    /// Address of the Lambda runtime/extensions API (`AWS_LAMBDA_RUNTIME_API`).
    pub runtime_api: String,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            apm_server_url: String::new(),
            secret_token: None,
            api_key: None,
            send_strategy: SendStrategy::SyncFlush,
            log_level: "info".to_string(),
            data_receiver_timeout: Duration::from_secs(DEFAULT_DATA_RECEIVER_TIMEOUT_SECS),
            data_forwarder_timeout: Duration::from_secs(DEFAULT_DATA_FORWARDER_TIMEOUT_SECS),
            data_receiver_port: DEFAULT_DATA_RECEIVER_PORT,
            logs_receiver_port: DEFAULT_LOGS_RECEIVER_PORT,
            runtime_api: String::new(),
        }
    }
}

impl ExtensionConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ExtensionError> {
        let apm_server_url = env::var("ELASTIC_APM_LAMBDA_APM_SERVER")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_default();
        let secret_token = env::var("ELASTIC_APM_SECRET_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        let api_key = env::var("ELASTIC_APM_API_KEY")
            .ok()
            .filter(|v| !v.is_empty());
        let send_strategy = env::var("ELASTIC_APM_SEND_STRATEGY")
            .map(|val| parse_or_default(&val, "ELASTIC_APM_SEND_STRATEGY", SendStrategy::SyncFlush))
            .unwrap_or(SendStrategy::SyncFlush);
        let log_level = env::var("ELASTIC_APM_LOG_LEVEL")
            .map(|val| parse_log_level(&val))
            .unwrap_or_else(|_| "info".to_string());
        let data_receiver_timeout = parse_seconds(
            "ELASTIC_APM_DATA_RECEIVER_TIMEOUT",
            DEFAULT_DATA_RECEIVER_TIMEOUT_SECS,
        );
        let data_forwarder_timeout = parse_seconds(
            "ELASTIC_APM_DATA_FORWARDER_TIMEOUT",
            DEFAULT_DATA_FORWARDER_TIMEOUT_SECS,
        );
        let data_receiver_port = env::var("ELASTIC_APM_DATA_RECEIVER_SERVER_PORT")
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(DEFAULT_DATA_RECEIVER_PORT);
        let runtime_api = env::var("AWS_LAMBDA_RUNTIME_API").unwrap_or_default();

        let config = Self {
            apm_server_url,
            secret_token,
            api_key,
            send_strategy,
            log_level,
            data_receiver_timeout,
            data_forwarder_timeout,
            data_receiver_port,
            logs_receiver_port: DEFAULT_LOGS_RECEIVER_PORT,
            runtime_api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Only the missing backend URL is fatal;
    /// everything else already fell back to a default during parsing.
    pub fn validate(&self) -> Result<(), ExtensionError> {
        if self.apm_server_url.trim().is_empty() {
            return Err(ExtensionError::InvalidConfig(
                "ELASTIC_APM_LAMBDA_APM_SERVER is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Full URL of the APM server intake endpoint.
    #[must_use]
    pub fn intake_url(&self) -> String {
        format!("{}/intake/v2/events", self.apm_server_url)
    }
}

fn parse_or_default(val: &str, var: &str, default: SendStrategy) -> SendStrategy {
    val.parse().unwrap_or_else(|()| {
        warn!("Invalid {var} value '{val}', using default");
        default
    })
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn parse_log_level(val: &str) -> String {
    let level = val.to_lowercase();
    if VALID_LOG_LEVELS.contains(&level.as_str()) {
        level
    } else {
        warn!("Invalid ELASTIC_APM_LOG_LEVEL value '{val}', using default of info");
        "info".to_string()
    }
}

fn parse_seconds(var: &str, default: u64) -> Duration {
    let secs = match env::var(var) {
        Ok(val) => val.parse::<u64>().unwrap_or_else(|_| {
            warn!("Invalid {var} value '{val}', using default of {default}s");
            default
        }),
        Err(_) => default,
    };
    Duration::from_secs(secs)
}
