//! Client for the Lambda Extensions API.
//!
//! Speaks the host's lifecycle protocol: one-shot registration at startup, a
//! long-polling `next` call per invocation, and the init/exit error reports
//! used on unrecoverable failures. The client holds no state beyond the
//! extension identifier handed out by `register`.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExtensionError;

pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Event kinds delivered by the `next` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Invoke,
    Shutdown,
}

/// X-Ray tracing header passed along with an invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tracing {
    #[serde(rename = "type", default)]
    pub tracing_type: String,
    #[serde(default)]
    pub value: String,
}

/// One event from `GET /2020-01-01/extension/event/next`.
///
/// `received_at` is stamped locally when the response is decoded; the host
/// does not send it. It anchors the invocation's timeout computation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    pub event_type: EventType,
    #[serde(default)]
    pub deadline_ms: i64,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub invoked_function_arn: String,
    #[serde(default)]
    pub tracing: Tracing,
    #[serde(skip, default = "SystemTime::now")]
    pub received_at: SystemTime,
}

/// Response to a successful registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub function_version: String,
    #[serde(default)]
    pub handler: String,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    events: &'a [&'a str],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorRequest<'a> {
    error_message: &'a str,
    error_type: &'a str,
}

/// Client of the host's extension lifecycle API.
pub struct LifecycleClient {
    client: reqwest::Client,
    base_url: String,
    extension_id: Option<String>,
}

impl LifecycleClient {
    /// Build a client against `AWS_LAMBDA_RUNTIME_API`. No overall request
    /// timeout is set because `next_event` long-polls for as long as the
    /// container stays warm.
    #[must_use]
    pub fn new(runtime_api: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{runtime_api}/2020-01-01/extension"),
            extension_id: None,
        }
    }

    #[must_use]
    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.as_deref()
    }

    /// Register this extension for INVOKE and SHUTDOWN events. Stores the
    /// extension identifier used on every subsequent call. Failure here is
    /// fatal for the process.
    pub async fn register(&mut self, extension_name: &str) -> Result<RegisterResponse, ExtensionError> {
        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&RegisterRequest {
                events: &["INVOKE", "SHUTDOWN"],
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtensionError::Register(format!(
                "register returned status {status}"
            )));
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| {
                ExtensionError::Register("register response is missing the extension identifier".to_string())
            })?;
        debug!("Registered with extension id {extension_id}");
        self.extension_id = Some(extension_id);

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ExtensionError::Protocol(format!("invalid register response: {e}")))
    }

    /// Long-poll for the next lifecycle event. Blocks until the host answers
    /// with an INVOKE or SHUTDOWN event; cancel by dropping the future.
    pub async fn next_event(&self) -> Result<NextEventResponse, ExtensionError> {
        let response = self
            .client
            .get(format!("{}/event/next", self.base_url))
            .header(EXTENSION_ID_HEADER, self.extension_id().unwrap_or_default())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtensionError::Protocol(format!(
                "next event returned status {status}"
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ExtensionError::Protocol(format!("invalid next event response: {e}")))
    }

    /// Report an unrecoverable initialization failure to the host.
    pub async fn init_error(&self, message: &str) -> Result<(), ExtensionError> {
        self.post_error("init/error", message, "Extension.InitError").await
    }

    /// Report an unrecoverable runtime failure to the host.
    pub async fn exit_error(&self, message: &str) -> Result<(), ExtensionError> {
        self.post_error("exit/error", message, "Extension.ExitError").await
    }

    async fn post_error(
        &self,
        path: &str,
        message: &str,
        error_type: &str,
    ) -> Result<(), ExtensionError> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .header(EXTENSION_ID_HEADER, self.extension_id().unwrap_or_default())
            .json(&ErrorRequest {
                error_message: message,
                error_type,
            })
            .send()
            .await?;
        debug!("Error report to {path} answered with {}", response.status());
        Ok(())
    }
}
