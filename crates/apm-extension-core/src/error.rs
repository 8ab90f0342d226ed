/// Errors that can occur while running the extension
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to register with the extensions API: {0}")]
    Register(String),

    #[error("Extensions API request failed: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Malformed extensions API response: {0}")]
    Protocol(String),

    #[error("Logs API subscription failed: {0}")]
    LogsSubscription(String),

    #[error("Logs API is not supported in this environment")]
    LogsNotSupported,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the backend transport. Transient by design: callers log
/// them and rely on the transport state machine for recovery.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("APM server transport is failing, request short-circuited")]
    Unavailable,

    #[error("APM server returned status {0}")]
    Status(u16),

    #[error("APM server request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Failed to compress agent payload: {0}")]
    Compression(#[from] std::io::Error),
}
