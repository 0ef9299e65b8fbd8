//! Error handling for the solo mining client
//!
//! One error type covering both notification channels and the template
//! lifecycle, with retryability classification for the reconnect logic.

use thiserror::Error;

/// Result type alias for solo mining operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the solo mining client
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS resolution failures
    #[error("Resolution error: {message}")]
    Resolution { message: String },

    /// Transport-level connect/read/write failures on either channel
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Malformed or unexpected bytes during the push-channel handshake
    #[error("Handshake error: {message}")]
    Handshake { message: String },

    /// Unparseable or incomplete block template responses
    #[error("Malformed template: {message}")]
    MalformedTemplate { message: String },

    /// JSON-RPC error responses from the node
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Submission attempted without an active block template
    #[error("Not connected: no active block template")]
    NotConnected,

    /// Submission against a job that has already been superseded
    #[error("Stale job: {job_id} no longer matches the current template")]
    StaleJob { job_id: String },

    /// Node rejected a submitted block
    #[error("Submission rejected: {reason}")]
    SubmissionRejected { reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Create a resolution error
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create a malformed template error
    pub fn malformed_template(message: impl Into<String>) -> Self {
        Self::MalformedTemplate {
            message: message.into(),
        }
    }

    /// Create a stale job error
    pub fn stale_job(job_id: impl Into<String>) -> Self {
        Self::StaleJob {
            job_id: job_id.into(),
        }
    }

    /// Create a submission rejected error
    pub fn submission_rejected(reason: impl Into<String>) -> Self {
        Self::SubmissionRejected {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    ///
    /// Everything transient retries on the poll interval; nothing in this
    /// client is process-fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            Error::Resolution { .. } => true,
            Error::Connection { .. } => true,
            Error::Handshake { .. } => true,
            Error::MalformedTemplate { .. } => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
            Error::Resolution { .. } => "resolution",
            Error::Connection { .. } => "connection",
            Error::Handshake { .. } => "handshake",
            Error::MalformedTemplate { .. } => "malformed_template",
            Error::Rpc { .. } => "rpc",
            Error::NotConnected => "not_connected",
            Error::StaleJob { .. } => "stale_job",
            Error::SubmissionRejected { .. } => "submission_rejected",
            Error::Config { .. } => "config",
        }
    }
}
