use std::time::Duration;

/// Errors raised by platform drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("HTTP request to {uri} failed: {message}")]
    Http { uri: String, message: String },

    #[error("{uri} answered {status}: {body}")]
    Status { uri: String, status: u16, body: String },

    #[error("request to {uri} timed out after {timeout:?}")]
    Timeout { uri: String, timeout: Duration },

    #[error("invalid platform response: {0}")]
    InvalidResponse(String),

    #[error("function not found: {0}")]
    NotFound(String),

    #[error("injected failure: {0}")]
    Injected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;
