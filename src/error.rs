//! Error taxonomy for the verdict client.
//!
//! Transport and decode failures are converted into these variants at the
//! boundary; callers never see raw socket or JSON errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaasError>;

#[derive(Debug, Error)]
pub enum VaasError {
    /// Bad credentials or the server rejected the auth frame.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The transport could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport dropped while a request was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The caller's deadline elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The signed-URL upload returned a non-2xx status.
    #[error("upload failed with status {status}: {message}")]
    UploadFailed { status: u16, message: String },

    /// The engine is not in a state that accepts requests.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Upload length could not be determined.
    #[error("unsupported reader: content length cannot be determined")]
    UnsupportedReader,

    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP 4xx from the polling API.
    #[error("client error: {0}")]
    Client(String),

    /// HTTP 5xx from the polling API.
    #[error("server error: {0}")]
    Server(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaasError {
    /// True for failures of the shared connection rather than of one call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            VaasError::ConnectionFailed(_) | VaasError::ConnectionLost(_)
        )
    }
}

impl From<reqwest::Error> for VaasError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VaasError::Timeout
        } else if err.is_connect() {
            VaasError::ConnectionFailed(err.to_string())
        } else if err.is_builder() {
            VaasError::InvalidOperation(err.to_string())
        } else if err.is_decode() {
            VaasError::InvalidResponse(err.to_string())
        } else {
            // Request or body failed on the wire
            VaasError::ConnectionLost(err.to_string())
        }
    }
}
