use thiserror::Error;

use crate::transport::TransportStatus;

/// Terminal error carried by a settled [`Request`](crate::request::Request).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request cancelled")]
    Cancelled,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("endpoint timeout")]
    EndpointTimeout,

    #[error("transport error {status:?}: {message}")]
    Transport {
        status: TransportStatus,
        message: String,
    },
}

impl RequestError {
    /// Maps a request error back to the transport status that produced it.
    pub fn status(&self) -> TransportStatus {
        match self {
            RequestError::Cancelled => TransportStatus::Canceled,
            RequestError::ConnectionReset => TransportStatus::ConnectionReset,
            RequestError::EndpointTimeout => TransportStatus::EndpointTimeout,
            RequestError::Transport { status, .. } => *status,
        }
    }
}

/// Terminal status of a request: `Ok(())` or the error it settled with.
pub type RequestStatus = std::result::Result<(), RequestError>;

/// Failures returned by construction and submission calls.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not initialized")]
    NotInitialized(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("endpoint timeout: {0}")]
    EndpointTimeout(String),

    #[error("transport error {status:?}: {message}")]
    Transport {
        status: TransportStatus,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn transport(status: TransportStatus) -> Self {
        Error::Transport {
            status,
            message: status.description().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
