//! Transport trait used by the client sync engine

use async_trait::async_trait;
use thiserror::Error;

use crate::{Command, ErrorCode, ErrorInfo, ResponsePayload};

/// Errors from a transport round-trip
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The request never produced a well-formed response
    #[error("There was an error while communicating with the server: {0}")]
    Communication(String),

    /// The server answered with an error
    #[error("Server error: {0}")]
    Server(ErrorInfo),

    /// The server answered with the wrong payload kind
    #[error("Unexpected response to {command}")]
    UnexpectedResponse { command: &'static str },
}

impl TransportError {
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    pub fn server(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Server(ErrorInfo::new(code, msg))
    }

    /// Error code reported by the server, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server(info) => Some(info.code),
            _ => None,
        }
    }

    /// Whether the server rejected the request for carrying old versions
    pub fn is_stale(&self) -> bool {
        self.code() == Some(ErrorCode::StaleData)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A connection to an account server, already bound to one account
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one command and wait for its response
    async fn call(&self, command: Command) -> TransportResult<ResponsePayload>;
}
