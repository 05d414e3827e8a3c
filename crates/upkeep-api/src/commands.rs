//! Command types for the upkeep protocol

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{API_VERSION, AccountSalts, ChunkMap};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }

    pub fn into_result(self) -> Result<ResponsePayload, ErrorInfo> {
        match self.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn stale() -> Self {
        Self::new(
            ErrorCode::StaleData,
            "Your data is out of date. Please reload the page.",
        )
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotLoggedIn,
    UnknownUser,
    IncorrectPassword,
    /// `key_version` or `chunks_version` did not match the account
    StaleData,
    /// The server is draining; retry later
    ShuttingDown,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Look up the salt used to hash the password for authentication
    GetAuthSalt { username: String },

    /// Bind this connection to an account
    LogIn { username: String, auth_hash: String },

    /// Salts and versions of the logged-in account
    GetSalts,

    /// Check a password hash against the logged-in account
    ValidateAuthHash {
        auth_hash: String,
        key_version: Option<u64>,
        chunks_version: Option<u64>,
    },

    /// Replace the password and every chunk (re-encrypted under the new key)
    ChangePassword {
        old_auth_hash: String,
        new_auth_salt: String,
        new_auth_hash: String,
        new_key_salt: String,
        key_version: u64,
        chunks_version: u64,
        chunks: ChunkMap,
    },

    /// Read chunks by name
    GetChunks {
        key_version: u64,
        chunks_version: Option<u64>,
        names: Vec<String>,
    },

    /// Write (or tombstone) a set of chunks as one version step
    SetChunks {
        key_version: u64,
        chunks_version: u64,
        chunks: ChunkMap,
    },

    /// Ping for keepalive
    Ping,
}

impl Command {
    /// Commands that change account state and go through the account queue
    pub fn is_mutating(&self) -> bool {
        matches!(self, Command::ChangePassword { .. } | Command::SetChunks { .. })
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetAuthSalt { .. } => "get_auth_salt",
            Command::LogIn { .. } => "log_in",
            Command::GetSalts => "get_salts",
            Command::ValidateAuthHash { .. } => "validate_auth_hash",
            Command::ChangePassword { .. } => "change_password",
            Command::GetChunks { .. } => "get_chunks",
            Command::SetChunks { .. } => "set_chunks",
            Command::Ping => "ping",
        }
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    AuthSalt {
        auth_salt: String,
    },
    LoggedIn {
        key_salt: String,
        key_version: u64,
    },
    Salts(AccountSalts),
    Validated,
    PasswordChanged {
        key_version: u64,
        chunks_version: u64,
    },
    Chunks {
        chunks: ChunkMap,
        chunks_version: u64,
    },
    ChunksSet {
        chunks_version: u64,
    },
    Pong,
}
