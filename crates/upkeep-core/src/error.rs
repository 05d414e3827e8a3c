//! Client error types

use thiserror::Error;
use upkeep_util::{CalendarError, TaskId};

use crate::{CodecError, ItemId, SyncError};

/// Errors surfaced by planner and session operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad user input; nothing was changed
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A chunk decoded but its contents are inconsistent
    #[error("Invalid chunk '{chunk}': {message}")]
    Schema { chunk: String, message: String },

    #[error("Unknown planner item {0}")]
    UnknownItem(ItemId),

    #[error("Unknown task {0}")]
    UnknownTask(TaskId),

    #[error("Unknown completion")]
    UnknownCompletion,

    /// The password was changed elsewhere; the saved key no longer applies
    #[error("Your saved credentials are out of date. Please log in again.")]
    KeyVersionMismatch { saved: u64, current: u64 },

    #[error("You are not currently logged in. Please log in to view your tasks.")]
    NotLoggedIn,

    #[error("Credential storage error: {0}")]
    Credentials(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn schema(chunk: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Schema {
            chunk: chunk.into(),
            message: msg.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
