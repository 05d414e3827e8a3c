//! Protocol types for upkeep
//!
//! This crate defines the stable API between the upkeep client engine and
//! the upkeepd account server:
//! - Commands (requests from clients)
//! - Responses and error codes
//! - Chunk naming
//! - The `Transport` trait the client sync engine talks through
//! - A mock server for tests

mod commands;
mod mock;
mod transport;
mod types;

pub use commands::*;
pub use mock::*;
pub use transport::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
