//! upkeepd account server
//!
//! - Per-account job queue with an orphan timeout
//! - Command handling, version checks and graceful shutdown
//! - In-process transport for tests and embedding
//! - Serve loop over the IPC socket

mod daemon;
mod queue;
mod service;
mod transport;

pub use daemon::*;
pub use queue::*;
pub use service::*;
pub use transport::*;
