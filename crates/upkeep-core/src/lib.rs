//! Client-side planner state engine for upkeep
//!
//! This crate holds everything a logged-in client keeps in memory:
//! - Planner tree of categories and tasks (arena of ids)
//! - Completion history, split into a recent working set and per-task archives
//! - Due-date and status derivation
//! - Encrypted chunk codec and versioned chunk schemas
//! - Sync engine serializing every server request into one FIFO queue

mod chunks;
mod codec;
mod completions;
mod credentials;
mod due;
mod error;
mod forms;
mod planner;
mod session;
mod status;
mod sync;

pub use chunks::*;
pub use codec::*;
pub use completions::*;
pub use credentials::*;
pub use due::*;
pub use error::*;
pub use forms::*;
pub use planner::*;
pub use session::*;
pub use status::*;
pub use sync::*;
