//! Shared utilities for upkeep
//!
//! This crate provides:
//! - Calendar dates and due-date projection
//! - ID types (TaskId, ClientId)
//! - Time utilities (mockable wall clock, monotonic instants)
//! - Default paths for socket, data, and config files

mod calendar;
mod ids;
mod paths;
mod time;

pub use calendar::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
