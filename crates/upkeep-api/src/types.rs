//! Shared types for the upkeep API

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use upkeep_util::TaskId;

/// Chunk name → ciphertext. `None` is a tombstone ("absent"), distinct from
/// an encrypted empty collection.
pub type ChunkMap = BTreeMap<String, Option<String>>;

/// Chunk holding the serialized planner tree
pub const PLANNER_ITEMS_CHUNK: &str = "plannerItems";

/// Chunk holding the recent completions working set
pub const RECENT_COMPLETIONS_CHUNK: &str = "recentCompletions";

/// Prefix of the per-task old completions archive chunks
pub const OLD_COMPLETIONS_PREFIX: &str = "oldCompletions.";

/// Longest chunk name the server accepts
pub const MAX_CHUNK_NAME_LEN: usize = 64;

/// Name of the archive chunk for one task
pub fn old_completions_chunk(task_id: TaskId) -> String {
    format!("{}{}", OLD_COMPLETIONS_PREFIX, task_id)
}

/// Task id encoded in an archive chunk name, if `name` is one
pub fn parse_old_completions_chunk(name: &str) -> Option<TaskId> {
    name.strip_prefix(OLD_COMPLETIONS_PREFIX)?
        .parse::<u64>()
        .ok()
        .map(TaskId::new)
}

/// Whether the server should accept `name` as a chunk name.
///
/// Names must be short, non-empty, and free of the `_` separator used in
/// the key-value store's `<name>_<username>` keys.
pub fn is_valid_chunk_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CHUNK_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
}

/// Salts and versions of the logged-in account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSalts {
    pub auth_salt: String,
    pub key_salt: String,
    pub key_version: u64,
    pub chunks_version: u64,
}
