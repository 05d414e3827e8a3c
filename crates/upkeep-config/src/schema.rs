//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Account server settings
    #[serde(default)]
    pub server: RawServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: RawClientConfig,
}

/// Server-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawServerConfig {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/upkeep/upkeepd.sock)
    pub socket_path: Option<PathBuf>,

    /// Data directory for the account database
    pub data_dir: Option<PathBuf>,

    /// How long an account job may hold the account lock before it is
    /// considered orphaned
    pub job_timeout_seconds: Option<u64>,
}

/// Client-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawClientConfig {
    /// Socket of the server to talk to
    pub socket_path: Option<PathBuf>,

    /// Where saved credentials live
    pub data_dir: Option<PathBuf>,

    /// Surplus of recent completions that triggers a flush to the archive
    pub flush_threshold: Option<usize>,

    /// How long "Saved" is shown after the last save finishes
    pub saved_indicator_millis: Option<u64>,
}
