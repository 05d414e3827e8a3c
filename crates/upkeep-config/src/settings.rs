//! Validated settings types

use crate::schema::{RawClientConfig, RawConfig, RawServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use upkeep_util::{default_data_dir, default_socket_path};

/// Default time an account job may run before it is treated as orphaned
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Default surplus of recent completions that triggers a flush
pub const DEFAULT_FLUSH_THRESHOLD: usize = 3;

/// Default time the "Saved" indicator stays visible
pub const DEFAULT_SAVED_INDICATOR: Duration = Duration::from_millis(1200);

/// Validated settings for both halves of the system
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
}

impl Settings {
    /// Convert from a validated raw config
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            server: ServerSettings::from_raw(raw.server),
            client: ClientSettings::from_raw(raw.client),
        }
    }
}

/// Account server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub job_timeout: Duration,
}

impl ServerSettings {
    fn from_raw(raw: RawServerConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
            job_timeout: raw
                .job_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_JOB_TIMEOUT),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_raw(RawServerConfig::default())
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub flush_threshold: usize,
    pub saved_indicator: Duration,
}

impl ClientSettings {
    fn from_raw(raw: RawClientConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
            flush_threshold: raw.flush_threshold.unwrap_or(DEFAULT_FLUSH_THRESHOLD),
            saved_indicator: raw
                .saved_indicator_millis
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SAVED_INDICATOR),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_raw(RawClientConfig::default())
    }
}
