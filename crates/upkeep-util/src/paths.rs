//! Default paths for upkeep components
//!
//! Provides centralized path defaults that all crates can use.
//! Paths are user-writable by default (no root required):
//! - Socket: `$XDG_RUNTIME_DIR/upkeep/upkeepd.sock` or `/tmp/upkeep-$USER/upkeepd.sock`
//! - Data: `$XDG_DATA_HOME/upkeep` or `~/.local/share/upkeep`
//! - Config: `$XDG_CONFIG_HOME/upkeep/config.toml` or `~/.config/upkeep/config.toml`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const UPKEEP_SOCKET_ENV: &str = "UPKEEP_SOCKET";

/// Environment variable for overriding the data directory
pub const UPKEEP_DATA_DIR_ENV: &str = "UPKEEP_DATA_DIR";

/// Socket filename within the socket directory
const SOCKET_FILENAME: &str = "upkeepd.sock";

/// Server database filename within the data directory
const DATABASE_FILENAME: &str = "upkeepd.db";

/// Client credential bundle filename within the data directory
const CREDENTIALS_FILENAME: &str = "credentials.json";

/// Application subdirectory name
const APP_DIR: &str = "upkeep";

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$UPKEEP_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/upkeep/upkeepd.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/upkeep-$USER/upkeepd.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(UPKEEP_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Get the socket path without checking UPKEEP_SOCKET env var.
/// Used for default values in configs where the env var is checked separately.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default data directory.
///
/// Order of precedence:
/// 1. `$UPKEEP_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/upkeep` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/upkeep` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(UPKEEP_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Get the data directory without checking UPKEEP_DATA_DIR env var.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR);
    }

    // Last resort
    PathBuf::from("/tmp").join(APP_DIR).join("data")
}

/// Get the default configuration file path.
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join("config.toml");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml");
    }

    PathBuf::from("/etc").join(APP_DIR).join("config.toml")
}

/// Path of the server database inside a data directory
pub fn database_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(DATABASE_FILENAME)
}

/// Path of the client credential bundle inside a data directory
pub fn credentials_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(CREDENTIALS_FILENAME)
}
