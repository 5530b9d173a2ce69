//! Environment constants and path utilities for the session valve.
//!
//! This module centralizes the hardcoded paths, file names and defaults used
//! throughout the crate, making them easier to maintain and modify.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const SVALVE_DIR_NAME: &str = ".svalve";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "svalve.toml";

/// Valve defaults
pub mod valve {
    /// Status sent to requests refused their session ("Too Many Requests")
    pub const DEFAULT_REJECTION_STATUS: u16 = 429;

    /// Idle seconds before a newly created session goes stale
    pub const DEFAULT_MAX_INACTIVE_INTERVAL: i64 = 1800;

    /// Seconds between sweeps of the active working set
    pub const DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS: u64 = 60;
}

/// Session store file layout
pub mod store {
    /// Sessions directory name within .svalve
    pub const SESSIONS_DIR_NAME: &str = "sessions";

    /// Extension of an uncompressed session file
    pub const SESSION_EXTENSION: &str = "json";

    /// Extension of a gzip-compressed session file
    pub const COMPRESSED_EXTENSION: &str = "json.gz";
}

/// Build the .svalve directory path from a root directory
pub fn svalve_dir_path(root: &Path) -> PathBuf {
    root.join(SVALVE_DIR_NAME)
}

/// Build the default session store directory from a root directory
pub fn sessions_dir_path(root: &Path) -> PathBuf {
    svalve_dir_path(root).join(store::SESSIONS_DIR_NAME)
}

/// Build the config file path inside a project's .svalve directory
pub fn local_config_file_path(root: &Path) -> PathBuf {
    svalve_dir_path(root).join(CONFIG_FILE_NAME)
}

/// Build the per-user config directory path
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(SVALVE_DIR_NAME)
}

/// Build the per-user config file path
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}
