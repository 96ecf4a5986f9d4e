// marksync platform paths
// Config and data directories per OS, with a single override for tests and
// packaged deployments.
//
// Linux:   $XDG_CONFIG_HOME/marksync, $XDG_DATA_HOME/marksync
// macOS:   ~/Library/Application Support/marksync (both)
// Windows: %APPDATA%\marksync (both)

use std::env;
use std::path::PathBuf;

/// When set, both config and data live under this directory.
pub const ENV_HOME_OVERRIDE: &str = "MARKSYNC_HOME";

const APP_DIR: &str = "marksync";

/// Returns the configuration directory.
pub fn get_config_dir() -> PathBuf {
    if let Some(root) = home_override() {
        return root.join("config");
    }
    config_base().join(APP_DIR)
}

/// Returns the data directory (embedded database, credentials).
pub fn get_data_dir() -> PathBuf {
    if let Some(root) = home_override() {
        return root.join("data");
    }
    data_base().join(APP_DIR)
}

fn home_override() -> Option<PathBuf> {
    env::var_os(ENV_HOME_OVERRIDE)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn user_home() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
}

#[cfg(target_os = "linux")]
fn config_base() -> PathBuf {
    env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| user_home().join(".config"))
}

#[cfg(target_os = "linux")]
fn data_base() -> PathBuf {
    env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| user_home().join(".local").join("share"))
}

#[cfg(target_os = "macos")]
fn config_base() -> PathBuf {
    user_home().join("Library").join("Application Support")
}

#[cfg(target_os = "macos")]
fn data_base() -> PathBuf {
    config_base()
}

#[cfg(target_os = "windows")]
fn config_base() -> PathBuf {
    env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| user_home().join("AppData").join("Roaming"))
}

#[cfg(target_os = "windows")]
fn data_base() -> PathBuf {
    config_base()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn config_base() -> PathBuf {
    user_home().join(".config")
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn data_base() -> PathBuf {
    user_home().join(".local").join("share")
}
