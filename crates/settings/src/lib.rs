//! echotun Settings
//!
//! Relay configuration persisted as a JSON file.
//!
//! ## Usage
//!
//! ```no_run
//! use echotun_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.tunnel.rate_kbps = 512;
//! settings.save()?;
//! # Ok::<(), echotun_settings::SettingsError>(())
//! ```

mod config;

pub use config::{AuthSettings, ProcessSettings, Settings, TunnelSettings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Directory holding the settings file: `~/.echotun`, or `/etc/echotun`
/// when no home directory is known
pub fn default_config_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".echotun"),
        _ => PathBuf::from("/etc/echotun"),
    }
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
