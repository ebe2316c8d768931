//! Configuration types

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tunnel: TunnelSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub process: ProcessSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.config_path = Some(path.to_path_buf());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            Ok(Self {
                config_path: Some(path.to_path_buf()),
                ..Self::default()
            })
        }
    }

    /// Save settings to the path they were loaded from
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Tunnel and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Tunnel network; the relay takes `.1`
    #[serde(default = "default_network")]
    pub network: Ipv4Addr,

    /// TUN device MTU, the largest tunnelled frame
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// TUN device name, kernel-assigned when absent
    #[serde(default)]
    pub device: Option<String>,

    /// Answer ordinary pings that are not tunnel traffic
    #[serde(default)]
    pub answer_echo: bool,

    #[serde(default = "default_true")]
    pub ipv4: bool,

    #[serde(default = "default_true")]
    pub ipv6: bool,

    /// Packets buffered per client while it has no outstanding poll
    #[serde(default = "default_max_buffered_packets")]
    pub max_buffered_packets: usize,

    /// Per-client queues that share the buffer
    #[serde(default = "default_flow_queues")]
    pub flow_queues: usize,

    /// Messages read from one socket per wakeup
    #[serde(default = "default_recv_batch_max")]
    pub recv_batch_max: usize,

    #[serde(default = "default_socket_buffer")]
    pub recv_buffer: usize,

    #[serde(default = "default_socket_buffer")]
    pub send_buffer: usize,

    /// Outbound limit in kbit/s, 0 for none
    #[serde(default)]
    pub rate_kbps: u32,

    #[serde(default = "default_burst_bytes")]
    pub burst_bytes: u32,
}

fn default_network() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 0)
}

fn default_mtu() -> u16 {
    1467
}

fn default_true() -> bool {
    true
}

fn default_max_buffered_packets() -> usize {
    20
}

fn default_flow_queues() -> usize {
    4
}

fn default_recv_batch_max() -> usize {
    32
}

fn default_socket_buffer() -> usize {
    256 * 1024
}

fn default_burst_bytes() -> u32 {
    4500
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            mtu: default_mtu(),
            device: None,
            answer_echo: false,
            ipv4: true,
            ipv6: true,
            max_buffered_packets: default_max_buffered_packets(),
            flow_queues: default_flow_queues(),
            recv_batch_max: default_recv_batch_max(),
            recv_buffer: default_socket_buffer(),
            send_buffer: default_socket_buffer(),
            rate_kbps: 0,
            burst_bytes: default_burst_bytes(),
        }
    }
}

/// Shared secret
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Identity to switch to once sockets and the device are open
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSettings {
    #[serde(default)]
    pub user_id: Option<u32>,

    /// Defaults to the primary group of `user_id` when unset
    #[serde(default)]
    pub group_id: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("echotun-settings-{}-{}", std::process::id(), name))
            .join("settings.json")
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.tunnel.network, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(settings.tunnel.mtu, 1467);
        assert_eq!(settings.tunnel.max_buffered_packets, 20);
        assert_eq!(settings.tunnel.flow_queues, 4);
        assert_eq!(settings.tunnel.recv_batch_max, 32);
        assert_eq!(settings.tunnel.recv_buffer, 262144);
        assert_eq!(settings.tunnel.rate_kbps, 0);
        assert_eq!(settings.tunnel.burst_bytes, 4500);
        assert!(settings.tunnel.ipv4 && settings.tunnel.ipv6);
        assert!(!settings.tunnel.answer_echo);
        assert!(settings.auth.passphrase.is_none());
        assert!(settings.process.user_id.is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "tunnel": { "network": "10.8.0.0", "rate_kbps": 256 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.tunnel.network, Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(settings.tunnel.rate_kbps, 256);
        assert_eq!(settings.tunnel.mtu, 1467);
        assert!(settings.tunnel.ipv6);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = temp_path("missing");
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.config_path(), Some(path.as_path()));
        assert_eq!(settings.tunnel.flow_queues, 4);
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("roundtrip");
        let mut settings = Settings::default();
        settings.tunnel.answer_echo = true;
        settings.auth.passphrase = Some("hunter2".to_string());
        settings.process.user_id = Some(65534);
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert!(loaded.tunnel.answer_echo);
        assert_eq!(loaded.auth.passphrase.as_deref(), Some("hunter2"));
        assert_eq!(loaded.process.user_id, Some(65534));

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let path = temp_path("invalid");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            Settings::load_from(&path),
            Err(SettingsError::ParseError(_))
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_debug_redacts_passphrase() {
        let auth = AuthSettings {
            passphrase: Some("hunter2".to_string()),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
