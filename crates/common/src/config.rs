// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// Configuration structures for BTP Tunnel

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Top-level connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Platform domain the regional API and login hosts live under
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Base URL of the account directory service
    #[serde(default = "default_btp_cli_url")]
    pub btp_cli_url: String,
    #[serde(default = "default_btp_cli_version")]
    pub btp_cli_version: String,
    /// Public OAuth client used for platform logins (empty secret)
    #[serde(default = "default_oauth_client_id")]
    pub oauth_client_id: String,
    /// Name of the SSH helper app in the sub account
    #[serde(default = "default_ssh_app_name")]
    pub ssh_app_name: String,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub tunnel: TunnelOptions,
    #[serde(default = "default_forwards")]
    pub forwards: Vec<ForwardPort>,
}

/// SSH session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u64,
    /// Unanswered keepalives before the session is dropped
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: u32,
    /// SSH connect + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// SSH window size in bytes
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    /// Maximum SSH packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Verify the gateway host key against the published fingerprint
    #[serde(default = "default_verify_host_key")]
    pub verify_host_key: bool,
}

/// A local port relayed to the same-purpose port of the connectivity proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPort {
    /// 0 = ephemeral
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardPort {
    pub fn same(port: u16) -> Self {
        Self {
            local_port: port,
            remote_port: port,
        }
    }
}

// Default value functions
fn default_domain() -> String {
    "hana.ondemand.com".to_string()
}

fn default_btp_cli_url() -> String {
    "https://cli.btp.cloud.sap".to_string()
}

fn default_btp_cli_version() -> String {
    "v2.90.2".to_string()
}

fn default_oauth_client_id() -> String {
    "cf".to_string()
}

fn default_ssh_app_name() -> String {
    "trm-ssh".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    15
}

fn default_keepalive_max() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_window_size() -> u32 {
    2097152 // 2 MiB
}

fn default_max_packet_size() -> u32 {
    65535
}

fn default_nodelay() -> bool {
    true
}

fn default_verify_host_key() -> bool {
    true
}

fn default_forwards() -> Vec<ForwardPort> {
    // HTTP proxy and SOCKS5 ports of the connectivity proxy
    vec![ForwardPort::same(20003), ForwardPort::same(20004)]
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: default_keepalive(),
            keepalive_max: default_keepalive_max(),
            connect_timeout: default_connect_timeout(),
            window_size: default_window_size(),
            max_packet_size: default_max_packet_size(),
            nodelay: default_nodelay(),
            verify_host_key: default_verify_host_key(),
        }
    }
}

impl TunnelOptions {
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_interval > 0).then(|| Duration::from_secs(self.keepalive_interval))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            btp_cli_url: default_btp_cli_url(),
            btp_cli_version: default_btp_cli_version(),
            oauth_client_id: default_oauth_client_id(),
            ssh_app_name: default_ssh_app_name(),
            request_timeout: default_request_timeout(),
            tunnel: TunnelOptions::default(),
            forwards: default_forwards(),
        }
    }
}

impl ConnectorConfig {
    /// Default location: `<config dir>/btp-tunnel/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join("btp-tunnel").join("config.toml"))
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(Error::Config("Domain cannot be empty".to_string()));
        }
        if self.oauth_client_id.is_empty() {
            return Err(Error::Config("OAuth client id cannot be empty".to_string()));
        }
        if self.ssh_app_name.trim().is_empty() {
            return Err(Error::Config("SSH app name cannot be empty".to_string()));
        }
        if self.forwards.is_empty() {
            return Err(Error::Config("At least one forward is required".to_string()));
        }

        let mut seen = HashSet::new();
        for forward in &self.forwards {
            if forward.remote_port == 0 {
                return Err(Error::Config(
                    "Forward remote port must be greater than 0".to_string(),
                ));
            }
            if forward.local_port != 0 && !seen.insert(forward.local_port) {
                return Err(Error::Config(format!(
                    "Local port {} is forwarded twice",
                    forward.local_port
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::default();
        assert_eq!(config.domain, "hana.ondemand.com");
        assert_eq!(config.oauth_client_id, "cf");
        assert_eq!(config.forwards, vec![ForwardPort::same(20003), ForwardPort::same(20004)]);
        assert_eq!(config.tunnel.keepalive(), Some(Duration::from_secs(15)));
        assert_eq!(config.tunnel.keepalive_max, 3);
        assert!(config.tunnel.verify_host_key);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ConnectorConfig = toml::from_str(
            r#"
            domain = "example.test"

            [tunnel]
            keepalive_interval = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.domain, "example.test");
        assert_eq!(config.ssh_app_name, "trm-ssh");
        assert_eq!(config.tunnel.keepalive(), None);
        assert_eq!(config.tunnel.window_size, 2097152);
        assert_eq!(config.forwards.len(), 2);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = ConnectorConfig::default();
        config.domain = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.forwards = vec![ForwardPort::same(20003), ForwardPort::same(20003)];
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.forwards = vec![ForwardPort {
            local_port: 0,
            remote_port: 0,
        }];
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.forwards.clear();
        assert!(config.validate().is_err());

        // Ephemeral local ports may repeat
        let mut config = ConnectorConfig::default();
        config.forwards = vec![
            ForwardPort {
                local_port: 0,
                remote_port: 20003,
            },
            ForwardPort {
                local_port: 0,
                remote_port: 20004,
            },
        ];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let missing = ConnectorConfig::load_from(&path).unwrap();
        assert_eq!(missing.domain, "hana.ondemand.com");

        let mut config = ConnectorConfig::default();
        config.ssh_app_name = "ssh-helper".to_string();
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = ConnectorConfig::load_from(&path).unwrap();
        assert_eq!(loaded.ssh_app_name, "ssh-helper");
        assert_eq!(loaded.forwards, config.forwards);

        std::fs::write(&path, "domain = 42").unwrap();
        assert!(matches!(
            ConnectorConfig::load_from(&path),
            Err(Error::Toml(_))
        ));
    }
}
