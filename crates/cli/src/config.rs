// BTP Tunnel - CLI Config Module
// Locates and loads the connector configuration for the CLI

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use btp_tunnel_common::{ConnectorConfig, ReconnectionData};

/// Effective config path: the `--config` override or the per-user default
pub fn config_path(override_path: Option<&Path>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path.to_path_buf()),
        None => ConnectorConfig::default_path().context("Could not determine config directory"),
    }
}

/// Load configuration; a missing file yields the defaults
pub fn load(override_path: Option<&Path>) -> Result<ConnectorConfig> {
    let path = config_path(override_path)?;
    ConnectorConfig::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

pub fn read_reconnection_data(path: &Path) -> Result<ReconnectionData> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read connection data from {}", path.display()))?;
    ReconnectionData::from_json(&contents)
        .with_context(|| format!("Invalid connection data in {}", path.display()))
}

pub fn write_reconnection_data(path: &Path, data: &ReconnectionData) -> Result<()> {
    let json = data.to_json().context("Failed to serialize connection data")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write connection data to {}", path.display()))
}
