// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Common Library
// Shared types, errors, and configuration structures

pub mod config;
pub mod error;
pub mod network;
pub mod secret;
pub mod types;

pub use config::{ConnectorConfig, ForwardPort, TunnelOptions};
pub use error::{AuthFailure, Error, Result};
pub use network::{format_host_port, is_loopback_address, split_host_port};
pub use secret::{obfuscate_token, Secret};
pub use types::{BindTarget, ForwardSpec, ReconnectionData, TunnelEvent, TunnelState};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
