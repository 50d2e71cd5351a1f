// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// Common types for BTP Tunnel

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::network::format_host_port;

/// One local listener relayed to a host:port inside the gateway's network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    /// Local port to bind (0 = ephemeral)
    pub local_port: u16,
    /// Bind only this address instead of the loopback pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,
    pub remote_host: String,
    pub remote_port: u16,
}

/// An address a forward listens on, and whether failing to bind it is fatal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindTarget {
    pub ip: IpAddr,
    pub required: bool,
}

impl ForwardSpec {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            bind_address: None,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_host.trim().is_empty() {
            return Err(Error::Config("Forward remote host cannot be empty".to_string()));
        }
        if self.remote_port == 0 {
            return Err(Error::Config(format!(
                "Forward to {} needs a remote port greater than 0",
                self.remote_host
            )));
        }
        Ok(())
    }

    /// Addresses to bind, in order.
    ///
    /// An explicit bind address is the only (required) target. Otherwise the
    /// IPv4 loopback is required and the IPv6 loopback is best effort.
    pub fn bind_targets(&self) -> Vec<BindTarget> {
        match self.bind_address {
            Some(ip) => vec![BindTarget { ip, required: true }],
            None => vec![
                BindTarget {
                    ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    required: true,
                },
                BindTarget {
                    ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
                    required: false,
                },
            ],
        }
    }

    /// `host:port` of the remote side
    pub fn remote(&self) -> String {
        format_host_port(&self.remote_host, self.remote_port)
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bind_address {
            Some(ip) => write!(f, "{} -> {}", SocketAddr::new(ip, self.local_port), self.remote()),
            None => write!(f, "localhost:{} -> {}", self.local_port, self.remote()),
        }
    }
}

/// Lifecycle state of a tunnel handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Not opened yet, or closed for good
    Closed,
    /// SSH handshake and password authentication
    Authenticating,
    /// Binding local listeners
    Connecting,
    /// Relaying connections
    Listening,
    /// Opening failed or the gateway session dropped
    Error(String),
}

impl TunnelState {
    pub fn is_listening(&self) -> bool {
        matches!(self, TunnelState::Listening)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, TunnelState::Authenticating | TunnelState::Connecting)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Closed => f.write_str("closed"),
            TunnelState::Authenticating => f.write_str("authenticating"),
            TunnelState::Connecting => f.write_str("connecting"),
            TunnelState::Listening => f.write_str("listening"),
            TunnelState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Events broadcast by the tunnel manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    StateChanged {
        id: Uuid,
        state: TunnelState,
        timestamp: DateTime<Utc>,
    },

    /// A local connection got its forwarded channel
    ConnectionOpened {
        id: Uuid,
        peer: SocketAddr,
        remote: String,
        timestamp: DateTime<Utc>,
    },

    /// A local connection was closed without being relayed
    ConnectionRejected {
        id: Uuid,
        peer: SocketAddr,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl TunnelEvent {
    pub fn id(&self) -> Uuid {
        match self {
            TunnelEvent::StateChanged { id, .. }
            | TunnelEvent::ConnectionOpened { id, .. }
            | TunnelEvent::ConnectionRejected { id, .. } => *id,
        }
    }
}

/// Everything needed to reopen a connection without prompting.
///
/// Handed to (and received from) an external credential store as an opaque
/// JSON blob.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionData {
    /// Raw `VCAP_SERVICES` JSON of the SSH helper app
    #[serde(rename = "vcapServices")]
    pub vcap_services: String,
    /// GUID of the SSH helper app
    pub guid: String,
    #[serde(rename = "btpDestinationName")]
    pub destination_name: String,
    #[serde(rename = "cfRegion")]
    pub region: String,
    #[serde(rename = "cfRefreshToken")]
    pub refresh_token: String,
}

impl ReconnectionData {
    pub fn from_json(json: &str) -> Result<Self> {
        let data: Self = serde_json::from_str(json)?;
        data.validate()?;
        Ok(data)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("vcapServices", &self.vcap_services),
            ("guid", &self.guid),
            ("btpDestinationName", &self.destination_name),
            ("cfRegion", &self.region),
            ("cfRefreshToken", &self.refresh_token),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Reconnection data is missing '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ReconnectionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectionData")
            .field("guid", &self.guid)
            .field("destination_name", &self.destination_name)
            .field("region", &self.region)
            .field("refresh_token", &"[redacted]")
            .finish_non_exhaustive()
    }
}
