// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Core Library
// Platform sessions, SSH tunnels over the platform gateway, and tunnelled HTTP

pub mod accounts;
pub mod bindings;
pub mod connection;
pub mod credentials;
pub mod destinations;
pub mod gateway;
pub mod host_key;
pub mod oauth;
pub mod platform;
pub mod reconnect;
pub mod router;
pub mod setup;
pub mod token_store;
pub mod transport;
pub mod tunnel;

pub use accounts::{AccountDirectory, GlobalAccount, SubAccount};
pub use bindings::{ConnectivityCredentials, DestinationCredentials, ServiceBindings};
pub use connection::{ssh_username, Connection};
pub use credentials::CredentialExchanger;
pub use destinations::{fetch_all, on_premise, Destination, DestinationService, DestinationSource};
pub use gateway::{GatewayDirectory, GatewayEndpoints, GatewayInfo};
pub use host_key::{Fingerprint, HostKeyPolicy};
pub use oauth::{classify_rejection, service_token, CredentialKind};
pub use platform::{App, AppEnvironment, PlatformClient, SshEnabled};
pub use reconnect::{CredentialPrompt, LoginCredentials, ReconnectPolicy};
pub use router::RequestRouter;
pub use setup::{SetupPrompt, SetupSession};
pub use token_store::{Identity, Session, SessionRenewal, TokenStore};
pub use transport::{
    create_http_client, DirectTransport, ProxyCredentials, RestClient, TransportProvider, TunnelTransport,
};
pub use tunnel::{TunnelHandle, TunnelManager, TunnelRequest};
