// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Connection Module
// Opens the tunnel described by reconnection data and hands out tunnelled REST clients

use std::sync::{Arc, Mutex, PoisonError};

use reqwest::{Client, Url};
use tracing::{debug, info};

use btp_tunnel_common::{ConnectorConfig, Error, ForwardSpec, ReconnectionData, Result};

use crate::bindings::ServiceBindings;
use crate::credentials::CredentialExchanger;
use crate::destinations::DestinationService;
use crate::gateway::{GatewayDirectory, GatewayEndpoints};
use crate::host_key::HostKeyPolicy;
use crate::reconnect::{CredentialPrompt, ReconnectPolicy};
use crate::router::RequestRouter;
use crate::token_store::{Identity, TokenStore};
use crate::transport::{
    create_http_client, ProxyCredentials, RestClient, TunnelTransport, DEFAULT_HTTP_PROXY_PORT,
};
use crate::tunnel::{TunnelHandle, TunnelManager, TunnelRequest};

/// SSH user for instance 0 of the helper app
pub fn ssh_username(app_guid: &str) -> String {
    format!("cf:{}/0", app_guid)
}

/// A tunnel to the on-premise proxy of one subaccount
pub struct Connection {
    config: ConnectorConfig,
    data: ReconnectionData,
    bindings: ServiceBindings,
    http: Client,
    directory: GatewayDirectory,
    endpoints: Arc<GatewayEndpoints>,
    tokens: Arc<TokenStore>,
    exchanger: CredentialExchanger,
    policy: Option<ReconnectPolicy>,
    tunnels: TunnelManager,
    handle: Mutex<Option<TunnelHandle>>,
}

impl Connection {
    pub fn new(
        config: ConnectorConfig,
        data: ReconnectionData,
        prompt: Option<Arc<dyn CredentialPrompt>>,
    ) -> Result<Self> {
        let http = create_http_client(config.request_timeout())?;
        let directory = GatewayDirectory::new(http.clone(), config.domain.clone());
        Self::with_directory(config, data, directory, prompt)
    }

    /// Use `directory` to resolve the region instead of the configured domain
    pub fn with_directory(
        config: ConnectorConfig,
        data: ReconnectionData,
        directory: GatewayDirectory,
        prompt: Option<Arc<dyn CredentialPrompt>>,
    ) -> Result<Self> {
        config.validate()?;
        data.validate()?;

        let bindings = ServiceBindings::parse(&data.vcap_services)?;
        // Fail early rather than after the tunnel is up
        bindings.connectivity()?;

        let http = create_http_client(config.request_timeout())?;
        let endpoints = directory.resolve(&data.region)?;
        let identity = Identity::with_refresh_token(data.region.clone(), data.refresh_token.as_str());
        let tokens = Arc::new(TokenStore::new(
            http.clone(),
            &endpoints,
            config.oauth_client_id.clone(),
            identity,
        ));
        let exchanger = CredentialExchanger::new(config.request_timeout())?;
        let tunnels = TunnelManager::new(config.tunnel.clone());

        Ok(Self {
            config,
            data,
            bindings,
            http,
            directory,
            endpoints,
            tokens,
            exchanger,
            policy: prompt.map(ReconnectPolicy::new),
            tunnels,
            handle: Mutex::new(None),
        })
    }

    pub fn ssh_username(&self) -> String {
        ssh_username(&self.data.guid)
    }

    pub fn bindings(&self) -> &ServiceBindings {
        &self.bindings
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Configured forwards towards the connectivity proxy host
    pub fn forward_specs(&self) -> Result<Vec<ForwardSpec>> {
        let remote_host = self.bindings.connectivity()?.onpremise_proxy_host;
        Ok(self
            .config
            .forwards
            .iter()
            .map(|f| ForwardSpec::new(f.local_port, remote_host.clone(), f.remote_port))
            .collect())
    }

    /// The open tunnel, if any
    pub fn tunnel(&self) -> Option<TunnelHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|h| !h.is_finished())
    }

    /// Log in, fetch a one-time password and open the tunnel.
    ///
    /// Returns the existing handle when the tunnel is already listening.
    /// A handle that stopped listening is closed first, so its local ports
    /// are free for the new tunnel.
    pub async fn open(&self) -> Result<TunnelHandle> {
        let previous = self.handle.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handle) = previous {
            if !handle.is_finished() && handle.state().is_listening() {
                debug!("Tunnel {} already open", handle.id());
                return Ok(handle);
            }
            info!("Replacing tunnel {} ({})", handle.id(), handle.state());
            self.tunnels.close(&handle.id()).await?;
            self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        }

        self.with_policy(|| self.tokens.login()).await?;

        let info = self.directory.info(&self.endpoints).await?;
        let host_key = HostKeyPolicy::for_gateway(
            info.host_key_fingerprint.as_deref(),
            self.config.tunnel.verify_host_key,
        )?;
        let password = self
            .with_policy(|| self.exchanger.one_time_password(&self.tokens, info))
            .await?;

        let request = TunnelRequest {
            gateway_host: info.ssh_host.clone(),
            gateway_port: info.ssh_port,
            username: self.ssh_username(),
            password,
            forwards: self.forward_specs()?,
            host_key,
        };
        let handle = self.tunnels.open(request).await?;
        info!("Tunnel for {} is open", self.data.destination_name);

        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        Ok(handle)
    }

    async fn with_policy<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match &self.policy {
            Some(policy) => policy.run(self.tokens.as_ref(), operation).await,
            None => operation().await,
        }
    }

    /// Close the tunnel. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            self.tunnels.close(&handle.id()).await?;
        }
        // Also stops a tunnel that is still opening
        self.tunnels.close_all().await;
        Ok(())
    }

    /// Transport routing through the local end of the tunnel
    pub fn tunnel_transport(&self) -> Result<TunnelTransport> {
        let patched = self.bindings.with_local_proxy()?;
        let connectivity = patched.connectivity()?;
        let http_port = connectivity
            .onpremise_proxy_http_port
            .map(|p| p.0)
            .unwrap_or(DEFAULT_HTTP_PROXY_PORT);

        // The local port can differ from the proxy port (remapped or ephemeral)
        match self.tunnel().and_then(|h| h.local_addr_for(http_port)) {
            Some(addr) => Ok(
                TunnelTransport::new(self.http.clone(), RequestRouter::for_local_addr(addr))
                    .with_proxy_credentials(ProxyCredentials::from_binding(&connectivity)),
            ),
            None => TunnelTransport::from_bindings(self.http.clone(), &patched),
        }
    }

    /// REST client for `base_url` whose requests travel through the tunnel
    pub fn rest_client(&self, base_url: &str) -> Result<RestClient> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", base_url, e)))?;
        Ok(RestClient::new(base, Arc::new(self.tunnel_transport()?)))
    }

    /// REST client for the URL of the stored destination
    pub async fn destination_client(&self) -> Result<RestClient> {
        let service = DestinationService::connect(self.http.clone(), &self.bindings.destination()?).await?;
        let destination = service.find(&self.data.destination_name).await?;
        let url = destination.url.ok_or_else(|| {
            Error::Protocol(format!(
                "Destination \"{}\" has no URL",
                self.data.destination_name
            ))
        })?;
        self.rest_client(&url)
    }

    /// Reconnection data carrying the newest refresh token
    pub fn reconnection_data(&self) -> ReconnectionData {
        let mut data = self.data.clone();
        if let Some(token) = self.tokens.refresh_token() {
            data.refresh_token = token;
        }
        data
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("region", &self.data.region)
            .field("guid", &self.data.guid)
            .field("destination", &self.data.destination_name)
            .field("tunnel", &self.tunnel())
            .finish_non_exhaustive()
    }
}
