// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Transport Module
// REST client with pluggable transports (direct, or through the tunnel)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use reqwest::{Client, Method, Request, Response, Url};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use btp_tunnel_common::{Error, Result, Secret};

use crate::bindings::{ConnectivityCredentials, ServiceBindings};
use crate::oauth::service_token;
use crate::router::RequestRouter;

/// Port of the connectivity proxy's HTTP listener when the binding names none
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 20003;

/// Sends a prepared request somewhere
#[async_trait]
pub trait TransportProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, request: Request) -> Result<Response>;
}

/// Build the HTTP client shared by platform calls
pub fn create_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Plain HTTPS
pub struct DirectTransport {
    http: Client,
}

impl DirectTransport {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TransportProvider for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn execute(&self, request: Request) -> Result<Response> {
        let target = request.url().to_string();
        self.http.execute(request).await.map_err(|e| {
            error!("Request to {} failed: {}", target, e);
            Error::Unavailable(format!("Request to {} failed: {}", target, e))
        })
    }
}

/// Client credentials of the connectivity binding.
///
/// The proxy only relays requests carrying a token issued to this client.
#[derive(Clone)]
pub struct ProxyCredentials {
    token_base_url: String,
    client_id: String,
    client_secret: Secret,
}

impl ProxyCredentials {
    /// `None` when the binding lacks any of client id, secret or token URL
    pub fn from_binding(connectivity: &ConnectivityCredentials) -> Option<Self> {
        Some(Self {
            token_base_url: connectivity.url.clone()?,
            client_id: connectivity.clientid.clone()?,
            client_secret: connectivity.clientsecret.clone()?,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

struct ProxyAuthorization {
    credentials: ProxyCredentials,
    token: OnceCell<Secret>,
}

impl ProxyAuthorization {
    async fn header(&self, http: &Client) -> Result<HeaderValue> {
        let credentials = &self.credentials;
        let token = self
            .token
            .get_or_try_init(|| async {
                let token = service_token(
                    http,
                    &credentials.token_base_url,
                    &credentials.client_id,
                    &credentials.client_secret,
                )
                .await?;
                info!("Obtained connectivity proxy token for {}", credentials.client_id);
                Ok::<_, Error>(token)
            })
            .await?;

        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|e| Error::Protocol(format!("Connectivity token is not a valid header: {}", e)))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// `host[:port]` as it appears in a `Host` header
fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Sends every request to the local end of the tunnel.
///
/// The proxy learns the virtual host from `Host` and accepts the request
/// on the strength of `Proxy-Authorization`.
pub struct TunnelTransport {
    http: Client,
    router: RequestRouter,
    proxy_auth: Option<ProxyAuthorization>,
}

impl TunnelTransport {
    pub fn new(http: Client, router: RequestRouter) -> Self {
        Self {
            http,
            router,
            proxy_auth: None,
        }
    }

    /// Authorize requests at the proxy with tokens for `credentials`
    pub fn with_proxy_credentials(mut self, credentials: Option<ProxyCredentials>) -> Self {
        if credentials.is_none() {
            debug!("Connectivity binding has no client credentials, sending no proxy token");
        }
        self.proxy_auth = credentials.map(|credentials| ProxyAuthorization {
            credentials,
            token: OnceCell::new(),
        });
        self
    }

    /// Route to the HTTP proxy port named by a patched binding
    pub fn from_bindings(http: Client, patched: &ServiceBindings) -> Result<Self> {
        let connectivity = patched.connectivity()?;
        let port = connectivity
            .onpremise_proxy_http_port
            .map(|p| p.0)
            .unwrap_or(DEFAULT_HTTP_PROXY_PORT);
        let endpoint = Url::parse(&format!(
            "http://{}:{}",
            connectivity.onpremise_proxy_host, port
        ))
        .map_err(|e| Error::Config(format!("Invalid local proxy endpoint: {}", e)))?;
        Ok(Self::new(http, RequestRouter::new(endpoint))
            .with_proxy_credentials(ProxyCredentials::from_binding(&connectivity)))
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn proxy_client_id(&self) -> Option<&str> {
        self.proxy_auth.as_ref().map(|auth| auth.credentials.client_id())
    }
}

#[async_trait]
impl TransportProvider for TunnelTransport {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    async fn execute(&self, mut request: Request) -> Result<Response> {
        let original = request.url().clone();

        if self.router.endpoint().is_some() && !request.headers().contains_key(HOST) {
            if let Some(authority) = authority(&original) {
                let host = HeaderValue::from_str(&authority)
                    .map_err(|e| Error::Config(format!("Invalid host '{}': {}", authority, e)))?;
                request.headers_mut().insert(HOST, host);
            }
        }
        if let Some(auth) = &self.proxy_auth {
            let value = auth.header(&self.http).await?;
            request.headers_mut().insert(PROXY_AUTHORIZATION, value);
        }

        let request = self.router.rewrite(request);
        debug!("Routing {} via {}", original, request.url());

        self.http.execute(request).await.map_err(|e| {
            error!("Tunnelled request to {} failed: {}", original, e);
            Error::Unavailable(format!("Tunnelled request to {} failed: {}", original, e))
        })
    }
}

/// REST client bound to one base URL
#[derive(Clone)]
pub struct RestClient {
    base_url: Url,
    transport: Arc<dyn TransportProvider>,
}

impl RestClient {
    pub fn new(base_url: Url, transport: Arc<dyn TransportProvider>) -> Self {
        Self { base_url, transport }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// A request for `path`, resolved against the base URL
    pub fn request(&self, method: Method, path: &str) -> Result<Request> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid request path '{}': {}", path, e)))?;
        Ok(Request::new(method, url))
    }

    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.transport.execute(request).await
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        let request = self.request(Method::GET, path)?;
        self.execute(request).await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("transport", &self.transport.name())
            .finish()
    }
}
