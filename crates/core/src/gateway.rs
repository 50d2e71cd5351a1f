// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Gateway Module
// Resolves platform regions to API, login and SSH gateway endpoints

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use btp_tunnel_common::{split_host_port, Error, Result};

/// SSH port used when `app_ssh_endpoint` carries none
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// SSH gateway details published by the platform API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub host_key_fingerprint: Option<String>,
    pub token_endpoint: String,
    pub ssh_oauth_client: String,
}

#[derive(Debug, Deserialize)]
struct InfoPayload {
    #[serde(default)]
    app_ssh_endpoint: Option<String>,
    #[serde(default)]
    app_ssh_host_key_fingerprint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    app_ssh_oauth_client: Option<String>,
}

impl TryFrom<InfoPayload> for GatewayInfo {
    type Error = Error;

    fn try_from(payload: InfoPayload) -> Result<Self> {
        let missing = |field: &str| Error::Protocol(format!("Gateway info is missing '{}'", field));
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let endpoint = present(payload.app_ssh_endpoint).ok_or_else(|| missing("app_ssh_endpoint"))?;
        let (ssh_host, ssh_port) = split_host_port(&endpoint, DEFAULT_SSH_PORT)
            .ok_or_else(|| Error::Protocol(format!("Invalid app_ssh_endpoint '{}'", endpoint)))?;

        Ok(Self {
            ssh_host,
            ssh_port,
            host_key_fingerprint: present(payload.app_ssh_host_key_fingerprint),
            token_endpoint: present(payload.token_endpoint)
                .ok_or_else(|| missing("token_endpoint"))?
                .trim_end_matches('/')
                .to_string(),
            ssh_oauth_client: present(payload.app_ssh_oauth_client)
                .ok_or_else(|| missing("app_ssh_oauth_client"))?,
        })
    }
}

/// API and login hosts of one region, plus the lazily fetched gateway info
#[derive(Debug)]
pub struct GatewayEndpoints {
    pub region: String,
    pub api_url: String,
    pub login_url: String,
    info: OnceCell<GatewayInfo>,
}

impl GatewayEndpoints {
    pub fn new(region: impl Into<String>, api_url: impl Into<String>, login_url: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            login_url: login_url.into().trim_end_matches('/').to_string(),
            info: OnceCell::new(),
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.login_url)
    }

    /// Gateway info if it has been fetched already
    pub fn cached_info(&self) -> Option<&GatewayInfo> {
        self.info.get()
    }
}

/// Region to endpoint mapping, cached per region
pub struct GatewayDirectory {
    http: Client,
    domain: String,
    /// API and login URL used for every region instead of the derived ones
    pinned: Option<(String, String)>,
    resolved: Mutex<HashMap<String, Arc<GatewayEndpoints>>>,
}

impl GatewayDirectory {
    pub fn new(http: Client, domain: impl Into<String>) -> Self {
        Self {
            http,
            domain: domain.into(),
            pinned: None,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve every region to the same endpoints (private or local platforms)
    pub fn pinned(http: Client, api_url: impl Into<String>, login_url: impl Into<String>) -> Self {
        Self {
            http,
            domain: String::new(),
            pinned: Some((
                api_url.into().trim_end_matches('/').to_string(),
                login_url.into().trim_end_matches('/').to_string(),
            )),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, region: &str) -> Result<Arc<GatewayEndpoints>> {
        let region = region.trim();
        if region.is_empty() {
            return Err(Error::Config("Region cannot be empty".to_string()));
        }

        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        let endpoints = resolved.entry(region.to_string()).or_insert_with(|| {
            debug!("Resolving endpoints for region {}", region);
            let (api_url, login_url) = match &self.pinned {
                Some((api_url, login_url)) => (api_url.clone(), login_url.clone()),
                None => (
                    format!("https://api.cf.{}.{}", region, self.domain),
                    format!("https://login.cf.{}.{}", region, self.domain),
                ),
            };
            Arc::new(GatewayEndpoints::new(region, api_url, login_url))
        });
        Ok(endpoints.clone())
    }

    /// Fetch `<api>/v2/info` once per endpoints value
    pub async fn info<'a>(&self, endpoints: &'a GatewayEndpoints) -> Result<&'a GatewayInfo> {
        endpoints
            .info
            .get_or_try_init(|| self.fetch_info(&endpoints.api_url))
            .await
    }

    async fn fetch_info(&self, api_url: &str) -> Result<GatewayInfo> {
        let url = format!("{}/v2/info", api_url);
        debug!("Fetching gateway info from {}", url);

        let response = self.http.get(&url).send().await.map_err(|e| {
            error!("Gateway info request to {} failed: {}", url, e);
            Error::Unavailable(format!("Platform API {} unreachable", api_url))
        })?;

        let status = response.status();
        if !status.is_success() {
            error!("Gateway info request to {} returned HTTP {}", url, status);
            return Err(Error::Unavailable(format!(
                "Platform API {} answered HTTP {}",
                api_url, status
            )));
        }

        let payload: InfoPayload = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Malformed gateway info from {}: {}", url, e)))?;
        let info = GatewayInfo::try_from(payload)?;

        info!(
            "SSH gateway for {} is {}:{}",
            api_url, info.ssh_host, info.ssh_port
        );
        Ok(info)
    }
}
