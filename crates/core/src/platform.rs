// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Platform API Module
// Bearer requests against the regional platform API (apps, SSH status, environment)

use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use btp_tunnel_common::{Error, Result};

use crate::bindings::ServiceBindings;
use crate::oauth::{rejection, CredentialKind};
use crate::reconnect::ReconnectPolicy;
use crate::token_store::TokenStore;

/// An application as listed by `/v3/apps`
#[derive(Debug, Clone, Deserialize)]
pub struct App {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshEnabled {
    pub enabled: bool,
    #[serde(default)]
    pub reason: String,
}

/// Environment of an app; only the system part is read
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppEnvironment {
    #[serde(default)]
    pub system_env_json: SystemEnvironment,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemEnvironment {
    #[serde(rename = "VCAP_SERVICES", default)]
    pub vcap_services: Option<Value>,
}

impl AppEnvironment {
    pub fn service_bindings(&self) -> Result<ServiceBindings> {
        let vcap = self.system_env_json.vcap_services.clone().ok_or_else(|| {
            Error::Config("App environment has no VCAP_SERVICES".to_string())
        })?;
        ServiceBindings::from_value(vcap)
    }
}

#[derive(Deserialize)]
struct Resources<T> {
    #[serde(default = "Vec::new")]
    resources: Vec<T>,
}

pub struct PlatformClient {
    http: Client,
    api_url: String,
    tokens: Arc<TokenStore>,
    policy: Option<ReconnectPolicy>,
}

impl PlatformClient {
    pub fn new(http: Client, api_url: impl Into<String>, tokens: Arc<TokenStore>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            tokens,
            policy: None,
        }
    }

    /// Retry token rejections once after asking for fresh credentials
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Apps named `name` in the spaces visible to the user
    pub async fn apps(&self, name: &str) -> Result<Vec<App>> {
        let listing: Resources<App> = self.get_json("/v3/apps", &[("names", name)]).await?;
        debug!("Found {} app(s) named {}", listing.resources.len(), name);
        Ok(listing.resources)
    }

    pub async fn ssh_enabled(&self, guid: &str) -> Result<SshEnabled> {
        self.get_json(&format!("/v3/apps/{}/ssh_enabled", guid), &[])
            .await
    }

    pub async fn app_environment(&self, guid: &str) -> Result<AppEnvironment> {
        self.get_json(&format!("/v3/apps/{}/env", guid), &[]).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        match &self.policy {
            Some(policy) => {
                policy
                    .run(self.tokens.as_ref(), || self.fetch(path, query))
                    .await
            }
            None => self.fetch(path, query).await,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.api_url, path);
        let authorization = self.tokens.authorization()?;

        let response = self
            .http
            .get(&url)
            .query(query)
            .header(AUTHORIZATION, authorization)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                error!("Platform request to {} failed: {}", url, e);
                Error::Unavailable(format!("Platform API {} unreachable", self.api_url))
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(rejection(response, CredentialKind::Bearer, "Platform API request").await);
        }
        if !status.is_success() {
            error!("Platform request to {} returned HTTP {}", url, status);
            return Err(Error::Unavailable(format!(
                "Platform API answered HTTP {} for {}",
                status, path
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Protocol(format!("Malformed response from {}: {}", url, e)))
    }
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("api_url", &self.api_url)
            .field("reconnect", &self.policy.is_some())
            .finish_non_exhaustive()
    }
}
