// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Accounts Module
// Global and sub account listing through the account CLI backend

use reqwest::header::{HeaderMap, InvalidHeaderValue};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

use btp_tunnel_common::{AuthFailure, Error, Result, Secret};

use crate::oauth::{rejection, CredentialKind};

const SESSION_HEADER: &str = "x-cpcli-sessionid";
const FORMAT_HEADER: &str = "x-cpcli-format";
const SUBDOMAIN_HEADER: &str = "x-cpcli-subdomain";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalAccount {
    pub subdomain: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl GlobalAccount {
    /// Display name with description, or the subdomain
    pub fn label(&self) -> String {
        describe(self.display_name.as_deref(), self.description.as_deref())
            .unwrap_or_else(|| self.subdomain.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAccount {
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub technical_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub region: String,
}

impl SubAccount {
    pub fn label(&self) -> String {
        describe(self.display_name.as_deref(), self.description.as_deref())
            .or_else(|| self.technical_name.clone())
            .or_else(|| self.guid.clone())
            .unwrap_or_else(|| self.region.clone())
    }
}

fn describe(name: Option<&str>, description: Option<&str>) -> Option<String> {
    let name = name.filter(|n| !n.is_empty())?;
    Some(match description.filter(|d| !d.is_empty()) {
        Some(description) => format!("{} {}", name, description),
        None => name.to_string(),
    })
}

#[derive(Deserialize)]
struct SubAccountList {
    #[serde(default = "Vec::new")]
    value: Vec<SubAccount>,
}

/// Session against the account CLI backend
pub struct AccountDirectory {
    http: Client,
    base_url: String,
    version: String,
    session_id: Option<Secret>,
    subdomain: Option<String>,
}

impl AccountDirectory {
    pub fn new(http: Client, base_url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            version: version.into(),
            session_id: None,
            subdomain: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.session_id.is_some()
    }

    pub async fn login(&mut self, email: &str, password: &Secret) -> Result<()> {
        let url = format!("{}/login/{}", self.base_url, self.version);
        info!("Logging in to the account directory as {}", email);

        let response = self
            .http
            .post(&url)
            .json(&json!({
                "customIdp": "",
                "userName": email,
                "password": password.expose(),
                "jwt": "",
            }))
            .send()
            .await
            .map_err(|e| {
                error!("Account login request to {} failed: {}", url, e);
                Error::Unavailable(format!("Account service {} unreachable", self.base_url))
            })?;

        if !response.status().is_success() {
            return Err(rejection(response, CredentialKind::Password, "Account login").await);
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::authentication(AuthFailure::Other, "Account login returned no session id")
            })?;

        self.session_id = Some(Secret::new(session_id));
        self.subdomain = None;
        debug!("Account directory session established");
        Ok(())
    }

    pub async fn global_accounts(&self) -> Result<Vec<GlobalAccount>> {
        let path = format!("/client/{}/globalAccountList", self.version);
        self.post(&path, None).await
    }

    /// Scope later calls to the global account `subdomain`
    pub fn select_global_account(&mut self, subdomain: impl Into<String>) {
        let subdomain = subdomain.into();
        debug!("Selected global account {}", subdomain);
        self.subdomain = Some(subdomain);
    }

    pub fn selected_global_account(&self) -> Option<&str> {
        self.subdomain.as_deref()
    }

    pub async fn sub_accounts(&self) -> Result<Vec<SubAccount>> {
        let global_account = self.subdomain.as_deref().ok_or_else(|| {
            Error::Config("Select a global account before listing sub accounts".to_string())
        })?;
        let path = format!("/command/{}/accounts/subaccount?list", self.version);
        let body = json!({
            "paramValues": {
                "authorized": "false",
                "globalAccount": global_account,
            }
        });
        let list: SubAccountList = self.post(&path, Some(body)).await?;
        Ok(list.value)
    }

    fn session_headers(&self) -> Result<HeaderMap> {
        let session_id = self.session_id.as_ref().ok_or_else(|| {
            Error::authentication(AuthFailure::InvalidToken, "Not logged in to the account directory")
        })?;

        let mut headers = HeaderMap::new();
        let invalid = |e: InvalidHeaderValue| Error::Protocol(format!("Invalid session header: {}", e));
        headers.insert(SESSION_HEADER, session_id.expose().parse().map_err(invalid)?);
        headers.insert(FORMAT_HEADER, "json".parse().map_err(invalid)?);
        if let Some(subdomain) = &self.subdomain {
            headers.insert(SUBDOMAIN_HEADER, subdomain.parse().map_err(invalid)?);
        }
        Ok(headers)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Option<serde_json::Value>) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).headers(self.session_headers()?);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            error!("Account request to {} failed: {}", url, e);
            Error::Unavailable(format!("Account service {} unreachable", self.base_url))
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(rejection(response, CredentialKind::Bearer, "Account request").await);
        }
        if !status.is_success() {
            error!("Account request to {} returned HTTP {}", url, status);
            return Err(Error::Unavailable(format!(
                "Account service answered HTTP {}",
                status
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Protocol(format!("Malformed response from {}: {}", url, e)))
    }
}

impl std::fmt::Debug for AccountDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountDirectory")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("logged_in", &self.is_logged_in())
            .field("subdomain", &self.subdomain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_account_labels() {
        let accounts: Vec<GlobalAccount> = serde_json::from_str(
            r#"[
                {"subdomain": "acme-ga", "displayName": "ACME", "description": "Production"},
                {"subdomain": "acme-dev", "displayName": "ACME Dev"},
                {"subdomain": "bare"}
            ]"#,
        )
        .unwrap();

        let labels: Vec<String> = accounts.iter().map(GlobalAccount::label).collect();
        assert_eq!(labels, ["ACME Production", "ACME Dev", "bare"]);
    }

    #[test]
    fn test_sub_account_labels() {
        let list: SubAccountList = serde_json::from_str(
            r#"{"value": [
                {"guid": "sa-1", "technicalName": "dev", "displayName": "Development", "region": "eu10"},
                {"guid": "sa-2", "technicalName": "qa", "displayName": "", "region": "us10"},
                {"region": "ap21"}
            ]}"#,
        )
        .unwrap();

        let labels: Vec<String> = list.value.iter().map(SubAccount::label).collect();
        assert_eq!(labels, ["Development", "qa", "ap21"]);
        assert_eq!(list.value[1].region, "us10");
    }

    #[test]
    fn test_sub_account_requires_region() {
        assert!(serde_json::from_str::<SubAccount>(r#"{"guid":"x"}"#).is_err());
    }

    #[test]
    fn test_session_headers() {
        let mut directory = AccountDirectory::new(Client::new(), "https://cli.example/", "v2.90.2");
        assert!(directory.session_headers().is_err());

        directory.session_id = Some(Secret::new("session-1"));
        directory.select_global_account("acme-ga");

        let headers = directory.session_headers().unwrap();
        assert_eq!(headers[SESSION_HEADER], "session-1");
        assert_eq!(headers[FORMAT_HEADER], "json");
        assert_eq!(headers[SUBDOMAIN_HEADER], "acme-ga");
        assert!(!format!("{:?}", directory).contains("session-1"));
    }

    #[tokio::test]
    async fn test_sub_accounts_need_global_account() {
        let mut directory = AccountDirectory::new(Client::new(), "https://cli.example", "v2.90.2");
        directory.session_id = Some(Secret::new("session-1"));
        assert!(matches!(directory.sub_accounts().await, Err(Error::Config(_))));
    }
}
