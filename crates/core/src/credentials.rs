// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Credentials Module
// Exchanges a platform session for a one-time SSH password

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::{redirect, Client, Url};
use tracing::{debug, error, info};

use btp_tunnel_common::{AuthFailure, Error, Result, Secret};

use crate::gateway::GatewayInfo;
use crate::oauth::{rejection, CredentialKind};
use crate::token_store::TokenStore;

/// Reads the authorization code off the redirect instead of following it
pub struct CredentialExchanger {
    http: Client,
}

impl CredentialExchanger {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// Use a prebuilt client; it must not follow redirects
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    /// Request a fresh one-time SSH password. Never cached.
    pub async fn one_time_password(&self, store: &TokenStore, info: &GatewayInfo) -> Result<Secret> {
        let url = format!("{}/oauth/authorize", info.token_endpoint);
        let authorization = store.authorization()?;

        debug!("Requesting one-time SSH code for client {}", info.ssh_oauth_client);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("client_id", info.ssh_oauth_client.as_str()),
                ("response_type", "code"),
            ])
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| {
                error!("Authorize request to {} failed: {}", url, e);
                Error::Unavailable(format!("Token endpoint {} unreachable", info.token_endpoint))
            })?;

        let status = response.status();
        if !status.is_redirection() {
            if status.is_client_error() {
                return Err(rejection(response, CredentialKind::Bearer, "SSH code request").await);
            }
            error!("Expected a redirect from {}, got HTTP {}", url, status);
            return Err(Error::authentication(
                AuthFailure::Other,
                format!("SSH code request answered HTTP {} instead of a redirect", status),
            ));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::Protocol(format!("Redirect from {} has no Location header", url))
            })?;

        match code_from_location(location, &url)? {
            Some(code) => {
                info!("Obtained one-time SSH password");
                Ok(Secret::new(code))
            }
            None => {
                error!("Redirect from {} carries no authorization code", url);
                Err(Error::authentication(
                    AuthFailure::Other,
                    "SSH code redirect carries no authorization code",
                ))
            }
        }
    }
}

/// `code` query parameter of a (possibly relative) Location value
pub(crate) fn code_from_location(location: &str, request_url: &str) -> Result<Option<String>> {
    let parsed = match Url::parse(location) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(request_url)
            .and_then(|base| base.join(location))
            .map_err(|e| Error::Protocol(format!("Unparseable Location '{}': {}", location, e)))?,
        Err(e) => {
            return Err(Error::Protocol(format!(
                "Unparseable Location '{}': {}",
                location, e
            )))
        }
    };

    Ok(parsed
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHORIZE: &str = "https://uaa.example.com/oauth/authorize?client_id=ssh-proxy";

    #[test]
    fn test_code_from_absolute_location() {
        let code = code_from_location("https://gw/cb?code=ABC123", AUTHORIZE).unwrap();
        assert_eq!(code.as_deref(), Some("ABC123"));

        let code = code_from_location("https://gw/cb?state=x&code=a%2Bb", AUTHORIZE).unwrap();
        assert_eq!(code.as_deref(), Some("a+b"));
    }

    #[test]
    fn test_code_from_relative_location() {
        let code = code_from_location("/login?code=XYZ", AUTHORIZE).unwrap();
        assert_eq!(code.as_deref(), Some("XYZ"));
    }

    #[test]
    fn test_missing_code() {
        assert_eq!(code_from_location("https://gw/cb", AUTHORIZE).unwrap(), None);
        assert_eq!(code_from_location("https://gw/cb?code=", AUTHORIZE).unwrap(), None);
    }

    #[test]
    fn test_unparseable_location() {
        let err = code_from_location("http://[bad", AUTHORIZE).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
