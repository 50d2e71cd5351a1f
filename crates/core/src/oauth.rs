// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - OAuth Module
// Token grants and classification of rejected requests

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use btp_tunnel_common::{AuthFailure, Error, Result, Secret};

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// What the rejected request presented, which decides how a bare 401 reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Password,
    RefreshToken,
    Bearer,
    ClientCredentials,
}

#[derive(Debug, Default, Deserialize)]
struct RejectionBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    errors: Vec<PlatformError>,
}

#[derive(Debug, Deserialize)]
struct PlatformError {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

/// Classify a rejected request from its status and body
pub fn classify_rejection(status: StatusCode, body: &str, presented: CredentialKind) -> AuthFailure {
    let parsed: RejectionBody = serde_json::from_str(body).unwrap_or_default();
    let description = parsed
        .error_description
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| description.contains(w));

    if let Some(code) = parsed.error.as_deref() {
        match code {
            "invalid_token" => {
                return if mentions(&["expired"]) {
                    AuthFailure::ExpiredToken
                } else {
                    AuthFailure::InvalidToken
                };
            }
            "invalid_grant" => {
                if presented == CredentialKind::RefreshToken {
                    return if mentions(&["expired"]) {
                        AuthFailure::ExpiredToken
                    } else {
                        AuthFailure::InvalidToken
                    };
                }
                if mentions(&["locked", "disabled"]) {
                    return AuthFailure::AccountDisabled;
                }
                return AuthFailure::InvalidCredentials;
            }
            "insufficient_scope" | "access_denied" => return AuthFailure::InsufficientScope,
            "account_locked" | "account_disabled" => return AuthFailure::AccountDisabled,
            "unauthorized" | "invalid_client" => {
                if mentions(&["locked", "disabled"]) {
                    return AuthFailure::AccountDisabled;
                }
                return match presented {
                    CredentialKind::Password | CredentialKind::ClientCredentials => {
                        AuthFailure::InvalidCredentials
                    }
                    CredentialKind::RefreshToken | CredentialKind::Bearer => {
                        AuthFailure::InvalidToken
                    }
                };
            }
            _ => {}
        }
    }

    for error in &parsed.errors {
        match error.title.as_str() {
            "CF-InvalidAuthToken" => {
                return if error.detail.to_ascii_lowercase().contains("expired") {
                    AuthFailure::ExpiredToken
                } else {
                    AuthFailure::InvalidToken
                };
            }
            "CF-NotAuthenticated" => return AuthFailure::InvalidToken,
            "CF-NotAuthorized" => return AuthFailure::InsufficientScope,
            _ => {}
        }
    }

    match status {
        StatusCode::UNAUTHORIZED => match presented {
            CredentialKind::Password | CredentialKind::ClientCredentials => {
                AuthFailure::InvalidCredentials
            }
            CredentialKind::RefreshToken | CredentialKind::Bearer => AuthFailure::InvalidToken,
        },
        StatusCode::FORBIDDEN => AuthFailure::InsufficientScope,
        _ => AuthFailure::Other,
    }
}

/// Turn a rejected response into an authentication error, logging the details
pub(crate) async fn rejection(response: Response, presented: CredentialKind, context: &str) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let reason = classify_rejection(status, &body, presented);
    warn!("{} rejected with HTTP {} ({})", context, status, reason);
    debug!("{} rejection body: {}", context, body);
    Error::authentication(reason, format!("{} rejected with HTTP {}", context, status))
}

/// Post a form to a token endpoint with HTTP Basic client credentials
pub(crate) async fn request_token(
    http: &Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    form: &[(&str, &str)],
    presented: CredentialKind,
) -> Result<TokenResponse> {
    let response = http
        .post(token_url)
        .basic_auth(client_id, Some(client_secret))
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| Error::Unavailable(format!("Token endpoint {} unreachable: {}", token_url, e)))?;

    if !response.status().is_success() {
        return Err(rejection(response, presented, "Token request").await);
    }

    response.json::<TokenResponse>().await.map_err(|e| {
        Error::authentication(
            AuthFailure::Other,
            format!("Malformed token response from {}: {}", token_url, e),
        )
    })
}

/// `client_credentials` grant against `<base>/oauth/token`
pub async fn service_token(
    http: &Client,
    token_base_url: &str,
    client_id: &str,
    client_secret: &Secret,
) -> Result<Secret> {
    let token_url = format!("{}/oauth/token", token_base_url.trim_end_matches('/'));
    let token = request_token(
        http,
        &token_url,
        client_id,
        client_secret.expose(),
        &[("grant_type", "client_credentials"), ("client_id", client_id)],
        CredentialKind::ClientCredentials,
    )
    .await?;
    Ok(Secret::new(token.access_token))
}
