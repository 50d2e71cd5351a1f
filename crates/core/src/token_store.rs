// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Token Store Module
// Holds and refreshes the platform OAuth session of one identity

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use btp_tunnel_common::{AuthFailure, Error, Result, Secret};

use crate::gateway::GatewayEndpoints;
use crate::oauth::{request_token, CredentialKind};

/// What the identity currently logs in with
#[derive(Clone)]
pub enum Credential {
    Password(Secret),
    RefreshToken(Secret),
}

/// One federated identity on one platform region
#[derive(Clone)]
pub struct Identity {
    pub platform: String,
    pub username: Option<String>,
    pub credential: Credential,
}

impl Identity {
    pub fn with_password(
        platform: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Secret>,
    ) -> Self {
        Self {
            platform: platform.into(),
            username: Some(username.into()),
            credential: Credential::Password(password.into()),
        }
    }

    pub fn with_refresh_token(platform: impl Into<String>, refresh_token: impl Into<Secret>) -> Self {
        Self {
            platform: platform.into(),
            username: None,
            credential: Credential::RefreshToken(refresh_token.into()),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credential = match self.credential {
            Credential::Password(_) => "password",
            Credential::RefreshToken(_) => "refresh_token",
        };
        f.debug_struct("Identity")
            .field("platform", &self.platform)
            .field("username", &self.username)
            .field("credential", &credential)
            .finish()
    }
}

/// A live platform session
pub struct Session {
    access_token: Secret,
    refresh_token: Option<Secret>,
    pub username: Option<String>,
    pub platform: String,
}

impl Session {
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token.expose())
    }

    pub fn refresh_token(&self) -> Option<&Secret> {
        self.refresh_token.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("platform", &self.platform)
            .field("username", &self.username)
            .field("access_token", &self.access_token.obfuscated())
            .finish_non_exhaustive()
    }
}

/// Something that can renew its session, silently or with a fresh password
#[async_trait]
pub trait SessionRenewal: Send + Sync {
    /// Renew the live session with its refresh token
    async fn refresh(&self) -> Result<()>;

    async fn relogin(&self, username: &str, password: &Secret) -> Result<()>;
}

enum Grant {
    Password { username: String, password: Secret },
    RefreshToken(Secret),
}

/// Platform OAuth session holder.
///
/// The session is swapped as a whole; readers see the old or the new one.
pub struct TokenStore {
    http: Client,
    token_url: String,
    client_id: String,
    identity: Mutex<Identity>,
    session: RwLock<Option<Arc<Session>>>,
}

impl TokenStore {
    pub fn new(http: Client, endpoints: &GatewayEndpoints, client_id: impl Into<String>, identity: Identity) -> Self {
        Self::with_token_url(http, endpoints.token_url(), client_id, identity)
    }

    pub fn with_token_url(
        http: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        identity: Identity,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            identity: Mutex::new(identity),
            session: RwLock::new(None),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.session().is_some()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn identity(&self) -> Identity {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Log in with the identity's credential; no-op when a session exists
    pub async fn login(&self) -> Result<()> {
        if self.is_logged_in() {
            debug!("Already logged in, reusing session");
            return Ok(());
        }

        let identity = self.identity();
        let grant = match identity.credential {
            Credential::Password(password) => Grant::Password {
                username: identity.username.ok_or_else(|| {
                    Error::Config("Password login needs a username".to_string())
                })?,
                password,
            },
            Credential::RefreshToken(token) => Grant::RefreshToken(token),
        };
        self.exchange(grant).await
    }

    /// Force a refresh_token grant with the live session's refresh token.
    ///
    /// Fails without a request when there is no session to refresh.
    pub async fn refresh(&self) -> Result<()> {
        let token = self
            .session()
            .and_then(|s| s.refresh_token.clone())
            .ok_or_else(|| {
                Error::authentication(AuthFailure::InvalidToken, "No session to refresh")
            })?;
        self.exchange(Grant::RefreshToken(token)).await
    }

    /// Replace the credential with a fresh password and log in again
    pub async fn relogin(&self, username: &str, password: &Secret) -> Result<()> {
        {
            let mut identity = self.identity.lock().unwrap_or_else(PoisonError::into_inner);
            identity.username = Some(username.to_string());
            identity.credential = Credential::Password(password.clone());
        }
        self.exchange(Grant::Password {
            username: username.to_string(),
            password: password.clone(),
        })
        .await
    }

    /// Current refresh token, for persistence
    pub fn refresh_token(&self) -> Option<String> {
        if let Some(token) = self.session().and_then(|s| s.refresh_token.clone()) {
            return Some(token.expose().to_string());
        }
        match &self.identity().credential {
            Credential::RefreshToken(token) => Some(token.expose().to_string()),
            Credential::Password(_) => None,
        }
    }

    /// `Bearer <token>` header value of the current session
    pub fn authorization(&self) -> Result<String> {
        self.session().map(|s| s.bearer()).ok_or_else(|| {
            Error::authentication(AuthFailure::InvalidToken, "Not logged in to the platform")
        })
    }

    async fn exchange(&self, grant: Grant) -> Result<()> {
        let identity = self.identity();
        let response = match &grant {
            Grant::Password { username, password } => {
                info!("Logging in to {} as {}", identity.platform, username);
                request_token(
                    &self.http,
                    &self.token_url,
                    &self.client_id,
                    "",
                    &[
                        ("grant_type", "password"),
                        ("username", username.as_str()),
                        ("password", password.expose()),
                    ],
                    CredentialKind::Password,
                )
                .await?
            }
            Grant::RefreshToken(token) => {
                info!(
                    "Logging in to {} with refresh token {}",
                    identity.platform,
                    token.obfuscated()
                );
                request_token(
                    &self.http,
                    &self.token_url,
                    &self.client_id,
                    "",
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", token.expose()),
                    ],
                    CredentialKind::RefreshToken,
                )
                .await?
            }
        };

        if response.access_token.is_empty() {
            return Err(Error::authentication(
                AuthFailure::Other,
                "Token response carried an empty access token",
            ));
        }

        // Keep the previous refresh token unless a new one was issued
        let refresh_token = match response.refresh_token.filter(|t| !t.is_empty()) {
            Some(token) => Some(Secret::new(token)),
            None => match grant {
                Grant::RefreshToken(token) => Some(token),
                Grant::Password { .. } => None,
            },
        };

        let session = Arc::new(Session {
            access_token: Secret::new(response.access_token),
            refresh_token: refresh_token.clone(),
            username: identity.username.clone(),
            platform: identity.platform.clone(),
        });

        // The password is only needed until a refresh token exists
        if let Some(token) = refresh_token {
            let mut identity = self.identity.lock().unwrap_or_else(PoisonError::into_inner);
            identity.credential = Credential::RefreshToken(token);
        }

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        info!("Platform login successful");
        Ok(())
    }
}

#[async_trait]
impl SessionRenewal for TokenStore {
    async fn refresh(&self) -> Result<()> {
        TokenStore::refresh(self).await
    }

    async fn relogin(&self, username: &str, password: &Secret) -> Result<()> {
        TokenStore::relogin(self, username, password).await
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("token_url", &self.token_url)
            .field("identity", &self.identity())
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}
