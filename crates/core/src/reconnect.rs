// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Reconnect Module
// Re-login and retry once when the platform rejects the session token

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use btp_tunnel_common::{Error, Result, Secret};

use crate::token_store::SessionRenewal;

/// Fresh platform credentials supplied by the user
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub username: String,
    pub password: Secret,
}

/// Asks the user for credentials when a token is no longer accepted.
///
/// May block; it is called from a blocking thread.
pub trait CredentialPrompt: Send + Sync {
    /// `reason` describes why the old session was rejected
    fn credentials(&self, reason: &str) -> Result<LoginCredentials>;
}

#[derive(Clone)]
pub struct ReconnectPolicy {
    prompt: Arc<dyn CredentialPrompt>,
}

impl ReconnectPolicy {
    pub fn new(prompt: Arc<dyn CredentialPrompt>) -> Self {
        Self { prompt }
    }

    /// Only expired or invalid tokens are worth a fresh login
    pub fn should_reauthenticate(error: &Error) -> bool {
        error.is_token_rejection()
    }

    /// Run `operation`; on a token rejection renew the session and retry.
    ///
    /// A live session is refreshed silently first. When that is impossible
    /// or the refreshed token is rejected too, the user is asked for
    /// credentials and the operation is retried exactly once more.
    pub async fn run<T, F, Fut, S>(&self, session: &S, mut operation: F) -> Result<T>
    where
        S: SessionRenewal + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let error = match operation().await {
            Err(error) if Self::should_reauthenticate(&error) => error,
            other => return other,
        };

        let error = match session.refresh().await {
            Ok(()) => {
                info!("Session refreshed after rejection ({}), retrying", error);
                match operation().await {
                    Err(error) if Self::should_reauthenticate(&error) => error,
                    other => return other,
                }
            }
            Err(e) => {
                debug!("Session refresh not possible: {}", e);
                error
            }
        };

        warn!("Platform session rejected ({}), asking for credentials", error);
        let credentials = self.ask(error.to_string()).await?;
        session
            .relogin(&credentials.username, &credentials.password)
            .await?;
        info!("Re-login successful, retrying");
        operation().await
    }

    async fn ask(&self, reason: String) -> Result<LoginCredentials> {
        let prompt = self.prompt.clone();
        tokio::task::spawn_blocking(move || prompt.credentials(&reason))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("Credential prompt failed: {}", e))))?
    }
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy").finish_non_exhaustive()
    }
}
