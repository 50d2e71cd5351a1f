// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// Error types for BTP Tunnel

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a login or a bearer request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    /// The presented token is past its expiry
    ExpiredToken,
    /// The presented token is unknown, revoked or malformed
    InvalidToken,
    /// Username/password (or client credentials) were wrong
    InvalidCredentials,
    /// Authenticated, but not allowed to do this
    InsufficientScope,
    /// The account is locked or disabled
    AccountDisabled,
    Other,
}

impl AuthFailure {
    /// Token rejections are the only reasons a fresh login can fix
    pub fn is_token_rejection(self) -> bool {
        matches!(self, AuthFailure::ExpiredToken | AuthFailure::InvalidToken)
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuthFailure::ExpiredToken => "expired token",
            AuthFailure::InvalidToken => "invalid token",
            AuthFailure::InvalidCredentials => "invalid credentials",
            AuthFailure::InsufficientScope => "insufficient scope",
            AuthFailure::AccountDisabled => "account disabled",
            AuthFailure::Other => "rejected",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed ({reason}): {message}")]
    Authentication { reason: AuthFailure, message: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn authentication(reason: AuthFailure, message: impl Into<String>) -> Self {
        Error::Authentication {
            reason,
            message: message.into(),
        }
    }

    /// The rejection reason, if this is an authentication error
    pub fn auth_failure(&self) -> Option<AuthFailure> {
        match self {
            Error::Authentication { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_token_rejection(&self) -> bool {
        self.auth_failure()
            .is_some_and(AuthFailure::is_token_rejection)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_rejection_reasons() {
        assert!(Error::authentication(AuthFailure::ExpiredToken, "x").is_token_rejection());
        assert!(Error::authentication(AuthFailure::InvalidToken, "x").is_token_rejection());
        assert!(!Error::authentication(AuthFailure::InsufficientScope, "x").is_token_rejection());
        assert!(!Error::authentication(AuthFailure::InvalidCredentials, "x").is_token_rejection());
        assert!(!Error::authentication(AuthFailure::AccountDisabled, "x").is_token_rejection());
        assert!(!Error::Unavailable("down".into()).is_token_rejection());
    }

    #[test]
    fn test_authentication_display() {
        let err = Error::authentication(AuthFailure::ExpiredToken, "refresh token expired");
        assert_eq!(
            err.to_string(),
            "Authentication failed (expired token): refresh token expired"
        );
        assert_eq!(err.auth_failure(), Some(AuthFailure::ExpiredToken));
    }
}
