// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// Secret string handling: zeroed on drop, never printed

use std::fmt;

use zeroize::Zeroizing;

/// A password, token or one-time code
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last four characters, for log lines that need to tell tokens apart
    pub fn obfuscated(&self) -> String {
        obfuscate_token(self.expose())
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Obfuscate a token for display (shows only last 4 characters)
pub fn obfuscate_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        "****".to_string()
    } else {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{}", tail)
    }
}
