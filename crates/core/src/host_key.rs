// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Host Key Module
// Verifies the gateway host key against the fingerprint the platform publishes

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use md5::Md5;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::warn;

use btp_tunnel_common::{Error, Result};

/// A host key fingerprint in one of the formats gateways publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Sha256(Vec<u8>),
    Sha1(Vec<u8>),
    Md5(Vec<u8>),
}

impl Fingerprint {
    /// SHA256 fingerprint of a key
    pub fn of(key: &PublicKey) -> Self {
        Fingerprint::Sha256(Sha256::digest(key.public_key_bytes()).to_vec())
    }

    pub fn matches(&self, key: &PublicKey) -> bool {
        let blob = key.public_key_bytes();
        match self {
            Fingerprint::Sha256(expected) => Sha256::digest(&blob).as_slice() == expected.as_slice(),
            Fingerprint::Sha1(expected) => Sha1::digest(&blob).as_slice() == expected.as_slice(),
            Fingerprint::Md5(expected) => Md5::digest(&blob).as_slice() == expected.as_slice(),
        }
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        let invalid = || Error::Config(format!("Unrecognized host key fingerprint '{}'", value));

        if let Some(encoded) = value.strip_prefix("SHA256:") {
            return decode_sha256(encoded).ok_or_else(invalid);
        }
        if let Some(hex) = value.strip_prefix("MD5:") {
            return match decode_hex(hex) {
                Some(bytes) if bytes.len() == 16 => Ok(Fingerprint::Md5(bytes)),
                _ => Err(invalid()),
            };
        }
        if let Some(hex) = value.strip_prefix("SHA1:") {
            return match decode_hex(hex) {
                Some(bytes) if bytes.len() == 20 => Ok(Fingerprint::Sha1(bytes)),
                _ => Err(invalid()),
            };
        }

        if value.contains(':') {
            return match decode_hex(value) {
                Some(bytes) if bytes.len() == 16 => Ok(Fingerprint::Md5(bytes)),
                Some(bytes) if bytes.len() == 20 => Ok(Fingerprint::Sha1(bytes)),
                Some(bytes) if bytes.len() == 32 => Ok(Fingerprint::Sha256(bytes)),
                _ => Err(invalid()),
            };
        }

        decode_sha256(value).ok_or_else(invalid)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Sha256(bytes) => write!(f, "SHA256:{}", STANDARD_NO_PAD.encode(bytes)),
            Fingerprint::Sha1(bytes) => write!(f, "SHA1:{}", encode_hex(bytes)),
            Fingerprint::Md5(bytes) => write!(f, "MD5:{}", encode_hex(bytes)),
        }
    }
}

fn decode_sha256(encoded: &str) -> Option<Fingerprint> {
    let bytes = STANDARD_NO_PAD.decode(encoded.trim_end_matches('=')).ok()?;
    (bytes.len() == 32).then_some(Fingerprint::Sha256(bytes))
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    value
        .split(':')
        .map(|pair| {
            if pair.len() == 2 {
                u8::from_str_radix(pair, 16).ok()
            } else {
                None
            }
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// How the gateway host key is checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept only a key with this fingerprint
    Fingerprint(Fingerprint),
    /// Accept any key. Logged as a warning on every connect.
    AcceptAny,
}

impl HostKeyPolicy {
    /// Policy for a gateway that may or may not publish a fingerprint
    pub fn for_gateway(published: Option<&str>, verify: bool) -> Result<Self> {
        if !verify {
            warn!("Host key verification is disabled by configuration");
            return Ok(HostKeyPolicy::AcceptAny);
        }
        match published {
            Some(fingerprint) => Ok(HostKeyPolicy::Fingerprint(fingerprint.parse()?)),
            None => Err(Error::Config(
                "Gateway publishes no host key fingerprint; set tunnel.verify_host_key = false to connect without verification"
                    .to_string(),
            )),
        }
    }

    pub fn accepts(&self, key: &PublicKey) -> bool {
        match self {
            HostKeyPolicy::Fingerprint(expected) => expected.matches(key),
            HostKeyPolicy::AcceptAny => true,
        }
    }
}
