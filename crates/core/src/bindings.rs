// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Service Bindings Module
// Typed access to the VCAP_SERVICES metadata of the SSH helper app

use serde::Deserialize;
use serde_json::{Map, Value};

use btp_tunnel_common::{Error, Result, Secret};

/// Credentials of the destination service binding
#[derive(Clone, Deserialize)]
pub struct DestinationCredentials {
    pub clientid: String,
    #[serde(deserialize_with = "secret")]
    pub clientsecret: Secret,
    /// Token service base URL
    pub url: String,
    /// Destination service API base URL
    pub uri: String,
}

/// Credentials of the connectivity service binding
#[derive(Clone, Deserialize)]
pub struct ConnectivityCredentials {
    pub onpremise_proxy_host: String,
    #[serde(default)]
    pub onpremise_proxy_http_port: Option<PortValue>,
    #[serde(default)]
    pub onpremise_socks5_proxy_port: Option<PortValue>,
    /// Client authorizing requests to the proxy
    #[serde(default)]
    pub clientid: Option<String>,
    #[serde(default, deserialize_with = "optional_secret")]
    pub clientsecret: Option<Secret>,
    /// Token service base URL
    #[serde(default)]
    pub url: Option<String>,
}

/// Ports arrive as strings or numbers depending on the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Value")]
pub struct PortValue(pub u16);

impl TryFrom<Value> for PortValue {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let port = match &value {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u16>().ok(),
            _ => None,
        };
        port.map(PortValue)
            .ok_or_else(|| format!("invalid port value {}", value))
    }
}

fn secret<'de, D>(deserializer: D) -> std::result::Result<Secret, D::Error>
where
    D: serde::Deserializer<'de>,
{
    String::deserialize(deserializer).map(Secret::new)
}

fn optional_secret<'de, D>(deserializer: D) -> std::result::Result<Option<Secret>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|s| s.map(Secret::new))
}

/// Keys rewritten to point at the local end of the tunnel
const LOCAL_PROXY_KEYS: [&str; 3] = [
    "onpremise_proxy_host",
    "onpremise_proxy_http_host",
    "onpremise_socks5_proxy_host",
];

/// The parsed `VCAP_SERVICES` document.
///
/// Kept as raw JSON so unknown fields survive a round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceBindings(Map<String, Value>);

impl ServiceBindings {
    pub fn parse(vcap_services: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(vcap_services)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(Error::Config("VCAP_SERVICES is not a JSON object".to_string())),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(Error::Config("VCAP_SERVICES is not a JSON object".to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    fn first_credentials(&self, service: &str) -> Option<&Value> {
        self.0
            .get(service)?
            .as_array()?
            .first()?
            .get("credentials")
    }

    fn credentials<T: for<'de> Deserialize<'de>>(&self, service: &str) -> Result<T> {
        let credentials = self.first_credentials(service).ok_or_else(|| {
            Error::Config(format!("No {} service binding found", service))
        })?;
        T::deserialize(credentials).map_err(|e| {
            Error::Config(format!("Invalid {} service binding: {}", service, e))
        })
    }

    pub fn destination(&self) -> Result<DestinationCredentials> {
        self.credentials("destination")
    }

    pub fn connectivity(&self) -> Result<ConnectivityCredentials> {
        self.credentials("connectivity")
    }

    /// Copy whose connectivity proxy hosts point at `localhost`.
    ///
    /// `onpremise_proxy_http_host` is only rewritten when present.
    pub fn with_local_proxy(&self) -> Result<Self> {
        let mut patched = self.clone();
        let credentials = patched
            .0
            .get_mut("connectivity")
            .and_then(Value::as_array_mut)
            .and_then(|bindings| bindings.first_mut())
            .and_then(|binding| binding.get_mut("credentials"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::Config("No connectivity service binding found".to_string()))?;

        for key in LOCAL_PROXY_KEYS {
            if key == "onpremise_proxy_http_host" && !credentials.contains_key(key) {
                continue;
            }
            credentials.insert(key.to_string(), Value::String("localhost".to_string()));
        }
        Ok(patched)
    }
}
