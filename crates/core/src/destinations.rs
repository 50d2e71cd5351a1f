// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Destinations Module
// Subaccount destinations read through the destination service binding

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use btp_tunnel_common::{Error, Result, Secret};

use crate::bindings::DestinationCredentials;
use crate::oauth::{rejection, service_token, CredentialKind};

pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Upper bound on pages read by `fetch_all`
const MAX_PAGES: u32 = 1000;

const ON_PREMISE: &str = "OnPremise";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Destination {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
    #[serde(rename = "ProxyType", default)]
    pub proxy_type: Option<String>,
    #[serde(rename = "Authentication", default)]
    pub authentication: Option<String>,
}

impl Destination {
    pub fn is_on_premise(&self) -> bool {
        self.proxy_type.as_deref() == Some(ON_PREMISE)
    }

    /// Name with description, falling back to the URL
    pub fn label(&self) -> String {
        match (self.name.as_deref(), self.description.as_deref()) {
            (Some(name), Some(description)) if !description.is_empty() => {
                format!("{} {}", name, description)
            }
            (Some(name), _) => name.to_string(),
            (None, _) => self.url.clone().unwrap_or_default(),
        }
    }
}

/// Single-destination lookup wraps the configuration in an envelope
#[derive(Deserialize)]
struct DestinationLookup {
    #[serde(rename = "destinationConfiguration", default)]
    configuration: Option<Destination>,
}

/// A paged source of destinations
#[async_trait]
pub trait DestinationSource: Send + Sync {
    /// `page` starts at 1; an empty page marks the end
    async fn page(&self, page: u32, page_size: u32) -> Result<Vec<Destination>>;
}

/// Read pages until one comes back empty
pub async fn fetch_all<S: DestinationSource + ?Sized>(source: &S, page_size: u32) -> Result<Vec<Destination>> {
    let mut destinations = Vec::new();
    for page in 1..=MAX_PAGES {
        let batch = source.page(page, page_size).await?;
        if batch.is_empty() {
            debug!("Read {} destination(s) in {} page(s)", destinations.len(), page - 1);
            return Ok(destinations);
        }
        destinations.extend(batch);
    }
    warn!("Stopped reading destinations after {} pages", MAX_PAGES);
    Ok(destinations)
}

pub fn on_premise(destinations: Vec<Destination>) -> Vec<Destination> {
    destinations
        .into_iter()
        .filter(Destination::is_on_premise)
        .collect()
}

/// HTTP client for the destination configuration API
pub struct DestinationService {
    http: Client,
    base_url: Url,
    token: Secret,
}

impl DestinationService {
    /// Obtain a service token from the binding and build the client
    pub async fn connect(http: Client, credentials: &DestinationCredentials) -> Result<Self> {
        let token = service_token(
            &http,
            &credentials.url,
            &credentials.clientid,
            &credentials.clientsecret,
        )
        .await?;
        info!("Obtained destination service token");
        Self::with_token(http, &credentials.uri, token)
    }

    pub fn with_token(http: Client, uri: &str, token: Secret) -> Result<Self> {
        let base = format!(
            "{}/destination-configuration/v1/subaccountDestinations",
            uri.trim_end_matches('/')
        );
        let base_url = Url::parse(&base)
            .map_err(|e| Error::Config(format!("Invalid destination service URI '{}': {}", uri, e)))?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub async fn list(&self) -> Result<Vec<Destination>> {
        fetch_all(self, DEFAULT_PAGE_SIZE).await
    }

    /// Look up one destination by name
    pub async fn find(&self, name: &str) -> Result<Destination> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Invalid destination service URL {}", self.base_url)))?
            .push(name);

        let response = self.send(url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::Protocol(format!("Destination \"{}\" not found", name)));
        }
        let response = self.check(response).await?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::Protocol(format!("Unreadable destination \"{}\": {}", name, e)))?;
        parse_lookup(&body)
            .ok_or_else(|| Error::Protocol(format!("Malformed destination \"{}\"", name)))
    }

    async fn send(&self, url: Url) -> Result<reqwest::Response> {
        debug!("GET {}", url);
        self.http
            .get(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.token.expose()))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                error!("Destination request to {} failed: {}", url, e);
                Error::Unavailable(format!("Destination service unreachable: {}", e))
            })
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(rejection(response, CredentialKind::ClientCredentials, "Destination request").await);
        }
        if !status.is_success() {
            error!("Destination service returned HTTP {}", status);
            return Err(Error::Unavailable(format!(
                "Destination service answered HTTP {}",
                status
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl DestinationSource for DestinationService {
    async fn page(&self, page: u32, page_size: u32) -> Result<Vec<Destination>> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("$page", &page.to_string())
            .append_pair("$pageSize", &page_size.to_string());

        let response = self.check(self.send(url).await?).await?;
        response
            .json::<Vec<Destination>>()
            .await
            .map_err(|e| Error::Protocol(format!("Malformed destination page {}: {}", page, e)))
    }
}

impl std::fmt::Debug for DestinationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationService")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Accepts both the enveloped lookup and a bare configuration
fn parse_lookup(body: &str) -> Option<Destination> {
    if let Ok(DestinationLookup {
        configuration: Some(destination),
    }) = serde_json::from_str(body)
    {
        return Some(destination);
    }
    serde_json::from_str::<Destination>(body)
        .ok()
        .filter(|d| d.name.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn destination(name: &str, proxy_type: &str) -> Destination {
        Destination {
            name: Some(name.to_string()),
            description: None,
            url: Some(format!("http://{}.internal:44300", name)),
            proxy_type: Some(proxy_type.to_string()),
            authentication: None,
        }
    }

    struct Pages {
        pages: Vec<Vec<Destination>>,
        requested: Mutex<Vec<(u32, u32)>>,
    }

    #[async_trait]
    impl DestinationSource for Pages {
        async fn page(&self, page: u32, page_size: u32) -> Result<Vec<Destination>> {
            self.requested.lock().unwrap().push((page, page_size));
            Ok(self
                .pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_fetch_all_stops_at_empty_page() {
        let source = Pages {
            pages: vec![
                vec![destination("S4H", ON_PREMISE), destination("WEB", "Internet")],
                vec![destination("ECC", ON_PREMISE)],
            ],
            requested: Mutex::new(Vec::new()),
        };

        let all = fetch_all(&source, DEFAULT_PAGE_SIZE).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(
            source.requested.lock().unwrap().as_slice(),
            [(1, 100), (2, 100), (3, 100)]
        );

        let names: Vec<String> = on_premise(all).iter().map(Destination::label).collect();
        assert_eq!(names, ["S4H", "ECC"]);
    }

    #[test]
    fn test_destination_labels() {
        let page: Vec<Destination> = serde_json::from_str(
            r#"[
                {"Name": "S4H", "Description": "Sandbox", "URL": "http://s4h:44300", "ProxyType": "OnPremise"},
                {"Name": "ECC", "URL": "http://ecc:8000", "ProxyType": "OnPremise"},
                {"URL": "http://anonymous:8000", "ProxyType": "Internet"}
            ]"#,
        )
        .unwrap();

        let labels: Vec<String> = page.iter().map(Destination::label).collect();
        assert_eq!(labels, ["S4H Sandbox", "ECC", "http://anonymous:8000"]);
        assert!(page[0].is_on_premise());
        assert!(!page[2].is_on_premise());
    }

    #[test]
    fn test_lookup_shapes() {
        let enveloped = r#"{"owner":{"SubaccountId":"x"},"destinationConfiguration":{"Name":"S4H","URL":"http://s4h:44300","ProxyType":"OnPremise"}}"#;
        assert_eq!(parse_lookup(enveloped).unwrap().name.as_deref(), Some("S4H"));

        let bare = r#"{"Name":"ECC","URL":"http://ecc:8000"}"#;
        assert_eq!(parse_lookup(bare).unwrap().url.as_deref(), Some("http://ecc:8000"));

        assert!(parse_lookup(r#"{"unexpected":true}"#).is_none());
    }

    #[test]
    fn test_service_urls() {
        let service = DestinationService::with_token(
            Client::new(),
            "https://destination-configuration.cfapps.eu10.hana.ondemand.com/",
            Secret::new("token"),
        )
        .unwrap();
        assert_eq!(
            service.base_url.as_str(),
            "https://destination-configuration.cfapps.eu10.hana.ondemand.com/destination-configuration/v1/subaccountDestinations"
        );
        assert!(!format!("{:?}", service).contains("token"));

        assert!(DestinationService::with_token(Client::new(), "not a url", Secret::new("t")).is_err());
    }
}
