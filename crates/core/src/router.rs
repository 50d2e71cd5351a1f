// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Router Module
// Points outgoing HTTP requests at the local tunnel endpoint

use std::net::SocketAddr;

use reqwest::{Request, Url};

/// Rewrites the authority of requests to the local tunnel endpoint
#[derive(Debug, Clone, Default)]
pub struct RequestRouter {
    endpoint: Option<Url>,
}

impl RequestRouter {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint: Some(endpoint),
        }
    }

    /// Route to `http://<addr>`
    pub fn for_local_addr(addr: SocketAddr) -> Self {
        Self {
            endpoint: Url::parse(&format!("http://{}", addr)).ok(),
        }
    }

    /// Leave requests untouched
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    pub fn rewrite(&self, mut request: Request) -> Request {
        self.rewrite_url(request.url_mut());
        request
    }

    /// Swap scheme, host and port; keep path, query and fragment
    pub fn rewrite_url(&self, url: &mut Url) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let mut rewritten = endpoint.clone();
        rewritten.set_path(url.path());
        rewritten.set_query(url.query());
        rewritten.set_fragment(url.fragment());
        *url = rewritten;
    }
}
