// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Setup Module
// Interactive discovery of account, helper app and destination

use std::sync::Arc;

use reqwest::Client;
use tracing::{info, warn};

use btp_tunnel_common::{AuthFailure, ConnectorConfig, Error, ReconnectionData, Result};

use crate::accounts::{AccountDirectory, GlobalAccount, SubAccount};
use crate::destinations::{on_premise, Destination, DestinationService};
use crate::gateway::GatewayDirectory;
use crate::platform::PlatformClient;
use crate::reconnect::{CredentialPrompt, LoginCredentials, ReconnectPolicy};
use crate::token_store::{Identity, TokenStore};
use crate::transport::create_http_client;

/// User choices during setup; each `choose_*` returns an index into the list
pub trait SetupPrompt: Send + Sync {
    fn choose_global_account(&self, accounts: &[GlobalAccount]) -> Result<usize>;

    fn choose_sub_account(&self, accounts: &[SubAccount]) -> Result<usize>;

    fn choose_destination(&self, destinations: &[Destination]) -> Result<usize>;

    /// A step is starting
    fn progress(&self, _message: &str) {}

    /// Something the user should know about but that does not stop setup
    fn notice(&self, _message: &str) {}
}

pub struct SetupSession {
    config: ConnectorConfig,
    http: Client,
    directory: GatewayDirectory,
    prompt: Arc<dyn SetupPrompt>,
    policy: Option<ReconnectPolicy>,
}

fn pick<'a, T>(items: &'a [T], index: usize, what: &str) -> Result<&'a T> {
    items
        .get(index)
        .ok_or_else(|| Error::Config(format!("Invalid {} selection {}", what, index)))
}

impl SetupSession {
    pub fn new(config: ConnectorConfig, prompt: Arc<dyn SetupPrompt>) -> Result<Self> {
        let http = create_http_client(config.request_timeout())?;
        let directory = GatewayDirectory::new(http.clone(), config.domain.clone());
        Self::with_directory(config, directory, prompt)
    }

    pub fn with_directory(
        config: ConnectorConfig,
        directory: GatewayDirectory,
        prompt: Arc<dyn SetupPrompt>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            http: create_http_client(config.request_timeout())?,
            config,
            directory,
            prompt,
            policy: None,
        })
    }

    /// Ask `prompt` for a new login when the platform rejects the session
    pub fn with_relogin(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.policy = Some(ReconnectPolicy::new(prompt));
        self
    }

    /// Walk the user from a login to a stored destination
    pub async fn run(&self, login: &LoginCredentials) -> Result<ReconnectionData> {
        let prompt = self.prompt.as_ref();
        let mut accounts = AccountDirectory::new(
            self.http.clone(),
            self.config.btp_cli_url.clone(),
            self.config.btp_cli_version.clone(),
        );

        prompt.progress("Logging into BTP...");
        accounts.login(&login.username, &login.password).await?;

        prompt.progress("Reading BTP global accounts...");
        let global_accounts = accounts.global_accounts().await?;
        if global_accounts.is_empty() {
            return Err(Error::Config("No global accounts available".to_string()));
        }
        let index = prompt.choose_global_account(&global_accounts)?;
        let global_account = pick(&global_accounts, index, "global account")?;
        accounts.select_global_account(global_account.subdomain.clone());

        prompt.progress("Reading BTP sub accounts...");
        let sub_accounts = accounts.sub_accounts().await?;
        if sub_accounts.is_empty() {
            return Err(Error::Config(format!(
                "No sub accounts in global account {}",
                global_account.subdomain
            )));
        }
        let index = prompt.choose_sub_account(&sub_accounts)?;
        let sub_account = pick(&sub_accounts, index, "sub account")?;
        let region = sub_account.region.clone();

        prompt.progress("Logging into Cloud Foundry...");
        let endpoints = self.directory.resolve(&region)?;
        let tokens = Arc::new(TokenStore::new(
            self.http.clone(),
            &endpoints,
            self.config.oauth_client_id.clone(),
            Identity::with_password(region.clone(), login.username.clone(), login.password.clone()),
        ));
        tokens.login().await?;
        let mut platform = PlatformClient::new(self.http.clone(), endpoints.api_url.clone(), tokens.clone());
        if let Some(policy) = &self.policy {
            platform = platform.with_policy(policy.clone());
        }

        let app_name = &self.config.ssh_app_name;
        prompt.progress(&format!("Searching {} instance...", app_name));
        let app = platform
            .apps(app_name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config(format!("App \"{}\" not found.", app_name)))?;

        let ssh = platform.ssh_enabled(&app.guid).await?;
        if !ssh.enabled {
            if !ssh.reason.is_empty() {
                prompt.notice(&format!("{}: {}", app_name, ssh.reason));
            }
            warn!("SSH is not enabled on app {}", app_name);
            return Err(Error::Config(format!(
                "Enable ssh and restart on app \"{}\".",
                app_name
            )));
        }

        prompt.progress(&format!("{} running, reading data...", app_name));
        let environment = platform.app_environment(&app.guid).await?;
        let bindings = environment.service_bindings()?;
        let destination_credentials = bindings.destination()?;

        prompt.progress("Reading destinations...");
        let service = DestinationService::connect(self.http.clone(), &destination_credentials).await?;
        let destinations = on_premise(service.list().await?);
        if destinations.is_empty() {
            return Err(Error::Config("No on-premise destinations found".to_string()));
        }
        let index = prompt.choose_destination(&destinations)?;
        let destination = pick(&destinations, index, "destination")?;
        let destination_name = destination
            .name
            .clone()
            .ok_or_else(|| Error::Config("The chosen destination has no name".to_string()))?;

        let refresh_token = tokens.refresh_token().ok_or_else(|| {
            Error::authentication(AuthFailure::InvalidToken, "Platform login returned no refresh token")
        })?;

        info!(
            "Setup complete: app {} in {}, destination {}",
            app.guid, region, destination_name
        );
        Ok(ReconnectionData {
            vcap_services: bindings.to_json()?,
            guid: app.guid,
            destination_name,
            region,
            refresh_token,
        })
    }
}

impl std::fmt::Debug for SetupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupSession")
            .field("btp_cli_url", &self.config.btp_cli_url)
            .field("ssh_app_name", &self.config.ssh_app_name)
            .finish_non_exhaustive()
    }
}
