// BTP Tunnel - CLI Prompt Module
// Terminal prompts and progress spinner for setup and re-login

use std::sync::Mutex;
use std::time::Duration;

use colored::Colorize;
use dialoguer::{Input, Password, Select};
use indicatif::{ProgressBar, ProgressStyle};

use btp_tunnel_common::{Error, Result, Secret};
use btp_tunnel_core::{
    CredentialPrompt, Destination, GlobalAccount, LoginCredentials, SetupPrompt, SubAccount,
};

fn prompt_error(e: dialoguer::Error) -> Error {
    Error::Io(std::io::Error::other(e))
}

/// Ask for the platform login (email and password)
pub fn ask_login(email: Option<String>) -> Result<LoginCredentials> {
    let username = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("BTP Login: Email")
            .interact_text()
            .map_err(prompt_error)?,
    };
    let password: String = Password::new()
        .with_prompt("BTP Login: Password")
        .interact()
        .map_err(prompt_error)?;

    Ok(LoginCredentials {
        username,
        password: Secret::new(password),
    })
}

/// Dialoguer prompts; a spinner shows the current step between them
#[derive(Default)]
pub struct TerminalPrompt {
    spinner: Mutex<Option<ProgressBar>>,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the spinner, leaving a final line
    pub fn finish(&self, message: &str) {
        if let Some(spinner) = self.take_spinner() {
            spinner.finish_and_clear();
        }
        println!("{}", message.green().bold());
    }

    pub fn abandon(&self) {
        if let Some(spinner) = self.take_spinner() {
            spinner.finish_and_clear();
        }
    }

    fn take_spinner(&self) -> Option<ProgressBar> {
        self.spinner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Run a prompt with the spinner hidden
    fn suspended<T>(&self, prompt: impl FnOnce() -> T) -> T {
        let spinner = self
            .spinner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match spinner {
            Some(spinner) => spinner.suspend(prompt),
            None => prompt(),
        }
    }

    fn select(&self, title: &str, labels: Vec<String>) -> Result<usize> {
        self.suspended(|| {
            Select::new()
                .with_prompt(title)
                .items(&labels)
                .default(0)
                .interact()
                .map_err(prompt_error)
        })
    }
}

impl SetupPrompt for TerminalPrompt {
    fn choose_global_account(&self, accounts: &[GlobalAccount]) -> Result<usize> {
        self.select(
            "Choose global account",
            accounts.iter().map(GlobalAccount::label).collect(),
        )
    }

    fn choose_sub_account(&self, accounts: &[SubAccount]) -> Result<usize> {
        self.select(
            "Choose sub account",
            accounts.iter().map(SubAccount::label).collect(),
        )
    }

    fn choose_destination(&self, destinations: &[Destination]) -> Result<usize> {
        self.select(
            "Choose destination",
            destinations.iter().map(Destination::label).collect(),
        )
    }

    fn progress(&self, message: &str) {
        let mut spinner = self
            .spinner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let spinner = spinner.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        spinner.set_message(message.to_string());
    }

    fn notice(&self, message: &str) {
        let message = format!("⚠️  {}", message).yellow().to_string();
        self.suspended(|| println!("{}", message));
    }
}

impl CredentialPrompt for TerminalPrompt {
    fn credentials(&self, reason: &str) -> Result<LoginCredentials> {
        self.suspended(|| {
            println!("{}", format!("Platform session expired: {}", reason).yellow());
            ask_login(None)
        })
    }
}
