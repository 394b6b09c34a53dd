// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Deployment configuration.
//!
//! Loaded from an optional TOML file with `MAILTRIAGE`-prefixed environment
//! overrides. Account settings are a tagged enum per provider kind, so a
//! config error surfaces at load time instead of deep inside a sync run.

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::ActionOverride;
use crate::store::{Store, StoreError};
use crate::tags::TagDefinition;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load or parse configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Api,
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Api => "api",
            ProviderKind::Imap => "imap",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    /// API base URL; the default targets the Gmail-compatible surface.
    #[serde(default)]
    pub base_url: Option<String>,
    /// OAuth token endpoint used for refreshes.
    #[serde(default)]
    pub token_url: Option<String>,
    /// Label hierarchy root; falls back to the global prefix.
    #[serde(default)]
    pub label_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    /// Prefix for keyword flags written back to the server (e.g. `$work`).
    #[serde(default = "default_keyword_prefix")]
    pub keyword_prefix: String,

    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub smtp_tls: bool,
    #[serde(default)]
    pub smtp_username: Option<String>,
    /// Separate SMTP password file; the IMAP password is used when absent.
    #[serde(default)]
    pub smtp_password_file: Option<PathBuf>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_keyword_prefix() -> String {
    "$".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderSettings {
    Api(ApiSettings),
    Imap(ImapSettings),
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSettings::Api(_) => ProviderKind::Api,
            ProviderSettings::Imap(_) => ProviderKind::Imap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub email: String,
    pub credential_file: PathBuf,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

impl AccountConfig {
    pub fn settings_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.settings).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_ai_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_ai_timeout")]
    pub timeout_seconds: u64,
    /// Extraction prompts get longer to run than classification.
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_seconds: u64,
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_ai_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_ai_timeout() -> u64 {
    30
}

fn default_extraction_timeout() -> u64 {
    60
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            endpoint: default_ai_endpoint(),
            temperature: default_temperature(),
            timeout_seconds: default_ai_timeout(),
            extraction_timeout_seconds: default_extraction_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub addressbook: Option<String>,
    #[serde(default)]
    pub calendar: Option<String>,
}

fn default_gateway_url() -> String {
    "http://localhost:8085".to_string()
}

fn default_gateway_timeout() -> u64 {
    30
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            timeout_seconds: default_gateway_timeout(),
            addressbook: None,
            calendar: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSettings {
    #[serde(default = "default_true")]
    pub use_defaults: bool,
    #[serde(default)]
    pub custom: Vec<TagDefinition>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub label_colors: HashMap<String, String>,
}

impl Default for TagSettings {
    fn default() -> Self {
        Self {
            use_defaults: true,
            custom: Vec::new(),
            exclude: Vec::new(),
            label_colors: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub ai: AiSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub tags: TagSettings,
    #[serde(default)]
    pub actions: HashMap<String, ActionOverride>,
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
}

fn default_database_path() -> String {
    "data/mailtriage.db".to_string()
}

fn default_label_prefix() -> String {
    "AI".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            label_prefix: default_label_prefix(),
            log: LogConfig::default(),
            ai: AiSettings::default(),
            gateway: GatewaySettings::default(),
            tags: TagSettings::default(),
            actions: HashMap::new(),
            accounts: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, SettingsError> {
        let path_to_use = config_path.unwrap_or("config/mailtriage.toml");

        let builder = config::Config::builder()
            .add_source(File::with_name(path_to_use).required(false))
            .add_source(Environment::with_prefix("MAILTRIAGE").separator("__"));

        Ok(builder.build()?.try_deserialize()?)
    }

    /// The effective tag taxonomy for this deployment.
    pub fn taxonomy(&self) -> Vec<TagDefinition> {
        crate::tags::merge_tags(self.tags.use_defaults, &self.tags.custom, &self.tags.exclude)
    }
}

/// Push configured accounts into the store, creating or updating rows.
///
/// Idempotent: existing database state (messages, classifications) is
/// preserved, and renames are handled by the store's email-matching path.
pub async fn sync_accounts_to_store(store: &Store, settings: &Settings) -> Result<(), StoreError> {
    for (account_id, account) in &settings.accounts {
        store
            .upsert_account(
                account_id,
                &account.name,
                &account.email,
                account.settings.kind().as_str(),
                &account.settings_json(),
            )
            .await?;
        log::debug!(
            "Synced account: {} ({})",
            account_id,
            account.settings.kind().as_str()
        );
    }
    Ok(())
}
