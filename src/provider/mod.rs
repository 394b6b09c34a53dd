// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provider abstraction: one uniform capability set over a mail account,
//! realized by the OAuth label-based API provider and the IMAP provider.
//!
//! The capability set is the `Provider` trait; provider *choice* is the
//! `MailProvider` enum, so call sites that hold a concrete account dispatch
//! statically through a match rather than a vtable.

pub mod api;
pub mod folders;
pub mod idle;
pub mod imap;
pub mod pool;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AccountConfig, ProviderSettings};
use crate::credentials::CredentialError;
use crate::imap::error::ImapError;

pub use api::ApiProvider;
pub use imap::ImapProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("provider policy: {0}")]
    Policy(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("{0}")]
    Other(String),
}

impl From<ImapError> for ProviderError {
    fn from(err: ImapError) -> Self {
        match err {
            ImapError::Auth(msg) => ProviderError::Auth(msg),
            ImapError::Connection(msg) | ImapError::Tls(msg) | ImapError::Timeout(msg) => {
                ProviderError::Transport(msg)
            }
            ImapError::Parse(msg) | ImapError::BadResponse(msg) | ImapError::Command(msg) => {
                ProviderError::Protocol(msg)
            }
            other => ProviderError::Other(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProviderError::Transport(err.to_string())
        } else if err.is_decode() {
            ProviderError::Protocol(err.to_string())
        } else {
            ProviderError::Other(err.to_string())
        }
    }
}

/// Normalized message representation across providers.
///
/// `date` is stored as local wall-clock time without a zone, matching the
/// persisted rows; `folder` is the logical name, `imap_folder` the actual
/// provider folder the message was fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub date: NaiveDateTime,
    pub snippet: String,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub labels: HashSet<String>,
    #[serde(default = "default_true")]
    pub is_unread: bool,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub imap_folder: Option<String>,
    #[serde(default)]
    pub has_attachments: bool,
}

fn default_true() -> bool {
    true
}

fn default_folder() -> String {
    "inbox".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "high" => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// Classification result for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tags: Vec<String>,
    pub priority: Priority,
    pub todo: bool,
    pub can_archive: bool,
    pub confidence: f64,
}

/// Attachment metadata as listed by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub is_inline: bool,
}

/// Map classification tags to provider label names under a prefix.
///
/// `work` with prefix `AI` becomes `AI/Work`.
pub fn map_tags_to_labels(tags: &[String], label_prefix: &str) -> HashSet<String> {
    tags.iter()
        .map(|tag| format!("{}/{}", label_prefix, capitalize(tag)))
        .collect()
}

fn capitalize(tag: &str) -> String {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Uniform capability set over one mail account.
#[async_trait]
pub trait Provider: Send + Sync {
    fn account_id(&self) -> &str;

    /// Synchronous (in the protocol sense) authentication; a failure here is
    /// terminal for the current run.
    async fn authenticate(&self) -> Result<(), ProviderError>;

    /// Fetch messages newer than `since` (advisory: older rows may appear,
    /// newer rows must not be missed), up to `max_results`.
    async fn fetch_messages(
        &self,
        since: Option<NaiveDateTime>,
        max_results: usize,
    ) -> Result<Vec<Message>, ProviderError>;

    /// Lazy body retrieval: (text, html).
    async fn fetch_body(
        &self,
        message_id: &str,
    ) -> Result<(Option<String>, Option<String>), ProviderError>;

    /// Idempotent label delta on one message.
    async fn update_labels(
        &self,
        message_id: &str,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> Result<(), ProviderError>;

    /// Idempotent creation of any labels not yet present.
    async fn ensure_labels_exist(&self, labels: &HashSet<String>) -> Result<(), ProviderError>;

    /// All labels as name → provider id.
    async fn list_labels(&self) -> Result<HashMap<String, String>, ProviderError>;

    async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError>;

    async fn mark_unread(&self, message_id: &str) -> Result<(), ProviderError>;

    /// Delete a message; `permanent=false` moves it to trash when the
    /// provider has one.
    async fn delete(&self, message_id: &str, permanent: bool) -> Result<(), ProviderError>;

    async fn move_to_trash(&self, message_id: &str) -> Result<(), ProviderError>;

    /// Reverse a trash move toward `original_folder` (as recorded locally).
    async fn restore_from_trash(
        &self,
        message_id: &str,
        original_folder: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Send a prebuilt MIME message; returns the provider's id for it.
    async fn send_message(
        &self,
        mime_message: &[u8],
        thread_id: Option<&str>,
    ) -> Result<String, ProviderError>;

    async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<AttachmentInfo>, ProviderError>;

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;
}

#[async_trait]
impl<T: Provider + ?Sized> Provider for std::sync::Arc<T> {
    fn account_id(&self) -> &str {
        (**self).account_id()
    }

    async fn authenticate(&self) -> Result<(), ProviderError> {
        (**self).authenticate().await
    }

    async fn fetch_messages(
        &self,
        since: Option<NaiveDateTime>,
        max_results: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        (**self).fetch_messages(since, max_results).await
    }

    async fn fetch_body(
        &self,
        message_id: &str,
    ) -> Result<(Option<String>, Option<String>), ProviderError> {
        (**self).fetch_body(message_id).await
    }

    async fn update_labels(
        &self,
        message_id: &str,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> Result<(), ProviderError> {
        (**self).update_labels(message_id, add, remove).await
    }

    async fn ensure_labels_exist(&self, labels: &HashSet<String>) -> Result<(), ProviderError> {
        (**self).ensure_labels_exist(labels).await
    }

    async fn list_labels(&self) -> Result<HashMap<String, String>, ProviderError> {
        (**self).list_labels().await
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError> {
        (**self).mark_read(message_id).await
    }

    async fn mark_unread(&self, message_id: &str) -> Result<(), ProviderError> {
        (**self).mark_unread(message_id).await
    }

    async fn delete(&self, message_id: &str, permanent: bool) -> Result<(), ProviderError> {
        (**self).delete(message_id, permanent).await
    }

    async fn move_to_trash(&self, message_id: &str) -> Result<(), ProviderError> {
        (**self).move_to_trash(message_id).await
    }

    async fn restore_from_trash(
        &self,
        message_id: &str,
        original_folder: Option<&str>,
    ) -> Result<(), ProviderError> {
        (**self).restore_from_trash(message_id, original_folder).await
    }

    async fn send_message(
        &self,
        mime_message: &[u8],
        thread_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        (**self).send_message(mime_message, thread_id).await
    }

    async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<AttachmentInfo>, ProviderError> {
        (**self).list_attachments(message_id).await
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        (**self).get_attachment(message_id, attachment_id).await
    }
}

/// Tagged provider choice. Everything that holds "some provider" holds this,
/// and each call dispatches through one match.
pub enum MailProvider {
    Api(ApiProvider),
    Imap(ImapProvider),
}

impl MailProvider {
    /// Build the provider for a configured account.
    pub fn for_account(
        account_id: &str,
        config: &AccountConfig,
    ) -> Result<MailProvider, ProviderError> {
        match &config.settings {
            ProviderSettings::Api(settings) => Ok(MailProvider::Api(ApiProvider::new(
                account_id,
                &config.email,
                &config.credential_file,
                settings.clone(),
            ))),
            ProviderSettings::Imap(settings) => Ok(MailProvider::Imap(ImapProvider::new(
                account_id,
                &config.email,
                &config.credential_file,
                settings.clone(),
            ))),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $provider:ident => $body:expr) => {
        match $self {
            MailProvider::Api($provider) => $body,
            MailProvider::Imap($provider) => $body,
        }
    };
}

#[async_trait]
impl Provider for MailProvider {
    fn account_id(&self) -> &str {
        dispatch!(self, p => p.account_id())
    }

    async fn authenticate(&self) -> Result<(), ProviderError> {
        dispatch!(self, p => p.authenticate().await)
    }

    async fn fetch_messages(
        &self,
        since: Option<NaiveDateTime>,
        max_results: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        dispatch!(self, p => p.fetch_messages(since, max_results).await)
    }

    async fn fetch_body(
        &self,
        message_id: &str,
    ) -> Result<(Option<String>, Option<String>), ProviderError> {
        dispatch!(self, p => p.fetch_body(message_id).await)
    }

    async fn update_labels(
        &self,
        message_id: &str,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> Result<(), ProviderError> {
        dispatch!(self, p => p.update_labels(message_id, add, remove).await)
    }

    async fn ensure_labels_exist(&self, labels: &HashSet<String>) -> Result<(), ProviderError> {
        dispatch!(self, p => p.ensure_labels_exist(labels).await)
    }

    async fn list_labels(&self) -> Result<HashMap<String, String>, ProviderError> {
        dispatch!(self, p => p.list_labels().await)
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError> {
        dispatch!(self, p => p.mark_read(message_id).await)
    }

    async fn mark_unread(&self, message_id: &str) -> Result<(), ProviderError> {
        dispatch!(self, p => p.mark_unread(message_id).await)
    }

    async fn delete(&self, message_id: &str, permanent: bool) -> Result<(), ProviderError> {
        dispatch!(self, p => p.delete(message_id, permanent).await)
    }

    async fn move_to_trash(&self, message_id: &str) -> Result<(), ProviderError> {
        dispatch!(self, p => p.move_to_trash(message_id).await)
    }

    async fn restore_from_trash(
        &self,
        message_id: &str,
        original_folder: Option<&str>,
    ) -> Result<(), ProviderError> {
        dispatch!(self, p => p.restore_from_trash(message_id, original_folder).await)
    }

    async fn send_message(
        &self,
        mime_message: &[u8],
        thread_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        dispatch!(self, p => p.send_message(mime_message, thread_id).await)
    }

    async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<AttachmentInfo>, ProviderError> {
        dispatch!(self, p => p.list_attachments(message_id).await)
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        dispatch!(self, p => p.get_attachment(message_id, attachment_id).await)
    }
}
