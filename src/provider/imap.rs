// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP provider with KEYWORD-based tag synchronization.
//!
//! Message identity is `account_id:imap_folder:uid`; an id stays valid until
//! the message is expunged from that folder, and a cross-folder move mints a
//! new id. Tag writes go through keyword flags when the server advertises
//! the KEYWORD capability and are silently dropped otherwise.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeZone};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use tokio::sync::Mutex as TokioMutex;

use crate::config::ImapSettings;
use crate::credentials;
use crate::imap::session::{FetchedMessage, ImapSession};
use crate::provider::folders::{
    compose_message_id, discover_folder_mapping, normalize_folder_name, parse_message_id,
};
use crate::provider::pool;
use crate::provider::{AttachmentInfo, Message, Provider, ProviderError};
use crate::smtp::{self, SmtpConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_CHUNK: usize = 50;
const SNIPPET_CHARS: usize = 200;

lazy_static! {
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
}

pub struct ImapProvider {
    account_id: String,
    email: String,
    credential_file: PathBuf,
    settings: ImapSettings,
    session: TokioMutex<Option<ImapSession>>,
    supports_keywords: TokioMutex<Option<bool>>,
    folder_mapping: TokioMutex<Option<HashMap<String, String>>>,
}

impl ImapProvider {
    pub fn new(
        account_id: &str,
        email: &str,
        credential_file: &Path,
        settings: ImapSettings,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            email: email.to_string(),
            credential_file: credential_file.to_path_buf(),
            settings,
            session: TokioMutex::new(None),
            supports_keywords: TokioMutex::new(None),
            folder_mapping: TokioMutex::new(None),
        }
    }

    async fn session(&self) -> Result<ImapSession, ProviderError> {
        let guard = self.session.lock().await;
        guard
            .clone()
            .ok_or_else(|| ProviderError::Other("not authenticated".to_string()))
    }

    /// Discover (and cache) the logical-to-actual folder mapping.
    async fn folder_mapping(&self) -> Result<HashMap<String, String>, ProviderError> {
        {
            let cached = self.folder_mapping.lock().await;
            if let Some(mapping) = cached.as_ref() {
                return Ok(mapping.clone());
            }
        }

        let session = self.session().await?;
        let available = session.list_folders().await.map_err(ProviderError::from)?;
        let mapping = discover_folder_mapping(&available);
        info!("Discovered folder mapping for {}: {:?}", self.account_id, mapping);

        let mut cached = self.folder_mapping.lock().await;
        *cached = Some(mapping.clone());
        Ok(mapping)
    }

    async fn fetch_from_folder(
        &self,
        folder: &str,
        since: Option<NaiveDateTime>,
        max_results: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        let session = self.session().await?;
        session
            .ensure_selected(folder)
            .await
            .map_err(ProviderError::from)?;

        debug!("Fetching messages from IMAP folder '{}' (max: {})", folder, max_results);

        // IMAP date format: DD-Mon-YYYY.
        let criteria = match since {
            Some(since) => format!("SINCE {}", since.format("%d-%b-%Y")),
            None => "ALL".to_string(),
        };

        let mut uids = session.uid_search(&criteria).await.map_err(ProviderError::from)?;
        if uids.len() > max_results {
            uids = uids.split_off(uids.len() - max_results);
        }

        debug!("Found {} messages in {}", uids.len(), folder);

        let mut messages = Vec::new();
        for chunk in uids.chunks(FETCH_CHUNK) {
            let fetched = session
                .uid_fetch_full(chunk)
                .await
                .map_err(ProviderError::from)?;
            for raw in &fetched {
                match self.parse_message(raw, folder) {
                    Some(message) => messages.push(message),
                    None => warn!("Failed to parse message UID {} in {}", raw.uid, folder),
                }
            }
        }

        Ok(messages)
    }

    /// Normalize one fetched message.
    fn parse_message(&self, fetched: &FetchedMessage, imap_folder: &str) -> Option<Message> {
        let body = fetched.body.as_deref()?;
        let parsed = MessageParser::default().parse(body)?;

        let subject = parsed.subject().unwrap_or("(No Subject)").to_string();

        let from_email = parsed
            .from()
            .and_then(|addrs| addrs.first())
            .map(format_addr)
            .unwrap_or_default();

        let to_emails: Vec<String> = parsed
            .to()
            .map(|addrs| addrs.iter().map(format_addr).collect())
            .unwrap_or_default();

        // Header date preferred, INTERNALDATE as fallback. Stored as local
        // wall-clock time to match the persisted rows.
        let date = parsed
            .date()
            .and_then(|d| Local.timestamp_opt(d.to_timestamp(), 0).single())
            .map(|d| d.naive_local())
            .or_else(|| fetched.internal_date.map(|d| d.with_timezone(&Local).naive_local()))
            .unwrap_or_else(|| Local::now().naive_local());

        let mut body_text = parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default();
        let body_html = parsed.body_html(0).map(|h| h.to_string());

        // HTML-only message: derive an approximate plaintext by stripping tags.
        if body_text.trim().is_empty() {
            if let Some(html) = &body_html {
                body_text = HTML_TAG.replace_all(html, "").trim().to_string();
            }
        }

        let snippet = make_snippet(&body_text);

        let is_unread = !fetched.flags.iter().any(|f| f == "\\Seen");

        let labels: HashSet<String> = fetched
            .flags
            .iter()
            .filter_map(|f| f.strip_prefix(self.settings.keyword_prefix.as_str()))
            .map(|s| s.to_string())
            .collect();

        let thread_id = parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("thread-{}", fetched.uid));

        let has_attachments = parsed.attachments().next().is_some();

        Some(Message {
            id: compose_message_id(&self.account_id, imap_folder, fetched.uid),
            thread_id,
            subject,
            from_email,
            to_emails,
            date,
            snippet,
            body_text: Some(body_text),
            body_html,
            labels,
            is_unread,
            folder: normalize_folder_name(imap_folder),
            imap_folder: Some(imap_folder.to_string()),
            has_attachments,
        })
    }

    async fn select_for(&self, message_id: &str) -> Result<(ImapSession, u32), ProviderError> {
        let (folder, uid) = parse_message_id(message_id).map_err(ProviderError::from)?;
        let session = self.session().await?;
        session
            .ensure_selected(&folder)
            .await
            .map_err(ProviderError::from)?;
        Ok((session, uid))
    }

    async fn keywords_enabled(&self) -> bool {
        let supported = self.supports_keywords.lock().await;
        supported.unwrap_or(false)
    }

    fn smtp_config(&self) -> Result<SmtpConfig, ProviderError> {
        let smtp_host = self.settings.smtp_host.as_ref().ok_or_else(|| {
            ProviderError::NotSupported("SMTP host not configured for IMAP account".to_string())
        })?;

        let username = self
            .settings
            .smtp_username
            .clone()
            .unwrap_or_else(|| self.email.clone());

        let password_file = self
            .settings
            .smtp_password_file
            .as_deref()
            .unwrap_or(&self.credential_file);
        let password = credentials::load_password(password_file)?;

        Ok(SmtpConfig::new(
            smtp_host,
            self.settings.smtp_port,
            &username,
            &password,
            self.settings.smtp_tls,
        ))
    }
}

fn format_addr(addr: &mail_parser::Addr<'_>) -> String {
    let address = addr.address().unwrap_or_default();
    match addr.name() {
        Some(name) if !name.trim().is_empty() => format!("{} <{}>", name, address),
        _ => address.to_string(),
    }
}

fn make_snippet(body_text: &str) -> String {
    let mut snippet: String = body_text.chars().take(SNIPPET_CHARS).collect();
    if body_text.chars().count() > SNIPPET_CHARS {
        snippet.push_str("...");
    }
    snippet
}

#[async_trait]
impl Provider for ImapProvider {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn authenticate(&self) -> Result<(), ProviderError> {
        info!("Authenticating IMAP: {}@{}", self.email, self.settings.host);

        let password = credentials::load_password(&self.credential_file)?;
        let host = self.settings.host.clone();
        let port = self.settings.port;
        let email = self.email.clone();

        let session = match pool::connection_pool() {
            Some(pool) => {
                pool.acquire(&self.account_id, move || {
                    Box::pin(async move {
                        ImapSession::connect(&host, port, &email, &password, CONNECT_TIMEOUT).await
                    })
                })
                .await
                .map_err(ProviderError::from)?
            }
            None => ImapSession::connect(&host, port, &email, &password, CONNECT_TIMEOUT)
                .await
                .map_err(ProviderError::from)?,
        };

        let keyword_support = session
            .has_capability("KEYWORD")
            .await
            .map_err(ProviderError::from)?;
        info!(
            "IMAP KEYWORD extension: {}",
            if keyword_support { "supported" } else { "not supported" }
        );

        {
            let mut guard = self.session.lock().await;
            *guard = Some(session);
        }
        {
            let mut supported = self.supports_keywords.lock().await;
            *supported = Some(keyword_support);
        }
        {
            // Connection may be fresh; rediscover folders on next use.
            let mut mapping = self.folder_mapping.lock().await;
            *mapping = None;
        }

        Ok(())
    }

    async fn fetch_messages(
        &self,
        since: Option<NaiveDateTime>,
        max_results: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        info!("Fetching messages from all folders (INBOX, Sent, Trash)");

        let mapping = self.folder_mapping().await?;
        let folders_to_fetch: Vec<String> = ["inbox", "sent", "trash"]
            .iter()
            .filter_map(|logical| mapping.get(*logical).cloned())
            .collect();

        if folders_to_fetch.is_empty() {
            warn!("No folders found on IMAP server");
            return Ok(Vec::new());
        }

        let per_folder_limit = std::cmp::max(10, max_results / folders_to_fetch.len());

        let mut all_messages = Vec::new();
        for folder in &folders_to_fetch {
            match self.fetch_from_folder(folder, since, per_folder_limit).await {
                Ok(messages) => {
                    info!("Fetched {} messages from {}", messages.len(), folder);
                    all_messages.extend(messages);
                }
                Err(e) => {
                    // One bad folder must not sink the whole fetch.
                    warn!("Failed to fetch from folder {}: {}", folder, e);
                }
            }
        }

        all_messages.sort_by(|a, b| b.date.cmp(&a.date));
        all_messages.truncate(max_results);

        info!(
            "Total fetched: {} messages across {} folders",
            all_messages.len(),
            folders_to_fetch.len()
        );
        Ok(all_messages)
    }

    async fn fetch_body(
        &self,
        message_id: &str,
    ) -> Result<(Option<String>, Option<String>), ProviderError> {
        let (session, uid) = self.select_for(message_id).await?;

        let fetched = session
            .uid_fetch_full(&[uid])
            .await
            .map_err(ProviderError::from)?;

        let Some(raw) = fetched.first() else {
            warn!("Failed to fetch body for message {}", message_id);
            return Ok((None, None));
        };

        let Some(body) = raw.body.as_deref() else {
            return Ok((None, None));
        };

        let Some(parsed) = MessageParser::default().parse(body) else {
            return Ok((None, None));
        };

        let mut text = parsed.body_text(0).map(|t| t.to_string());
        let html = parsed.body_html(0).map(|h| h.to_string());

        if text.as_deref().map(|t| t.trim().is_empty()).unwrap_or(true) {
            if let Some(html) = &html {
                text = Some(HTML_TAG.replace_all(html, "").trim().to_string());
            }
        }

        Ok((text, html))
    }

    async fn update_labels(
        &self,
        message_id: &str,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> Result<(), ProviderError> {
        if !self.keywords_enabled().await {
            debug!("IMAP KEYWORD extension not supported - running in read-only mode");
            return Ok(());
        }

        let (session, uid) = self.select_for(message_id).await?;
        let prefix = &self.settings.keyword_prefix;

        if !add.is_empty() {
            let keywords = add
                .iter()
                .map(|label| format!("{}{}", prefix, label))
                .collect::<Vec<_>>()
                .join(" ");
            session
                .uid_store(&[uid], &format!("+FLAGS ({})", keywords))
                .await
                .map_err(ProviderError::from)?;
            debug!("Added keywords to message {}: {}", message_id, keywords);
        }

        if !remove.is_empty() {
            let keywords = remove
                .iter()
                .map(|label| format!("{}{}", prefix, label))
                .collect::<Vec<_>>()
                .join(" ");
            session
                .uid_store(&[uid], &format!("-FLAGS ({})", keywords))
                .await
                .map_err(ProviderError::from)?;
            debug!("Removed keywords from message {}: {}", message_id, keywords);
        }

        Ok(())
    }

    async fn ensure_labels_exist(&self, _labels: &HashSet<String>) -> Result<(), ProviderError> {
        // Keywords are ad-hoc; nothing to create.
        Ok(())
    }

    async fn list_labels(&self) -> Result<HashMap<String, String>, ProviderError> {
        // IMAP has no global keyword listing; keywords are discovered on
        // message fetch.
        Ok(HashMap::new())
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError> {
        let (session, uid) = self.select_for(message_id).await?;
        session
            .uid_store(&[uid], "+FLAGS (\\Seen)")
            .await
            .map_err(ProviderError::from)?;
        debug!("Marked message {} as read", message_id);
        Ok(())
    }

    async fn mark_unread(&self, message_id: &str) -> Result<(), ProviderError> {
        let (session, uid) = self.select_for(message_id).await?;
        session
            .uid_store(&[uid], "-FLAGS (\\Seen)")
            .await
            .map_err(ProviderError::from)?;
        debug!("Marked message {} as unread", message_id);
        Ok(())
    }

    async fn delete(&self, message_id: &str, permanent: bool) -> Result<(), ProviderError> {
        let (session, uid) = self.select_for(message_id).await?;

        if permanent {
            session
                .uid_store(&[uid], "+FLAGS (\\Deleted)")
                .await
                .map_err(ProviderError::from)?;
            session.expunge().await.map_err(ProviderError::from)?;
            info!("Permanently deleted message {}", message_id);
            return Ok(());
        }

        let mapping = self.folder_mapping().await?;
        let Some(trash_folder) = mapping.get("trash").cloned() else {
            warn!("No Trash folder found, performing permanent delete");
            return Box::pin(self.delete(message_id, true)).await;
        };

        session
            .uid_copy(&[uid], &trash_folder)
            .await
            .map_err(ProviderError::from)?;
        session
            .uid_store(&[uid], "+FLAGS (\\Deleted)")
            .await
            .map_err(ProviderError::from)?;
        session.expunge().await.map_err(ProviderError::from)?;

        info!("Moved message {} to {}", message_id, trash_folder);
        Ok(())
    }

    async fn move_to_trash(&self, message_id: &str) -> Result<(), ProviderError> {
        self.delete(message_id, false).await
    }

    async fn restore_from_trash(
        &self,
        message_id: &str,
        original_folder: Option<&str>,
    ) -> Result<(), ProviderError> {
        let (_, uid) = parse_message_id(message_id).map_err(ProviderError::from)?;

        let mapping = self.folder_mapping().await?;
        let trash_folder = mapping
            .get("trash")
            .cloned()
            .ok_or_else(|| ProviderError::Other("No Trash folder found on server".to_string()))?;

        // Restore toward the recorded original folder; INBOX when unknown.
        let destination = original_folder
            .map(|logical| {
                mapping
                    .get(logical)
                    .cloned()
                    .unwrap_or_else(|| logical.to_string())
            })
            .or_else(|| mapping.get("inbox").cloned())
            .unwrap_or_else(|| "INBOX".to_string());

        let session = self.session().await?;
        session
            .ensure_selected(&trash_folder)
            .await
            .map_err(ProviderError::from)?;
        session
            .uid_copy(&[uid], &destination)
            .await
            .map_err(ProviderError::from)?;
        session
            .uid_store(&[uid], "+FLAGS (\\Deleted)")
            .await
            .map_err(ProviderError::from)?;
        session.expunge().await.map_err(ProviderError::from)?;

        info!("Restored message {} from {} to {}", message_id, trash_folder, destination);
        Ok(())
    }

    async fn send_message(
        &self,
        mime_message: &[u8],
        _thread_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        let smtp_config = self.smtp_config()?;

        info!("Sending message via SMTP for {}", self.account_id);
        let message_id = smtp::send_raw(&smtp_config, mime_message)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        // Store a copy in the Sent folder. Best effort: the message has
        // already left the building.
        let stored = async {
            let mapping = self.folder_mapping().await?;
            let sent_folder = mapping
                .get("sent")
                .cloned()
                .unwrap_or_else(|| "Sent".to_string());

            let session = self.session().await?;
            let existing = session.list_folders().await.map_err(ProviderError::from)?;
            if !existing.iter().any(|f| f == &sent_folder) {
                info!("Creating Sent folder: {}", sent_folder);
                session
                    .create_folder(&sent_folder)
                    .await
                    .map_err(ProviderError::from)?;
            }

            session
                .append(&sent_folder, mime_message, &["\\Seen".to_string()])
                .await
                .map_err(ProviderError::from)?;

            Ok::<String, ProviderError>(sent_folder)
        }
        .await;

        match stored {
            Ok(sent_folder) => {
                info!("Stored sent message in {}", sent_folder);
                Ok(format!("{}:{}:{}", self.account_id, sent_folder, message_id))
            }
            Err(e) => {
                warn!("Failed to store sent message in IMAP: {}", e);
                Ok(message_id)
            }
        }
    }

    async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<AttachmentInfo>, ProviderError> {
        let (session, uid) = self.select_for(message_id).await?;
        let fetched = session
            .uid_fetch_full(&[uid])
            .await
            .map_err(ProviderError::from)?;

        let raw = fetched
            .first()
            .and_then(|f| f.body.clone())
            .ok_or_else(|| ProviderError::Other(format!("Message {} not found", message_id)))?;

        let parsed = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| ProviderError::Protocol("unparsable message".to_string()))?;

        let mut attachments = Vec::new();
        for (index, part) in parsed.attachments().enumerate() {
            let filename = part
                .attachment_name()
                .unwrap_or("attachment")
                .to_string();
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let is_inline = part
                .content_disposition()
                .map(|cd| cd.ctype().eq_ignore_ascii_case("inline"))
                .unwrap_or(false);

            attachments.push(AttachmentInfo {
                id: format!("part_{}", index),
                filename,
                content_type,
                size: part.len(),
                is_inline,
            });
        }

        debug!("Found {} attachments in message {}", attachments.len(), message_id);
        Ok(attachments)
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let index: usize = attachment_id
            .strip_prefix("part_")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                ProviderError::Other(format!("Invalid attachment id: {}", attachment_id))
            })?;

        let (session, uid) = self.select_for(message_id).await?;
        let fetched = session
            .uid_fetch_full(&[uid])
            .await
            .map_err(ProviderError::from)?;

        let raw = fetched
            .first()
            .and_then(|f| f.body.clone())
            .ok_or_else(|| ProviderError::Other(format!("Message {} not found", message_id)))?;

        let parsed = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| ProviderError::Protocol("unparsable message".to_string()))?;

        let part = parsed.attachments().nth(index).ok_or_else(|| {
            ProviderError::Other(format!("Attachment {} not found in message", attachment_id))
        })?;

        let data = part.contents().to_vec();
        debug!("Downloaded attachment {} ({} bytes)", attachment_id, data.len());
        Ok(data)
    }
}
