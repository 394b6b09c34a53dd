// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thin async wrapper around an authenticated IMAP session.
//!
//! The wrapper owns the session behind an `Arc<Mutex<_>>` so it can be cloned
//! into the connection pool, and tracks the currently selected folder so
//! repeated operations against the same folder skip the redundant SELECT.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use chrono::{DateTime, FixedOffset};
use futures_util::stream::TryStreamExt;
use log::{debug, info};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_native_tls::native_tls;
use tokio_native_tls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::imap::error::ImapError;

pub type TlsCompatibleStream =
    tokio_util::compat::Compat<tokio_native_tls::TlsStream<TokioTcpStream>>;
pub type TlsImapSession = async_imap::Session<TlsCompatibleStream>;

/// A message as fetched from the server, before normalization.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub body: Option<Vec<u8>>,
}

fn flag_to_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

impl From<&Fetch> for FetchedMessage {
    fn from(fetch: &Fetch) -> Self {
        FetchedMessage {
            uid: fetch.uid.unwrap_or(0),
            flags: fetch.flags().map(|f| flag_to_string(&f)).collect(),
            internal_date: fetch.internal_date(),
            body: fetch.body().map(|b| b.to_vec()),
        }
    }
}

/// Cloneable handle to one authenticated IMAP connection.
#[derive(Clone)]
pub struct ImapSession {
    session: Arc<TokioMutex<TlsImapSession>>,
    current_folder: Arc<TokioMutex<Option<String>>>,
}

impl std::fmt::Debug for ImapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSession").finish_non_exhaustive()
    }
}

impl ImapSession {
    /// Establish a TLS connection and log in with a password.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ImapError> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ImapError::Tls(e.to_string()))?;
        let tls_connector = TlsConnector::from(tls);

        let tcp_stream = tokio::time::timeout(timeout, TokioTcpStream::connect((host, port)))
            .await
            .map_err(|_| ImapError::Timeout("Connection timed out".to_string()))?
            .map_err(|e| ImapError::Connection(e.to_string()))?;

        tcp_stream
            .set_nodelay(true)
            .map_err(|e| ImapError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let tls_stream = tokio::time::timeout(timeout, tls_connector.connect(host, tcp_stream))
            .await
            .map_err(|_| ImapError::Timeout("TLS handshake timed out".to_string()))?
            .map_err(|e| ImapError::Tls(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let session = tokio::time::timeout(timeout, client.login(username, password))
            .await
            .map_err(|_| ImapError::Timeout("Login timed out".to_string()))?
            .map_err(|(err, _client)| match err {
                async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
                    ImapError::Auth(format!("Login failed: {}", msg))
                }
                other => ImapError::Auth(format!("Login failed: {:?}", other)),
            })?;

        info!("IMAP login successful for {}@{}", username, host);

        Ok(Self {
            session: Arc::new(TokioMutex::new(session)),
            current_folder: Arc::new(TokioMutex::new(None)),
        })
    }

    /// Whether two handles share the same underlying connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }

    pub async fn current_folder(&self) -> Option<String> {
        self.current_folder.lock().await.clone()
    }

    /// Select `folder` unless it is already the selected folder.
    pub async fn ensure_selected(&self, folder: &str) -> Result<(), ImapError> {
        {
            let current = self.current_folder.lock().await;
            if current.as_deref() == Some(folder) {
                return Ok(());
            }
        }

        let mut session = self.session.lock().await;
        session
            .select(folder)
            .await
            .map_err(|e| match e {
                async_imap::error::Error::No(msg) => ImapError::FolderNotFound(msg),
                other => ImapError::from(other),
            })?;
        drop(session);

        let mut current = self.current_folder.lock().await;
        *current = Some(folder.to_string());
        debug!("Selected folder: {}", folder);
        Ok(())
    }

    /// Forget the selected-folder shadow (after an error of unknown depth).
    pub async fn reset_selection(&self) {
        let mut current = self.current_folder.lock().await;
        *current = None;
    }

    /// List folder names via LIST "" "*".
    pub async fn list_folders(&self) -> Result<Vec<String>, ImapError> {
        let mut session = self.session.lock().await;
        let stream = session.list(None, Some("*")).await.map_err(ImapError::from)?;
        let names: Vec<_> = stream.try_collect().await.map_err(ImapError::from)?;
        Ok(names.iter().map(|n| n.name().to_string()).collect())
    }

    pub async fn create_folder(&self, name: &str) -> Result<(), ImapError> {
        let mut session = self.session.lock().await;
        session.create(name).await.map_err(ImapError::from)
    }

    /// Whether the server advertises a capability (e.g. "IDLE", "KEYWORD").
    pub async fn has_capability(&self, name: &str) -> Result<bool, ImapError> {
        let mut session = self.session.lock().await;
        let caps = session.capabilities().await.map_err(ImapError::from)?;
        Ok(caps.has_str(name))
    }

    /// UID SEARCH with a raw criteria string.
    pub async fn uid_search(&self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let mut session = self.session.lock().await;
        let uids = session.uid_search(criteria).await.map_err(ImapError::from)?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// UID FETCH of flags, internal date, and full body.
    pub async fn uid_fetch_full(&self, uids: &[u32]) -> Result<Vec<FetchedMessage>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let sequence = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut session = self.session.lock().await;
        let mut stream = session
            .uid_fetch(&sequence, "(UID FLAGS INTERNALDATE BODY[])")
            .await
            .map_err(ImapError::from)?;

        let mut messages = Vec::new();
        while let Some(fetch) = stream.try_next().await.map_err(ImapError::from)? {
            messages.push(FetchedMessage::from(&fetch));
        }
        debug!("Fetched {} of {} requested UIDs", messages.len(), uids.len());
        Ok(messages)
    }

    /// UID STORE with a prebuilt item string, e.g. `+FLAGS (\Seen)`.
    pub async fn uid_store(&self, uids: &[u32], item: &str) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }

        let sequence = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut session = self.session.lock().await;
        let stream = session
            .uid_store(&sequence, item)
            .await
            .map_err(ImapError::from)?;
        let _: Vec<_> = stream.try_collect().await.map_err(ImapError::from)?;
        Ok(())
    }

    pub async fn uid_copy(&self, uids: &[u32], to_folder: &str) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }

        let sequence = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut session = self.session.lock().await;
        session
            .uid_copy(&sequence, to_folder)
            .await
            .map_err(ImapError::from)
    }

    pub async fn expunge(&self) -> Result<(), ImapError> {
        let mut session = self.session.lock().await;
        let stream = session.expunge().await.map_err(ImapError::from)?;
        let _: Vec<_> = stream.try_collect().await.map_err(ImapError::from)?;
        Ok(())
    }

    /// APPEND a raw message to a folder with the given flags.
    pub async fn append(
        &self,
        folder: &str,
        content: &[u8],
        flags: &[String],
    ) -> Result<(), ImapError> {
        let flags_item = if flags.is_empty() {
            None
        } else {
            Some(format!("({})", flags.join(" ")))
        };

        let mut session = self.session.lock().await;
        session
            .append(folder, flags_item.as_deref(), None, content)
            .await
            .map_err(ImapError::from)
    }

    pub async fn noop(&self) -> Result<(), ImapError> {
        let mut session = self.session.lock().await;
        session.noop().await.map_err(ImapError::from)
    }

    pub async fn logout(&self) -> Result<(), ImapError> {
        let mut session = self.session.lock().await;
        session.logout().await.map_err(ImapError::from)
    }
}
