// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Durable local state: accounts, messages, classifications, feedback,
//! drafts, attachments, the pending-operation queue, and auxiliary rows.
//!
//! SQLite in WAL mode with foreign keys enforced. Every mutation that
//! logically belongs together runs in one transaction; a user action that
//! writes local state and enqueues a provider echo commits atomically, so
//! readers never see one without the other.

pub mod models;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::provider::{Classification, Message};

pub use models::{
    AccountRecord, ActionLogRecord, AttachmentRecord, ClassificationRecord, DraftRecord,
    FeedbackRecord, MessageFilters, MessageRecord, OperationStatus, PendingOp, PendingOperation,
    PushSubscriptionRecord, TrustedSenderRecord,
};

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),
}

lazy_static! {
    static ref REPLY_PREFIX: Regex = Regex::new(r"(?i)^(Re:|Fwd:|FW:|RE:)\s*").unwrap();
    static ref TICKET_HASH: Regex = Regex::new(r"#\d+").unwrap();
    static ref TICKET_BRACKET: Regex = Regex::new(r"\[\d+\]").unwrap();
    static ref DATE_SLASH: Regex = Regex::new(r"\d{1,2}/\d{1,2}/\d{2,4}").unwrap();
    static ref DATE_ISO: Regex = Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap();
}

/// Extract the domain part of an address for similarity matching.
pub fn extract_domain(email: &str) -> String {
    match email.rsplit_once('@') {
        Some((_, domain)) => domain.trim_end_matches('>').to_lowercase(),
        None => email.to_lowercase(),
    }
}

/// Normalize a subject into a pattern: reply prefixes dropped, ticket numbers
/// and dates masked, truncated.
pub fn normalize_subject(subject: &str) -> String {
    let s = REPLY_PREFIX.replace(subject, "");
    let s = TICKET_HASH.replace_all(&s, "#XXX");
    let s = TICKET_BRACKET.replace_all(&s, "[XXX]");
    let s = DATE_SLASH.replace_all(&s, "DATE");
    let s = DATE_ISO.replace_all(&s, "DATE");
    s.chars().take(200).collect::<String>().trim().to_string()
}

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_account(row: &SqliteRow) -> Result<AccountRecord, sqlx::Error> {
    let settings_raw: String = row.try_get("settings")?;
    Ok(AccountRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        provider: row.try_get("provider")?,
        last_sync: row.try_get("last_sync")?,
        settings: serde_json::from_str(&settings_raw).unwrap_or(Value::Null),
    })
}

fn row_to_message(row: &SqliteRow) -> Result<MessageRecord, sqlx::Error> {
    let to_emails: String = row.try_get("to_emails")?;
    let provider_labels: String = row.try_get("provider_labels")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        thread_id: row.try_get("thread_id")?,
        subject: row.try_get("subject")?,
        from_email: row.try_get("from_email")?,
        to_emails: parse_json_list(&to_emails),
        date: row.try_get("date")?,
        snippet: row.try_get("snippet")?,
        is_unread: row.try_get("is_unread")?,
        provider_labels: parse_json_list(&provider_labels),
        folder: row.try_get("folder")?,
        original_folder: row.try_get("original_folder")?,
        imap_folder: row.try_get("imap_folder")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        has_attachments: row.try_get("has_attachments")?,
    })
}

fn row_to_classification(row: &SqliteRow) -> Result<ClassificationRecord, sqlx::Error> {
    let tags: String = row.try_get("tags")?;
    Ok(ClassificationRecord {
        message_id: row.try_get("message_id")?,
        tags: parse_json_list(&tags),
        priority: row.try_get("priority")?,
        todo: row.try_get("todo")?,
        can_archive: row.try_get("can_archive")?,
        model: row.try_get("model")?,
        confidence: row.try_get("confidence")?,
        classified_at: row.try_get("classified_at")?,
    })
}

fn row_to_feedback(row: &SqliteRow) -> Result<FeedbackRecord, sqlx::Error> {
    let original_tags: String = row.try_get("original_tags")?;
    let corrected_tags: String = row.try_get("corrected_tags")?;
    Ok(FeedbackRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        message_id: row.try_get("message_id")?,
        sender_domain: row.try_get("sender_domain")?,
        subject_pattern: row.try_get("subject_pattern")?,
        original_tags: parse_json_list(&original_tags),
        corrected_tags: parse_json_list(&corrected_tags),
        context_snippet: row.try_get("context_snippet")?,
        corrected_at: row.try_get("corrected_at")?,
        used_count: row.try_get("used_count")?,
    })
}

fn row_to_pending(row: &SqliteRow) -> Result<PendingOperation, sqlx::Error> {
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    Ok(PendingOperation {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        message_id: row.try_get("message_id")?,
        operation: PendingOp::parse(&operation).ok_or_else(|| sqlx::Error::Decode(
            format!("unknown pending operation: {}", operation).into(),
        ))?,
        attempts: row.try_get("attempts")?,
        last_attempt: row.try_get("last_attempt")?,
        last_error: row.try_get("last_error")?,
        status: OperationStatus::parse(&status),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_draft(row: &SqliteRow) -> Result<DraftRecord, sqlx::Error> {
    let to_emails: String = row.try_get("to_emails")?;
    let cc_emails: Option<String> = row.try_get("cc_emails")?;
    let bcc_emails: Option<String> = row.try_get("bcc_emails")?;
    Ok(DraftRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        subject: row.try_get("subject")?,
        to_emails: parse_json_list(&to_emails),
        cc_emails: cc_emails.map(|raw| parse_json_list(&raw)),
        bcc_emails: bcc_emails.map(|raw| parse_json_list(&raw)),
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        thread_id: row.try_get("thread_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_attachment(row: &SqliteRow) -> Result<AttachmentRecord, sqlx::Error> {
    Ok(AttachmentRecord {
        id: row.try_get("id")?,
        draft_id: row.try_get("draft_id")?,
        message_id: row.try_get("message_id")?,
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        size: row.try_get("size")?,
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_action_log(row: &SqliteRow) -> Result<ActionLogRecord, sqlx::Error> {
    let extracted: Option<String> = row.try_get("extracted_data")?;
    let tool_result: Option<String> = row.try_get("tool_result")?;
    Ok(ActionLogRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        message_id: row.try_get("message_id")?,
        action_name: row.try_get("action_name")?,
        server: row.try_get("server")?,
        tool: row.try_get("tool")?,
        status: row.try_get("status")?,
        extracted_data: extracted.and_then(|raw| serde_json::from_str(&raw).ok()),
        tool_result: tool_result.and_then(|raw| serde_json::from_str(&raw).ok()),
        error: row.try_get("error")?,
        attempts: row.try_get("attempts")?,
        processed_at: row.try_get("processed_at")?,
    })
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at `path` and bring the schema up to date.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Invalid(format!("cannot create data dir: {}", e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Store initialized at {}", path.display());
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Invalid(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Store connections closed");
    }

    // ----- Accounts -----

    /// Create or update an account.
    ///
    /// A new id arriving with an email that already belongs to another id is
    /// a rename: the old row's email is parked on a sentinel, the new row is
    /// inserted (keeping `last_sync`), every message is reassigned, and the
    /// old row is deleted. All in one transaction.
    pub async fn upsert_account(
        &self,
        account_id: &str,
        name: &str,
        email: &str,
        provider: &str,
        settings: &Value,
    ) -> Result<AccountRecord, StoreError> {
        let settings_raw = serde_json::to_string(settings)?;
        let mut tx = self.pool.begin().await?;

        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM accounts WHERE id = ?")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?;

        if existing_id.is_some() {
            sqlx::query(
                "UPDATE accounts SET name = ?, email = ?, provider = ?, settings = ? WHERE id = ?",
            )
            .bind(name)
            .bind(email)
            .bind(provider)
            .bind(&settings_raw)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        } else {
            let by_email: Option<(String, Option<DateTime<Utc>>)> =
                sqlx::query_as("SELECT id, last_sync FROM accounts WHERE email = ?")
                    .bind(email)
                    .fetch_optional(&mut *tx)
                    .await?;

            match by_email {
                Some((old_id, old_last_sync)) => {
                    info!("Detected account rename: {} -> {}", old_id, account_id);

                    // Park the old email to dodge the UNIQUE constraint.
                    sqlx::query("UPDATE accounts SET email = ? WHERE id = ?")
                        .bind(format!("__migrating__{}", old_id))
                        .bind(&old_id)
                        .execute(&mut *tx)
                        .await?;

                    sqlx::query(
                        "INSERT INTO accounts (id, name, email, provider, last_sync, settings) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(account_id)
                    .bind(name)
                    .bind(email)
                    .bind(provider)
                    .bind(old_last_sync)
                    .bind(&settings_raw)
                    .execute(&mut *tx)
                    .await?;

                    let moved = sqlx::query("UPDATE messages SET account_id = ? WHERE account_id = ?")
                        .bind(account_id)
                        .bind(&old_id)
                        .execute(&mut *tx)
                        .await?;
                    info!(
                        "Migrated {} messages from {} to {}",
                        moved.rows_affected(),
                        old_id,
                        account_id
                    );

                    sqlx::query("DELETE FROM accounts WHERE id = ?")
                        .bind(&old_id)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO accounts (id, name, email, provider, settings) \
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(account_id)
                    .bind(name)
                    .bind(email)
                    .bind(provider)
                    .bind(&settings_raw)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;

        self.get_account(account_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", account_id)))
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_account).transpose().map_err(StoreError::from)
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_account).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_last_sync(
        &self,
        account_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET last_sync = ? WHERE id = ?")
            .bind(timestamp)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_sync_time(
        &self,
        account_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_sync FROM accounts WHERE id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.flatten())
    }

    // ----- Messages -----

    /// Insert or update a message from provider data. Returns whether the row
    /// is new.
    ///
    /// On existing rows `folder`, `is_unread`, and `original_folder` are left
    /// untouched (the local row is the authority; callers never get to flip
    /// them through this path), and bodies are only overwritten when the
    /// provider actually supplied one.
    pub async fn upsert_message(
        &self,
        account_id: &str,
        message: &Message,
    ) -> Result<bool, StoreError> {
        let to_emails = json_list(&message.to_emails);
        let labels: Vec<String> = {
            let mut labels: Vec<String> = message.labels.iter().cloned().collect();
            labels.sort();
            labels
        };
        let provider_labels = json_list(&labels);

        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM messages WHERE id = ?")
            .bind(&message.id)
            .fetch_optional(&mut *tx)
            .await?;
        let is_new = exists.is_none();

        if is_new {
            sqlx::query(
                "INSERT INTO messages (id, account_id, thread_id, subject, from_email, to_emails, \
                 date, snippet, is_unread, provider_labels, folder, imap_folder, body_text, \
                 body_html, has_attachments) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&message.id)
            .bind(account_id)
            .bind(&message.thread_id)
            .bind(&message.subject)
            .bind(&message.from_email)
            .bind(&to_emails)
            .bind(message.date)
            .bind(&message.snippet)
            .bind(message.is_unread)
            .bind(&provider_labels)
            .bind(&message.folder)
            .bind(&message.imap_folder)
            .bind(&message.body_text)
            .bind(&message.body_html)
            .bind(message.has_attachments)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE messages SET thread_id = ?, subject = ?, from_email = ?, to_emails = ?, \
                 date = ?, snippet = ?, provider_labels = ?, imap_folder = ?, \
                 body_text = COALESCE(?, body_text), body_html = COALESCE(?, body_html), \
                 has_attachments = ? WHERE id = ?",
            )
            .bind(&message.thread_id)
            .bind(&message.subject)
            .bind(&message.from_email)
            .bind(&to_emails)
            .bind(message.date)
            .bind(&message.snippet)
            .bind(&provider_labels)
            .bind(&message.imap_folder)
            .bind(&message.body_text)
            .bind(&message.body_html)
            .bind(message.has_attachments)
            .bind(&message.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(is_new)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose().map_err(StoreError::from)
    }

    /// Flip the unread flag. No-op if the message is absent.
    pub async fn update_message_read(
        &self,
        message_id: &str,
        is_unread: bool,
    ) -> Result<Option<MessageRecord>, StoreError> {
        sqlx::query("UPDATE messages SET is_unread = ? WHERE id = ?")
            .bind(is_unread)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        self.get_message(message_id).await
    }

    /// Set bodies fetched lazily from the provider.
    pub async fn update_message_body(
        &self,
        message_id: &str,
        body_text: Option<&str>,
        body_html: Option<&str>,
    ) -> Result<Option<MessageRecord>, StoreError> {
        sqlx::query("UPDATE messages SET body_text = ?, body_html = ? WHERE id = ?")
            .bind(body_text)
            .bind(body_html)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        self.get_message(message_id).await
    }

    /// Soft delete: record the current folder and move to trash. Idempotent.
    pub async fn move_to_trash(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let moved = move_to_trash_tx(&mut tx, message_id).await?;
        tx.commit().await?;

        if moved {
            self.get_message(message_id).await
        } else {
            Ok(None)
        }
    }

    /// Restore from trash to the recorded original folder (inbox fallback).
    pub async fn restore_from_trash(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let restored = restore_from_trash_tx(&mut tx, message_id).await?;
        tx.commit().await?;

        if restored {
            self.get_message(message_id).await
        } else {
            Ok(None)
        }
    }

    /// Hard delete. Classification, feedback, and attachments go with it.
    pub async fn delete_message(&self, message_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Filtered, paginated message listing, newest first.
    pub async fn query_messages(
        &self,
        filters: &MessageFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let (account_email_ids, taxonomy_tags) = self.split_tag_filters(&filters.tags).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT m.* FROM messages m");
        if !taxonomy_tags.is_empty() {
            qb.push(" JOIN classifications c ON c.message_id = m.id");
        }
        qb.push(" WHERE 1=1");
        push_message_filters(&mut qb, filters, &account_email_ids, &taxonomy_tags);
        qb.push(" ORDER BY m.date DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub async fn count_messages(&self, filters: &MessageFilters) -> Result<i64, StoreError> {
        let (account_email_ids, taxonomy_tags) = self.split_tag_filters(&filters.tags).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(m.id) FROM messages m");
        if !taxonomy_tags.is_empty() {
            qb.push(" JOIN classifications c ON c.message_id = m.id");
        }
        qb.push(" WHERE 1=1");
        push_message_filters(&mut qb, filters, &account_email_ids, &taxonomy_tags);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Distinguish account-email pseudo-tags from taxonomy tags.
    async fn split_tag_filters(
        &self,
        tags: &[String],
    ) -> Result<(Vec<String>, Vec<String>), StoreError> {
        if tags.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let accounts = self.list_accounts().await?;
        let by_email: HashMap<&str, &str> = accounts
            .iter()
            .map(|a| (a.email.as_str(), a.id.as_str()))
            .collect();

        let mut account_ids = Vec::new();
        let mut taxonomy = Vec::new();
        for tag in tags {
            match by_email.get(tag.as_str()) {
                Some(account_id) => account_ids.push((*account_id).to_string()),
                None => taxonomy.push(tag.clone()),
            }
        }
        Ok((account_ids, taxonomy))
    }

    /// Full-text search over subject, sender, snippet, and plaintext body.
    pub async fn search_messages(
        &self,
        account_id: Option<&str>,
        query: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT m.* FROM messages m JOIN messages_fts f ON m.rowid = f.rowid \
             WHERE messages_fts MATCH ",
        );
        qb.push_bind(query);
        if let Some(account_id) = account_id {
            qb.push(" AND m.account_id = ");
            qb.push_bind(account_id);
        }
        qb.push(" ORDER BY m.date DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub async fn unclassified_messages(
        &self,
        account_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT m.* FROM messages m \
             WHERE NOT EXISTS (SELECT 1 FROM classifications c WHERE c.message_id = m.id)",
        );
        if let Some(account_id) = account_id {
            qb.push(" AND m.account_id = ");
            qb.push_bind(account_id);
        }
        qb.push(" ORDER BY m.date DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub async fn message_count(&self, account_id: Option<&str>) -> Result<i64, StoreError> {
        let count: i64 = match account_id {
            Some(account_id) => {
                sqlx::query_scalar("SELECT COUNT(id) FROM messages WHERE account_id = ?")
                    .bind(account_id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(id) FROM messages")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    // ----- User actions (local mutation + provider echo, one transaction) -----

    /// Flip the read flag locally and queue the provider echo atomically.
    pub async fn set_read_state(
        &self,
        account_id: &str,
        message_id: &str,
        is_unread: bool,
    ) -> Result<(), StoreError> {
        let op = if is_unread {
            PendingOp::MarkUnread
        } else {
            PendingOp::MarkRead
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET is_unread = ? WHERE id = ?")
            .bind(is_unread)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        enqueue_pending_tx(&mut tx, account_id, message_id, op).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Trash locally and queue the provider echo atomically.
    pub async fn trash_message(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        move_to_trash_tx(&mut tx, message_id).await?;
        enqueue_pending_tx(&mut tx, account_id, message_id, PendingOp::Trash).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Restore locally and queue the provider echo atomically.
    pub async fn restore_message(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        restore_from_trash_tx(&mut tx, message_id).await?;
        enqueue_pending_tx(&mut tx, account_id, message_id, PendingOp::Restore).await?;
        tx.commit().await?;
        Ok(())
    }

    // ----- Pending operations -----

    /// Queue a provider echo, applying the cancellation and dedup rules:
    /// an opposite pending op cancels both, an identical pending op is
    /// returned as-is.
    pub async fn enqueue_pending(
        &self,
        account_id: &str,
        message_id: &str,
        operation: PendingOp,
    ) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = enqueue_pending_tx(&mut tx, account_id, message_id, operation).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Pending rows in FIFO order.
    pub async fn dequeue_pending(
        &self,
        account_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        self.pending_with_status(account_id, limit, OperationStatus::Pending)
            .await
    }

    async fn pending_with_status(
        &self,
        account_id: Option<&str>,
        limit: i64,
        status: OperationStatus,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM pending_operations WHERE status = ");
        qb.push_bind(status.as_str());
        if let Some(account_id) = account_id {
            qb.push(" AND account_id = ");
            qb.push_bind(account_id);
        }
        qb.push(" ORDER BY created_at ASC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_pending).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub async fn complete_pending(&self, operation_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'completed', last_attempt = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(operation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failed attempt; the row turns terminal once attempts reach
    /// `max_attempts`.
    pub async fn fail_pending(
        &self,
        operation_id: &str,
        error: &str,
        max_attempts: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM pending_operations WHERE id = ?")
            .bind(operation_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let op = row_to_pending(&row)?;

        let attempts = op.attempts + 1;
        let status = if attempts >= max_attempts {
            warn!(
                "Operation {} ({}) failed permanently after {} attempts: {}",
                operation_id,
                op.operation.as_str(),
                attempts,
                error
            );
            OperationStatus::Failed
        } else {
            info!(
                "Operation {} ({}) attempt {}/{} failed: {}",
                operation_id,
                op.operation.as_str(),
                attempts,
                max_attempts,
                error
            );
            OperationStatus::Pending
        };

        sqlx::query(
            "UPDATE pending_operations SET attempts = ?, last_attempt = ?, last_error = ?, \
             status = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(Utc::now())
        .bind(error)
        .bind(status.as_str())
        .bind(operation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Terminal failures, for manual attention.
    pub async fn get_failed_operations(
        &self,
        account_id: Option<&str>,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        self.pending_with_status(account_id, 100, OperationStatus::Failed)
            .await
    }

    pub async fn delete_pending(&self, operation_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM pending_operations WHERE id = ?")
            .bind(operation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cleanup_completed_operations(
        &self,
        older_than_hours: i64,
    ) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::hours(older_than_hours);
        let result = sqlx::query(
            "DELETE FROM pending_operations WHERE status = 'completed' AND last_attempt < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!("Cleaned up {} completed pending operations", count);
        }
        Ok(count)
    }

    // ----- Classifications -----

    pub async fn has_classification(&self, message_id: &str) -> Result<bool, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM classifications WHERE message_id = ?")
                .bind(message_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Store or replace the classification. The message row is untouched.
    pub async fn store_classification(
        &self,
        message_id: &str,
        classification: &Classification,
        model: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO classifications \
             (message_id, tags, priority, todo, can_archive, model, confidence, classified_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(message_id) DO UPDATE SET tags = excluded.tags, \
             priority = excluded.priority, todo = excluded.todo, \
             can_archive = excluded.can_archive, model = excluded.model, \
             confidence = excluded.confidence, classified_at = excluded.classified_at",
        )
        .bind(message_id)
        .bind(json_list(&classification.tags))
        .bind(classification.priority.as_str())
        .bind(classification.todo)
        .bind(classification.can_archive)
        .bind(model)
        .bind(classification.confidence)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_classification(
        &self,
        message_id: &str,
    ) -> Result<Option<ClassificationRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM classifications WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(row_to_classification)
            .transpose()
            .map_err(StoreError::from)
    }

    /// Update a message's tags. A user edit that changes the tag set also
    /// records a feedback row (in the same transaction) for few-shot reuse.
    pub async fn update_message_tags(
        &self,
        message_id: &str,
        tags: &[String],
        confidence: Option<f64>,
        user_edited: bool,
    ) -> Result<Option<ClassificationRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM classifications WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let old = row_to_classification(&row)?;

        sqlx::query(
            "UPDATE classifications SET tags = ?, confidence = COALESCE(?, confidence), \
             classified_at = ? WHERE message_id = ?",
        )
        .bind(json_list(tags))
        .bind(confidence)
        .bind(Utc::now())
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        let old_set: HashSet<&String> = old.tags.iter().collect();
        let new_set: HashSet<&String> = tags.iter().collect();

        if user_edited && old_set != new_set {
            let message_row = sqlx::query("SELECT * FROM messages WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(message_row) = message_row {
                let message = row_to_message(&message_row)?;
                let snippet: String = message.snippet.chars().take(300).collect();

                sqlx::query(
                    "INSERT INTO feedback (account_id, message_id, sender_domain, \
                     subject_pattern, original_tags, corrected_tags, context_snippet, \
                     corrected_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&message.account_id)
                .bind(message_id)
                .bind(extract_domain(&message.from_email))
                .bind(normalize_subject(&message.subject))
                .bind(json_list(&old.tags))
                .bind(json_list(tags))
                .bind(&snippet)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;

                debug!(
                    "Recorded correction for {}: {:?} -> {:?}",
                    message.from_email, old.tags, tags
                );
            }
        }

        tx.commit().await?;
        self.get_classification(message_id).await
    }

    /// Per-tag usage counts across all classifications.
    pub async fn tag_stats(&self) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query("SELECT tags FROM classifications")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in &rows {
            let raw: String = row.try_get("tags")?;
            for tag in parse_json_list(&raw) {
                *counts.entry(tag).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    // ----- Feedback (dynamic few-shot learning) -----

    /// Relevant correction examples: up to three recent domain matches,
    /// topped up with other recent corrections from the same account.
    /// `used_count` is bumped in the same transaction as the read.
    pub async fn relevant_feedback(
        &self,
        account_id: &str,
        sender_domain: &str,
        limit: i64,
    ) -> Result<Vec<FeedbackRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let domain_limit = std::cmp::min(3, limit);
        let domain_rows = sqlx::query(
            "SELECT * FROM feedback WHERE account_id = ? AND sender_domain = ? \
             ORDER BY corrected_at DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(sender_domain.to_lowercase())
        .bind(domain_limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut feedback: Vec<FeedbackRecord> = domain_rows
            .iter()
            .map(row_to_feedback)
            .collect::<Result<_, _>>()?;

        let remaining = limit - feedback.len() as i64;
        if remaining > 0 {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT * FROM feedback WHERE account_id = ");
            qb.push_bind(account_id);
            if !feedback.is_empty() {
                qb.push(" AND id NOT IN (");
                let mut separated = qb.separated(", ");
                for record in &feedback {
                    separated.push_bind(record.id);
                }
                qb.push(")");
            }
            qb.push(" ORDER BY corrected_at DESC LIMIT ");
            qb.push_bind(remaining);

            let other_rows = qb.build().fetch_all(&mut *tx).await?;
            for row in &other_rows {
                feedback.push(row_to_feedback(row)?);
            }
        }

        for record in &mut feedback {
            sqlx::query("UPDATE feedback SET used_count = used_count + 1 WHERE id = ?")
                .bind(record.id)
                .execute(&mut *tx)
                .await?;
            record.used_count += 1;
        }

        tx.commit().await?;
        Ok(feedback)
    }

    pub async fn feedback_stats(
        &self,
        account_id: &str,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;

        let total_used: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(used_count), 0) FROM feedback WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        let domain_rows = sqlx::query(
            "SELECT sender_domain, COUNT(id) AS cnt FROM feedback WHERE account_id = ? \
             GROUP BY sender_domain ORDER BY cnt DESC LIMIT 10",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let top_domains: Vec<Value> = domain_rows
            .iter()
            .map(|row| {
                let domain: String = row.try_get("sender_domain")?;
                let count: i64 = row.try_get("cnt")?;
                Ok(serde_json::json!({ "domain": domain, "count": count }))
            })
            .collect::<Result<_, sqlx::Error>>()?;

        let mut stats = HashMap::new();
        stats.insert("total_corrections".to_string(), Value::from(total));
        stats.insert("total_usage".to_string(), Value::from(total_used));
        stats.insert("top_domains".to_string(), Value::from(top_domains));
        Ok(stats)
    }

    pub async fn has_user_feedback(&self, message_id: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback WHERE message_id = ?")
            .bind(message_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Retention: drop entries past `max_age_days`, then trim each account to
    /// `max_per_account` (oldest first). Returns how many went away.
    pub async fn cleanup_feedback(
        &self,
        max_age_days: i64,
        max_per_account: i64,
    ) -> Result<u64, StoreError> {
        let mut removed: u64 = 0;
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM feedback WHERE corrected_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        removed += result.rows_affected();

        let accounts: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT account_id FROM feedback")
                .fetch_all(&mut *tx)
                .await?;

        for account_id in accounts {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM feedback WHERE account_id = ?")
                    .bind(&account_id)
                    .fetch_one(&mut *tx)
                    .await?;

            if count > max_per_account {
                let excess = count - max_per_account;
                let result = sqlx::query(
                    "DELETE FROM feedback WHERE id IN \
                     (SELECT id FROM feedback WHERE account_id = ? \
                      ORDER BY corrected_at ASC LIMIT ?)",
                )
                .bind(&account_id)
                .bind(excess)
                .execute(&mut *tx)
                .await?;
                removed += result.rows_affected();
            }
        }

        tx.commit().await?;

        if removed > 0 {
            info!("Feedback cleanup: removed {} entries", removed);
        }
        Ok(removed)
    }

    // ----- Drafts -----

    pub async fn create_draft(&self, draft: &DraftRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO drafts (id, account_id, subject, to_emails, cc_emails, bcc_emails, \
             body_text, body_html, thread_id, in_reply_to, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.id)
        .bind(&draft.account_id)
        .bind(&draft.subject)
        .bind(json_list(&draft.to_emails))
        .bind(draft.cc_emails.as_ref().map(|v| json_list(v)))
        .bind(draft.bcc_emails.as_ref().map(|v| json_list(v)))
        .bind(&draft.body_text)
        .bind(&draft.body_html)
        .bind(&draft.thread_id)
        .bind(&draft.in_reply_to)
        .bind(draft.created_at)
        .bind(draft.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_draft(&self, draft_id: &str) -> Result<Option<DraftRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM drafts WHERE id = ?")
            .bind(draft_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_draft).transpose().map_err(StoreError::from)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_draft(
        &self,
        draft_id: &str,
        subject: Option<&str>,
        to_emails: Option<&[String]>,
        cc_emails: Option<&[String]>,
        bcc_emails: Option<&[String]>,
        body_text: Option<&str>,
        body_html: Option<&str>,
    ) -> Result<Option<DraftRecord>, StoreError> {
        let existing = self.get_draft(draft_id).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE drafts SET subject = ?, to_emails = ?, cc_emails = ?, bcc_emails = ?, \
             body_text = ?, body_html = ?, updated_at = ? WHERE id = ?",
        )
        .bind(subject.unwrap_or(&existing.subject))
        .bind(json_list(to_emails.unwrap_or(&existing.to_emails)))
        .bind(
            cc_emails
                .map(json_list)
                .or_else(|| existing.cc_emails.as_ref().map(|v| json_list(v))),
        )
        .bind(
            bcc_emails
                .map(json_list)
                .or_else(|| existing.bcc_emails.as_ref().map(|v| json_list(v))),
        )
        .bind(body_text.or(existing.body_text.as_deref()))
        .bind(body_html.or(existing.body_html.as_deref()))
        .bind(Utc::now())
        .bind(draft_id)
        .execute(&self.pool)
        .await?;

        self.get_draft(draft_id).await
    }

    /// Draft deletion cascades to its attachments.
    pub async fn delete_draft(&self, draft_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM drafts WHERE id = ?")
            .bind(draft_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_drafts(
        &self,
        account_id: Option<&str>,
    ) -> Result<Vec<DraftRecord>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM drafts WHERE 1=1");
        if let Some(account_id) = account_id {
            qb.push(" AND account_id = ");
            qb.push_bind(account_id);
        }
        qb.push(" ORDER BY updated_at DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_draft).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    // ----- Attachments -----

    /// Attach to a draft or a message, never both.
    pub async fn add_attachment(&self, attachment: &AttachmentRecord) -> Result<(), StoreError> {
        if attachment.draft_id.is_some() == attachment.message_id.is_some() {
            return Err(StoreError::Invalid(
                "attachment must reference exactly one of draft or message".to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO attachments (id, draft_id, message_id, filename, content_type, size, \
             data, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attachment.id)
        .bind(&attachment.draft_id)
        .bind(&attachment.message_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(attachment.size)
        .bind(&attachment.data)
        .bind(attachment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<Option<AttachmentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM attachments WHERE id = ?")
            .bind(attachment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_attachment).transpose().map_err(StoreError::from)
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = ?")
            .bind(attachment_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_attachments(
        &self,
        draft_id: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<Vec<AttachmentRecord>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM attachments WHERE 1=1");
        if let Some(draft_id) = draft_id {
            qb.push(" AND draft_id = ");
            qb.push_bind(draft_id);
        } else if let Some(message_id) = message_id {
            qb.push(" AND message_id = ");
            qb.push_bind(message_id);
        }
        qb.push(" ORDER BY created_at ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_attachment).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    // ----- Trusted senders -----

    pub async fn add_trusted_sender(
        &self,
        account_id: &str,
        sender: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO trusted_senders (account_id, sender, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(account_id, sender) DO NOTHING",
        )
        .bind(account_id)
        .bind(sender.to_lowercase())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_trusted_sender(
        &self,
        account_id: &str,
        sender: &str,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM trusted_senders WHERE account_id = ? AND sender = ?")
                .bind(account_id)
                .bind(sender.to_lowercase())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_trusted_senders(
        &self,
        account_id: &str,
    ) -> Result<Vec<TrustedSenderRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trusted_senders WHERE account_id = ? ORDER BY sender ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TrustedSenderRecord {
                    id: row.try_get("id")?,
                    account_id: row.try_get("account_id")?,
                    sender: row.try_get("sender")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    pub async fn is_trusted_sender(
        &self,
        account_id: &str,
        sender: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trusted_senders WHERE account_id = ? AND sender = ?",
        )
        .bind(account_id)
        .bind(sender.to_lowercase())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ----- Push subscriptions -----

    pub async fn add_push_subscription(
        &self,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO push_subscriptions (endpoint, p256dh, auth, created_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(endpoint) DO UPDATE SET p256dh = excluded.p256dh, auth = excluded.auth",
        )
        .bind(endpoint)
        .bind(p256dh)
        .bind(auth)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_push_subscriptions(
        &self,
    ) -> Result<Vec<PushSubscriptionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM push_subscriptions ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PushSubscriptionRecord {
                    id: row.try_get("id")?,
                    endpoint: row.try_get("endpoint")?,
                    p256dh: row.try_get("p256dh")?,
                    auth: row.try_get("auth")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    pub async fn delete_push_subscription(&self, endpoint: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ----- Action logs -----

    pub async fn store_action_log(&self, entry: &ActionLogRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO action_logs (id, account_id, message_id, action_name, server, tool, \
             status, extracted_data, tool_result, error, attempts, processed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.account_id)
        .bind(&entry.message_id)
        .bind(&entry.action_name)
        .bind(&entry.server)
        .bind(&entry.tool)
        .bind(&entry.status)
        .bind(
            entry
                .extracted_data
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default()),
        )
        .bind(
            entry
                .tool_result
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default()),
        )
        .bind(&entry.error)
        .bind(entry.attempts)
        .bind(entry.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// How many failed attempts are on record for this (message, action).
    pub async fn action_attempt_count(
        &self,
        message_id: &str,
        action_name: &str,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM action_logs WHERE message_id = ? AND action_name = ? \
             AND status = 'failed'",
        )
        .bind(message_id)
        .bind(action_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn action_logs_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ActionLogRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM action_logs WHERE message_id = ? ORDER BY processed_at DESC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_action_log).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub async fn action_logs_for_account(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<ActionLogRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM action_logs WHERE account_id = ? ORDER BY processed_at DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_action_log).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    /// Resetting a message's retry counter means deleting its log rows.
    pub async fn delete_action_logs(&self, message_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM action_logs WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Messages whose classification carries any of the given action tags.
    pub async fn pending_action_messages(
        &self,
        account_id: &str,
        action_tags: &[String],
        limit: i64,
    ) -> Result<Vec<(MessageRecord, ClassificationRecord)>, StoreError> {
        if action_tags.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT m.*, c.message_id AS c_message_id, c.tags AS c_tags, \
             c.priority AS c_priority, c.todo AS c_todo, c.can_archive AS c_can_archive, \
             c.model AS c_model, c.confidence AS c_confidence, \
             c.classified_at AS c_classified_at \
             FROM messages m JOIN classifications c ON c.message_id = m.id \
             WHERE m.account_id = ",
        );
        qb.push_bind(account_id);
        qb.push(" AND (");
        for (i, tag) in action_tags.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("c.tags LIKE ");
            qb.push_bind(format!("%\"{}\"%", tag));
        }
        qb.push(") ORDER BY m.date DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut results = Vec::new();
        for row in &rows {
            let message = row_to_message(row)?;
            let tags: String = row.try_get("c_tags")?;
            let classification = ClassificationRecord {
                message_id: row.try_get("c_message_id")?,
                tags: parse_json_list(&tags),
                priority: row.try_get("c_priority")?,
                todo: row.try_get("c_todo")?,
                can_archive: row.try_get("c_can_archive")?,
                model: row.try_get("c_model")?,
                confidence: row.try_get("c_confidence")?,
                classified_at: row.try_get("c_classified_at")?,
            };
            results.push((message, classification));
        }
        Ok(results)
    }
}

// ----- Transaction-scoped helpers -----

async fn move_to_trash_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    message_id: &str,
) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT folder FROM messages WHERE id = ?")
        .bind(message_id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Ok(false);
    };
    let folder: String = row.try_get("folder")?;

    if folder == "trash" {
        return Ok(true);
    }

    warn!("Moving message to trash: id={}, from_folder={}", message_id, folder);

    sqlx::query("UPDATE messages SET original_folder = folder, folder = 'trash' WHERE id = ?")
        .bind(message_id)
        .execute(&mut **tx)
        .await?;
    Ok(true)
}

async fn restore_from_trash_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    message_id: &str,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE messages SET folder = COALESCE(original_folder, 'inbox'), \
         original_folder = NULL WHERE id = ? AND folder = 'trash'",
    )
    .bind(message_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn enqueue_pending_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    account_id: &str,
    message_id: &str,
    operation: PendingOp,
) -> Result<Option<String>, StoreError> {
    if let Some(opposite) = operation.opposite() {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM pending_operations WHERE message_id = ? AND operation = ? \
             AND status = 'pending'",
        )
        .bind(message_id)
        .bind(opposite.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(existing_id) = existing {
            sqlx::query("DELETE FROM pending_operations WHERE id = ?")
                .bind(&existing_id)
                .execute(&mut **tx)
                .await?;
            info!(
                "Cancelled pending {} with {} for message {}",
                opposite.as_str(),
                operation.as_str(),
                message_id
            );
            return Ok(None);
        }
    }

    let duplicate: Option<String> = sqlx::query_scalar(
        "SELECT id FROM pending_operations WHERE message_id = ? AND operation = ? \
         AND status = 'pending'",
    )
    .bind(message_id)
    .bind(operation.as_str())
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(existing_id) = duplicate {
        debug!(
            "Operation {} already queued for message {}",
            operation.as_str(),
            message_id
        );
        return Ok(Some(existing_id));
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO pending_operations (id, account_id, message_id, operation, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(account_id)
    .bind(message_id)
    .bind(operation.as_str())
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    info!("Queued {} for message {}", operation.as_str(), message_id);
    Ok(Some(id))
}

fn push_message_filters(
    qb: &mut QueryBuilder<Sqlite>,
    filters: &MessageFilters,
    account_email_ids: &[String],
    taxonomy_tags: &[String],
) {
    if let Some(account_id) = &filters.account_id {
        qb.push(" AND m.account_id = ");
        qb.push_bind(account_id.clone());
    } else if !account_email_ids.is_empty() {
        qb.push(" AND m.account_id IN (");
        let mut separated = qb.separated(", ");
        for account_id in account_email_ids {
            separated.push_bind(account_id.clone());
        }
        qb.push(")");
    }

    if let Some(is_unread) = filters.is_unread {
        qb.push(" AND m.is_unread = ");
        qb.push_bind(is_unread);
    }

    if let Some(folder) = &filters.folder {
        qb.push(" AND m.folder = ");
        qb.push_bind(folder.clone());
    }

    if let Some(thread_id) = &filters.thread_id {
        qb.push(" AND m.thread_id = ");
        qb.push_bind(thread_id.clone());
    }

    if !taxonomy_tags.is_empty() {
        qb.push(" AND (");
        for (i, tag) in taxonomy_tags.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("c.tags LIKE ");
            qb.push_bind(format!("%\"{}\"%", tag));
        }
        qb.push(")");
    }

    if let Some(text) = &filters.text {
        let pattern = format!("%{}%", text);
        qb.push(" AND (m.subject LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR m.from_email LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR m.snippet LIKE ");
        qb.push_bind(pattern);
        qb.push(")");
    }
}
