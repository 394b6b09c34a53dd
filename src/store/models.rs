// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Row types for the durable store.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub provider: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub settings: Value,
}

/// The message row is the authority on local state; provider state is only
/// reconciled into it for new rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub account_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub date: NaiveDateTime,
    pub snippet: String,
    pub is_unread: bool,
    pub provider_labels: Vec<String>,
    pub folder: String,
    pub original_folder: Option<String>,
    pub imap_folder: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub message_id: String,
    pub tags: Vec<String>,
    pub priority: String,
    pub todo: bool,
    pub can_archive: bool,
    pub model: String,
    pub confidence: Option<f64>,
    pub classified_at: DateTime<Utc>,
}

/// One stored user correction, usable as a few-shot example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: i64,
    pub account_id: String,
    pub message_id: String,
    pub sender_domain: String,
    pub subject_pattern: String,
    pub original_tags: Vec<String>,
    pub corrected_tags: Vec<String>,
    pub context_snippet: Option<String>,
    pub corrected_at: DateTime<Utc>,
    pub used_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRecord {
    pub id: String,
    pub account_id: String,
    pub subject: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Option<Vec<String>>,
    pub bcc_emails: Option<Vec<String>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub draft_id: Option<String>,
    pub message_id: Option<String>,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    #[serde(skip_serializing)]
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOp {
    MarkRead,
    MarkUnread,
    Trash,
    Restore,
    Delete,
}

impl PendingOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOp::MarkRead => "mark_read",
            PendingOp::MarkUnread => "mark_unread",
            PendingOp::Trash => "trash",
            PendingOp::Restore => "restore",
            PendingOp::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mark_read" => Some(PendingOp::MarkRead),
            "mark_unread" => Some(PendingOp::MarkUnread),
            "trash" => Some(PendingOp::Trash),
            "restore" => Some(PendingOp::Restore),
            "delete" => Some(PendingOp::Delete),
            _ => None,
        }
    }

    /// The operation this one cancels out with, if any.
    pub fn opposite(&self) -> Option<Self> {
        match self {
            PendingOp::MarkRead => Some(PendingOp::MarkUnread),
            PendingOp::MarkUnread => Some(PendingOp::MarkRead),
            PendingOp::Trash => Some(PendingOp::Restore),
            PendingOp::Restore => Some(PendingOp::Trash),
            PendingOp::Delete => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => OperationStatus::Completed,
            "failed" => OperationStatus::Failed,
            _ => OperationStatus::Pending,
        }
    }
}

/// A mutation waiting to be echoed to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub account_id: String,
    pub message_id: String,
    pub operation: PendingOp,
    pub attempts: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedSenderRecord {
    pub id: i64,
    pub account_id: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscriptionRecord {
    pub id: i64,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogRecord {
    pub id: String,
    pub account_id: String,
    pub message_id: String,
    pub action_name: String,
    pub server: String,
    pub tool: String,
    pub status: String,
    pub extracted_data: Option<Value>,
    pub tool_result: Option<Value>,
    pub error: Option<String>,
    pub attempts: i64,
    pub processed_at: DateTime<Utc>,
}

/// Filters for `query_messages`. Tag filters use OR logic; tags matching a
/// configured account email act as account filters instead.
#[derive(Debug, Clone, Default)]
pub struct MessageFilters {
    pub account_id: Option<String>,
    pub tags: Vec<String>,
    pub is_unread: Option<bool>,
    pub folder: Option<String>,
    pub thread_id: Option<String>,
    pub text: Option<String>,
}

impl MessageFilters {
    pub fn for_account(account_id: &str) -> Self {
        Self {
            account_id: Some(account_id.to_string()),
            ..Default::default()
        }
    }
}

impl MessageRecord {
    /// View the row as a canonical provider message (for reclassification).
    pub fn to_message(&self) -> crate::provider::Message {
        crate::provider::Message {
            id: self.id.clone(),
            thread_id: self.thread_id.clone().unwrap_or_default(),
            subject: self.subject.clone(),
            from_email: self.from_email.clone(),
            to_emails: self.to_emails.clone(),
            date: self.date,
            snippet: self.snippet.clone(),
            body_text: self.body_text.clone(),
            body_html: self.body_html.clone(),
            labels: self.provider_labels.iter().cloned().collect(),
            is_unread: self.is_unread,
            folder: self.folder.clone(),
            imap_folder: self.imap_folder.clone(),
            has_attachments: self.has_attachments,
        }
    }
}
