// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sync engine: fetch, persist, classify, push labels, drain pending
//! provider echoes.
//!
//! Local consistency first, provider sync is best effort: existing rows keep
//! their local `is_unread` and `folder` no matter what the provider reports,
//! and one message's failure never aborts the run for the others.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use log::{debug, error, info};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::classifier::{Classifier, FewShotExample};
use crate::control::SyncEvent;
use crate::provider::{map_tags_to_labels, Classification, Message, Priority, Provider};
use crate::store::{self, MessageFilters, PendingOp, Store};

pub const DEFAULT_DRAIN_LIMIT: i64 = 50;
const FEW_SHOT_LIMIT: i64 = 5;
const RECLASSIFY_DEFAULT_LIMIT: i64 = 10_000;

/// Info about a genuinely-new message, for notification fan-out.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NewMessageInfo {
    pub id: String,
    pub subject: String,
    pub from_email: String,
    pub snippet: String,
}

#[derive(Debug)]
pub struct SyncResult {
    pub account_id: String,
    pub messages_fetched: usize,
    pub messages_classified: usize,
    pub labels_updated: usize,
    pub errors: Vec<String>,
    pub duration: Duration,
    pub new_messages: Vec<NewMessageInfo>,
}

impl SyncResult {
    fn empty(account_id: &str, started: Instant) -> Self {
        Self {
            account_id: account_id.to_string(),
            messages_fetched: 0,
            messages_classified: 0,
            labels_updated: 0,
            errors: Vec::new(),
            duration: started.elapsed(),
            new_messages: Vec::new(),
        }
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SyncResult(account={}, fetched={}, classified={}, labels_updated={}, errors={}, duration={:.2}s)",
            self.account_id,
            self.messages_fetched,
            self.messages_classified,
            self.labels_updated,
            self.errors.len(),
            self.duration.as_secs_f64()
        )
    }
}

pub struct SyncEngine<P: Provider> {
    provider: P,
    store: Arc<Store>,
    classifier: Arc<Classifier>,
    label_prefix: String,
    account_id: String,
    max_attempts: i64,
    drain_limit: i64,
    events: Option<broadcast::Sender<SyncEvent>>,
}

impl<P: Provider> SyncEngine<P> {
    pub fn new(
        provider: P,
        store: Arc<Store>,
        classifier: Arc<Classifier>,
        label_prefix: &str,
    ) -> Self {
        let account_id = provider.account_id().to_string();
        Self {
            provider,
            store,
            classifier,
            label_prefix: label_prefix.to_string(),
            account_id,
            max_attempts: store::DEFAULT_MAX_ATTEMPTS,
            drain_limit: DEFAULT_DRAIN_LIMIT,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// One complete sync run.
    pub async fn sync(&self, max_messages: usize, cancel: &CancellationToken) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::empty(&self.account_id, started);

        info!("Starting sync for account {}", self.account_id);

        if let Err(e) = self.provider.authenticate().await {
            let message = format!("Authentication failed for {}: {}", self.account_id, e);
            error!("{}", message);
            result.errors.push(message);
            result.duration = started.elapsed();
            return result;
        }

        // 1. Read the last sync point.
        let last_sync = match self.store.last_sync_time(&self.account_id).await {
            Ok(last_sync) => last_sync,
            Err(e) => {
                result.errors.push(format!("Failed to read last sync: {}", e));
                result.duration = started.elapsed();
                return result;
            }
        };
        info!("Last sync: {:?}", last_sync);

        // 2. Fetch from the provider. A stage-level failure aborts the run
        // and leaves last_sync untouched.
        let since = last_sync.map(|t| t.with_timezone(&Local).naive_local());
        let messages = match self.provider.fetch_messages(since, max_messages).await {
            Ok(messages) => messages,
            Err(e) => {
                let message = format!("Fetch failed for {}: {}", self.account_id, e);
                error!("{}", message);
                result.errors.push(message);
                result.duration = started.elapsed();
                return result;
            }
        };
        result.messages_fetched = messages.len();
        if messages.is_empty() {
            info!("No new messages to process");
        }

        // 3. Persist. The store keeps local is_unread/folder on existing rows.
        for message in &messages {
            if cancel.is_cancelled() {
                debug!("Sync cancelled while persisting");
                result.duration = started.elapsed();
                return result;
            }

            match self.store.upsert_message(&self.account_id, message).await {
                Ok(true) => result.new_messages.push(NewMessageInfo {
                    id: message.id.clone(),
                    subject: message.subject.clone(),
                    from_email: message.from_email.clone(),
                    snippet: message.snippet.chars().take(100).collect(),
                }),
                Ok(false) => {}
                Err(e) => {
                    let error = format!("Failed to store message {}: {}", message.id, e);
                    error!("{}", error);
                    result.errors.push(error);
                }
            }
        }

        // 4 + 5. Classify what has no classification yet, then push labels.
        let mut to_classify = Vec::new();
        for message in &messages {
            match self.store.has_classification(&message.id).await {
                Ok(false) => to_classify.push(message),
                Ok(true) => {}
                Err(e) => result
                    .errors
                    .push(format!("Classification lookup failed for {}: {}", message.id, e)),
            }
        }
        info!("Classifying {} messages", to_classify.len());

        for message in to_classify {
            if cancel.is_cancelled() {
                debug!("Sync cancelled while classifying");
                result.duration = started.elapsed();
                return result;
            }
            self.classify_and_label(message, &mut result).await;
        }

        // 6. Drain pending provider echoes for this account.
        self.drain_pending(cancel, &mut result).await;

        // 7. Advance the sync point.
        if let Err(e) = self.store.update_last_sync(&self.account_id, Utc::now()).await {
            result.errors.push(format!("Failed to update last sync: {}", e));
        }

        result.duration = started.elapsed();
        info!("Sync completed: {}", result);
        if !result.new_messages.is_empty() {
            info!("New messages for notifications: {}", result.new_messages.len());
        }
        result
    }

    /// Reclassify stored messages, reusing the classify-and-label flow.
    pub async fn reclassify(
        &self,
        max_messages: Option<i64>,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::empty(&self.account_id, started);

        info!("Starting reclassification for account {}", self.account_id);

        if let Err(e) = self.provider.authenticate().await {
            result.errors.push(format!("Authentication failed: {}", e));
            result.duration = started.elapsed();
            return result;
        }

        let filters = MessageFilters::for_account(&self.account_id);
        let limit = max_messages.unwrap_or(RECLASSIFY_DEFAULT_LIMIT);
        let records = match self.store.query_messages(&filters, limit, 0).await {
            Ok(records) => records,
            Err(e) => {
                result.errors.push(format!("Failed to list messages: {}", e));
                result.duration = started.elapsed();
                return result;
            }
        };
        info!("Reclassifying {} messages", records.len());

        for record in &records {
            if cancel.is_cancelled() {
                debug!("Reclassification cancelled");
                break;
            }
            let message = record.to_message();
            self.classify_and_label(&message, &mut result).await;
        }

        result.duration = started.elapsed();
        info!("Reclassification completed: {}", result);
        result
    }

    /// Classify one message, store the result, and push the label delta.
    /// Failures land in the result's error list; the run continues.
    async fn classify_and_label(&self, message: &Message, result: &mut SyncResult) {
        let context = self.few_shot_context(message).await;

        let classification = match self.classifier.classify(message, &context).await {
            Ok(classification) => classification,
            Err(e) => {
                let error = format!("Failed to classify message {}: {}", message.id, e);
                error!("{}", error);
                result.errors.push(error);
                return;
            }
        };

        if let Err(e) = self
            .store
            .store_classification(&message.id, &classification, self.classifier.model())
            .await
        {
            let error = format!("Failed to store classification for {}: {}", message.id, e);
            error!("{}", error);
            result.errors.push(error);
            return;
        }

        result.messages_classified += 1;
        self.emit(SyncEvent::MessageClassified {
            account_id: self.account_id.clone(),
            message_id: message.id.clone(),
            tags: classification.tags.clone(),
        });

        let (add_labels, remove_labels) = compute_label_changes(
            &self.label_prefix,
            &message.labels,
            &classification,
        );

        if add_labels.is_empty() && remove_labels.is_empty() {
            return;
        }

        let label_push = async {
            self.provider.ensure_labels_exist(&add_labels).await?;
            self.provider
                .update_labels(&message.id, &add_labels, &remove_labels)
                .await
        };

        match label_push.await {
            Ok(()) => {
                result.labels_updated += 1;
                debug!(
                    "Updated labels for {}: +{:?} -{:?}",
                    message.id, add_labels, remove_labels
                );
            }
            Err(e) => {
                let error = format!("Failed to update labels for {}: {}", message.id, e);
                error!("{}", error);
                result.errors.push(error);
            }
        }
    }

    /// Few-shot context from stored corrections; empty on any failure.
    async fn few_shot_context(&self, message: &Message) -> Vec<FewShotExample> {
        let domain = store::extract_domain(&message.from_email);
        match self
            .store
            .relevant_feedback(&self.account_id, &domain, FEW_SHOT_LIMIT)
            .await
        {
            Ok(feedback) => feedback
                .into_iter()
                .map(|f| FewShotExample {
                    sender_domain: f.sender_domain,
                    subject_pattern: f.subject_pattern,
                    original_tags: f.original_tags,
                    corrected_tags: f.corrected_tags,
                })
                .collect(),
            Err(e) => {
                debug!("No feedback context for {}: {}", message.id, e);
                Vec::new()
            }
        }
    }

    /// Translate queued local mutations into provider calls, FIFO.
    async fn drain_pending(&self, cancel: &CancellationToken, result: &mut SyncResult) {
        let operations = match self
            .store
            .dequeue_pending(Some(&self.account_id), self.drain_limit)
            .await
        {
            Ok(operations) => operations,
            Err(e) => {
                result.errors.push(format!("Failed to read pending queue: {}", e));
                return;
            }
        };

        if operations.is_empty() {
            return;
        }
        info!("Draining {} pending operations", operations.len());

        for op in operations {
            if cancel.is_cancelled() {
                debug!("Sync cancelled while draining pending operations");
                return;
            }

            let outcome = match op.operation {
                PendingOp::MarkRead => self.provider.mark_read(&op.message_id).await,
                PendingOp::MarkUnread => self.provider.mark_unread(&op.message_id).await,
                PendingOp::Trash => self.provider.move_to_trash(&op.message_id).await,
                PendingOp::Restore => {
                    // The local row has usually been restored already, so its
                    // current folder is the destination; fall back to the
                    // recorded original folder if the row still sits in trash.
                    let destination = self
                        .store
                        .get_message(&op.message_id)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|m| {
                            if m.folder != "trash" {
                                Some(m.folder)
                            } else {
                                m.original_folder
                            }
                        });
                    self.provider
                        .restore_from_trash(&op.message_id, destination.as_deref())
                        .await
                }
                PendingOp::Delete => self.provider.delete(&op.message_id, true).await,
            };

            match outcome {
                Ok(()) => {
                    if let Err(e) = self.store.complete_pending(&op.id).await {
                        result.errors.push(format!(
                            "Failed to mark operation {} complete: {}",
                            op.id, e
                        ));
                    }
                }
                Err(e) => {
                    let error = format!(
                        "Pending {} failed for {}: {}",
                        op.operation.as_str(),
                        op.message_id,
                        e
                    );
                    debug!("{}", error);
                    if let Err(store_err) = self
                        .store
                        .fail_pending(&op.id, &error, self.max_attempts)
                        .await
                    {
                        result
                            .errors
                            .push(format!("Failed to record attempt for {}: {}", op.id, store_err));
                    }
                }
            }
        }
    }
}

/// Which labels to add and remove for a freshly classified message.
///
/// Desired = prefix-capitalized tags, plus `Priority` on high priority and
/// `ToDo` on action-required. The remove set only ever touches labels under
/// the prefix, except that an archivable message also drops `INBOX`.
pub fn compute_label_changes(
    label_prefix: &str,
    current_labels: &HashSet<String>,
    classification: &Classification,
) -> (HashSet<String>, HashSet<String>) {
    let mut desired = map_tags_to_labels(&classification.tags, label_prefix);

    if classification.priority == Priority::High {
        desired.insert(format!("{}/Priority", label_prefix));
    }
    if classification.todo {
        desired.insert(format!("{}/ToDo", label_prefix));
    }

    let prefix_slash = format!("{}/", label_prefix);
    let current_ai: HashSet<String> = current_labels
        .iter()
        .filter(|label| label.starts_with(&prefix_slash))
        .cloned()
        .collect();

    let add: HashSet<String> = desired.difference(&current_ai).cloned().collect();
    let mut remove: HashSet<String> = current_ai.difference(&desired).cloned().collect();

    if classification.can_archive && current_labels.contains("INBOX") {
        remove.insert("INBOX".to_string());
    }

    (add, remove)
}
