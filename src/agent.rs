// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Action agent: turns action tags on classified messages into remote tool
//! invocations.
//!
//! For each (message, action) pair the agent extracts a structured payload
//! from the message with the inference endpoint, merges it over the action's
//! default arguments, and calls the tool through the gateway. Every attempt
//! is recorded in the action log; the triggering tag is removed only on
//! success, so failures are retried until the attempt cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::actions::ActionDefinition;
use crate::classifier::Classifier;
use crate::gateway::GatewayClient;
use crate::store::{ActionLogRecord, ClassificationRecord, MessageRecord, Store};

pub const MAX_RETRIES: i64 = 3;
const EXTRACTION_TEMPERATURE: f32 = 0.1;
const EXTRACTION_BODY_LIMIT: usize = 3000;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failed,
    Skipped,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

pub struct ActionAgent {
    store: Arc<Store>,
    gateway: Arc<GatewayClient>,
    classifier: Arc<Classifier>,
    actions: HashMap<String, ActionDefinition>,
    extraction_timeout: Duration,
}

impl ActionAgent {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<GatewayClient>,
        classifier: Arc<Classifier>,
        actions: HashMap<String, ActionDefinition>,
        extraction_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            classifier,
            actions,
            extraction_timeout,
        }
    }

    pub fn action_tag_names(&self) -> Vec<String> {
        crate::actions::action_tag_names(&self.actions)
    }

    /// Process pending action tags for an account.
    pub async fn process_actions(&self, account_id: &str, max_actions: i64) -> ActionStats {
        let mut stats = ActionStats::default();

        let tag_names = self.action_tag_names();
        if tag_names.is_empty() {
            debug!("No action tags configured");
            return stats;
        }

        // An unreachable gateway skips the whole pipeline; nothing is logged
        // against individual messages.
        if let Err(e) = self.gateway.discover_tools().await {
            warn!("Tool gateway unavailable, skipping action processing: {}", e);
            return stats;
        }

        let messages = match self
            .store
            .pending_action_messages(account_id, &tag_names, max_actions)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!("Failed to list action-tagged messages: {}", e);
                return stats;
            }
        };

        if messages.is_empty() {
            debug!("No messages with action tags to process");
            return stats;
        }
        info!("Processing action tags on {} messages", messages.len());

        for (message, classification) in &messages {
            let message_action_tags: Vec<&String> = classification
                .tags
                .iter()
                .filter(|tag| tag_names.contains(tag))
                .collect();

            for tag_name in message_action_tags {
                let Some(action) = self.actions.get(tag_name) else {
                    continue;
                };

                stats.processed += 1;
                match self
                    .process_single_action(message, classification, action, account_id)
                    .await
                {
                    Outcome::Success => stats.succeeded += 1,
                    Outcome::Failed => stats.failed += 1,
                    Outcome::Skipped => stats.skipped += 1,
                }
            }
        }

        info!(
            "Action processing complete: {} succeeded, {} failed, {} skipped",
            stats.succeeded, stats.failed, stats.skipped
        );
        stats
    }

    async fn process_single_action(
        &self,
        message: &MessageRecord,
        classification: &ClassificationRecord,
        action: &ActionDefinition,
        account_id: &str,
    ) -> Outcome {
        let attempt_count = self
            .store
            .action_attempt_count(&message.id, &action.name)
            .await
            .unwrap_or(0);

        // This attempt would reach the cap; record a skip instead of burning
        // another extraction call.
        if attempt_count + 1 >= MAX_RETRIES {
            warn!(
                "Max retries ({}) exceeded for {} on {}",
                MAX_RETRIES, action.name, message.id
            );
            self.log_attempt(
                message,
                action,
                account_id,
                Outcome::Skipped,
                None,
                None,
                Some(format!("Max retries ({}) exceeded", MAX_RETRIES)),
                attempt_count,
            )
            .await;
            return Outcome::Skipped;
        }

        if !self.gateway.has_tool(&action.server, &action.tool).await {
            warn!(
                "Tool {}/{} not available for action {}",
                action.server, action.tool, action.name
            );
            self.log_attempt(
                message,
                action,
                account_id,
                Outcome::Skipped,
                None,
                None,
                Some(format!(
                    "Tool {}/{} not available in gateway",
                    action.server, action.tool
                )),
                attempt_count,
            )
            .await;
            return Outcome::Skipped;
        }

        let extracted = match self.extract_data(message, action).await {
            Ok(extracted) => extracted,
            Err(e) => {
                error!("Data extraction failed for {} on {}: {}", action.name, message.id, e);
                self.log_attempt(
                    message,
                    action,
                    account_id,
                    Outcome::Failed,
                    None,
                    None,
                    Some(format!("Extraction failed: {}", e)),
                    attempt_count + 1,
                )
                .await;
                return Outcome::Failed;
            }
        };

        // Extracted fields win over the action's defaults.
        let mut arguments = action.default_args.clone();
        for (key, value) in &extracted {
            arguments.insert(key.clone(), value.clone());
        }

        match self
            .gateway
            .call_tool(&action.server, &action.tool, Value::Object(arguments))
            .await
        {
            Ok(tool_result) => {
                info!("Action {} succeeded for message {}", action.name, message.id);
                self.log_attempt(
                    message,
                    action,
                    account_id,
                    Outcome::Success,
                    Some(Value::Object(extracted)),
                    Some(tool_result),
                    None,
                    attempt_count + 1,
                )
                .await;

                self.remove_action_tag(message, classification, &action.name).await;
                Outcome::Success
            }
            Err(e) => {
                error!("Tool call failed for {} on {}: {}", action.name, message.id, e);
                self.log_attempt(
                    message,
                    action,
                    account_id,
                    Outcome::Failed,
                    Some(Value::Object(extracted)),
                    None,
                    Some(format!("Tool call failed: {}", e)),
                    attempt_count + 1,
                )
                .await;
                Outcome::Failed
            }
        }
    }

    /// Run the action's extraction prompt through the inference endpoint.
    /// The reply must be a JSON object; null fields are dropped.
    async fn extract_data(
        &self,
        message: &MessageRecord,
        action: &ActionDefinition,
    ) -> Result<Map<String, Value>, String> {
        if action.extraction_prompt.is_empty() {
            return Ok(Map::new());
        }

        let body: String = message
            .body_text
            .as_deref()
            .unwrap_or(&message.snippet)
            .chars()
            .take(EXTRACTION_BODY_LIMIT)
            .collect();

        let prompt = action
            .extraction_prompt
            .replace("{subject}", &message.subject)
            .replace("{from_email}", &message.from_email)
            .replace("{to_emails}", &message.to_emails.join(", "))
            .replace("{date}", &message.date.to_string())
            .replace("{body}", &body);

        let response = self
            .classifier
            .generate(&prompt, EXTRACTION_TEMPERATURE, self.extraction_timeout)
            .await
            .map_err(|e| e.to_string())?;

        let parsed: Value = serde_json::from_str(&response).map_err(|e| {
            let preview: String = response.chars().take(200).collect();
            format!("invalid JSON from extraction: {} (response: {})", e, preview)
        })?;

        let Value::Object(map) = parsed else {
            return Err(format!("expected object from extraction, got {}", type_name(&parsed)));
        };

        let cleaned: Map<String, Value> = map
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();

        debug!(
            "Extracted {} fields for {}: {:?}",
            cleaned.len(),
            action.name,
            cleaned.keys().collect::<Vec<_>>()
        );
        Ok(cleaned)
    }

    /// Drop the triggering tag so the message is not reprocessed.
    async fn remove_action_tag(
        &self,
        message: &MessageRecord,
        classification: &ClassificationRecord,
        tag_name: &str,
    ) {
        let updated_tags: Vec<String> = classification
            .tags
            .iter()
            .filter(|tag| tag.as_str() != tag_name)
            .cloned()
            .collect();

        match self
            .store
            .update_message_tags(&message.id, &updated_tags, None, false)
            .await
        {
            Ok(_) => debug!("Removed action tag '{}' from message {}", tag_name, message.id),
            Err(e) => error!("Failed to remove action tag from {}: {}", message.id, e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_attempt(
        &self,
        message: &MessageRecord,
        action: &ActionDefinition,
        account_id: &str,
        outcome: Outcome,
        extracted_data: Option<Value>,
        tool_result: Option<Value>,
        error: Option<String>,
        attempts: i64,
    ) {
        let entry = ActionLogRecord {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            message_id: message.id.clone(),
            action_name: action.name.clone(),
            server: action.server.clone(),
            tool: action.tool.clone(),
            status: outcome.as_str().to_string(),
            extracted_data,
            tool_result,
            error,
            attempts,
            processed_at: Utc::now(),
        };

        if let Err(e) = self.store.store_action_log(&entry).await {
            error!("Failed to write action log for {}: {}", message.id, e);
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
