// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Message classification through a local JSON-mode inference endpoint.
//!
//! The prompt is deterministic: taxonomy, message fields, then an
//! instruction block that pins the output schema. Responses are normalized
//! defensively; a reply the model mangles degrades to a low-confidence
//! default rather than failing the sync run.

use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::AiSettings;
use crate::provider::{Classification, Message, Priority};
use crate::tags::{self, TagDefinition};

const CLASSIFY_TEMPERATURE_DEFAULT: f32 = 0.3;
const REPLY_TEMPERATURE: f32 = 0.7;
const MAX_REPLIES: usize = 4;
const MAX_REPLY_CHARS: usize = 500;

/// Errors that survive normalization: endpoint unreachable or misbehaving.
/// These are retryable; schema-level noise never reaches the caller.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("inference request timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference transport error: {0}")]
    Transport(String),

    #[error("inference endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'a str,
    stream: bool,
    /// Zero tells the endpoint to release model resources after this call.
    keep_alive: u32,
    options: GenerateOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// One stored user correction rendered into the prompt as a few-shot example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub sender_domain: String,
    pub subject_pattern: String,
    pub original_tags: Vec<String>,
    pub corrected_tags: Vec<String>,
}

pub struct Classifier {
    config: AiSettings,
    taxonomy: Vec<TagDefinition>,
    http: reqwest::Client,
}

impl Classifier {
    pub fn new(config: AiSettings, taxonomy: Vec<TagDefinition>) -> Self {
        Self {
            config,
            taxonomy,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    fn build_prompt(&self, message: &Message, context: &[FewShotExample]) -> String {
        let tag_descriptions = tags::tags_for_prompt(&self.taxonomy);

        let corrections = if context.is_empty() {
            String::new()
        } else {
            let examples = context
                .iter()
                .map(|ex| {
                    format!(
                        "- A message from {} with subject like \"{}\" was corrected from {:?} to {:?}",
                        ex.sender_domain, ex.subject_pattern, ex.original_tags, ex.corrected_tags
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("\nPAST USER CORRECTIONS (follow these when applicable):\n{}\n", examples)
        };

        format!(
            r#"
Analyze this email and classify it with structured tags.

EMAIL CONTENT:
Subject: {subject}
From: {from}
To: {to}
Date: {date}
Snippet: {snippet}

AVAILABLE TAGS:
{tags}
{corrections}
CLASSIFICATION RULES:
1. Select 1-3 most relevant tags from the list above
2. Set priority to "high" if:
   - From important senders (boss, family, banks)
   - Contains urgent language (ASAP, urgent, deadline)
   - Requires immediate attention
3. Set action_required to true if:
   - Requires a reply
   - Contains a task or to-do
   - Needs payment or form submission
4. Set can_archive to true ONLY if:
   - It's a receipt, shipping notification, or newsletter
   - AND requires no action from the user
   - When in doubt, set to false
5. Set confidence between 0.0 and 1.0:
   - 0.9-1.0: Very confident (clear category, obvious sender type)
   - 0.7-0.9: Confident (good match, some ambiguity)
   - 0.5-0.7: Uncertain (multiple categories possible)
   - Below 0.5: Low confidence (unclear content)

RESPOND WITH ONLY A JSON OBJECT (no markdown, no explanation):
{{
  "tags": ["tag1", "tag2"],
  "priority": "high" | "normal",
  "action_required": true | false,
  "can_archive": true | false,
  "confidence": 0.85
}}
"#,
            subject = message.subject,
            from = message.from_email,
            to = message.to_emails.join(", "),
            date = message.date,
            snippet = message.snippet,
            tags = tag_descriptions,
            corrections = corrections,
        )
    }

    fn build_reply_prompt(&self, message: &Message) -> String {
        format!(
            r#"
Generate 3-4 short, contextual reply suggestions for this email.

EMAIL CONTENT:
Subject: {subject}
From: {from}
Date: {date}
Content: {snippet}

GUIDELINES:
1. Keep each reply to 1-2 sentences maximum
2. Be professional but friendly
3. Provide variety: include casual, neutral, and formal options if appropriate
4. Make replies contextually relevant to the message content
5. Don't include greetings or signatures - just the core message
6. Replies should be complete thoughts that can stand alone

RESPOND WITH ONLY A JSON OBJECT (no markdown, no explanation):
{{
  "replies": [
    "Reply suggestion 1",
    "Reply suggestion 2",
    "Reply suggestion 3"
  ]
}}
"#,
            subject = message.subject,
            from = message.from_email,
            date = message.date,
            snippet = message.snippet,
        )
    }

    /// Raw JSON-mode generation call. Returns the model's response string.
    pub async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, ClassifyError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            format: "json",
            stream: false,
            keep_alive: 0,
            options: GenerateOptions { temperature },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.config.endpoint))
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifyError::Timeout(timeout)
                } else {
                    ClassifyError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::Endpoint { status, body });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::Transport(e.to_string()))?;
        Ok(body.response)
    }

    /// Classify a message. `context` carries few-shot correction examples.
    pub async fn classify(
        &self,
        message: &Message,
        context: &[FewShotExample],
    ) -> Result<Classification, ClassifyError> {
        let prompt = self.build_prompt(message, context);
        let temperature = if self.config.temperature > 0.0 {
            self.config.temperature
        } else {
            CLASSIFY_TEMPERATURE_DEFAULT
        };

        let raw = match self
            .generate(&prompt, temperature, self.classify_timeout())
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                error!("Inference call failed for message {}: {}", message.id, e);
                return Err(e);
            }
        };

        let classification = match serde_json::from_str::<Value>(&raw) {
            Ok(value) => self.normalize(&value),
            Err(e) => {
                error!("Failed to parse model response for message {}: {}", message.id, e);
                fallback_classification()
            }
        };

        info!(
            "Classified message {}: tags={:?}, priority={}, todo={}, archive={}, confidence={:.2}",
            short_id(&message.id),
            classification.tags,
            classification.priority.as_str(),
            classification.todo,
            classification.can_archive,
            classification.confidence
        );

        Ok(classification)
    }

    /// Apply the normalization rules to a parsed model reply.
    pub fn normalize(&self, value: &Value) -> Classification {
        let raw_tags: Vec<Value> = value
            .get("tags")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let tags = self.normalize_tags(&raw_tags);

        let priority = value
            .get("priority")
            .and_then(|v| v.as_str())
            .map(Priority::parse)
            .unwrap_or(Priority::Normal);

        let todo = value
            .get("action_required")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let can_archive = value
            .get("can_archive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let confidence = normalize_confidence(value.get("confidence"));

        Classification {
            tags,
            priority,
            todo,
            can_archive,
            confidence,
        }
    }

    /// Lowercase, trim, dedupe (keeping first occurrence), and filter against
    /// the taxonomy. An empty result defaults to `personal`.
    fn normalize_tags(&self, raw: &[Value]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut tags = Vec::new();

        for value in raw {
            let Some(tag) = value.as_str() else { continue };
            let tag = tag.to_lowercase().trim().to_string();
            if tag.is_empty() || !seen.insert(tag.clone()) {
                continue;
            }
            if self.taxonomy.iter().any(|t| t.name == tag) {
                tags.push(tag);
            }
        }

        if tags.is_empty() {
            tags.push("personal".to_string());
        }

        tags
    }

    /// Generate up to four short reply suggestions. Parse failures degrade to
    /// an empty list.
    pub async fn suggest_replies(&self, message: &Message) -> Result<Vec<String>, ClassifyError> {
        let prompt = self.build_reply_prompt(message);
        let raw = self
            .generate(&prompt, REPLY_TEMPERATURE, self.classify_timeout())
            .await?;

        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to parse reply suggestions for message {}: {}", message.id, e);
                return Ok(Vec::new());
            }
        };

        let Some(replies) = parsed.get("replies").and_then(|v| v.as_array()) else {
            warn!("Invalid replies format for message {}", message.id);
            return Ok(Vec::new());
        };

        let valid: Vec<String> = replies
            .iter()
            .filter_map(|r| r.as_str())
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(|r| r.chars().take(MAX_REPLY_CHARS).collect::<String>())
            .take(MAX_REPLIES)
            .collect();

        debug!("Generated {} smart replies for message {}", valid.len(), short_id(&message.id));
        Ok(valid)
    }
}

/// The low-confidence default used when the model's reply is unusable.
pub fn fallback_classification() -> Classification {
    Classification {
        tags: vec!["personal".to_string()],
        priority: Priority::Normal,
        todo: false,
        can_archive: false,
        confidence: 0.5,
    }
}

fn normalize_confidence(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        // Numeric strings are accepted; anything else falls back.
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(x) => x.clamp(0.0, 1.0),
        None => 0.8,
    }
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((pos, _)) => &id[..pos],
        None => id,
    }
}
