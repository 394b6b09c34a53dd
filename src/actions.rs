// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Action-tag registry.
//!
//! An action tag maps a classification tag (e.g. `add-contact`) to a remote
//! tool invocation, with an extraction prompt that pulls the tool's arguments
//! out of the message body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub extraction_prompt: String,
    #[serde(default)]
    pub default_args: Map<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial override for an action, as it appears in deployment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOverride {
    pub description: Option<String>,
    pub server: Option<String>,
    pub tool: Option<String>,
    #[serde(rename = "extractionPrompt")]
    pub extraction_prompt: Option<String>,
    #[serde(rename = "defaultArgs")]
    pub default_args: Option<Map<String, Value>>,
    pub enabled: Option<bool>,
}

const CONTACT_EXTRACTION_PROMPT: &str = r#"
Analyze this email and extract contact information for the SENDER.

EMAIL CONTENT:
Subject: {subject}
From: {from_email}
To: {to_emails}
Date: {date}
Body:
{body}

Extract the sender's contact details from the email content, signature, and headers.
Return ONLY a JSON object with these fields (omit OPTIONAL fields you cannot determine):

{
  "formatted_name": "Full Name",
  "first_name": "First",
  "last_name": "Last",
  "emails": ["email@example.com"],
  "organization": "Company Name",
  "title": "Job Title",
  "phones": [{"type": "WORK", "number": "+1-555-1234"}],
  "notes": "Met via email about [topic]"
}

RULES:
1. "formatted_name" and "emails" are REQUIRED - always include them
2. The email address MUST come from the From header
3. For formatted_name: use the display name from the From header, or derive from the email address
4. Look for organization, title, and phone in the email signature
5. If no signature, use what you can determine from the email address and content
6. Do NOT include phone entries with null numbers - omit phones entirely if unknown
7. Return ONLY valid JSON, no markdown or explanation
"#;

const REMINDER_EXTRACTION_PROMPT: &str = r#"
Analyze this email and extract details for creating a calendar reminder.

EMAIL CONTENT:
Subject: {subject}
From: {from_email}
To: {to_emails}
Date: {date}
Body:
{body}

Create a calendar reminder based on any dates, deadlines, or events mentioned.
Return ONLY a JSON object with these fields:

{
  "summary": "Brief description of what to remember",
  "start": "2025-02-15T09:00:00",
  "end": "2025-02-15T09:30:00",
  "description": "Details from the email",
  "location": "Location if mentioned"
}

RULES:
1. The summary should be concise but descriptive (e.g., "Payment due - Invoice #1234")
2. If a specific date is mentioned, use it for start. If only a deadline, set reminder for that date at 9:00 AM
3. If no end time, set it 30 minutes after start
4. Include relevant context from the email in the description
5. Use ISO 8601 format for dates (YYYY-MM-DDTHH:MM:SS)
6. If no date can be determined, set start to tomorrow at 9:00 AM
7. Return ONLY valid JSON, no markdown or explanation
"#;

/// Built-in actions available without any configuration.
pub fn default_actions() -> HashMap<String, ActionDefinition> {
    let mut actions = HashMap::new();

    actions.insert(
        "add-contact".to_string(),
        ActionDefinition {
            name: "add-contact".to_string(),
            description: "Create a contact from this email's sender".to_string(),
            server: "mcp-dav".to_string(),
            tool: "create_contact".to_string(),
            extraction_prompt: CONTACT_EXTRACTION_PROMPT.to_string(),
            default_args: Map::new(),
            enabled: true,
        },
    );

    actions.insert(
        "create-reminder".to_string(),
        ActionDefinition {
            name: "create-reminder".to_string(),
            description: "Create a calendar reminder from this email".to_string(),
            server: "mcp-dav".to_string(),
            tool: "create_event".to_string(),
            extraction_prompt: REMINDER_EXTRACTION_PROMPT.to_string(),
            default_args: Map::new(),
            enabled: true,
        },
    );

    actions
}

/// Merge built-ins with gateway-level defaults and user overrides.
///
/// Priority, lowest to highest: built-in definitions, gateway config
/// (addressbook/calendar names injected into the matching built-in), custom
/// overrides from deployment config.
pub fn merge_actions(
    custom_actions: &HashMap<String, ActionOverride>,
    addressbook: Option<&str>,
    calendar: Option<&str>,
) -> HashMap<String, ActionDefinition> {
    let mut result = default_actions();

    let gateway_defaults: [(&str, &str, Option<&str>); 2] = [
        ("add-contact", "addressbook", addressbook),
        ("create-reminder", "calendar", calendar),
    ];
    for (action_name, arg_name, value) in gateway_defaults {
        if let (Some(value), Some(action)) = (value, result.get_mut(action_name)) {
            action
                .default_args
                .insert(arg_name.to_string(), Value::String(value.to_string()));
        }
    }

    for (name, config) in custom_actions {
        match result.get_mut(name) {
            Some(builtin) => {
                if let Some(description) = &config.description {
                    builtin.description = description.clone();
                }
                if let Some(server) = &config.server {
                    builtin.server = server.clone();
                }
                if let Some(tool) = &config.tool {
                    builtin.tool = tool.clone();
                }
                if let Some(prompt) = &config.extraction_prompt {
                    builtin.extraction_prompt = prompt.clone();
                }
                if let Some(args) = &config.default_args {
                    builtin.default_args = args.clone();
                }
                if let Some(enabled) = config.enabled {
                    builtin.enabled = enabled;
                }
            }
            None => {
                // A custom action needs at least a server and tool to be usable.
                let (Some(server), Some(tool)) = (config.server.clone(), config.tool.clone())
                else {
                    log::warn!("Ignoring custom action '{}' without server/tool", name);
                    continue;
                };
                result.insert(
                    name.clone(),
                    ActionDefinition {
                        name: name.clone(),
                        description: config
                            .description
                            .clone()
                            .unwrap_or_else(|| format!("Custom action: {}", name)),
                        server,
                        tool,
                        extraction_prompt: config.extraction_prompt.clone().unwrap_or_default(),
                        default_args: config.default_args.clone().unwrap_or_default(),
                        enabled: config.enabled.unwrap_or(true),
                    },
                );
            }
        }
    }

    result
}

/// Names of the enabled action tags.
pub fn action_tag_names(actions: &HashMap<String, ActionDefinition>) -> Vec<String> {
    let mut names: Vec<String> = actions
        .iter()
        .filter(|(_, action)| action.enabled)
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();
    names
}
