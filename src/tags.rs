//! Tag taxonomy for classification.
//!
//! The default taxonomy can be extended or trimmed per deployment; custom
//! tags may override default descriptions. Colors are derived from the tag's
//! category, with a stable hash fallback for custom tags.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub name: String,
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "custom".to_string()
}

impl TagDefinition {
    fn new(name: &str, description: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
        }
    }
}

lazy_static::lazy_static! {
    /// Default expanded tag taxonomy (35 tags).
    pub static ref DEFAULT_TAGS: Vec<TagDefinition> = vec![
        // Priority
        TagDefinition::new("urgent", "Time-sensitive, requires immediate attention", "priority"),
        TagDefinition::new("important", "High priority but not time-critical", "priority"),
        TagDefinition::new("review", "Needs review or decision", "priority"),
        // Work
        TagDefinition::new("work", "General work-related emails", "work"),
        TagDefinition::new("project", "Project updates and discussions", "work"),
        TagDefinition::new("meeting", "Meeting invites, agendas, notes", "work"),
        TagDefinition::new("deadline", "Tasks with deadlines", "work"),
        // Personal
        TagDefinition::new("personal", "Personal correspondence", "personal"),
        TagDefinition::new("family", "Family-related emails", "personal"),
        TagDefinition::new("friends", "Emails from friends", "personal"),
        TagDefinition::new("hobby", "Hobbies and personal interests", "personal"),
        // Finance
        TagDefinition::new("finance", "Financial matters", "finance"),
        TagDefinition::new("invoice", "Invoices and bills", "finance"),
        TagDefinition::new("payment", "Payment confirmations and receipts", "finance"),
        TagDefinition::new("expense", "Expense reports and reimbursements", "finance"),
        // Shopping
        TagDefinition::new("shopping", "Order confirmations, tracking", "shopping"),
        TagDefinition::new("receipt", "Purchase receipts", "shopping"),
        TagDefinition::new("shipping", "Shipping notifications", "shopping"),
        // Travel
        TagDefinition::new("travel", "General travel emails", "travel"),
        TagDefinition::new("booking", "Reservations and bookings", "travel"),
        TagDefinition::new("itinerary", "Trip itineraries", "travel"),
        TagDefinition::new("flight", "Flight confirmations and updates", "travel"),
        // Developer
        TagDefinition::new("dev", "Developer notifications", "developer"),
        TagDefinition::new("github", "GitHub notifications", "developer"),
        TagDefinition::new("ci", "CI/CD build notifications", "developer"),
        TagDefinition::new("alert", "System alerts and monitoring", "developer"),
        // Marketing
        TagDefinition::new("marketing", "Marketing emails", "marketing"),
        TagDefinition::new("newsletter", "Newsletter subscriptions", "marketing"),
        TagDefinition::new("promotion", "Promotional offers", "marketing"),
        TagDefinition::new("announcement", "Company/product announcements", "marketing"),
        // Social
        TagDefinition::new("social", "Social media notifications", "social"),
        TagDefinition::new("notification", "App and service notifications", "social"),
        TagDefinition::new("update", "Account and service updates", "social"),
        TagDefinition::new("reminder", "Reminders and follow-ups", "social"),
        // System
        TagDefinition::new("junk", "Spam and unwanted mail", "system"),
    ];
}

const COLOR_PALETTE: [&str; 8] = [
    "blue", "green", "purple", "orange", "cyan", "teal", "magenta", "brown",
];

fn category_color(category: &str) -> Option<&'static str> {
    match category {
        "priority" => Some("red"),
        "work" => Some("blue"),
        "personal" => Some("purple"),
        "finance" => Some("green"),
        "shopping" => Some("yellow"),
        "travel" | "developer" => Some("cyan"),
        "marketing" => Some("orange"),
        "social" => Some("teal"),
        "system" => Some("gray"),
        _ => None,
    }
}

/// Resolve the display color for a tag: explicit override first, then the
/// category color, then a stable hash of the name into the palette.
pub fn tag_color(
    tag_name: &str,
    category: Option<&str>,
    overrides: Option<&HashMap<String, String>>,
) -> String {
    if let Some(color) = overrides.and_then(|map| map.get(tag_name)) {
        return color.clone();
    }

    if let Some(color) = category.and_then(category_color) {
        return color.to_string();
    }

    let hash: usize = tag_name.chars().map(|c| c as usize).sum();
    COLOR_PALETTE[hash % COLOR_PALETTE.len()].to_string()
}

/// Merge default and custom tags.
///
/// Custom tags may override a default tag's description; exclusions apply to
/// the defaults only.
pub fn merge_tags(
    use_defaults: bool,
    custom_tags: &[TagDefinition],
    exclude_tags: &[String],
) -> Vec<TagDefinition> {
    let exclude: HashSet<&str> = exclude_tags.iter().map(|s| s.as_str()).collect();
    let mut result: Vec<TagDefinition> = Vec::new();

    if use_defaults {
        for tag in DEFAULT_TAGS.iter() {
            if !exclude.contains(tag.name.as_str()) {
                result.push(tag.clone());
            }
        }
    }

    for tag in custom_tags {
        if tag.name.is_empty() {
            continue;
        }
        if let Some(existing) = result.iter_mut().find(|t| t.name == tag.name) {
            if !tag.description.is_empty() {
                existing.description = tag.description.clone();
            }
        } else {
            result.push(TagDefinition {
                name: tag.name.clone(),
                description: if tag.description.is_empty() {
                    format!("Custom tag: {}", tag.name)
                } else {
                    tag.description.clone()
                },
                category: tag.category.clone(),
            });
        }
    }

    result
}

pub fn tag_names(tags: &[TagDefinition]) -> Vec<String> {
    tags.iter().map(|t| t.name.clone()).collect()
}

/// Format the taxonomy for inclusion in a classification prompt.
pub fn tags_for_prompt(tags: &[TagDefinition]) -> String {
    tags.iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}
