// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Folder-name handling for the IMAP provider.
//!
//! Servers disagree on LIST response formatting and on what the standard
//! folders are called, so parsing is layered: quoted-last-token first, then a
//! delimiter-anchored pattern, then a whitespace fallback. Discovered actual
//! names are mapped to the logical folder vocabulary used everywhere else
//! (`inbox`, `sent`, `trash`, `drafts`, `archive`).

use std::collections::HashMap;

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::imap::error::ImapError;

lazy_static! {
    static ref QUOTED_LAST: Regex = Regex::new(r#""([^"]+)"$"#).unwrap();
    static ref AFTER_DELIMITER: Regex = Regex::new(r#"\)\s+(?:"[^"]*"|NIL)\s+(.+)$"#).unwrap();
    static ref SENT_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)^INBOX\.Sent$").unwrap(),
        Regex::new(r"(?i)^Sent$").unwrap(),
        Regex::new(r"(?i)^Sent Items$").unwrap(),
        Regex::new(r"(?i)^Sent Mail$").unwrap(),
        Regex::new(r"(?i)^Sent Messages$").unwrap(),
        Regex::new(r"(?i)\[Gmail\]/Sent Mail").unwrap(),
    ];
    static ref TRASH_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)^INBOX\.Trash$").unwrap(),
        Regex::new(r"(?i)^Trash$").unwrap(),
        Regex::new(r"(?i)^Deleted Items$").unwrap(),
        Regex::new(r"(?i)^Deleted Messages$").unwrap(),
        Regex::new(r"(?i)^Deleted$").unwrap(),
        Regex::new(r"(?i)\[Gmail\]/Trash").unwrap(),
    ];
    static ref DRAFTS_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)^INBOX\.Drafts?$").unwrap(),
        Regex::new(r"(?i)^Drafts?$").unwrap(),
        Regex::new(r"(?i)\[Gmail\]/Drafts").unwrap(),
    ];
    static ref ARCHIVE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)^Archive$").unwrap(),
        Regex::new(r"(?i)^All Mail$").unwrap(),
        Regex::new(r"(?i)\[Gmail\]/All Mail").unwrap(),
    ];
}

/// Extract the folder name from one raw LIST response line.
///
/// Accepted shapes:
/// - `(\Flags) "delimiter" "folder name"` (standard, quoted)
/// - `(\Flags) "/" folder_name` (unquoted folder)
/// - `(\Flags) NIL folder_name` (no delimiter)
pub fn parse_list_line(line: &str) -> Option<String> {
    if let Some(caps) = QUOTED_LAST.captures(line) {
        return Some(caps[1].to_string());
    }

    if let Some(caps) = AFTER_DELIMITER.captures(line) {
        let name = caps[1].trim().trim_matches(|c| c == '"' || c == '\'');
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    // Last resort: skip flags and delimiter tokens, keep the rest.
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() >= 3 {
        let name = parts[2..]
            .join(" ")
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string();
        if !name.is_empty() {
            debug!("Fallback LIST parsing used for: {}", line);
            return Some(name);
        }
    }

    None
}

/// Map logical folder names to the actual folder names present on the server.
pub fn discover_folder_mapping(available: &[String]) -> HashMap<String, String> {
    let mut mapping = HashMap::new();

    if available.iter().any(|f| f == "INBOX") {
        mapping.insert("inbox".to_string(), "INBOX".to_string());
    }

    let searches: [(&str, &Vec<Regex>); 4] = [
        ("sent", &SENT_PATTERNS),
        ("trash", &TRASH_PATTERNS),
        ("drafts", &DRAFTS_PATTERNS),
        ("archive", &ARCHIVE_PATTERNS),
    ];

    for (logical, patterns) in searches {
        'folders: for folder in available {
            for pattern in patterns.iter() {
                if pattern.is_match(folder) {
                    mapping.insert(logical.to_string(), folder.clone());
                    break 'folders;
                }
            }
        }
    }

    debug!("Discovered folder mapping: {:?}", mapping);
    mapping
}

/// Normalize an actual IMAP folder name to its logical name. Custom folders
/// pass through unchanged.
pub fn normalize_folder_name(imap_folder: &str) -> String {
    let lower = imap_folder.to_lowercase();

    if lower == "inbox" {
        return "inbox".to_string();
    }

    if lower.starts_with("inbox.sent")
        || lower.starts_with("sent")
        || lower == "[gmail]/sent mail"
    {
        return "sent".to_string();
    }

    if lower == "inbox.drafts" || lower == "inbox.draft" || lower == "drafts" || lower == "draft" {
        return "drafts".to_string();
    }

    if lower == "inbox.trash"
        || lower == "trash"
        || lower == "deleted items"
        || lower == "deleted messages"
        || lower == "deleted"
        || lower == "[gmail]/trash"
    {
        return "trash".to_string();
    }

    if lower == "archive" || lower == "all mail" || lower == "[gmail]/all mail" {
        return "archive".to_string();
    }

    imap_folder.to_string()
}

/// Compose the stable message id for an IMAP message.
pub fn compose_message_id(account_id: &str, imap_folder: &str, uid: u32) -> String {
    format!("{}:{}:{}", account_id, imap_folder, uid)
}

/// Split a message id into its IMAP folder and UID.
///
/// The current format is `account_id:folder:uid`. Legacy two-part
/// `account_id:uid` ids are still accepted and assumed to live in INBOX.
pub fn parse_message_id(message_id: &str) -> Result<(String, u32), ImapError> {
    let parts: Vec<&str> = message_id.splitn(3, ':').collect();

    let (folder, uid_str) = match parts.as_slice() {
        [_, folder, uid] => ((*folder).to_string(), *uid),
        [_, uid] => {
            warn!("Message ID in old format (missing folder): {}", message_id);
            ("INBOX".to_string(), *uid)
        }
        _ => return Err(ImapError::InvalidMessageId(message_id.to_string())),
    };

    let uid = uid_str
        .parse::<u32>()
        .map_err(|_| ImapError::InvalidMessageId(message_id.to_string()))?;

    Ok((folder, uid))
}
