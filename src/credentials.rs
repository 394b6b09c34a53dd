// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Credential loading for provider secrets stored on disk.
//!
//! Two file shapes are supported: an OAuth token JSON (for the API provider)
//! and a single-line password file (for IMAP/SMTP). Files are expected to be
//! decrypted into place by an external secret manager; permissive modes are
//! warned about, never fatal.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file not found: {0}")]
    Missing(String),

    #[error("credential file is not readable: {0}")]
    Unreadable(String),

    #[error("OAuth token missing required keys: {0}")]
    Shape(String),

    #[error("invalid JSON in OAuth token file {path}: {source_msg}")]
    Parse { path: String, source_msg: String },

    #[error("password file {0} is empty")]
    EmptyPassword(String),

    #[error("failed to read credential file {path}: {source_msg}")]
    Io { path: String, source_msg: String },
}

/// OAuth2 token on disk. Extra fields (expiry, scopes, ...) are carried along
/// so a round trip through `save_oauth` does not drop them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

const REQUIRED_KEYS: [&str; 4] = ["access_token", "refresh_token", "client_id", "client_secret"];

/// Warn if the file is group- or world-accessible. Missing files are an error;
/// loose permissions are not.
pub fn check_file_permissions(path: &Path) -> Result<(), CredentialError> {
    if !path.exists() {
        return Err(CredentialError::Missing(path.display().to_string()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o066 != 0 {
                warn!(
                    "Credential file {} has permissive permissions ({:o}). Recommended: 0600 (owner read/write only)",
                    path.display(),
                    mode
                );
            }
        }
    }

    Ok(())
}

/// Load an OAuth2 token from a JSON file.
pub fn load_oauth(path: &Path) -> Result<OAuthToken, CredentialError> {
    check_file_permissions(path)?;

    let raw = fs::read_to_string(path).map_err(|e| CredentialError::Io {
        path: path.display().to_string(),
        source_msg: e.to_string(),
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| CredentialError::Parse {
            path: path.display().to_string(),
            source_msg: e.to_string(),
        })?;

    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .filter(|key| value.get(**key).and_then(|v| v.as_str()).is_none())
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(CredentialError::Shape(missing.join(", ")));
    }

    let token: OAuthToken = serde_json::from_value(value).map_err(|e| CredentialError::Parse {
        path: path.display().to_string(),
        source_msg: e.to_string(),
    })?;

    debug!("Loaded OAuth token from {}", path.display());
    Ok(token)
}

/// Persist a refreshed OAuth token with owner-only permissions.
///
/// Write failures are logged and swallowed: the in-memory token keeps working
/// and will simply be refreshed again on the next start. The write goes
/// through a temporary file in the same directory so a crash never leaves a
/// half-written token behind.
pub fn save_oauth(path: &Path, token: &OAuthToken) {
    let result = (|| -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(token)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp_path = temp_sibling(path);
        fs::write(&tmp_path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    match result {
        Ok(()) => debug!("Saved refreshed OAuth token to {}", path.display()),
        Err(e) => warn!(
            "Failed to write updated OAuth token to {}: {}. Token will be refreshed again on next start.",
            path.display(),
            e
        ),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "token".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Load a password from a single-line file, stripping trailing whitespace.
pub fn load_password(path: &Path) -> Result<String, CredentialError> {
    check_file_permissions(path)?;

    let raw = fs::read_to_string(path).map_err(|e| CredentialError::Io {
        path: path.display().to_string(),
        source_msg: e.to_string(),
    })?;

    let password = raw.trim_end().to_string();
    if password.is_empty() {
        return Err(CredentialError::EmptyPassword(path.display().to_string()));
    }

    debug!("Loaded password from {}", path.display());
    Ok(password)
}

/// Guess which secret manager produced the file, from its path convention.
pub fn detect_secret_manager(path: &Path) -> Option<&'static str> {
    let path_str = path.to_string_lossy();

    if path_str.contains("/run/credentials/") {
        Some("systemd-creds")
    } else if path_str.contains("/run/agenix/") || path_str.contains(".age") {
        Some("agenix")
    } else if path_str.contains("/run/secrets/") {
        Some("sops-nix")
    } else {
        None
    }
}

/// Probe a credential file for existence and readability, producing an error
/// message with a secret-manager hint when the path matches a known layout.
pub fn validate(path: &Path, account_name: &str) -> Result<(), CredentialError> {
    if !path.exists() {
        let hint = match detect_secret_manager(path) {
            Some("sops-nix") => " (Ensure sops-nix has decrypted secrets to /run/secrets/)",
            Some("agenix") => " (Ensure agenix has decrypted secrets to /run/agenix/)",
            Some("systemd-creds") => " (Ensure systemd LoadCredential is configured)",
            _ => "",
        };
        return Err(CredentialError::Missing(format!(
            "credential file for account '{}' not found: {}{}",
            account_name,
            path.display(),
            hint
        )));
    }

    if fs::File::open(path).is_err() {
        return Err(CredentialError::Unreadable(format!(
            "credential file for account '{}' is not readable: {}",
            account_name,
            path.display()
        )));
    }

    debug!("Credential file validation passed for account '{}'", account_name);
    Ok(())
}
