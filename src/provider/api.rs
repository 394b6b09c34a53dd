// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! OAuth-authenticated, label-based API provider.
//!
//! Message identity is the provider's own message id. Labels form a mutable
//! hierarchy rooted at the configured prefix; name→id translation goes
//! through a cache that is invalidated by every create.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex as TokioMutex;

use crate::config::ApiSettings;
use crate::credentials::{self, OAuthToken};
use crate::provider::{AttachmentInfo, Message, Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Refresh slightly before the advertised expiry.
const EXPIRY_SLACK_SECONDS: i64 = 60;

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LabelListResponse {
    #[serde(default)]
    labels: Vec<LabelRef>,
}

#[derive(Debug, Deserialize)]
struct LabelRef {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct ApiProvider {
    account_id: String,
    email: String,
    credential_file: PathBuf,
    settings: ApiSettings,
    http: reqwest::Client,
    token: TokioMutex<Option<OAuthToken>>,
    label_cache: TokioMutex<Option<HashMap<String, String>>>,
}

impl ApiProvider {
    pub fn new(
        account_id: &str,
        email: &str,
        credential_file: &Path,
        settings: ApiSettings,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            email: email.to_string(),
            credential_file: credential_file.to_path_buf(),
            settings,
            http: reqwest::Client::new(),
            token: TokioMutex::new(None),
            label_cache: TokioMutex::new(None),
        }
    }

    fn base_url(&self) -> &str {
        self.settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn token_url(&self) -> &str {
        self.settings.token_url.as_deref().unwrap_or(DEFAULT_TOKEN_URL)
    }

    async fn bearer(&self) -> Result<String, ProviderError> {
        let token = self.token.lock().await;
        token
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| ProviderError::Other("not authenticated".to_string()))
    }

    fn token_expired(token: &OAuthToken) -> bool {
        // No recorded expiry means we cannot trust the cached access token.
        match token.extra.get("expires_at").and_then(|v| v.as_i64()) {
            Some(expires_at) => Utc::now().timestamp() + EXPIRY_SLACK_SECONDS >= expires_at,
            None => true,
        }
    }

    async fn refresh_token(&self, token: &mut OAuthToken) -> Result<(), ProviderError> {
        info!("Refreshing OAuth token for {}", self.email);

        let params = [
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
            ("refresh_token", token.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(self.token_url())
            .form(&params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ProviderError::from)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Auth(format!(
                "token refresh failed with status {}: {}",
                status, body
            )));
        }

        let refreshed: TokenRefreshResponse =
            response.json().await.map_err(ProviderError::from)?;

        token.access_token = refreshed.access_token;
        if let Some(new_refresh) = refreshed.refresh_token {
            token.refresh_token = new_refresh;
        }
        if let Some(expires_in) = refreshed.expires_in {
            token.extra.insert(
                "expires_at".to_string(),
                json!(Utc::now().timestamp() + expires_in),
            );
        }

        // Best effort; the refreshed token keeps working either way.
        credentials::save_oauth(&self.credential_file, token);
        Ok(())
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 => Err(ProviderError::Auth(format!("API returned 401: {}", body))),
            403 | 429 => Err(ProviderError::Policy(format!(
                "API returned {}: {}",
                status, body
            ))),
            _ => Err(ProviderError::Other(format!(
                "API returned {}: {}",
                status, body
            ))),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, ProviderError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(bearer)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ProviderError::from)?;
        let response = self.check(response).await?;
        response.json().await.map_err(ProviderError::from)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, ProviderError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(bearer)
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ProviderError::from)?;
        let response = self.check(response).await?;
        response.json().await.map_err(ProviderError::from)
    }

    /// Label name → id, loading the cache on first use.
    async fn label_mapping(&self) -> Result<HashMap<String, String>, ProviderError> {
        {
            let cache = self.label_cache.lock().await;
            if let Some(mapping) = cache.as_ref() {
                return Ok(mapping.clone());
            }
        }
        self.list_labels().await
    }

    async fn invalidate_label_cache(&self) {
        let mut cache = self.label_cache.lock().await;
        *cache = None;
    }

    async fn create_label(&self, name: &str) -> Result<String, ProviderError> {
        let existing = self.label_mapping().await?;
        if let Some(id) = existing.get(name) {
            debug!("Label '{}' already exists", name);
            return Ok(id.clone());
        }

        let body = json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });

        let created = self
            .post_json(&format!("{}/labels", self.base_url()), &body)
            .await?;
        let label_id = created
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Protocol("label create response missing id".into()))?
            .to_string();

        info!("Created label: {} (ID: {})", name, label_id);
        self.invalidate_label_cache().await;
        Ok(label_id)
    }

    fn parse_api_message(&self, detail: &Value) -> Option<Message> {
        let id = detail.get("id")?.as_str()?.to_string();
        let thread_id = detail
            .get("threadId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let payload = detail.get("payload")?;
        let headers: HashMap<String, String> = payload
            .get("headers")
            .and_then(|v| v.as_array())
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|h| {
                        Some((
                            h.get("name")?.as_str()?.to_string(),
                            h.get("value")?.as_str()?.to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let label_ids: HashSet<String> = detail
            .get("labelIds")
            .and_then(|v| v.as_array())
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let body_text = find_part_data(payload, "text/plain");
        let body_html = find_part_data(payload, "text/html");

        let date = detail
            .get("internalDate")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Local.timestamp_opt(ms / 1000, 0).single())
            .map(|d| d.naive_local())
            .unwrap_or_else(|| Local::now().naive_local());

        let has_attachments = payload
            .get("parts")
            .and_then(|v| v.as_array())
            .map(|parts| {
                parts.iter().any(|p| {
                    p.get("filename")
                        .and_then(|f| f.as_str())
                        .map(|f| !f.is_empty())
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        Some(Message {
            id,
            thread_id,
            subject: headers
                .get("Subject")
                .cloned()
                .unwrap_or_else(|| "(No Subject)".to_string()),
            from_email: headers.get("From").cloned().unwrap_or_default(),
            to_emails: headers
                .get("To")
                .map(|to| to.split(',').map(|a| a.trim().to_string()).collect())
                .unwrap_or_default(),
            date,
            snippet: detail
                .get("snippet")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            body_text,
            body_html,
            is_unread: label_ids.contains("UNREAD"),
            labels: label_ids,
            folder: "inbox".to_string(),
            imap_folder: None,
            has_attachments,
        })
    }
}

/// Find the first decoded body of the given MIME type, walking the payload
/// and its nested parts depth-first.
fn find_part_data(payload: &Value, mime_type: &str) -> Option<String> {
    fn decode_body(part: &Value) -> Option<String> {
        let data = part.get("body")?.get("data")?.as_str()?;
        let bytes = URL_SAFE.decode(data).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    if payload.get("mimeType").and_then(|v| v.as_str()) == Some(mime_type) {
        if let Some(body) = decode_body(payload) {
            return Some(body);
        }
    }

    if let Some(parts) = payload.get("parts").and_then(|v| v.as_array()) {
        for part in parts {
            if let Some(body) = find_part_data(part, mime_type) {
                return Some(body);
            }
        }
    }

    None
}

#[async_trait]
impl Provider for ApiProvider {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn authenticate(&self) -> Result<(), ProviderError> {
        let mut token = credentials::load_oauth(&self.credential_file)?;

        if Self::token_expired(&token) && !token.refresh_token.is_empty() {
            self.refresh_token(&mut token).await?;
        }

        let mut slot = self.token.lock().await;
        *slot = Some(token);
        info!("Successfully authenticated with API for {}", self.email);
        Ok(())
    }

    async fn fetch_messages(
        &self,
        since: Option<NaiveDateTime>,
        max_results: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        let mut query = "in:inbox".to_string();
        if let Some(since) = since {
            query.push_str(&format!(" after:{}", since.format("%Y/%m/%d")));
        }

        let url = format!(
            "{}/messages?q={}&maxResults={}",
            self.base_url(),
            urlencode(&query),
            max_results
        );

        let list: MessageListResponse = serde_json::from_value(self.get_json(&url).await?)
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        info!("Fetched {} message refs from API", list.messages.len());

        let mut messages = Vec::new();
        for item in &list.messages {
            let detail_url = format!("{}/messages/{}?format=full", self.base_url(), item.id);
            match self.get_json(&detail_url).await {
                Ok(detail) => match self.parse_api_message(&detail) {
                    Some(message) => messages.push(message),
                    None => warn!("Skipping malformed message {}", item.id),
                },
                Err(ProviderError::Auth(e)) => return Err(ProviderError::Auth(e)),
                Err(e) => warn!("Failed to fetch message {}: {}", item.id, e),
            }
        }

        Ok(messages)
    }

    async fn fetch_body(
        &self,
        message_id: &str,
    ) -> Result<(Option<String>, Option<String>), ProviderError> {
        let url = format!("{}/messages/{}?format=full", self.base_url(), message_id);
        let detail = self.get_json(&url).await?;
        let payload = detail
            .get("payload")
            .ok_or_else(|| ProviderError::Protocol("message missing payload".into()))?;

        Ok((
            find_part_data(payload, "text/plain"),
            find_part_data(payload, "text/html"),
        ))
    }

    async fn update_labels(
        &self,
        message_id: &str,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> Result<(), ProviderError> {
        let mapping = self.label_mapping().await?;

        // Built-in labels (INBOX, UNREAD, ...) are their own ids.
        let resolve = |name: &String| -> Option<String> {
            mapping.get(name).cloned().or_else(|| {
                if name.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
                    Some(name.clone())
                } else {
                    None
                }
            })
        };

        let mut add_label_ids: Vec<String> = add.iter().filter_map(|n| resolve(n)).collect();
        let mut remove_label_ids: Vec<String> = remove.iter().filter_map(|n| resolve(n)).collect();
        add_label_ids.sort();
        add_label_ids.dedup();
        remove_label_ids.sort();
        remove_label_ids.dedup();

        if add_label_ids.is_empty() && remove_label_ids.is_empty() {
            debug!("No label changes for message {}", message_id);
            return Ok(());
        }

        let (added, removed) = (add_label_ids.len(), remove_label_ids.len());
        let body = json!({
            "addLabelIds": add_label_ids,
            "removeLabelIds": remove_label_ids,
        });

        self.post_json(
            &format!("{}/messages/{}/modify", self.base_url(), message_id),
            &body,
        )
        .await?;

        info!("Updated labels on message {}: +{} -{}", message_id, added, removed);
        Ok(())
    }

    async fn ensure_labels_exist(&self, labels: &HashSet<String>) -> Result<(), ProviderError> {
        let existing = self.label_mapping().await?;
        for name in labels {
            if !existing.contains_key(name) {
                self.create_label(name).await?;
            }
        }
        Ok(())
    }

    async fn list_labels(&self) -> Result<HashMap<String, String>, ProviderError> {
        let list: LabelListResponse = serde_json::from_value(
            self.get_json(&format!("{}/labels", self.base_url())).await?,
        )
        .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let mapping: HashMap<String, String> = list
            .labels
            .into_iter()
            .map(|label| (label.name, label.id))
            .collect();
        debug!("Fetched {} labels from API", mapping.len());

        let mut cache = self.label_cache.lock().await;
        *cache = Some(mapping.clone());
        Ok(mapping)
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError> {
        let body = json!({ "removeLabelIds": ["UNREAD"] });
        self.post_json(
            &format!("{}/messages/{}/modify", self.base_url(), message_id),
            &body,
        )
        .await?;
        Ok(())
    }

    async fn mark_unread(&self, message_id: &str) -> Result<(), ProviderError> {
        let body = json!({ "addLabelIds": ["UNREAD"] });
        self.post_json(
            &format!("{}/messages/{}/modify", self.base_url(), message_id),
            &body,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, message_id: &str, permanent: bool) -> Result<(), ProviderError> {
        if permanent {
            let bearer = self.bearer().await?;
            let response = self
                .http
                .delete(format!("{}/messages/{}", self.base_url(), message_id))
                .bearer_auth(bearer)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(ProviderError::from)?;
            self.check(response).await?;
            info!("Permanently deleted message {}", message_id);
        } else {
            self.post_json(
                &format!("{}/messages/{}/trash", self.base_url(), message_id),
                &json!({}),
            )
            .await?;
            info!("Moved message {} to trash", message_id);
        }
        Ok(())
    }

    async fn move_to_trash(&self, message_id: &str) -> Result<(), ProviderError> {
        self.delete(message_id, false).await
    }

    async fn restore_from_trash(
        &self,
        message_id: &str,
        _original_folder: Option<&str>,
    ) -> Result<(), ProviderError> {
        // Label-based provider: untrash restores the previous label set.
        self.post_json(
            &format!("{}/messages/{}/untrash", self.base_url(), message_id),
            &json!({}),
        )
        .await?;
        info!("Restored message {} from trash", message_id);
        Ok(())
    }

    async fn send_message(
        &self,
        mime_message: &[u8],
        thread_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut body = json!({ "raw": URL_SAFE.encode(mime_message) });
        if let Some(thread_id) = thread_id {
            body["threadId"] = json!(thread_id);
        }

        let sent = self
            .post_json(&format!("{}/messages/send", self.base_url()), &body)
            .await?;
        let id = sent
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        info!("Sent message via API: {}", id);
        Ok(id)
    }

    async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<AttachmentInfo>, ProviderError> {
        let url = format!("{}/messages/{}?format=full", self.base_url(), message_id);
        let detail = self.get_json(&url).await?;

        let mut attachments = Vec::new();
        if let Some(parts) = detail
            .get("payload")
            .and_then(|p| p.get("parts"))
            .and_then(|v| v.as_array())
        {
            for part in parts {
                let filename = part
                    .get("filename")
                    .and_then(|f| f.as_str())
                    .unwrap_or_default();
                if filename.is_empty() {
                    continue;
                }

                let attachment_id = part
                    .get("body")
                    .and_then(|b| b.get("attachmentId"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let size = part
                    .get("body")
                    .and_then(|b| b.get("size"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;

                attachments.push(AttachmentInfo {
                    id: attachment_id,
                    filename: filename.to_string(),
                    content_type: part
                        .get("mimeType")
                        .and_then(|v| v.as_str())
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    size,
                    is_inline: false,
                });
            }
        }

        Ok(attachments)
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/messages/{}/attachments/{}",
            self.base_url(),
            message_id,
            attachment_id
        );
        let response = self.get_json(&url).await?;
        let data = response
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Protocol("attachment response missing data".into()))?;

        URL_SAFE
            .decode(data)
            .map_err(|e| ProviderError::Protocol(format!("bad attachment encoding: {}", e)))
    }
}

fn urlencode(query: &str) -> String {
    query
        .replace('%', "%25")
        .replace(' ', "%20")
        .replace(':', "%3A")
        .replace('+', "%2B")
        .replace('/', "%2F")
}
