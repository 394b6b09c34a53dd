//! Shared fixtures: an in-memory mock provider, small HTTP stubs for the
//! inference and gateway endpoints, and a scripted IMAP server for the IDLE
//! watcher.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use mailtriage::provider::{AttachmentInfo, Message, Provider, ProviderError};
use mailtriage::store::Store;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn sample_date() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 2, 1)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap()
}

pub fn make_message(id: &str, subject: &str, labels: &[&str]) -> Message {
    Message {
        id: id.to_string(),
        thread_id: format!("thread-{}", id),
        subject: subject.to_string(),
        from_email: "sender@example.com".to_string(),
        to_emails: vec!["me@example.com".to_string()],
        date: sample_date(),
        snippet: format!("{} snippet", subject),
        body_text: Some(format!("{} body", subject)),
        body_html: None,
        labels: labels.iter().map(|l| l.to_string()).collect(),
        is_unread: true,
        folder: "inbox".to_string(),
        imap_folder: None,
        has_attachments: false,
    }
}

pub async fn store_with_account(account_id: &str, email: &str) -> Store {
    let store = Store::in_memory().await.expect("in-memory store");
    store
        .upsert_account(account_id, "Test Account", email, "imap", &serde_json::json!({}))
        .await
        .expect("account upsert");
    store
}

/// Scriptable provider recording every call it receives.
pub struct MockProvider {
    pub account: String,
    pub messages: StdMutex<Vec<Message>>,
    pub auth_error: StdMutex<Option<String>>,
    pub fail_operations: StdMutex<bool>,
    pub label_updates: StdMutex<Vec<(String, HashSet<String>, HashSet<String>)>>,
    pub ensured_labels: StdMutex<Vec<HashSet<String>>>,
    pub operation_calls: StdMutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            messages: StdMutex::new(Vec::new()),
            auth_error: StdMutex::new(None),
            fail_operations: StdMutex::new(false),
            label_updates: StdMutex::new(Vec::new()),
            ensured_labels: StdMutex::new(Vec::new()),
            operation_calls: StdMutex::new(Vec::new()),
        }
    }

    pub fn with_messages(self, messages: Vec<Message>) -> Self {
        *self.messages.lock().unwrap() = messages;
        self
    }

    pub fn with_auth_error(self, error: &str) -> Self {
        *self.auth_error.lock().unwrap() = Some(error.to_string());
        self
    }

    fn record(&self, call: String) -> Result<(), ProviderError> {
        self.operation_calls.lock().unwrap().push(call);
        if *self.fail_operations.lock().unwrap() {
            Err(ProviderError::Transport("mock operation failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn account_id(&self) -> &str {
        &self.account
    }

    async fn authenticate(&self) -> Result<(), ProviderError> {
        match self.auth_error.lock().unwrap().clone() {
            Some(error) => Err(ProviderError::Auth(error)),
            None => Ok(()),
        }
    }

    async fn fetch_messages(
        &self,
        _since: Option<NaiveDateTime>,
        max_results: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        let mut messages = self.messages.lock().unwrap().clone();
        messages.truncate(max_results);
        Ok(messages)
    }

    async fn fetch_body(
        &self,
        _message_id: &str,
    ) -> Result<(Option<String>, Option<String>), ProviderError> {
        Ok((Some("lazy body".to_string()), None))
    }

    async fn update_labels(
        &self,
        message_id: &str,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> Result<(), ProviderError> {
        self.label_updates
            .lock()
            .unwrap()
            .push((message_id.to_string(), add.clone(), remove.clone()));
        Ok(())
    }

    async fn ensure_labels_exist(&self, labels: &HashSet<String>) -> Result<(), ProviderError> {
        self.ensured_labels.lock().unwrap().push(labels.clone());
        Ok(())
    }

    async fn list_labels(&self) -> Result<HashMap<String, String>, ProviderError> {
        Ok(HashMap::new())
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError> {
        self.record(format!("mark_read:{}", message_id))
    }

    async fn mark_unread(&self, message_id: &str) -> Result<(), ProviderError> {
        self.record(format!("mark_unread:{}", message_id))
    }

    async fn delete(&self, message_id: &str, permanent: bool) -> Result<(), ProviderError> {
        self.record(format!("delete:{}:{}", message_id, permanent))
    }

    async fn move_to_trash(&self, message_id: &str) -> Result<(), ProviderError> {
        self.record(format!("trash:{}", message_id))
    }

    async fn restore_from_trash(
        &self,
        message_id: &str,
        original_folder: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.record(format!(
            "restore:{}:{}",
            message_id,
            original_folder.unwrap_or("inbox")
        ))
    }

    async fn send_message(
        &self,
        _mime_message: &[u8],
        _thread_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        Ok("sent-1".to_string())
    }

    async fn list_attachments(
        &self,
        _message_id: &str,
    ) -> Result<Vec<AttachmentInfo>, ProviderError> {
        Ok(Vec::new())
    }

    async fn get_attachment(
        &self,
        _message_id: &str,
        _attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        Ok(Vec::new())
    }
}

async fn read_http_request(stream: &mut tokio::net::TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let (header_end, header_text) = loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break (buf.len(), String::from_utf8_lossy(&buf).into_owned());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break (pos, String::from_utf8_lossy(&buf[..pos]).into_owned());
        }
    };

    let content_length = header_text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end.min(buf.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    (header_text, String::from_utf8_lossy(&body).into_owned())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

async fn write_http_response(stream: &mut tokio::net::TcpStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// An inference endpoint stub that answers every generate call with the given
/// inner response strings, in order (the last one repeats).
pub async fn spawn_inference_stub(responses: Vec<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let responses = responses.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let (_headers, _body) = read_http_request(&mut stream).await;
                let index = counter.fetch_add(1, Ordering::SeqCst).min(responses.len() - 1);
                let body =
                    serde_json::json!({ "response": responses[index] }).to_string();
                write_http_response(&mut stream, &body).await;
            });
        }
    });

    addr
}

/// A tool-gateway stub: serves the given tool list and answers every tool
/// call with `{"ok": true}`.
pub async fn spawn_gateway_stub(tools_json: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tools_json = tools_json.clone();
            tokio::spawn(async move {
                let (headers, _body) = read_http_request(&mut stream).await;
                let body = if headers.starts_with("GET /api/tools") {
                    tools_json
                } else {
                    "{\"ok\": true}".to_string()
                };
                write_http_response(&mut stream, &body).await;
            });
        }
    });

    addr
}

/// A minimal scripted IMAP server for the IDLE watcher: accepts LOGIN,
/// SELECT, CAPABILITY, and serves per-IDLE-cycle pushes (e.g. `* 2 EXISTS`),
/// one script entry per IDLE command received.
pub async fn spawn_idle_imap_stub(idle_pushes: Vec<Option<String>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let _ = writer.write_all(b"* OK IMAP4rev1 ready\r\n").await;

        let mut idle_cycle = 0usize;
        let mut current_idle_tag: Option<String> = None;

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let trimmed = line.trim_end();

            if trimmed == "DONE" {
                if let Some(tag) = current_idle_tag.take() {
                    let _ = writer
                        .write_all(format!("{} OK IDLE terminated\r\n", tag).as_bytes())
                        .await;
                }
                continue;
            }

            let mut parts = trimmed.splitn(2, ' ');
            let tag = parts.next().unwrap_or("").to_string();
            let command = parts.next().unwrap_or("").to_uppercase();

            if command.starts_with("LOGIN") {
                let _ = writer
                    .write_all(format!("{} OK LOGIN completed\r\n", tag).as_bytes())
                    .await;
            } else if command.starts_with("SELECT") {
                let _ = writer.write_all(b"* 1 EXISTS\r\n* 0 RECENT\r\n").await;
                let _ = writer
                    .write_all(format!("{} OK [READ-WRITE] SELECT completed\r\n", tag).as_bytes())
                    .await;
            } else if command.starts_with("CAPABILITY") {
                let _ = writer
                    .write_all(b"* CAPABILITY IMAP4rev1 IDLE KEYWORD\r\n")
                    .await;
                let _ = writer
                    .write_all(format!("{} OK CAPABILITY completed\r\n", tag).as_bytes())
                    .await;
            } else if command.starts_with("IDLE") {
                current_idle_tag = Some(tag);
                let _ = writer.write_all(b"+ idling\r\n").await;
                if let Some(push) = idle_pushes.get(idle_cycle).cloned().flatten() {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    let _ = writer.write_all(format!("{}\r\n", push).as_bytes()).await;
                }
                idle_cycle += 1;
            } else if command.starts_with("NOOP") {
                let _ = writer
                    .write_all(format!("{} OK NOOP completed\r\n", tag).as_bytes())
                    .await;
            } else if command.starts_with("LOGOUT") {
                let _ = writer.write_all(b"* BYE\r\n").await;
                let _ = writer
                    .write_all(format!("{} OK LOGOUT completed\r\n", tag).as_bytes())
                    .await;
                return;
            } else {
                let _ = writer
                    .write_all(format!("{} OK completed\r\n", tag).as_bytes())
                    .await;
            }
        }
    });

    addr
}
