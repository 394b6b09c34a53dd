// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP IDLE watcher: per-account push notifications for new mail.
//!
//! Each watcher owns a dedicated connection (never shared with sync) and
//! speaks the IDLE exchange directly over the socket, because it must react
//! to unsolicited responses line by line: `EXISTS` raises the new-mail
//! callback, `EXPUNGE` is acknowledged silently, and the session is refreshed
//! well under the 29-minute cap from RFC 2177.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_native_tls::{native_tls, TlsConnector};

use crate::credentials;

/// Refresh IDLE before the server is allowed to drop us (RFC says 29 min).
const IDLE_REFRESH: Duration = Duration::from_secs(28 * 60);
/// How long one blocking read waits before we cycle the IDLE session.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(30);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type NewMailCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct IdleConfig {
    pub account_id: String,
    pub email: String,
    pub host: String,
    pub port: u16,
    pub credential_file: PathBuf,
    pub use_tls: bool,
    pub folder: String,
}

trait IdleIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IdleIo for T {}

struct IdleConnection {
    reader: BufReader<ReadHalf<Box<dyn IdleIo>>>,
    writer: WriteHalf<Box<dyn IdleIo>>,
    tag_counter: u32,
}

#[derive(Debug)]
enum ReadOutcome {
    Line(String),
    TimedOut,
}

impl IdleConnection {
    async fn open(config: &IdleConfig) -> Result<Self, String> {
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((config.host.as_str(), config.port)))
            .await
            .map_err(|_| "connect timed out".to_string())?
            .map_err(|e| e.to_string())?;

        let stream: Box<dyn IdleIo> = if config.use_tls {
            let tls = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| e.to_string())?;
            let connector = TlsConnector::from(tls);
            let tls_stream = timeout(CONNECT_TIMEOUT, connector.connect(&config.host, tcp))
                .await
                .map_err(|_| "TLS handshake timed out".to_string())?
                .map_err(|e| e.to_string())?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            tag_counter: 0,
        };

        // Server greeting.
        match conn.read_line(CONNECT_TIMEOUT).await? {
            ReadOutcome::Line(greeting) if greeting.starts_with("* OK") => {}
            ReadOutcome::Line(greeting) => {
                return Err(format!("unexpected greeting: {}", greeting.trim()));
            }
            ReadOutcome::TimedOut => return Err("no greeting from server".to_string()),
        }

        Ok(conn)
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("w{}", self.tag_counter)
    }

    async fn send(&mut self, data: &str) -> Result<(), String> {
        self.writer
            .write_all(data.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        self.writer.flush().await.map_err(|e| e.to_string())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<ReadOutcome, String> {
        let mut line = String::new();
        match timeout(wait, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) => Err("connection closed by server".to_string()),
            Ok(Ok(_)) => Ok(ReadOutcome::Line(line)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Ok(ReadOutcome::TimedOut),
        }
    }

    /// Send a tagged command and read until its tagged completion.
    /// Untagged lines are collected and returned.
    async fn command(&mut self, command: &str) -> Result<Vec<String>, String> {
        let tag = self.next_tag();
        self.send(&format!("{} {}\r\n", tag, command)).await?;

        let mut untagged = Vec::new();
        loop {
            match self.read_line(CONNECT_TIMEOUT).await? {
                ReadOutcome::Line(line) => {
                    if line.starts_with(&format!("{} ", tag)) {
                        if line[tag.len() + 1..].trim_start().starts_with("OK") {
                            return Ok(untagged);
                        }
                        return Err(format!("command failed: {}", line.trim()));
                    }
                    untagged.push(line);
                }
                ReadOutcome::TimedOut => {
                    return Err("timed out waiting for command completion".to_string())
                }
            }
        }
    }

    async fn login(&mut self, email: &str, password: &str) -> Result<(), String> {
        let quoted_pass = password.replace('\\', "\\\\").replace('"', "\\\"");
        let quoted_user = email.replace('\\', "\\\\").replace('"', "\\\"");
        self.command(&format!("LOGIN \"{}\" \"{}\"", quoted_user, quoted_pass))
            .await
            .map(|_| ())
    }

    async fn select(&mut self, folder: &str) -> Result<(), String> {
        self.command(&format!("SELECT \"{}\"", folder)).await.map(|_| ())
    }

    async fn supports_idle(&mut self) -> Result<bool, String> {
        let lines = self.command("CAPABILITY").await?;
        Ok(lines.iter().any(|line| line.contains("IDLE")))
    }

    /// Send IDLE and wait for the continuation response. A few unsolicited
    /// lines (including the OK from a previous IDLE) may arrive first.
    async fn enter_idle(&mut self) -> Result<String, String> {
        let tag = self.next_tag();
        self.send(&format!("{} IDLE\r\n", tag)).await?;

        for _ in 0..3 {
            match self.read_line(CONNECT_TIMEOUT).await? {
                ReadOutcome::Line(line) => {
                    if line.starts_with('+') {
                        return Ok(tag);
                    }
                    if line.starts_with('*') || line.contains("OK") {
                        debug!("Skipping response while entering IDLE: {}", line.trim());
                        continue;
                    }
                    return Err(format!("IDLE rejected: {}", line.trim()));
                }
                ReadOutcome::TimedOut => return Err("timed out entering IDLE".to_string()),
            }
        }

        Err("failed to enter IDLE after retries".to_string())
    }

    /// Send DONE and consume the tagged completion, best effort.
    async fn exit_idle(&mut self) -> Result<(), String> {
        self.send("DONE\r\n").await?;
        for _ in 0..5 {
            match self.read_line(Duration::from_secs(5)).await? {
                ReadOutcome::Line(line) => {
                    if !line.starts_with('*') {
                        return Ok(());
                    }
                }
                ReadOutcome::TimedOut => return Ok(()),
            }
        }
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), String> {
        self.command("NOOP").await.map(|_| ())
    }
}

/// Long-lived watcher holding one account's IDLE connection.
pub struct IdleWatcher {
    config: Arc<IdleConfig>,
    on_new_mail: NewMailCallback,
    shutdown_tx: watch::Sender<bool>,
    handle: StdMutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl IdleWatcher {
    pub fn new(config: IdleConfig, on_new_mail: NewMailCallback) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            on_new_mail,
            shutdown_tx,
            handle: StdMutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.config.account_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background worker. A second start is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown_tx.send_replace(false);
        let config = self.config.clone();
        let callback = self.on_new_mail.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(watch_loop(config, callback, shutdown_rx));
        *self.handle.lock().expect("idle handle lock poisoned") = Some(handle);
        info!("Started IMAP IDLE watcher for {}", self.config.account_id);
    }

    /// Signal the worker to stop, unblock its read, and join it with a
    /// bounded wait. Stopping twice is harmless.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shutdown_tx.send_replace(true);

        let handle = self.handle.lock().expect("idle handle lock poisoned").take();
        if let Some(handle) = handle {
            if timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(
                    "IDLE worker for {} did not stop within {:?}",
                    self.config.account_id, STOP_JOIN_TIMEOUT
                );
            }
        }
        info!("Stopped IMAP IDLE watcher for {}", self.config.account_id);
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        result = shutdown.wait_for(|stopped| *stopped) => result.is_ok(),
    }
}

async fn connect_and_prepare(config: &IdleConfig) -> Result<IdleConnection, String> {
    info!("Connecting IMAP IDLE for {}", config.account_id);

    let password =
        credentials::load_password(&config.credential_file).map_err(|e| e.to_string())?;

    let mut conn = IdleConnection::open(config).await?;
    conn.login(&config.email, &password).await?;
    conn.select(&config.folder).await?;

    if !conn.supports_idle().await? {
        return Err(format!(
            "IMAP server for {} doesn't support IDLE",
            config.account_id
        ));
    }

    info!(
        "IMAP IDLE connected for {} (folder: {})",
        config.account_id, config.folder
    );
    Ok(conn)
}

async fn watch_loop(
    config: Arc<IdleConfig>,
    on_new_mail: NewMailCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let mut conn = match connect_and_prepare(&config).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    "IDLE connection failed for {}: {}, retrying in {:?}",
                    config.account_id, e, RECONNECT_DELAY
                );
                if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        let mut idle_start = Instant::now();

        'session: while !*shutdown.borrow() {
            if let Err(e) = conn.enter_idle().await {
                warn!("Failed to enter IDLE for {}: {}", config.account_id, e);
                break 'session;
            }

            let outcome = tokio::select! {
                result = conn.read_line(READ_TIMEOUT) => Some(result),
                _ = shutdown.wait_for(|stopped| *stopped) => None,
            };

            // A missing outcome means we were asked to stop.
            let Some(outcome) = outcome else {
                let _ = conn.exit_idle().await;
                return;
            };

            match outcome {
                Ok(ReadOutcome::Line(line)) => {
                    debug!("IDLE response for {}: {}", config.account_id, line.trim());

                    if line.contains("EXISTS") {
                        info!("New mail detected for {}", config.account_id);
                        if let Err(e) = conn.exit_idle().await {
                            warn!("Failed to exit IDLE: {}", e);
                            break 'session;
                        }
                        (on_new_mail)(&config.account_id);
                        idle_start = Instant::now();
                        continue;
                    }

                    if line.contains("EXPUNGE") {
                        debug!("Message expunged for {}", config.account_id);
                        if conn.exit_idle().await.is_err() {
                            break 'session;
                        }
                        idle_start = Instant::now();
                        continue;
                    }

                    // Other unsolicited response; cycle the IDLE session.
                    if conn.exit_idle().await.is_err() {
                        break 'session;
                    }
                }
                Ok(ReadOutcome::TimedOut) => {
                    if conn.exit_idle().await.is_err() {
                        break 'session;
                    }
                    if idle_start.elapsed() > IDLE_REFRESH {
                        debug!("IDLE refresh for {}", config.account_id);
                        if conn.noop().await.is_err() {
                            break 'session;
                        }
                        idle_start = Instant::now();
                    }
                }
                Err(e) => {
                    warn!("IDLE connection error for {}: {}", config.account_id, e);
                    break 'session;
                }
            }
        }

        if *shutdown.borrow() {
            return;
        }

        info!(
            "IDLE disconnected for {}, reconnecting in {:?}",
            config.account_id, RECONNECT_DELAY
        );
        if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
            return;
        }
    }
}

/// Registry of IDLE watchers across accounts.
pub struct IdleRegistry {
    watchers: StdMutex<HashMap<String, Arc<IdleWatcher>>>,
    default_callback: NewMailCallback,
    enabled: AtomicBool,
}

impl IdleRegistry {
    pub fn new(on_new_mail: Option<NewMailCallback>) -> Self {
        let default_callback = on_new_mail.unwrap_or_else(|| {
            Arc::new(|account_id: &str| {
                info!("New mail for {} (no callback configured)", account_id);
            })
        });

        Self {
            watchers: StdMutex::new(HashMap::new()),
            default_callback,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn add_account(&self, config: IdleConfig, on_new_mail: Option<NewMailCallback>) {
        let account_id = config.account_id.clone();
        let mut watchers = self.watchers.lock().expect("idle registry poisoned");

        if watchers.contains_key(&account_id) {
            warn!("Account {} already being watched", account_id);
            return;
        }

        let callback = on_new_mail.unwrap_or_else(|| self.default_callback.clone());
        let watcher = Arc::new(IdleWatcher::new(config, callback));
        if self.enabled.load(Ordering::SeqCst) {
            watcher.start();
        }
        watchers.insert(account_id.clone(), watcher);
        info!("Added IDLE watcher for account {}", account_id);
    }

    pub async fn remove_account(&self, account_id: &str) {
        let watcher = {
            let mut watchers = self.watchers.lock().expect("idle registry poisoned");
            watchers.remove(account_id)
        };
        if let Some(watcher) = watcher {
            watcher.stop().await;
            info!("Removed IDLE watcher for account {}", account_id);
        }
    }

    pub fn watched_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .watchers
            .lock()
            .expect("idle registry poisoned")
            .keys()
            .cloned()
            .collect();
        accounts.sort();
        accounts
    }

    pub fn is_watching(&self, account_id: &str) -> bool {
        self.watchers
            .lock()
            .expect("idle registry poisoned")
            .contains_key(account_id)
    }

    pub fn start_all(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        let watchers: Vec<Arc<IdleWatcher>> = self
            .watchers
            .lock()
            .expect("idle registry poisoned")
            .values()
            .cloned()
            .collect();
        for watcher in watchers {
            watcher.start();
        }
    }

    pub async fn stop_all(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let watchers: Vec<Arc<IdleWatcher>> = self
            .watchers
            .lock()
            .expect("idle registry poisoned")
            .values()
            .cloned()
            .collect();
        for watcher in watchers {
            watcher.stop().await;
        }
    }
}

// Process-wide registry with explicit lifecycle, mirroring the connection
// pool: init at startup, shutdown at exit, nothing implicit in tests.
static GLOBAL_REGISTRY: StdMutex<Option<Arc<IdleRegistry>>> = StdMutex::new(None);

pub fn init_idle_registry(on_new_mail: Option<NewMailCallback>) -> Arc<IdleRegistry> {
    let mut slot = GLOBAL_REGISTRY.lock().expect("idle registry slot poisoned");
    let registry = Arc::new(IdleRegistry::new(on_new_mail));
    *slot = Some(registry.clone());
    registry
}

pub fn idle_registry() -> Option<Arc<IdleRegistry>> {
    GLOBAL_REGISTRY.lock().expect("idle registry slot poisoned").clone()
}

pub async fn shutdown_idle_registry() {
    let registry = {
        let mut slot = GLOBAL_REGISTRY.lock().expect("idle registry slot poisoned");
        slot.take()
    };
    if let Some(registry) = registry {
        registry.stop_all().await;
    }
}
