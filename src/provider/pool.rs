// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Keyed connection pool: one long-lived IMAP connection per account.
//!
//! Connections are reused across sync cycles to avoid re-authentication,
//! health-checked with NOOP before reuse, and closed after sitting idle.
//! Locking discipline: a global map lock guards the key table, one async lock
//! per account guards its entry, and neither is held across network I/O.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex as TokioMutex;

use crate::imap::error::ImapError;
use crate::imap::session::ImapSession;

pub type ConnFuture<C> = Pin<Box<dyn Future<Output = Result<C, ImapError>> + Send>>;

/// A connection the pool can probe and close. Handles are cheap clones of the
/// underlying connection.
#[async_trait]
pub trait PooledConnection: Clone + Send + Sync + 'static {
    async fn is_healthy(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
impl PooledConnection for ImapSession {
    async fn is_healthy(&self) -> bool {
        match self.noop().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Connection health check failed: {}", e);
                false
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.logout().await {
            debug!("Error during logout: {}", e);
        }
    }
}

struct Entry<C> {
    conn: Option<C>,
    last_used: Instant,
    in_use: bool,
}

impl<C> Entry<C> {
    fn new() -> Self {
        Self {
            conn: None,
            last_used: Instant::now(),
            in_use: false,
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub accounts: Vec<String>,
}

pub const DEFAULT_MAX_IDLE_SECONDS: u64 = 300;

pub struct ConnectionPool<C: PooledConnection> {
    entries: TokioMutex<HashMap<String, Arc<TokioMutex<Entry<C>>>>>,
    max_idle: Duration,
    health_check_on_acquire: bool,
}

impl<C: PooledConnection> ConnectionPool<C> {
    pub fn new(max_idle_seconds: u64) -> Self {
        Self {
            entries: TokioMutex::new(HashMap::new()),
            max_idle: Duration::from_secs(max_idle_seconds),
            health_check_on_acquire: true,
        }
    }

    pub fn without_health_checks(mut self) -> Self {
        self.health_check_on_acquire = false;
        self
    }

    async fn entry(&self, account_id: &str) -> Arc<TokioMutex<Entry<C>>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(Entry::new())))
            .clone()
    }

    /// Return a healthy connection for the account, reusing the pooled one
    /// when the health probe passes, otherwise creating a fresh one via
    /// `factory`.
    pub async fn acquire<F>(&self, account_id: &str, factory: F) -> Result<C, ImapError>
    where
        F: FnOnce() -> ConnFuture<C>,
    {
        let entry = self.entry(account_id).await;

        // Take the candidate out of the entry so the probe runs lock-free.
        let candidate = {
            let mut guard = entry.lock().await;
            if guard.in_use {
                warn!("Connection for {} already in use, creating a new one", account_id);
                None
            } else {
                guard.in_use = true;
                guard.conn.take()
            }
        };

        if let Some(conn) = candidate {
            let reusable = !self.health_check_on_acquire || conn.is_healthy().await;
            if reusable {
                debug!("Reusing pooled connection for {}", account_id);
                let mut guard = entry.lock().await;
                guard.conn = Some(conn.clone());
                guard.touch();
                return Ok(conn);
            }

            info!("Connection for {} unhealthy, replacing", account_id);
            conn.close().await;
        }

        info!("Creating new pooled connection for {}", account_id);
        match factory().await {
            Ok(conn) => {
                let mut guard = entry.lock().await;
                guard.conn = Some(conn.clone());
                guard.in_use = true;
                guard.touch();
                Ok(conn)
            }
            Err(e) => {
                let mut guard = entry.lock().await;
                guard.in_use = false;
                Err(e)
            }
        }
    }

    /// Release the account's connection back to the pool, keeping it alive.
    pub async fn release(&self, account_id: &str) {
        let entry = self.entry(account_id).await;
        let mut guard = entry.lock().await;
        if guard.conn.is_some() || guard.in_use {
            guard.in_use = false;
            guard.touch();
            debug!("Released connection for {} back to pool", account_id);
        } else {
            warn!("No connection to release for {}", account_id);
        }
    }

    /// Close and remove a specific account's connection.
    pub async fn close_connection(&self, account_id: &str) {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.remove(account_id)
        };

        if let Some(entry) = entry {
            let conn = {
                let mut guard = entry.lock().await;
                guard.conn.take()
            };
            if let Some(conn) = conn {
                conn.close().await;
                info!("Closed connection for {}", account_id);
            }
        }
    }

    /// Close connections idle longer than `max_idle`. Returns how many were
    /// closed.
    pub async fn cleanup_idle(&self) -> usize {
        let snapshot: Vec<(String, Arc<TokioMutex<Entry<C>>>)> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let mut to_close = Vec::new();
        for (account_id, entry) in snapshot {
            let guard = entry.lock().await;
            if !guard.in_use && guard.conn.is_some() && guard.last_used.elapsed() > self.max_idle {
                to_close.push(account_id);
            }
        }

        let closed = to_close.len();
        for account_id in to_close {
            self.close_connection(&account_id).await;
        }

        if closed > 0 {
            info!("Cleaned up {} idle connection(s)", closed);
        }
        closed
    }

    /// Close every connection. Called at shutdown.
    pub async fn close_all(&self) {
        let account_ids: Vec<String> = {
            let entries = self.entries.lock().await;
            entries.keys().cloned().collect()
        };

        let count = account_ids.len();
        for account_id in account_ids {
            self.close_connection(&account_id).await;
        }
        info!("Closed all {} connection(s)", count);
    }

    pub async fn stats(&self) -> PoolStats {
        let snapshot: Vec<(String, Arc<TokioMutex<Entry<C>>>)> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let mut total = 0;
        let mut in_use = 0;
        let mut accounts = Vec::new();
        for (account_id, entry) in snapshot {
            let guard = entry.lock().await;
            if guard.conn.is_some() {
                total += 1;
                if guard.in_use {
                    in_use += 1;
                }
                accounts.push(account_id);
            }
        }
        accounts.sort();

        PoolStats {
            total_connections: total,
            in_use,
            idle: total - in_use,
            accounts,
        }
    }
}

// Process-wide pool instance. Created by an explicit init call, never
// implicitly, so tests that construct their own pools stay isolated.
static GLOBAL_POOL: StdMutex<Option<Arc<ConnectionPool<ImapSession>>>> = StdMutex::new(None);

pub fn init_connection_pool(max_idle_seconds: u64) -> Arc<ConnectionPool<ImapSession>> {
    let mut slot = GLOBAL_POOL.lock().expect("pool registry poisoned");
    let pool = Arc::new(ConnectionPool::new(max_idle_seconds));
    *slot = Some(pool.clone());
    pool
}

pub fn connection_pool() -> Option<Arc<ConnectionPool<ImapSession>>> {
    GLOBAL_POOL.lock().expect("pool registry poisoned").clone()
}

pub async fn shutdown_connection_pool() {
    let pool = {
        let mut slot = GLOBAL_POOL.lock().expect("pool registry poisoned");
        slot.take()
    };
    if let Some(pool) = pool {
        pool.close_all().await;
    }
}
