// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Control plane: the facade external surfaces (web UI, bulk API, assistant
//! tools) program against.
//!
//! Owns the wiring between store, classifier, gateway, and providers; keeps a
//! lock per account so one account never runs two syncs at once; fans out
//! engine events over a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;

use crate::actions;
use crate::agent::{ActionAgent, ActionStats};
use crate::classifier::Classifier;
use crate::config::{ProviderSettings, Settings};
use crate::error::{EngineError, EngineResult};
use crate::gateway::GatewayClient;
use crate::provider::idle::{self, IdleConfig, NewMailCallback};
use crate::provider::pool;
use crate::provider::{MailProvider, Provider};
use crate::store::Store;
use crate::sync::{SyncEngine, SyncResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_MAX_MESSAGES: usize = 100;
const DEFAULT_MAX_ACTIONS: i64 = 10;

/// Events pushed to connected UIs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted {
        account_id: String,
    },
    SyncCompleted {
        account_id: String,
        fetched: usize,
        classified: usize,
        labels_updated: usize,
        errors: usize,
    },
    MessageClassified {
        account_id: String,
        message_id: String,
        tags: Vec<String>,
    },
    Error {
        account_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

pub struct Engine {
    settings: Settings,
    store: Arc<Store>,
    classifier: Arc<Classifier>,
    gateway: Arc<GatewayClient>,
    agent: ActionAgent,
    sync_locks: DashMap<String, Arc<TokioMutex<()>>>,
    sync_status: DashMap<String, SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl Engine {
    /// Open the store, push configured accounts into it, and wire the
    /// pipeline components together.
    pub async fn new(settings: Settings) -> EngineResult<Self> {
        let store = Arc::new(Store::open(std::path::Path::new(&settings.database_path)).await?);
        crate::config::sync_accounts_to_store(&store, &settings).await?;

        let classifier = Arc::new(Classifier::new(settings.ai.clone(), settings.taxonomy()));
        let gateway = Arc::new(GatewayClient::new(
            &settings.gateway.url,
            settings.gateway.timeout_seconds,
        ));

        let merged_actions = actions::merge_actions(
            &settings.actions,
            settings.gateway.addressbook.as_deref(),
            settings.gateway.calendar.as_deref(),
        );

        let agent = ActionAgent::new(
            store.clone(),
            gateway.clone(),
            classifier.clone(),
            merged_actions,
            Duration::from_secs(settings.ai.extraction_timeout_seconds),
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            settings,
            store,
            classifier,
            gateway,
            agent,
            sync_locks: DashMap::new(),
            sync_status: DashMap::new(),
            events,
        })
    }

    /// The store, for the read/mutation surface the control plane re-exposes.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<GatewayClient> {
        &self.gateway
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn sync_state(&self, account_id: &str) -> SyncState {
        self.sync_status
            .get(account_id)
            .map(|entry| entry.value().clone())
            .unwrap_or(SyncState::Idle)
    }

    fn account_lock(&self, account_id: &str) -> Arc<TokioMutex<()>> {
        self.sync_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    fn provider_for(&self, account_id: &str) -> EngineResult<MailProvider> {
        let account = self
            .settings
            .accounts
            .get(account_id)
            .ok_or_else(|| EngineError::Config(format!("unknown account: {}", account_id)))?;
        MailProvider::for_account(account_id, account).map_err(EngineError::from)
    }

    /// The label prefix for an account: a per-account API override wins over
    /// the global one.
    fn label_prefix_for(&self, account_id: &str) -> String {
        self.settings
            .accounts
            .get(account_id)
            .and_then(|account| match &account.settings {
                ProviderSettings::Api(api) => api.label_prefix.clone(),
                _ => None,
            })
            .unwrap_or_else(|| self.settings.label_prefix.clone())
    }

    /// Run one sync for the account. Concurrent calls for the same account
    /// serialize on a per-account lock; different accounts run in parallel.
    pub async fn sync_account(
        &self,
        account_id: &str,
        max_messages: Option<usize>,
        cancel: &CancellationToken,
    ) -> EngineResult<SyncResult> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let provider = self.provider_for(account_id)?;

        self.sync_status
            .insert(account_id.to_string(), SyncState::Syncing);
        let _ = self.events.send(SyncEvent::SyncStarted {
            account_id: account_id.to_string(),
        });

        let engine = SyncEngine::new(
            provider,
            self.store.clone(),
            self.classifier.clone(),
            &self.label_prefix_for(account_id),
        )
        .with_events(self.events.clone());

        let result = engine
            .sync(max_messages.unwrap_or(DEFAULT_MAX_MESSAGES), cancel)
            .await;

        let state = if result.errors.is_empty() {
            SyncState::Idle
        } else {
            for error in &result.errors {
                let _ = self.events.send(SyncEvent::Error {
                    account_id: account_id.to_string(),
                    message: error.clone(),
                });
            }
            SyncState::Error
        };
        self.sync_status.insert(account_id.to_string(), state);

        let _ = self.events.send(SyncEvent::SyncCompleted {
            account_id: account_id.to_string(),
            fetched: result.messages_fetched,
            classified: result.messages_classified,
            labels_updated: result.labels_updated,
            errors: result.errors.len(),
        });

        Ok(result)
    }

    /// Re-run classification over stored messages for the account.
    pub async fn reclassify_account(
        &self,
        account_id: &str,
        max_messages: Option<i64>,
        cancel: &CancellationToken,
    ) -> EngineResult<SyncResult> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let provider = self.provider_for(account_id)?;
        let engine = SyncEngine::new(
            provider,
            self.store.clone(),
            self.classifier.clone(),
            &self.label_prefix_for(account_id),
        )
        .with_events(self.events.clone());

        Ok(engine.reclassify(max_messages, cancel).await)
    }

    /// Run the action pipeline for the account.
    pub async fn process_actions(
        &self,
        account_id: &str,
        max_actions: Option<i64>,
    ) -> ActionStats {
        self.agent
            .process_actions(account_id, max_actions.unwrap_or(DEFAULT_MAX_ACTIONS))
            .await
    }

    /// Reply suggestions for a stored message.
    pub async fn suggest_replies(&self, message_id: &str) -> EngineResult<Vec<String>> {
        let record = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| EngineError::Config(format!("unknown message: {}", message_id)))?;

        Ok(self.classifier.suggest_replies(&record.to_message()).await?)
    }

    /// Fetch and persist a message's body on demand.
    pub async fn fetch_message_body(&self, message_id: &str) -> EngineResult<()> {
        let record = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| EngineError::Config(format!("unknown message: {}", message_id)))?;

        let provider = self.provider_for(&record.account_id)?;
        provider.authenticate().await?;
        let (text, html) = provider.fetch_body(message_id).await?;
        self.store
            .update_message_body(message_id, text.as_deref(), html.as_deref())
            .await?;
        Ok(())
    }

    /// Bring up the process-wide connection pool and IDLE watchers for every
    /// configured IMAP account.
    pub fn start_background_services(&self, on_new_mail: Option<NewMailCallback>) {
        pool::init_connection_pool(pool::DEFAULT_MAX_IDLE_SECONDS);
        let registry = idle::init_idle_registry(on_new_mail);

        for (account_id, account) in &self.settings.accounts {
            let ProviderSettings::Imap(imap) = &account.settings else {
                continue;
            };

            registry.add_account(
                IdleConfig {
                    account_id: account_id.clone(),
                    email: account.email.clone(),
                    host: imap.host.clone(),
                    port: imap.port,
                    credential_file: account.credential_file.clone(),
                    use_tls: imap.use_ssl,
                    folder: "INBOX".to_string(),
                },
                None,
            );
        }

        info!("Background services started");
    }

    /// Tear down background services and close the store.
    pub async fn shutdown(&self) {
        idle::shutdown_idle_registry().await;
        pool::shutdown_connection_pool().await;
        self.store.close().await;
        info!("Engine shut down");
    }

    /// Periodic maintenance: expired feedback and stale completed echoes.
    pub async fn run_maintenance(&self) {
        if let Err(e) = self.store.cleanup_feedback(90, 100).await {
            warn!("Feedback cleanup failed: {}", e);
        }
        if let Err(e) = self.store.cleanup_completed_operations(24).await {
            warn!("Pending-operation cleanup failed: {}", e);
        }
    }
}
