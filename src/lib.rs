//! Library core for mailtriage: a multi-account mail synchronization engine
//! with AI-assisted classification and two-way label propagation.
//!
//! The engine pulls messages from heterogeneous providers (an OAuth API
//! provider and IMAP/SMTP), stores canonical metadata locally, classifies
//! each message through a local inference endpoint, pushes the resulting
//! tags back as server-side labels or keywords, and exposes everything
//! through the [`control::Engine`] facade. It performs no mail delivery of
//! its own; host processes embed it and map errors to their own exit codes.

pub mod actions;
pub mod agent;
pub mod classifier;
pub mod config;
pub mod control;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod imap;
pub mod provider;
pub mod smtp;
pub mod store;
pub mod sync;
pub mod tags;

// CONSOLIDATED PRELUDE
pub mod prelude {
    pub use crate::classifier::{Classifier, FewShotExample};
    pub use crate::config::{AccountConfig, ProviderKind, ProviderSettings, Settings};
    pub use crate::control::{Engine, SyncEvent, SyncState};
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::provider::{
        Classification, MailProvider, Message, Priority, Provider, ProviderError,
    };
    pub use crate::store::{
        MessageFilters, OperationStatus, PendingOp, Store, StoreError, DEFAULT_MAX_ATTEMPTS,
    };
    pub use crate::sync::{SyncEngine, SyncResult};

    // Common Libs
    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
    pub use thiserror::Error;
    pub use tokio::sync::Mutex as TokioMutex;
    pub use uuid::Uuid;
}
