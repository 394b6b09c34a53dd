// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Crate-level error type.
//!
//! Module-local errors (`StoreError`, `ImapError`, `ProviderError`, ...) are
//! converted into `EngineError` at the orchestration layer. The variants map
//! onto failure kinds, not source types: a `Transport` error is retryable
//! wherever it came from, an `Auth` error ends the current run.

use thiserror::Error;

use crate::classifier::ClassifyError;
use crate::credentials::CredentialError;
use crate::gateway::GatewayError;
use crate::imap::error::ImapError;
use crate::provider::ProviderError;
use crate::store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad configuration, missing account, unknown provider. Fatal for the
    /// affected account.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing/unreadable/malformed secret. Fatal for the affected account.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Provider rejected our credentials. Fatal for the current run.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network timeout, connection reset, DNS. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed server response. The caller falls back or reconnects.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Permission denied, quota. Non-retryable for that item.
    #[error("provider policy: {0}")]
    ProviderPolicy(String),

    /// Inference endpoint failure that could not be degraded away.
    #[error("inference error: {0}")]
    Inference(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Inference(_))
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(msg) => EngineError::Auth(msg),
            ProviderError::Transport(msg) => EngineError::Transport(msg),
            ProviderError::Protocol(msg) => EngineError::Protocol(msg),
            ProviderError::Policy(msg) => EngineError::ProviderPolicy(msg),
            ProviderError::Credential(err) => EngineError::Credential(err),
            ProviderError::NotSupported(msg) | ProviderError::Other(msg) => {
                EngineError::Other(msg)
            }
        }
    }
}

impl From<ImapError> for EngineError {
    fn from(err: ImapError) -> Self {
        EngineError::from(ProviderError::from(err))
    }
}

impl From<ClassifyError> for EngineError {
    fn from(err: ClassifyError) -> Self {
        EngineError::Inference(err.to_string())
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        EngineError::Transport(err.to_string())
    }
}
