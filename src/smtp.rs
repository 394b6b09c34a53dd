// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SMTP sending of prebuilt MIME messages.
//!
//! Port 465 gets implicit TLS; anything else upgrades with STARTTLS when
//! configured. Transient failures are retried with exponential backoff
//! (1 s, 2 s, 4 s) before giving up.

use std::time::Duration;

use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::{debug, info, warn};
use mail_parser::MessageParser;
use thiserror::Error;

const MAX_SEND_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("SMTP configuration error: {0}")]
    Config(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("failed to send message after {attempts} attempts: {last_error}")]
    SendFailed { attempts: u32, last_error: String },
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub timeout: Duration,
}

impl SmtpConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str, use_tls: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            use_tls,
            timeout: Duration::from_secs(30),
        }
    }
}

fn parse_address(raw: &str) -> Result<Address, SmtpError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| SmtpError::InvalidMessage(format!("bad address '{}': {}", raw, e)))
}

/// Derive the SMTP envelope (from + all recipients) from the MIME headers.
pub fn envelope_from_mime(mime_message: &[u8]) -> Result<(Envelope, String), SmtpError> {
    let parsed = MessageParser::default()
        .parse(mime_message)
        .ok_or_else(|| SmtpError::InvalidMessage("unparsable MIME message".to_string()))?;

    let from = parsed
        .from()
        .and_then(|addrs| addrs.first())
        .and_then(|addr| addr.address.as_deref())
        .ok_or_else(|| SmtpError::InvalidMessage("missing From address".to_string()))?
        .to_string();

    let mut recipients: Vec<Address> = Vec::new();
    for list in [parsed.to(), parsed.cc(), parsed.bcc()].into_iter().flatten() {
        for addr in list.iter() {
            if let Some(address) = addr.address.as_deref() {
                recipients.push(parse_address(address)?);
            }
        }
    }

    if recipients.is_empty() {
        return Err(SmtpError::InvalidMessage("no recipients".to_string()));
    }

    let message_id = parsed.message_id().unwrap_or_default().to_string();

    let envelope = Envelope::new(Some(parse_address(&from)?), recipients)
        .map_err(|e| SmtpError::InvalidMessage(e.to_string()))?;

    Ok((envelope, message_id))
}

fn build_transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, SmtpError> {
    let creds = Credentials::new(config.username.clone(), config.password.clone());

    // Port 465 means SMTPS (TLS from the first byte); other ports upgrade
    // with STARTTLS when TLS is enabled at all.
    let builder = if config.port == 465 && config.use_tls {
        debug!("Connecting to {}:{} with implicit TLS", config.host, config.port);
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| SmtpError::Config(format!("SMTP relay error: {}", e)))?
    } else if config.use_tls {
        debug!("Connecting to {}:{} with STARTTLS", config.host, config.port);
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| SmtpError::Config(format!("SMTP relay error: {}", e)))?
    } else {
        warn!("SMTP connection to {} is not encrypted (TLS disabled)", config.host);
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
    };

    Ok(builder
        .port(config.port)
        .credentials(creds)
        .timeout(Some(config.timeout))
        .build())
}

/// Send a raw MIME message, retrying transient failures. Returns the
/// Message-ID header of the sent message.
pub async fn send_raw(config: &SmtpConfig, mime_message: &[u8]) -> Result<String, SmtpError> {
    let (envelope, message_id) = envelope_from_mime(mime_message)?;
    let transport = build_transport(config)?;

    let mut last_error = String::new();
    for attempt in 0..MAX_SEND_ATTEMPTS {
        match transport.send_raw(&envelope, mime_message).await {
            Ok(_) => {
                info!("Message sent successfully: {}", message_id);
                return Ok(message_id);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt + 1 < MAX_SEND_ATTEMPTS {
                    let wait = Duration::from_secs(1 << attempt);
                    warn!(
                        "Send attempt {}/{} failed: {}. Retrying in {:?}...",
                        attempt + 1,
                        MAX_SEND_ATTEMPTS,
                        last_error,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    Err(SmtpError::SendFailed {
        attempts: MAX_SEND_ATTEMPTS,
        last_error,
    })
}
