//! HTTP client for the remote tool endpoint.
//!
//! Tools are discovered with `GET /api/tools` and invoked with
//! `POST /api/tools/{server}/{tool}`. Discovery results are cached until
//! invalidated.

use std::sync::RwLock;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:8085";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("cannot connect to tool gateway at {0}")]
    Unreachable(String),

    #[error("timeout calling tool gateway: {0}")]
    Timeout(String),

    #[error("tool gateway returned error: {0}")]
    Http(String),

    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_connect() {
            GatewayError::Unreachable(err.to_string())
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Http(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: Value,
}

pub struct GatewayClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
    tools: RwLock<Option<Vec<ToolDescriptor>>>,
}

impl GatewayClient {
    pub fn new(base_url: &str, timeout_seconds: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_seconds),
            http: reqwest::Client::new(),
            tools: RwLock::new(None),
        }
    }

    /// Fetch the tool list from the gateway and cache it.
    pub async fn discover_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let response = self
            .http
            .get(format!("{}/api/tools", self.base_url))
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Http(format!(
                "status {} from {}",
                response.status(),
                self.base_url
            )));
        }

        let tools: Vec<ToolDescriptor> = response.json().await?;
        info!("Discovered {} tools from gateway", tools.len());

        let mut cache = self.tools.write().expect("tool cache poisoned");
        *cache = Some(tools.clone());
        Ok(tools)
    }

    /// Drop the cached tool list; the next check re-discovers.
    pub fn invalidate(&self) {
        let mut cache = self.tools.write().expect("tool cache poisoned");
        *cache = None;
        debug!("Tool cache invalidated");
    }

    /// Whether `(server, tool)` is known to the gateway. Unreachable gateways
    /// answer false.
    pub async fn has_tool(&self, server: &str, tool: &str) -> bool {
        let cached = {
            let cache = self.tools.read().expect("tool cache poisoned");
            cache.clone()
        };

        let tools = match cached {
            Some(tools) => tools,
            None => match self.discover_tools().await {
                Ok(tools) => tools,
                Err(_) => return false,
            },
        };

        tools
            .iter()
            .any(|t| t.server_id == server && t.name == tool)
    }

    /// Invoke a tool and return its structured result.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}/api/tools/{}/{}", self.base_url, server, tool);
        debug!("Calling tool {}/{}", server, tool);

        let response = self
            .http
            .post(&url)
            .json(&json!({ "arguments": arguments }))
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Http(format!(
                "tool call {}/{} failed with status {}",
                server,
                tool,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = GatewayClient::new("http://localhost:8085/", 30);
        assert_eq!(client.base_url, "http://localhost:8085");
    }

    #[tokio::test]
    async fn unknown_tool_when_gateway_unreachable() {
        // Port 9 is the discard protocol; nothing should answer.
        let client = GatewayClient::new("http://127.0.0.1:9", 1);
        assert!(!client.has_tool("mcp-dav", "create_contact").await);
    }
}
