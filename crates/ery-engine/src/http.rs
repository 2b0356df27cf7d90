use std::time::Duration;

use async_trait::async_trait;
use ery_types::{EryError, Result};

use crate::{EngineClient, EngineReply, JavascriptOp};

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// HttpEngineClient
// ---------------------------------------------------------------------------

/// Client for a remote JavaScript evaluation service.
///
/// Each op is POSTed as JSON to `{base_url}/run`.
#[derive(Debug)]
pub struct HttpEngineClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpEngineClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn endpoint(&self) -> String {
        format!("{}/run", self.base_url)
    }

    /// Reads `ERY_ENGINE_URL` (required) and `ERY_ENGINE_TIMEOUT_MS` (optional).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("ERY_ENGINE_URL")
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| EryError::Other("ERY_ENGINE_URL is not set".to_string()))?;

        let timeout_ms = match lookup("ERY_ENGINE_TIMEOUT_MS") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                EryError::Other(format!("ERY_ENGINE_TIMEOUT_MS is not a number: '{}'", raw))
            })?,
            None => DEFAULT_TIMEOUT_MS,
        };

        Ok(Self::new(url).with_timeout(Duration::from_millis(timeout_ms)))
    }
}

/// Interpret an engine reply body.
fn parse_reply(
    endpoint: &str,
    op: &JavascriptOp,
    status: reqwest::StatusCode,
    body: &str,
) -> Result<serde_json::Value> {
    if !status.is_success() {
        return Err(EryError::EngineHttp {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message: body.chars().take(500).collect(),
        });
    }

    let reply: EngineReply = serde_json::from_str(body).map_err(|e| EryError::EngineHttp {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message: format!("Failed to parse response JSON: {e}"),
    })?;

    if let Some(message) = reply.error {
        return Err(EryError::ScriptEval {
            label: op.name.clone(),
            message,
        });
    }

    Ok(reply.value.unwrap_or(serde_json::Value::Null))
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(&self, op: &JavascriptOp) -> Result<serde_json::Value> {
        let endpoint = self.endpoint();

        let resp = self
            .client
            .post(&endpoint)
            .timeout(self.timeout)
            .json(op)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EryError::EngineTimeout {
                        endpoint: endpoint.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    EryError::EngineTransport(e.to_string())
                }
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| EryError::EngineTransport(e.to_string()))?;

        parse_reply(&endpoint, op, status, &body)
    }
}
