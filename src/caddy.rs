//! Low-level client for the Caddy admin API
//!
//! Two operations: fetch the full configuration tree and replace a server's
//! routes array. Every call carries a bounded timeout and is attempted
//! exactly once; retry policy, if any, belongs to the caller.

use crate::error::{Error, Result};
use crate::routes::Route;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Default per-request timeout for admin API calls
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// HTTP client for a single Caddy admin endpoint
#[derive(Debug, Clone)]
pub struct CaddyClient {
    base_url: String,
    client: reqwest::Client,
}

impl CaddyClient {
    /// Create a client for the given admin API base URL
    /// (e.g. `http://localhost:2019`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET the full configuration tree.
    ///
    /// Read-only. Fails with `RemoteUnavailable` on network error, timeout,
    /// or non-2xx status.
    pub async fn fetch_config(&self) -> Result<Value> {
        let url = format!("{}/config/", self.base_url);
        debug!(url = %url, "Fetching Caddy configuration");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::RemoteUnavailable(format!(
                "GET /config/ returned {}",
                response.status().as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::RemoteUnavailable(format!("invalid config JSON: {}", e)))
    }

    /// PATCH the complete routes array of one HTTP server.
    ///
    /// Caddy often answers 2xx with an empty or plain-text body; that is
    /// still success. Returns the response payload: `Null` for an empty
    /// body, the parsed value for JSON, the raw text otherwise. Non-2xx
    /// fails with `RemoteRejected` carrying the body verbatim.
    pub async fn replace_routes(&self, server_key: &str, routes: &[Route]) -> Result<Value> {
        let url = format!(
            "{}/config/apps/http/servers/{}/routes",
            self.base_url, server_key
        );
        debug!(url = %url, count = routes.len(), "Replacing routes array");

        let response = self
            .client
            .patch(&url)
            .json(routes)
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::RemoteRejected {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Cheap reachability probe: can we GET the configuration tree?
    pub async fn check_status(&self) -> CaddyStatus {
        match self.fetch_config().await {
            Ok(_) => CaddyStatus::Running,
            Err(e) => CaddyStatus::Unreachable(e.to_string()),
        }
    }
}

/// Outcome of a reachability probe against the admin API
#[derive(Debug, Clone, PartialEq)]
pub enum CaddyStatus {
    Running,
    Unreachable(String),
}
