//! Remote business-API boundary.
//!
//! The core only needs two seams: `Dispatcher` replays one queued
//! mutation, `ReferenceFetcher` pulls the reference datasets for
//! pre-caching. Both resolve on success and reject with a
//! human-readable reason string — request/response shapes beyond that
//! belong to the hosted API. `RemoteClient` is the reqwest
//! implementation used in production; tests substitute stubs.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Replays one queued mutation against the remote API.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Resolve = the remote accepted the mutation. Err carries a
    /// human-readable reason for logging and queue bookkeeping.
    async fn dispatch(&self, kind: &str, payload: &Value) -> Result<(), String>;
}

/// Named fetches for the reference datasets cached for offline reads.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch_products(&self, tenant_id: &str) -> Result<Vec<Value>, String>;
    async fn fetch_customers(&self, tenant_id: &str) -> Result<Vec<Value>, String>;
    async fn fetch_vehicles(&self, tenant_id: &str) -> Result<Vec<Value>, String>;
    async fn fetch_warehouses(&self, tenant_id: &str) -> Result<Vec<Value>, String>;
    async fn fetch_employees(&self, tenant_id: &str) -> Result<Vec<Value>, String>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the business API base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach business API at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid business API URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Client not authorized".to_string(),
        404 => "Business API endpoint not found".to_string(),
        s if s >= 500 => format!("Business API server error (HTTP {s})"),
        s => format!("Unexpected response from business API (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Routes each action kind to its mutation endpoint. `None` means the
/// current build has no route — the action stays queued.
fn dispatch_path(kind: &str) -> Option<&'static str> {
    match kind {
        "create-trip" => Some("/api/client/trips"),
        "update-trip" => Some("/api/client/trips/update"),
        "create-sale" => Some("/api/client/sales"),
        "update-stock" => Some("/api/client/stock/adjust"),
        "create-customer" => Some("/api/client/customers"),
        "create-expense" => Some("/api/client/expenses"),
        "clock-in" => Some("/api/client/attendance/clock-in"),
        "clock-out" => Some("/api/client/attendance/clock-out"),
        "create-stock-movement" => Some("/api/client/stock/movements"),
        _ => None,
    }
}

/// Authenticated reqwest client for the hosted business API.
pub struct RemoteClient {
    base_url: String,
    api_key: String,
    tenant_id: String,
    client: Client,
}

impl RemoteClient {
    pub fn new(base_url: &str, api_key: &str, tenant_id: &str) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            tenant_id: tenant_id.trim().to_string(),
            client,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(), String> {
        let full_url = format!("{}{path}", self.base_url);
        debug!(url = %full_url, "dispatching queued mutation");

        let resp = self
            .client
            .post(&full_url)
            .header("X-Client-API-Key", &self.api_key)
            .header("x-tenant-id", &self.tenant_id)
            .json(body)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        // Preserve server detail where available for queue diagnostics.
        let body_text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body_text)
            .ok()
            .and_then(|json| {
                json.get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| status_error(status));
        Err(format!("{message} (HTTP {})", status.as_u16()))
    }

    async fn fetch_dataset(&self, path: &str, tenant_id: &str) -> Result<Vec<Value>, String> {
        let full_url = format!("{}{path}", self.base_url);

        let resp = self
            .client
            .get(&full_url)
            .query(&[("tenant_id", tenant_id)])
            .header("X-Client-API-Key", &self.api_key)
            .header("x-tenant-id", &self.tenant_id)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("{} (HTTP {})", status_error(status), status.as_u16()));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("Invalid JSON from business API: {e}"))?;

        // Accept either a bare array or the `{ "data": [...] }` envelope.
        let records = body
            .get("data")
            .cloned()
            .unwrap_or(body)
            .as_array()
            .cloned()
            .ok_or_else(|| format!("Expected a record array from {path}"))?;
        Ok(records)
    }
}

#[async_trait]
impl Dispatcher for RemoteClient {
    async fn dispatch(&self, kind: &str, payload: &Value) -> Result<(), String> {
        let path = dispatch_path(kind)
            .ok_or_else(|| format!("No remote route for action kind '{kind}'"))?;
        self.post(path, payload).await
    }
}

#[async_trait]
impl ReferenceFetcher for RemoteClient {
    async fn fetch_products(&self, tenant_id: &str) -> Result<Vec<Value>, String> {
        self.fetch_dataset("/api/client/products", tenant_id).await
    }

    async fn fetch_customers(&self, tenant_id: &str) -> Result<Vec<Value>, String> {
        self.fetch_dataset("/api/client/customers", tenant_id).await
    }

    async fn fetch_vehicles(&self, tenant_id: &str) -> Result<Vec<Value>, String> {
        self.fetch_dataset("/api/client/vehicles", tenant_id).await
    }

    async fn fetch_warehouses(&self, tenant_id: &str) -> Result<Vec<Value>, String> {
        self.fetch_dataset("/api/client/warehouses", tenant_id).await
    }

    async fn fetch_employees(&self, tenant_id: &str) -> Result<Vec<Value>, String> {
        self.fetch_dataset("/api/client/employees", tenant_id).await
    }
}
