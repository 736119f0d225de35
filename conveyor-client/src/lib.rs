//! Conveyor HTTP Client
//!
//! A type-safe HTTP client for the Conveyor orchestrator API, shared by the
//! CLI and by collaborators delivering triggers and approval decisions.
//!
//! # Example
//!
//! ```no_run
//! use conveyor_client::ConveyorClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ConveyorClient::new("http://localhost:8080");
//!
//!     for run in client.list_runs().await? {
//!         println!("{} {} {}", run.id, run.kind, run.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod approvals;
mod runs;
mod triggers;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

/// HTTP client for the Conveyor orchestrator API
///
/// Endpoints are grouped as:
/// - Triggers (repository pushes, build notifications, rollbacks)
/// - Runs (status, stage events, cancellation)
/// - Approvals (pending requests, decisions)
#[derive(Debug, Clone)]
pub struct ConveyorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    client: Client,
}

impl ConveyorClient {
    /// Create a new client for the orchestrator at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check that the orchestrator answers its health endpoint
    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("Orchestrator answered {}: {}", status, body);
            return Err(ClientError::api_error(status.as_u16(), error_message(&body)));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        self.check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle a response that may legitimately carry no body (204)
    async fn handle_optional_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        self.handle_response(response).await.map(Some)
    }

    /// Handle an API response whose body is irrelevant
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check_status(response).await.map(|_| ())
    }
}

/// Extracts the `error` field of the orchestrator's JSON error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.to_string())
}
