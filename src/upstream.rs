//! Client for the upstream provider's key-management API.
//!
//! Covers the three control-plane calls the broker needs: provisioning a
//! runtime key, deleting one by hash, and reading the account's credit
//! balance. Proxied inference traffic does not go through this client.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Bounded timeout on every control-plane call; a hung upstream must not
/// stall request handling or the sweep.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// A key returned by the provider's creation endpoint.
#[derive(Debug, Clone)]
pub struct ProvisionedKey {
    /// Plaintext key, encrypted by the caller before it is stored anywhere
    pub key: String,
    /// Provider-assigned stable hash, used for deletion
    pub hash: String,
}

/// Result of a deletion attempt, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Provider confirmed the deletion
    Deleted,
    /// Provider no longer knows the key; local and upstream state diverged
    NotFound,
    /// Provider answered but refused; worth retrying later
    Rejected,
}

/// Account billing snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Expense {
    pub usage: f64,
    pub total: f64,
}

#[derive(Deserialize)]
struct CreateKeyResponse {
    key: String,
    data: CreateKeyData,
}

#[derive(Deserialize)]
struct CreateKeyData {
    hash: String,
}

#[derive(Deserialize)]
struct CreditsResponse {
    data: CreditsData,
}

#[derive(Deserialize)]
struct CreditsData {
    total_usage: f64,
    total_credits: f64,
}

pub struct ProvisioningClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ProvisioningClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Provisions a new runtime key named `name`.
    ///
    /// Any HTTP failure, non-2xx status, or response missing the key or
    /// hash is an error; a partially constructed key is never returned.
    pub async fn create_key(&self, name: &str) -> Result<ProvisionedKey> {
        let response = self
            .http
            .post(format!("{}/keys", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "name": name,
                "include_byok_in_limit": true,
            }))
            .send()
            .await
            .context("key creation request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("key creation returned {}: {}", status, body));
        }

        let parsed: CreateKeyResponse = response
            .json()
            .await
            .context("malformed key creation response")?;

        Ok(ProvisionedKey {
            key: parsed.key,
            hash: parsed.data.hash,
        })
    }

    /// Deletes the key identified by `hash`.
    ///
    /// The provider's answer is read from the body rather than the status:
    /// `{"deleted": true}` confirms, an `"API key not found"` error means
    /// the key is already gone upstream. Transport errors and unparseable
    /// bodies propagate as `Err` so the caller can retry later.
    pub async fn delete_key(&self, hash: &str) -> Result<DeleteOutcome> {
        let response = self
            .http
            .delete(format!("{}/keys/{}", self.base_url, hash))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("key deletion request failed")?;

        let body: Value = response
            .json()
            .await
            .context("malformed key deletion response")?;

        if body.get("deleted").and_then(Value::as_bool) == Some(true) {
            return Ok(DeleteOutcome::Deleted);
        }
        let error_message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str);
        if error_message == Some("API key not found") {
            return Ok(DeleteOutcome::NotFound);
        }
        debug!(hash = %hash, body = %body, "upstream rejected key deletion");
        Ok(DeleteOutcome::Rejected)
    }

    /// Reads the account's usage and credit totals.
    pub async fn credits(&self) -> Result<Expense> {
        let response = self
            .http
            .get(format!("{}/credits", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("credits request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("credits endpoint returned {}", response.status()));
        }

        let parsed: CreditsResponse = response
            .json()
            .await
            .context("malformed credits response")?;

        Ok(Expense {
            usage: parsed.data.total_usage,
            total: parsed.data.total_credits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> ProvisioningClient {
        ProvisioningClient::new(
            reqwest::Client::new(),
            &server.base_url(),
            "prov-key".to_string(),
        )
    }

    #[tokio::test]
    async fn test_create_key_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/keys")
                .header("authorization", "Bearer prov-key")
                .json_body_partial(r#"{"include_byok_in_limit": true}"#);
            then.status(200).json_body(serde_json::json!({
                "key": "sk-or-v1-plaintext",
                "data": {"hash": "abc123", "name": "x", "disabled": false}
            }));
        });

        let provisioned = client(&server).create_key("req-name").await.unwrap();
        mock.assert();
        assert_eq!(provisioned.key, "sk-or-v1-plaintext");
        assert_eq!(provisioned.hash, "abc123");
    }

    #[tokio::test]
    async fn test_create_key_missing_hash_is_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/keys");
            then.status(200)
                .json_body(serde_json::json!({"key": "sk-or-v1-plaintext", "data": {}}));
        });

        assert!(client(&server).create_key("req-name").await.is_err());
    }

    #[tokio::test]
    async fn test_create_key_http_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/keys");
            then.status(500).body("boom");
        });

        assert!(client(&server).create_key("req-name").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_key_outcomes() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(DELETE).path("/keys/confirmed");
            then.status(200).json_body(serde_json::json!({"deleted": true}));
        });
        server.mock(|when, then| {
            when.method(DELETE).path("/keys/gone");
            then.status(404)
                .json_body(serde_json::json!({"error": {"message": "API key not found"}}));
        });
        server.mock(|when, then| {
            when.method(DELETE).path("/keys/refused");
            then.status(429)
                .json_body(serde_json::json!({"error": {"message": "rate limited"}}));
        });

        let client = client(&server);
        assert_eq!(
            client.delete_key("confirmed").await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            client.delete_key("gone").await.unwrap(),
            DeleteOutcome::NotFound
        );
        assert_eq!(
            client.delete_key("refused").await.unwrap(),
            DeleteOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn test_credits() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/credits");
            then.status(200).json_body(serde_json::json!({
                "data": {"total_usage": 1.25, "total_credits": 10.0}
            }));
        });

        let expense = client(&server).credits().await.unwrap();
        assert_eq!(
            expense,
            Expense {
                usage: 1.25,
                total: 10.0
            }
        );
    }
}
