//! Session key lifecycle: issue, reuse, revoke, sweep.
//!
//! The broker's model is "at least one usable key exists", not "exactly
//! one": two concurrent requests that both miss the store may both issue a
//! key upstream. That is tolerated: the extra key simply expires and the
//! sweep reclaims it. Revocation is double-delete tolerant because local
//! and upstream state can diverge under partial failure.

use crate::config::LifecycleConfig;
use crate::crypto;
use crate::store::{Credential, KeyStore};
use crate::upstream::{DeleteOutcome, ProvisioningClient};
use anyhow::{bail, Result};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct SessionKeyBroker {
    store: Arc<KeyStore>,
    upstream: Arc<ProvisioningClient>,
    key_password: String,
    expiry_seconds: i64,
    reservation_skew: i64,
}

impl SessionKeyBroker {
    pub fn new(
        store: Arc<KeyStore>,
        upstream: Arc<ProvisioningClient>,
        key_password: String,
        lifecycle: &LifecycleConfig,
    ) -> Self {
        Self {
            store,
            upstream,
            key_password,
            expiry_seconds: lifecycle.expiry_seconds,
            reservation_skew: lifecycle.reservation_skew_seconds,
        }
    }

    /// Some credential that will stay valid for at least the reservation
    /// skew, if one exists. Side-effect-free.
    pub fn available_key(&self) -> Result<Option<Credential>> {
        self.store
            .available_key(Utc::now().timestamp(), self.reservation_skew)
    }

    /// Provisions a new key upstream, encrypts it, and persists the record.
    pub async fn issue_key(&self) -> Result<Credential> {
        let api_id = Uuid::new_v4().to_string();
        let provisioned = self.upstream.create_key(&api_id).await?;
        let encrypted_key = crypto::encrypt_api_key(&provisioned.key, &self.key_password)?;

        let created_at = Utc::now().timestamp();
        let credential = Credential {
            api_id,
            encrypted_key,
            api_hash: provisioned.hash,
            created_at,
            expires_at: created_at + self.expiry_seconds,
        };
        self.store.insert(&credential)?;
        info!(hash = %credential.api_hash, expires_at = credential.expires_at, "issued session key");
        Ok(credential)
    }

    /// Reuse-or-issue composition behind the session endpoint.
    pub async fn session_key(&self) -> Result<Credential> {
        if let Some(credential) = self.available_key()? {
            return Ok(credential);
        }
        self.issue_key().await
    }

    /// Revokes one key upstream and, on confirmation, locally.
    ///
    /// An upstream "not found" counts as confirmation; the key is gone
    /// either way. Anything else leaves the local record in place so the
    /// sweep retries on its next pass.
    pub async fn release_key(&self, api_hash: &str) -> Result<()> {
        match self.upstream.delete_key(api_hash).await? {
            DeleteOutcome::Deleted => {
                self.store.remove(api_hash)?;
                info!(hash = %api_hash, "revoked session key");
                Ok(())
            }
            DeleteOutcome::NotFound => {
                self.store.remove(api_hash)?;
                info!(hash = %api_hash, "upstream already dropped key, removed local record");
                Ok(())
            }
            DeleteOutcome::Rejected => bail!("upstream refused to delete key {}", api_hash),
        }
    }

    /// Revokes every credential that has already expired.
    pub async fn sweep_expired(&self) -> Result<()> {
        let expired = self.store.expired_hashes(Utc::now().timestamp())?;
        if expired.is_empty() {
            return Ok(());
        }
        info!(count = expired.len(), "sweeping expired session keys");
        self.release_batch(&expired).await;
        Ok(())
    }

    /// Revokes every tracked credential regardless of expiry. Called once
    /// at startup (state left by a crashed run) and once at shutdown.
    pub async fn remove_all(&self) -> Result<()> {
        let hashes = self.store.all_hashes()?;
        if hashes.is_empty() {
            return Ok(());
        }
        info!(count = hashes.len(), "revoking all tracked session keys");
        self.release_batch(&hashes).await;
        Ok(())
    }

    /// Fan-out release with per-key error isolation: one upstream failure
    /// never aborts the rest of the batch.
    async fn release_batch(&self, hashes: &[String]) {
        let outcomes = join_all(
            hashes
                .iter()
                .map(|hash| async move { (hash, self.release_key(hash).await) }),
        )
        .await;

        for (hash, outcome) in outcomes {
            if let Err(error) = outcome {
                warn!(hash = %hash, error = %error, "failed to release session key, keeping record for retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn broker_for(server: &MockServer, store: Arc<KeyStore>) -> SessionKeyBroker {
        let upstream = Arc::new(ProvisioningClient::new(
            reqwest::Client::new(),
            &server.base_url(),
            "prov-key".to_string(),
        ));
        SessionKeyBroker::new(
            store,
            upstream,
            "blob-password".to_string(),
            &LifecycleConfig::default(),
        )
    }

    fn mock_create<'a>(server: &'a MockServer, hash: &str) -> httpmock::Mock<'a> {
        let body = serde_json::json!({
            "key": "sk-or-v1-plaintext",
            "data": {"hash": hash}
        });
        server.mock(move |when, then| {
            when.method(POST).path("/keys");
            then.status(200).json_body(body.clone());
        })
    }

    fn mock_delete_ok<'a>(server: &'a MockServer, hash: &str) -> httpmock::Mock<'a> {
        let path = format!("/keys/{}", hash);
        server.mock(move |when, then| {
            when.method(DELETE).path(path.clone());
            then.status(200).json_body(serde_json::json!({"deleted": true}));
        })
    }

    #[tokio::test]
    async fn test_issue_key_window_is_exact() {
        let server = MockServer::start();
        mock_create(&server, "abc123");
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        let broker = broker_for(&server, store.clone());

        let credential = broker.issue_key().await.unwrap();
        assert_eq!(credential.api_hash, "abc123");
        assert_eq!(
            credential.expires_at - credential.created_at,
            LifecycleConfig::default().expiry_seconds
        );
        assert!(!credential.encrypted_key.is_empty());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_issue_key_failure_persists_nothing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/keys");
            then.status(500).body("boom");
        });
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        let broker = broker_for(&server, store.clone());

        assert!(broker.issue_key().await.is_err());
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_session_key_reuses_available_credential() {
        let server = MockServer::start();
        let create = mock_create(&server, "abc123");
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        let broker = broker_for(&server, store);

        let first = broker.session_key().await.unwrap();
        let second = broker.session_key().await.unwrap();

        // Second call is served from the store; no new upstream issuance
        create.assert_hits(1);
        assert_eq!(first.api_hash, second.api_hash);
        assert_eq!(first.encrypted_key, second.encrypted_key);
    }

    #[tokio::test]
    async fn test_release_key_confirmed() {
        let server = MockServer::start();
        mock_create(&server, "abc123");
        mock_delete_ok(&server, "abc123");
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        let broker = broker_for(&server, store.clone());

        broker.issue_key().await.unwrap();
        broker.release_key("abc123").await.unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_release_key_not_found_upstream_still_succeeds() {
        let server = MockServer::start();
        mock_create(&server, "abc123");
        server.mock(|when, then| {
            when.method(DELETE).path("/keys/abc123");
            then.status(404)
                .json_body(serde_json::json!({"error": {"message": "API key not found"}}));
        });
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        let broker = broker_for(&server, store.clone());

        broker.issue_key().await.unwrap();
        // Double-delete tolerance: both calls succeed, no record remains
        broker.release_key("abc123").await.unwrap();
        broker.release_key("abc123").await.unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_release_key_transient_failure_keeps_record() {
        let server = MockServer::start();
        mock_create(&server, "abc123");
        server.mock(|when, then| {
            when.method(DELETE).path("/keys/abc123");
            then.status(429)
                .json_body(serde_json::json!({"error": {"message": "rate limited"}}));
        });
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        let broker = broker_for(&server, store.clone());

        broker.issue_key().await.unwrap();
        assert!(broker.release_key("abc123").await.is_err());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_isolates_per_key_failures() {
        let server = MockServer::start();
        mock_delete_ok(&server, "good-1");
        mock_delete_ok(&server, "good-2");
        server.mock(|when, then| {
            when.method(DELETE).path("/keys/bad");
            then.status(500).body("boom");
        });

        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        for hash in ["good-1", "bad", "good-2"] {
            store
                .insert(&Credential {
                    api_id: format!("id-{}", hash),
                    encrypted_key: "blob".to_string(),
                    api_hash: hash.to_string(),
                    created_at: 0,
                    expires_at: 1,
                })
                .unwrap();
        }
        let broker = broker_for(&server, store.clone());

        broker.sweep_expired().await.unwrap();

        // The failing key survives for the next pass; the others are gone
        let remaining = store.all_hashes().unwrap();
        assert_eq!(remaining, vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_skips_live_credentials() {
        let server = MockServer::start();
        let delete = mock_delete_ok(&server, "live");
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        store
            .insert(&Credential {
                api_id: "id-live".to_string(),
                encrypted_key: "blob".to_string(),
                api_hash: "live".to_string(),
                created_at: Utc::now().timestamp(),
                expires_at: Utc::now().timestamp() + 900,
            })
            .unwrap();
        let broker = broker_for(&server, store.clone());

        broker.sweep_expired().await.unwrap();
        delete.assert_hits(0);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_ignores_expiry() {
        let server = MockServer::start();
        mock_delete_ok(&server, "old");
        mock_delete_ok(&server, "fresh");
        let store = Arc::new(KeyStore::open(":memory:").unwrap());
        for (hash, expires_at) in [("old", 1), ("fresh", Utc::now().timestamp() + 900)] {
            store
                .insert(&Credential {
                    api_id: format!("id-{}", hash),
                    encrypted_key: "blob".to_string(),
                    api_hash: hash.to_string(),
                    created_at: 0,
                    expires_at,
                })
                .unwrap();
        }
        let broker = broker_for(&server, store.clone());

        broker.remove_all().await.unwrap();
        assert!(store.is_empty().unwrap());
    }
}
