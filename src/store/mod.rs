//! Durable record of issued session keys, backed by SQLite.
//!
//! One row per credential, keyed by the provider-assigned hash. The secret
//! column holds the encrypted blob produced by [`crate::crypto`]; the
//! plaintext key never touches disk.
//!
//! # Thread Safety
//! - Connection is wrapped in Mutex for safe concurrent access
//! - Each operation targets at most one row by key or scans read-only,
//!   so no cross-row transaction is needed

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// One upstream API key tracked by the broker.
///
/// `api_hash` is the provider's stable identifier for the key, used for
/// deletion. `encrypted_key` is opaque after creation; the server never
/// decrypts it. Timestamps are UTC epoch seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct Credential {
    /// Identifier chosen by the broker when requesting the key (not secret)
    pub api_id: String,
    /// Encrypted key blob, transport-safe
    pub encrypted_key: String,
    /// Provider-assigned hash, primary key
    pub api_hash: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// SQLite-backed credential store.
///
/// # Schema
/// ```sql
/// CREATE TABLE session_keys (
///     api_hash TEXT PRIMARY KEY,
///     api_id TEXT NOT NULL,
///     api_key TEXT NOT NULL,       -- Encrypted blob
///     created_at INTEGER NOT NULL, -- UTC epoch seconds
///     expires_at INTEGER NOT NULL
/// );
/// ```
pub struct KeyStore {
    conn: Mutex<Connection>,
}

impl KeyStore {
    /// Creates or opens a key store, creating the schema if needed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("failed to open key store database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS session_keys (
                api_hash TEXT PRIMARY KEY,
                api_id TEXT NOT NULL,
                api_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .context("failed to create session_keys table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persists a freshly issued credential.
    pub fn insert(&self, credential: &Credential) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO session_keys (api_hash, api_id, api_key, created_at, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    credential.api_hash,
                    credential.api_id,
                    credential.encrypted_key,
                    credential.created_at,
                    credential.expires_at,
                ],
            )
            .context("failed to store credential")?;
        Ok(())
    }

    /// Returns some credential still usable at `now` with `skew` seconds of
    /// margin, i.e. `expires_at > now + skew`. No ordering guarantee beyond
    /// "currently usable".
    pub fn available_key(&self, now: i64, skew: i64) -> Result<Option<Credential>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT api_hash, api_id, api_key, created_at, expires_at
                FROM session_keys
                WHERE expires_at > ?1
                LIMIT 1
                "#,
            )
            .context("failed to prepare availability query")?;

        let mut rows = stmt
            .query(params![now + skew])
            .context("failed to query available keys")?;

        match rows.next().context("failed to read credential row")? {
            Some(row) => Ok(Some(Credential {
                api_hash: row.get(0)?,
                api_id: row.get(1)?,
                encrypted_key: row.get(2)?,
                created_at: row.get(3)?,
                expires_at: row.get(4)?,
            })),
            None => Ok(None),
        }
    }

    /// Hashes of all credentials with `expires_at <= now`.
    pub fn expired_hashes(&self, now: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT api_hash FROM session_keys WHERE expires_at <= ?1")
            .context("failed to prepare expiry query")?;

        let hashes = stmt
            .query_map(params![now], |row| row.get(0))
            .context("failed to query expired keys")?
            .collect::<Result<Vec<String>, _>>()
            .context("failed to read expired keys")?;
        Ok(hashes)
    }

    /// Hashes of every tracked credential, regardless of expiry.
    pub fn all_hashes(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT api_hash FROM session_keys")
            .context("failed to prepare listing query")?;

        let hashes = stmt
            .query_map([], |row| row.get(0))
            .context("failed to list keys")?
            .collect::<Result<Vec<String>, _>>()
            .context("failed to read keys")?;
        Ok(hashes)
    }

    /// Deletes a credential by hash. Returns false if no row existed.
    pub fn remove(&self, api_hash: &str) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM session_keys WHERE api_hash = ?1",
                params![api_hash],
            )
            .context("failed to delete credential")?;
        Ok(rows_affected > 0)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM session_keys", [], |row| row.get(0))
            .context("failed to count credentials")?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
