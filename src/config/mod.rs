//! Process configuration.
//!
//! Structure comes from a TOML file (path in `KEYRELAY_CONFIG`, default
//! `keyrelay.toml`); every section is optional and falls back to defaults.
//! Secrets are never read from the file; they are resolved from the
//! environment at startup (`KEYRELAY_PROVISIONING_KEY`,
//! `KEYRELAY_KEY_PASSWORD`, and `KEYRELAY_<TARGET>_API_KEY` /
//! `KEYRELAY_<TARGET>_ADMIN_API_KEY` per proxy target).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

/// Complete keyrelay configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KeyrelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "keyrelay.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Bearer token verification settings.
///
/// `disabled = true` trusts every request unconditionally; only meant for
/// local development.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub team_domain: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Session key lifecycle policy.
///
/// An issued key is valid for `expiry_seconds` from issuance. The sweep
/// runs every `sweep_interval_seconds` and only touches rows that are
/// already expired. `reservation_skew_seconds` is the margin subtracted
/// from a key's remaining lifetime when deciding whether it can still be
/// handed out.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_expiry_seconds")]
    pub expiry_seconds: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_reservation_skew")]
    pub reservation_skew_seconds: i64,
}

fn default_expiry_seconds() -> i64 {
    900
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_reservation_skew() -> i64 {
    120
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: default_expiry_seconds(),
            sweep_interval_seconds: default_sweep_interval(),
            reservation_skew_seconds: default_reservation_skew(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the provider key-management API
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
}

fn default_upstream_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_targets")]
    pub targets: Vec<ProxyTargetConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            targets: default_proxy_targets(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyTargetConfig {
    pub name: String,
    pub base_url: String,
    /// First path segment routed with the admin credential instead of the
    /// regular one (e.g. `organization` for org-scoped admin endpoints)
    #[serde(default)]
    pub admin_prefix: Option<String>,
}

fn default_proxy_targets() -> Vec<ProxyTargetConfig> {
    vec![
        ProxyTargetConfig {
            name: "openrouter".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            admin_prefix: None,
        },
        ProxyTargetConfig {
            name: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            admin_prefix: Some("organization".to_string()),
        },
    ]
}

/// A proxy target with its credentials resolved
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub base_url: String,
    pub api_key: String,
    pub admin_prefix: Option<String>,
    pub admin_api_key: Option<String>,
}

/// Secrets resolved from the environment, kept out of the config file
#[derive(Clone)]
pub struct Secrets {
    /// Credential for the upstream key-management API
    pub provisioning_key: String,
    /// Password the crypto codec derives the blob key from
    pub key_password: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        let provisioning_key = std::env::var("KEYRELAY_PROVISIONING_KEY")
            .context("KEYRELAY_PROVISIONING_KEY is not set")?;
        let key_password = std::env::var("KEYRELAY_KEY_PASSWORD")
            .context("KEYRELAY_KEY_PASSWORD is not set")?;
        Ok(Self {
            provisioning_key,
            key_password,
        })
    }
}

impl KeyrelayConfig {
    /// Reject configurations that cannot serve authenticated traffic.
    pub fn validate(&self) -> Result<()> {
        if !self.auth.disabled && (self.auth.team_domain.is_empty() || self.auth.audience.is_empty())
        {
            bail!("auth.team_domain and auth.audience are required unless auth.disabled is set");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file; a missing file yields the defaults.
pub fn load_config(path: &str) -> Result<KeyrelayConfig> {
    if !std::path::Path::new(path).exists() {
        warn!(path = %path, "config file not found, using defaults");
        return Ok(KeyrelayConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path))?;
    let config: KeyrelayConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path))?;
    Ok(config)
}

/// Resolve the static proxy target table.
///
/// Credentials come from `KEYRELAY_<NAME>_API_KEY` and (optionally)
/// `KEYRELAY_<NAME>_ADMIN_API_KEY`. Targets without a credential are left
/// out of the table rather than forwarded without one.
pub fn resolve_targets(targets: &[ProxyTargetConfig]) -> HashMap<String, ProxyTarget> {
    let mut resolved = HashMap::new();
    for target in targets {
        let env_prefix = target.name.to_uppercase().replace('-', "_");
        let api_key = match std::env::var(format!("KEYRELAY_{}_API_KEY", env_prefix)) {
            Ok(key) => key,
            Err(_) => {
                warn!(target = %target.name, "no API key in environment, target disabled");
                continue;
            }
        };
        let admin_api_key = std::env::var(format!("KEYRELAY_{}_ADMIN_API_KEY", env_prefix)).ok();
        resolved.insert(
            target.name.clone(),
            ProxyTarget {
                base_url: target.base_url.trim_end_matches('/').to_string(),
                api_key,
                admin_prefix: target.admin_prefix.clone(),
                admin_api_key,
            },
        );
    }
    resolved
}
