//! # Credential Vault Module
//!
//! Encrypted storage for provider API keys.
//!
//! Keys are encrypted with ChaCha20-Poly1305 under a master key derived from a configured secret
//! and persisted as a flat JSON array through a [`KeyStore`]. At most one key per provider type is
//! active at a time. Plaintext of active keys is cached in memory so the hot path never decrypts.
//!
//! ## Usage Example
//! ```rust,no_run
//! use ai_gateway::vault::{AddKeyOptions, CredentialVault, InMemoryKeyStore, VaultConfig};
//! use ai_gateway::core::clock::system_clock;
//! use std::sync::Arc;
//!
//! # async fn demo() -> ai_gateway::core::error::GatewayResult<()> {
//! let vault = CredentialVault::open(VaultConfig::default(), Arc::new(InMemoryKeyStore::new()), system_clock()).await?;
//! vault.add_key("openai", "sk-live-123", AddKeyOptions::default()).await?;
//! assert_eq!(vault.get_key("openai").await.as_deref(), Some("sk-live-123"));
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod service;
pub mod store;
pub mod validator;

pub use crypto::{EncryptedValue, KeyCipher};
pub use service::{AddKeyOptions, CredentialVault, VaultStats};
pub use store::{InMemoryKeyStore, JsonFileKeyStore, KeyStore, KeySummary, VaultKeyRecord};
pub use validator::{HttpKeyValidator, KeyStatus, KeyValidator};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Master secret used when none is configured. Only acceptable in development.
pub const DEFAULT_ENCRYPTION_KEY: &str = "default-encryption-key-change-in-production";

/// Conventional environment variables and the key type they provide
pub const ENV_KEY_MAPPINGS: [(&str, &str); 6] = [
    ("ANTHROPIC_API_KEY", "anthropic"),
    ("OPENAI_API_KEY", "openai"),
    ("GOOGLE_API_KEY", "google"),
    ("GEMINI_API_KEY", "gemini"),
    ("GROK_API_KEY", "grok"),
    ("YOUTUBE_API_KEY", "youtube"),
];

/// Vault configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Master secret the encryption key is derived from
    pub encryption_key: String,

    /// JSON file holding the encrypted records; `None` keeps them in memory only
    pub key_file: Option<PathBuf>,

    /// How often expired records are deactivated
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Pick up plaintext keys from the conventional provider env vars on open
    pub load_env_keys: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            encryption_key: DEFAULT_ENCRYPTION_KEY.to_string(),
            key_file: Some(PathBuf::from("data/api-keys.json")),
            cleanup_interval: Duration::from_secs(60 * 60),
            load_env_keys: true,
        }
    }
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("encryption_key", &"[REDACTED]")
            .field("key_file", &self.key_file)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("load_env_keys", &self.load_env_keys)
            .finish()
    }
}
