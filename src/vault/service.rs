//! The credential vault itself.

use super::crypto::KeyCipher;
use super::store::{KeyStore, KeySummary, VaultKeyRecord};
use super::validator::{HttpKeyValidator, KeyStatus, KeyValidator};
use super::{VaultConfig, ENV_KEY_MAPPINGS};
use crate::core::clock::SharedClock;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::tasks::BackgroundTask;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Options for [`CredentialVault::add_key`]
#[derive(Debug, Clone, Default)]
pub struct AddKeyOptions {
    pub label: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AddKeyOptions {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Vault summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStats {
    pub store: String,
    pub total_keys: usize,
    pub active_keys: usize,
    pub cached_keys: usize,
    pub active_by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct CachedKey {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct VaultInner {
    cipher: KeyCipher,
    store: Arc<dyn KeyStore>,
    clock: SharedClock,
    records: RwLock<Vec<VaultKeyRecord>>,
    cache: DashMap<String, CachedKey>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl VaultInner {
    /// Apply `edit` to a copy of the record set and save it. The copy replaces the live records
    /// only once the store accepted it. `edit` returning `None` means nothing changed.
    ///
    /// Commits are serialized, so every edit starts from the last saved state.
    async fn commit<T, F>(&self, edit: F) -> GatewayResult<Option<T>>
    where
        F: FnOnce(&mut Vec<VaultKeyRecord>) -> Option<T>,
    {
        let _guard = self.persist_lock.lock().await;
        let mut next = self.records.read().clone();
        let Some(outcome) = edit(&mut next) else {
            return Ok(None);
        };

        self.store.save(&next).await?;
        *self.records.write() = next;
        Ok(Some(outcome))
    }

    async fn deactivate_expired(&self) -> GatewayResult<usize> {
        let now = self.clock.now();
        let expired = self
            .commit(|records| {
                let expired: Vec<(String, String)> = records
                    .iter_mut()
                    .filter(|r| r.is_active && r.is_expired(now))
                    .map(|r| {
                        r.is_active = false;
                        r.updated_at = now;
                        (r.id.clone(), r.key_type.clone())
                    })
                    .collect();
                (!expired.is_empty()).then_some(expired)
            })
            .await?;

        let Some(expired) = expired else {
            return Ok(0);
        };

        for (id, key_type) in &expired {
            self.cache.remove(key_type);
            info!(key_id = %id, key_type = %key_type, "Expired API key deactivated");
        }
        Ok(expired.len())
    }
}

/// Encrypted API key storage with an in-memory plaintext cache
pub struct CredentialVault {
    inner: Arc<VaultInner>,
    config: VaultConfig,
    validator: Arc<dyn KeyValidator>,
    cleanup: Mutex<Option<BackgroundTask>>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("store", &self.inner.store.describe())
            .field("keys", &self.inner.records.read().len())
            .finish()
    }
}

impl CredentialVault {
    /// Load the vault from `store`.
    ///
    /// A store that was never written opens empty. Unreadable or corrupt storage is an error so a
    /// later save cannot overwrite keys that merely failed to load.
    pub async fn open(config: VaultConfig, store: Arc<dyn KeyStore>, clock: SharedClock) -> GatewayResult<Self> {
        let records = store.load().await?;
        let loaded = records.len();

        let vault = Self {
            inner: Arc::new(VaultInner {
                cipher: KeyCipher::from_secret(&config.encryption_key),
                store,
                clock,
                records: RwLock::new(records),
                cache: DashMap::new(),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
            config,
            validator: Arc::new(HttpKeyValidator::default()),
            cleanup: Mutex::new(None),
        };

        if vault.config.load_env_keys {
            vault.load_env_keys_from(|name| std::env::var(name).ok());
        }

        info!(
            store = %vault.inner.store.describe(),
            keys = loaded,
            "Credential vault opened"
        );
        Ok(vault)
    }

    /// Replace the validator used by [`validate_key`](Self::validate_key)
    pub fn with_validator(mut self, validator: Arc<dyn KeyValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Cache plaintext keys found in the conventional provider variables. Returns how many.
    pub fn load_env_keys_from<F>(&self, lookup: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut loaded = 0;
        for (var, key_type) in ENV_KEY_MAPPINGS {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                self.inner.cache.insert(
                    key_type.to_string(),
                    CachedKey {
                        value,
                        expires_at: None,
                    },
                );
                debug!(key_type, env = var, "Loaded API key from environment");
                loaded += 1;
            }
        }
        loaded
    }

    /// Store a new key for `key_type` and make it the active one. Returns the record id.
    pub async fn add_key(&self, key_type: &str, value: &str, options: AddKeyOptions) -> GatewayResult<String> {
        if key_type.trim().is_empty() {
            return Err(GatewayError::validation("type", "key type must not be empty"));
        }
        if value.is_empty() {
            return Err(GatewayError::validation("value", "key value must not be empty"));
        }

        let now = self.inner.clock.now();
        let sealed = self.inner.cipher.encrypt(value)?;
        let id = generate_key_id(key_type, now);

        let record = VaultKeyRecord {
            id: id.clone(),
            key_type: key_type.to_string(),
            value: sealed.value,
            iv: sealed.iv,
            created_at: now,
            updated_at: now,
            expires_at: options.expires_at,
            label: options.label,
            is_active: true,
        };
        self.inner
            .commit(|records| {
                for existing in records.iter_mut().filter(|r| r.key_type == key_type && r.is_active) {
                    existing.is_active = false;
                    existing.updated_at = now;
                }
                records.push(record);
                Some(())
            })
            .await?;

        self.inner.cache.insert(
            key_type.to_string(),
            CachedKey {
                value: value.to_string(),
                expires_at: options.expires_at,
            },
        );

        info!(key_id = %id, key_type, "API key added");
        Ok(id)
    }

    /// Plaintext of the active key for `key_type`.
    ///
    /// An expired active record is deactivated and yields `None`, as does a record that fails to
    /// decrypt.
    pub async fn get_key(&self, key_type: &str) -> Option<String> {
        let now = self.inner.clock.now();

        if let Some(cached) = self.inner.cache.get(key_type) {
            if cached.expires_at.map(|at| now < at).unwrap_or(true) {
                return Some(cached.value.clone());
            }
        }
        self.inner.cache.remove(key_type);

        let record = self
            .inner
            .records
            .read()
            .iter()
            .find(|r| r.key_type == key_type && r.is_active)
            .cloned()?;

        if record.is_expired(now) {
            let deactivated = self
                .inner
                .commit(|records| {
                    records
                        .iter_mut()
                        .find(|r| r.id == record.id && r.is_active)
                        .map(|r| {
                            r.is_active = false;
                            r.updated_at = now;
                        })
                })
                .await;
            if let Err(e) = deactivated {
                error!(key_id = %record.id, error = %e, "Failed to persist expired key deactivation");
            }
            warn!(key_id = %record.id, key_type, "Active API key has expired");
            return None;
        }

        match self.inner.cipher.decrypt(&record.id, &record.value, &record.iv) {
            Ok(plaintext) => {
                self.inner.cache.insert(
                    key_type.to_string(),
                    CachedKey {
                        value: plaintext.clone(),
                        expires_at: record.expires_at,
                    },
                );
                Some(plaintext)
            }
            Err(e) => {
                error!(key_id = %record.id, key_type, error = %e, "Failed to decrypt API key");
                None
            }
        }
    }

    /// Activate or deactivate a record. Activating deactivates the other keys of its type.
    ///
    /// Returns `false` when no record has that id.
    pub async fn set_key_active(&self, id: &str, active: bool) -> GatewayResult<bool> {
        let now = self.inner.clock.now();
        let changed = self
            .inner
            .commit(|records| {
                let key_type = records.iter().find(|r| r.id == id).map(|r| r.key_type.clone())?;
                for record in records.iter_mut().filter(|r| r.key_type == key_type) {
                    if record.id == id {
                        record.is_active = active;
                        record.updated_at = now;
                    } else if active && record.is_active {
                        record.is_active = false;
                        record.updated_at = now;
                    }
                }
                Some(key_type)
            })
            .await?;

        let Some(key_type) = changed else {
            return Ok(false);
        };

        self.inner.cache.remove(&key_type);
        info!(key_id = %id, key_type = %key_type, active, "API key state changed");
        Ok(true)
    }

    /// Remove a record. Returns `false` when no record has that id.
    pub async fn delete_key(&self, id: &str) -> GatewayResult<bool> {
        let removed = self
            .inner
            .commit(|records| {
                records
                    .iter()
                    .position(|r| r.id == id)
                    .map(|index| records.remove(index))
            })
            .await?;

        let Some(record) = removed else {
            return Ok(false);
        };

        self.inner.cache.remove(&record.key_type);
        info!(key_id = %id, key_type = %record.key_type, "API key deleted");
        Ok(true)
    }

    /// Replace the secret of a record, re-encrypting under a fresh nonce
    pub async fn update_key_value(&self, id: &str, value: &str) -> GatewayResult<bool> {
        if value.is_empty() {
            return Err(GatewayError::validation("value", "key value must not be empty"));
        }

        let now = self.inner.clock.now();
        let sealed = self.inner.cipher.encrypt(value)?;

        let updated = self
            .inner
            .commit(|records| {
                records.iter_mut().find(|r| r.id == id).map(|record| {
                    record.value = sealed.value;
                    record.iv = sealed.iv;
                    record.updated_at = now;
                    (record.key_type.clone(), record.is_active, record.expires_at)
                })
            })
            .await?;

        let Some((key_type, is_active, expires_at)) = updated else {
            return Ok(false);
        };

        if is_active {
            self.inner.cache.insert(
                key_type.clone(),
                CachedKey {
                    value: value.to_string(),
                    expires_at,
                },
            );
        }

        info!(key_id = %id, key_type = %key_type, "API key rotated");
        Ok(true)
    }

    /// All records without key material
    pub fn list_keys(&self) -> Vec<KeySummary> {
        self.inner.records.read().iter().map(KeySummary::from).collect()
    }

    /// Store keys from the conventional provider env vars as vault records
    pub async fn persist_env_keys(&self) -> GatewayResult<usize> {
        self.persist_env_keys_from(|name| std::env::var(name).ok()).await
    }

    pub async fn persist_env_keys_from<F>(&self, lookup: F) -> GatewayResult<usize>
    where
        F: Fn(&str) -> Option<String>,
    {
        let label = format!(
            "From .env ({})",
            self.inner.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );

        let mut stored = 0;
        for (var, key_type) in ENV_KEY_MAPPINGS {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                self.add_key(key_type, &value, AddKeyOptions::default().label(label.clone()))
                    .await?;
                info!(env = var, key_type, "Environment key stored in vault");
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Ask the provider whether the active key of `key_type` works
    pub async fn validate_key(&self, key_type: &str) -> KeyStatus {
        match self.get_key(key_type).await {
            Some(key) => self.validator.validate(key_type, &key).await,
            None => KeyStatus::Missing,
        }
    }

    /// Deactivate every expired active record now. Returns how many.
    pub async fn cleanup_expired(&self) -> GatewayResult<usize> {
        self.inner.deactivate_expired().await
    }

    /// Start the periodic expiry cleanup. Calling it again is a no-op.
    pub fn start_cleanup(&self) {
        let mut slot = self.cleanup.lock();
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        *slot = Some(BackgroundTask::spawn_interval(
            "vault-cleanup",
            self.config.cleanup_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        if let Err(e) = inner.deactivate_expired().await {
                            error!(error = %e, "Vault cleanup failed");
                        }
                    }
                }
            },
        ));
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup.lock().as_ref().map(|t| t.is_running()).unwrap_or(false)
    }

    /// Stop background work
    pub async fn shutdown(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        debug!("Credential vault shut down");
    }

    pub fn stats(&self) -> VaultStats {
        let records = self.inner.records.read();
        let mut active_by_type = BTreeMap::new();
        for record in records.iter().filter(|r| r.is_active) {
            *active_by_type.entry(record.key_type.clone()).or_insert(0) += 1;
        }

        VaultStats {
            store: self.inner.store.describe(),
            total_keys: records.len(),
            active_keys: active_by_type.values().sum(),
            cached_keys: self.inner.cache.len(),
            active_by_type,
        }
    }
}

fn generate_key_id(key_type: &str, now: DateTime<Utc>) -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}-{}-{}", key_type, now.timestamp_millis(), hex::encode(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{Clock, ManualClock};
    use crate::vault::store::InMemoryKeyStore;
    use async_trait::async_trait;
    use std::time::Duration;

    fn config() -> VaultConfig {
        VaultConfig {
            encryption_key: "test-secret".to_string(),
            key_file: None,
            load_env_keys: false,
            ..Default::default()
        }
    }

    async fn open_vault() -> (CredentialVault, Arc<InMemoryKeyStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryKeyStore::new());
        let clock = ManualClock::starting_now();
        let vault = CredentialVault::open(config(), store.clone(), clock.clone()).await.unwrap();
        (vault, store, clock)
    }

    #[tokio::test]
    async fn test_add_key_replaces_active_key() {
        let (vault, store, _) = open_vault().await;
        let first = vault.add_key("openai", "A", AddKeyOptions::default()).await.unwrap();
        let second = vault.add_key("openai", "B", AddKeyOptions::default()).await.unwrap();

        assert_eq!(vault.get_key("openai").await.as_deref(), Some("B"));

        let records = store.snapshot();
        assert_eq!(records.len(), 2);
        assert!(!records.iter().find(|r| r.id == first).unwrap().is_active);
        assert!(records.iter().find(|r| r.id == second).unwrap().is_active);
        assert!(first.starts_with("openai-"));
        assert_eq!(first.rsplit('-').next().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_stored_value_is_encrypted() {
        let (vault, store, _) = open_vault().await;
        vault.add_key("grok", "xai-plaintext", AddKeyOptions::default()).await.unwrap();
        let record = &store.snapshot()[0];
        assert!(!record.value.contains(&hex::encode("xai-plaintext")));
        assert_eq!(record.iv.len(), 24);
    }

    #[tokio::test]
    async fn test_expired_key_is_deactivated() {
        let (vault, store, clock) = open_vault().await;
        let expires = clock.now() + chrono::Duration::seconds(60);
        vault
            .add_key("anthropic", "sk-ant", AddKeyOptions::default().expires_at(expires))
            .await
            .unwrap();
        assert_eq!(vault.get_key("anthropic").await.as_deref(), Some("sk-ant"));

        clock.advance(Duration::from_secs(61));
        assert_eq!(vault.get_key("anthropic").await, None);
        assert!(!store.snapshot()[0].is_active);
        assert_eq!(vault.get_key("anthropic").await, None);
    }

    #[tokio::test]
    async fn test_set_key_active_keeps_single_active() {
        let (vault, store, _) = open_vault().await;
        let a = vault.add_key("openai", "A", AddKeyOptions::default()).await.unwrap();
        vault.add_key("openai", "B", AddKeyOptions::default()).await.unwrap();
        vault.add_key("grok", "G", AddKeyOptions::default()).await.unwrap();

        assert!(vault.set_key_active(&a, true).await.unwrap());
        assert_eq!(vault.get_key("openai").await.as_deref(), Some("A"));

        let active_openai = store
            .snapshot()
            .iter()
            .filter(|r| r.key_type == "openai" && r.is_active)
            .count();
        assert_eq!(active_openai, 1);
        assert_eq!(vault.get_key("grok").await.as_deref(), Some("G"));

        assert!(vault.set_key_active(&a, false).await.unwrap());
        assert_eq!(vault.get_key("openai").await, None);
        assert!(!vault.set_key_active("missing-id", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_update() {
        let (vault, _, _) = open_vault().await;
        let id = vault.add_key("gemini", "old", AddKeyOptions::default()).await.unwrap();

        assert!(vault.update_key_value(&id, "new").await.unwrap());
        assert_eq!(vault.get_key("gemini").await.as_deref(), Some("new"));

        assert!(vault.delete_key(&id).await.unwrap());
        assert_eq!(vault.get_key("gemini").await, None);
        assert!(!vault.delete_key(&id).await.unwrap());
        assert!(!vault.update_key_value(&id, "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_keys_and_stats() {
        let (vault, _, _) = open_vault().await;
        vault
            .add_key("openai", "A", AddKeyOptions::default().label("primary"))
            .await
            .unwrap();
        vault.add_key("openai", "B", AddKeyOptions::default()).await.unwrap();

        let listed = vault.list_keys();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].label.as_deref(), Some("primary"));

        let stats = vault.stats();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.active_keys, 1);
        assert_eq!(stats.active_by_type.get("openai"), Some(&1));
    }

    #[tokio::test]
    async fn test_env_keys() {
        let (vault, store, _) = open_vault().await;
        let lookup = |name: &str| match name {
            "GROK_API_KEY" => Some("xai-env".to_string()),
            "OPENAI_API_KEY" => Some("   ".to_string()),
            _ => None,
        };

        assert_eq!(vault.load_env_keys_from(lookup), 1);
        assert_eq!(vault.get_key("grok").await.as_deref(), Some("xai-env"));
        assert!(store.snapshot().is_empty());

        assert_eq!(vault.persist_env_keys_from(lookup).await.unwrap(), 1);
        let records = store.snapshot();
        assert_eq!(records.len(), 1);
        assert!(records[0].label.as_deref().unwrap().starts_with("From .env ("));
    }

    #[tokio::test]
    async fn test_cleanup_deactivates_expired() {
        let (vault, store, clock) = open_vault().await;
        let soon = clock.now() + chrono::Duration::seconds(5);
        vault
            .add_key("openai", "A", AddKeyOptions::default().expires_at(soon))
            .await
            .unwrap();
        vault.add_key("grok", "G", AddKeyOptions::default()).await.unwrap();

        assert_eq!(vault.cleanup_expired().await.unwrap(), 0);
        clock.advance(Duration::from_secs(10));
        assert_eq!(vault.cleanup_expired().await.unwrap(), 1);
        assert_eq!(vault.stats().active_keys, 1);
        assert!(store.snapshot().iter().any(|r| r.key_type == "grok" && r.is_active));
    }

    #[derive(Debug)]
    struct AcceptAll;

    #[async_trait]
    impl KeyValidator for AcceptAll {
        async fn validate(&self, _key_type: &str, _key: &str) -> KeyStatus {
            KeyStatus::Valid
        }
    }

    #[tokio::test]
    async fn test_validate_key_reports_missing() {
        let (vault, _, _) = open_vault().await;
        let vault = vault.with_validator(Arc::new(AcceptAll));
        assert_eq!(vault.validate_key("openai").await, KeyStatus::Missing);
        vault.add_key("openai", "A", AddKeyOptions::default()).await.unwrap();
        assert_eq!(vault.validate_key("openai").await, KeyStatus::Valid);
    }

    #[tokio::test]
    async fn test_rejects_empty_input() {
        let (vault, _, _) = open_vault().await;
        assert!(matches!(
            vault.add_key("", "A", AddKeyOptions::default()).await,
            Err(GatewayError::Validation { .. })
        ));
        assert!(matches!(
            vault.add_key("openai", "", AddKeyOptions::default()).await,
            Err(GatewayError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_cleanup_task_lifecycle() {
        let (vault, _, _) = open_vault().await;
        vault.start_cleanup();
        assert!(vault.is_cleanup_running());
        vault.shutdown().await;
        assert!(!vault.is_cleanup_running());
    }

    /// Store whose saves can be switched to fail
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: InMemoryKeyStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn fail_saves(&self, failing: bool) {
            self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KeyStore for FlakyStore {
        async fn load(&self) -> GatewayResult<Vec<VaultKeyRecord>> {
            self.inner.load().await
        }

        async fn save(&self, records: &[VaultKeyRecord]) -> GatewayResult<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::Io {
                    message: "disk full".to_string(),
                });
            }
            self.inner.save(records).await
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[tokio::test]
    async fn test_failed_save_leaves_vault_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let vault = CredentialVault::open(config(), store.clone(), ManualClock::starting_now())
            .await
            .unwrap();
        let a = vault.add_key("openai", "A", AddKeyOptions::default()).await.unwrap();

        store.fail_saves(true);
        assert!(matches!(
            vault.add_key("openai", "B", AddKeyOptions::default()).await,
            Err(GatewayError::Io { .. })
        ));
        assert!(vault.delete_key(&a).await.is_err());
        assert!(vault.set_key_active(&a, false).await.is_err());
        assert!(vault.update_key_value(&a, "C").await.is_err());

        let listed = vault.list_keys();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_active);
        assert_eq!(vault.get_key("openai").await.as_deref(), Some("A"));

        // The next successful save must not carry any of the rejected edits
        store.fail_saves(false);
        vault.add_key("grok", "G", AddKeyOptions::default()).await.unwrap();
        let saved = store.inner.snapshot();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|r| r.is_active));
        vault.inner.cache.clear();
        assert_eq!(vault.get_key("openai").await.as_deref(), Some("A"));
    }
}
