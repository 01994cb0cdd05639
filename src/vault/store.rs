//! Durable storage of encrypted key records.
//!
//! The whole record set is read and written at once. [`JsonFileKeyStore`] keeps it as a pretty
//! printed JSON array; [`InMemoryKeyStore`] backs tests and deployments without a key file.

use crate::core::error::GatewayResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// One stored credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultKeyRecord {
    pub id: String,

    /// Provider the key belongs to (`openai`, `anthropic`, ...)
    #[serde(rename = "type")]
    pub key_type: String,

    /// Ciphertext, hex
    pub value: String,

    /// Nonce, hex
    pub iv: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    pub is_active: bool,
}

impl VaultKeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// A record without its key material, for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub is_active: bool,
}

impl From<&VaultKeyRecord> for KeySummary {
    fn from(record: &VaultKeyRecord) -> Self {
        Self {
            id: record.id.clone(),
            key_type: record.key_type.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
            label: record.label.clone(),
            is_active: record.is_active,
        }
    }
}

/// Persistence for the vault's record set
#[async_trait]
pub trait KeyStore: Send + Sync + std::fmt::Debug {
    /// Load every record. A store that has never been written is empty.
    async fn load(&self) -> GatewayResult<Vec<VaultKeyRecord>>;

    /// Replace the stored record set
    async fn save(&self, records: &[VaultKeyRecord]) -> GatewayResult<()>;

    /// Where the records live, for log lines
    fn describe(&self) -> String;
}

/// Records kept in a JSON file
#[derive(Debug, Clone)]
pub struct JsonFileKeyStore {
    path: PathBuf,
}

impl JsonFileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyStore for JsonFileKeyStore {
    async fn load(&self) -> GatewayResult<Vec<VaultKeyRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Key file does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, records: &[VaultKeyRecord]) -> GatewayResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let body = serde_json::to_vec_pretty(records)?;

        // Write next to the target and rename so readers never see a partial file
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), records = records.len(), "Key file written");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Records kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    records: Mutex<Vec<VaultKeyRecord>>,
    saves: AtomicUsize,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<VaultKeyRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Current stored records
    pub fn snapshot(&self) -> Vec<VaultKeyRecord> {
        self.records.lock().clone()
    }

    /// Number of completed saves
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn load(&self) -> GatewayResult<Vec<VaultKeyRecord>> {
        Ok(self.snapshot())
    }

    async fn save(&self, records: &[VaultKeyRecord]) -> GatewayResult<()> {
        *self.records.lock() = records.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str) -> VaultKeyRecord {
        let at = Utc.timestamp_millis_opt(1_714_000_000_123).unwrap();
        VaultKeyRecord {
            id: id.to_string(),
            key_type: "openai".to_string(),
            value: "00ff".to_string(),
            iv: "abcd".to_string(),
            created_at: at,
            updated_at: at,
            expires_at: None,
            label: Some("primary".to_string()),
            is_active: true,
        }
    }

    #[test]
    fn test_record_wire_format() {
        let json = serde_json::to_value(record("openai-1")).unwrap();
        assert_eq!(json["type"], "openai");
        assert_eq!(json["createdAt"], 1_714_000_000_123i64);
        assert_eq!(json["isActive"], true);
        assert!(json.get("expiresAt").is_none());

        let parsed: VaultKeyRecord = serde_json::from_value(serde_json::json!({
            "id": "grok-1", "type": "grok", "value": "aa", "iv": "bb",
            "createdAt": 1, "updatedAt": 2, "expiresAt": 3, "isActive": false
        }))
        .unwrap();
        assert_eq!(parsed.expires_at.map(|t| t.timestamp_millis()), Some(3));
        assert!(parsed.label.is_none());
    }

    #[test]
    fn test_summary_omits_key_material() {
        let summary = KeySummary::from(&record("openai-1"));
        let json = serde_json::to_value(summary).unwrap();
        assert!(json.get("value").is_none());
        assert!(json.get("iv").is_none());
        assert_eq!(json["label"], "primary");
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_and_save_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileKeyStore::new(dir.path().join("nested/data/api-keys.json"));
        assert!(store.load().await.unwrap().is_empty());

        store.save(&[record("a"), record("b")]).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].id, "b");

        let text = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(text.starts_with('['));
        assert!(text.contains('\n'));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(JsonFileKeyStore::new(path).load().await.is_err());
    }
}
