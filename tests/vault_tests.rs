//! # Credential Vault Integration Tests
//!
//! Key persistence through the JSON file store, reopening with the right and wrong master
//! secret, and expiry driven by a manual clock.

use ai_gateway::core::clock::{Clock, ManualClock};
use ai_gateway::vault::{AddKeyOptions, CredentialVault, JsonFileKeyStore, KeyStore, VaultConfig};
use chrono::Duration as ChronoDuration;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config(secret: &str, path: &Path) -> VaultConfig {
    VaultConfig {
        encryption_key: secret.to_string(),
        key_file: Some(path.to_path_buf()),
        load_env_keys: false,
        ..Default::default()
    }
}

async fn open(secret: &str, path: &Path, clock: Arc<ManualClock>) -> CredentialVault {
    CredentialVault::open(config(secret, path), Arc::new(JsonFileKeyStore::new(path)), clock)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_keys_survive_reopen_with_same_secret() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys").join("api-keys.json");
    let clock = ManualClock::starting_now();

    let vault = open("correct horse", &path, clock.clone()).await;
    vault
        .add_key("anthropic", "sk-ant-secret", AddKeyOptions::default().label("primary"))
        .await
        .unwrap();
    vault.add_key("openai", "sk-openai-secret", AddKeyOptions::default()).await.unwrap();

    let raw = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(!raw.contains("sk-ant-secret"));
    assert!(raw.contains("\"type\": \"anthropic\""));

    let reopened = open("correct horse", &path, clock).await;
    assert_eq!(reopened.get_key("anthropic").await.as_deref(), Some("sk-ant-secret"));
    assert_eq!(reopened.get_key("openai").await.as_deref(), Some("sk-openai-secret"));
    assert_eq!(reopened.stats().active_keys, 2);
}

#[tokio::test]
async fn test_wrong_secret_yields_no_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api-keys.json");
    let clock = ManualClock::starting_now();

    open("first secret", &path, clock.clone())
        .await
        .add_key("grok", "xai-secret", AddKeyOptions::default())
        .await
        .unwrap();

    let reopened = open("second secret", &path, clock).await;
    assert_eq!(reopened.get_key("grok").await, None);
    assert_eq!(reopened.list_keys().len(), 1);
}

#[tokio::test]
async fn test_rotation_keeps_single_active_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api-keys.json");
    let vault = open("secret", &path, ManualClock::starting_now()).await;

    let old = vault.add_key("openai", "sk-old", AddKeyOptions::default()).await.unwrap();
    let new = vault.add_key("openai", "sk-new", AddKeyOptions::default()).await.unwrap();
    assert_eq!(vault.get_key("openai").await.as_deref(), Some("sk-new"));

    assert!(vault.set_key_active(&old, true).await.unwrap());
    assert_eq!(vault.get_key("openai").await.as_deref(), Some("sk-old"));

    let keys = vault.list_keys();
    let active: Vec<_> = keys.iter().filter(|k| k.is_active).map(|k| k.id.clone()).collect();
    assert_eq!(active, vec![old.clone()]);

    assert!(vault.delete_key(&new).await.unwrap());
    let stored = JsonFileKeyStore::new(&path).load().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, old);
}

#[tokio::test]
async fn test_expired_key_is_deactivated_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api-keys.json");
    let clock = ManualClock::starting_now();
    let vault = open("secret", &path, clock.clone()).await;

    let expires_at = clock.now() + ChronoDuration::minutes(5);
    vault
        .add_key("gemini", "AIza-secret", AddKeyOptions::default().expires_at(expires_at))
        .await
        .unwrap();
    assert!(vault.get_key("gemini").await.is_some());

    clock.advance(Duration::from_secs(301));
    assert_eq!(vault.get_key("gemini").await, None);

    let stored = JsonFileKeyStore::new(&path).load().await.unwrap();
    assert!(!stored[0].is_active);
}

#[tokio::test]
async fn test_corrupt_key_file_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api-keys.json");
    tokio::fs::write(&path, "{ not json").await.unwrap();

    let result = CredentialVault::open(
        config("secret", &path),
        Arc::new(JsonFileKeyStore::new(&path)),
        ManualClock::starting_now(),
    )
    .await;
    assert!(result.is_err());

    // The broken file is left alone for an operator to inspect
    assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{ not json");
}

#[tokio::test]
async fn test_env_keys_persist_with_label() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api-keys.json");
    let vault = open("secret", &path, ManualClock::starting_now()).await;

    let env = |name: &str| match name {
        "OPENAI_API_KEY" => Some("sk-from-env".to_string()),
        "GROK_API_KEY" => Some(String::new()),
        _ => None,
    };
    assert_eq!(vault.persist_env_keys_from(env).await.unwrap(), 1);

    let keys = vault.list_keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key_type, "openai");
    assert!(keys[0].label.as_deref().unwrap().starts_with("From .env"));
    assert_eq!(vault.get_key("openai").await.as_deref(), Some("sk-from-env"));
}
