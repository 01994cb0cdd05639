//! # Cache Key Generator
//!
//! Derives the request fingerprint shared by the response cache and the request deduplicator.
//! The fingerprint hashes the provider, each message as `role:content` (content cut to a fixed
//! number of characters) and the temperature, so identical requests always map to the same key.

use crate::core::types::{Message, ProviderKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key generator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyGeneratorConfig {
    /// Prefix of every generated cache key
    pub prefix: String,

    /// Characters of each message taken into the fingerprint
    pub content_chars: usize,

    /// Hex characters of the digest kept in the key
    pub hash_len: usize,
}

impl Default for KeyGeneratorConfig {
    fn default() -> Self {
        Self {
            prefix: "completion:".to_string(),
            content_chars: 500,
            hash_len: 16,
        }
    }
}

/// Request fingerprinting
#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator {
    config: KeyGeneratorConfig,
}

impl CacheKeyGenerator {
    pub fn new(config: KeyGeneratorConfig) -> Self {
        Self { config }
    }

    /// Short stable hash of a request
    pub fn fingerprint(&self, provider: ProviderKind, messages: &[Message], temperature: f32) -> String {
        let joined = messages
            .iter()
            .map(|m| {
                let content: String = m.content.chars().take(self.config.content_chars).collect();
                format!("{}:{}", m.role, content)
            })
            .collect::<Vec<_>>()
            .join("|");

        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(joined.as_bytes());
        hasher.update(format!(":{:.1}", temperature).as_bytes());
        let digest = hex::encode(hasher.finalize());

        digest[..self.config.hash_len.clamp(8, digest.len())].to_string()
    }

    /// Full cache key: `{prefix}{provider}:{fingerprint}:{temperature}`
    pub fn cache_key(&self, provider: ProviderKind, messages: &[Message], temperature: f32) -> String {
        format!(
            "{}{}:{}:{:.1}",
            self.config.prefix,
            provider,
            self.fingerprint(provider, messages, temperature),
            temperature
        )
    }

    /// Glob matching every key of one provider
    pub fn provider_pattern(&self, provider: ProviderKind) -> String {
        format!("{}{}:*", self.config.prefix, provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<Message> {
        vec![Message::system("You write blog posts."), Message::user("Write about Rust.")]
    }

    #[test]
    fn test_key_is_stable() {
        let generator = CacheKeyGenerator::default();
        let a = generator.cache_key(ProviderKind::Grok, &conversation(), 0.7);
        let b = generator.cache_key(ProviderKind::Grok, &conversation(), 0.7);
        assert_eq!(a, b);
        assert!(a.starts_with("completion:grok:"));
        assert!(a.ends_with(":0.7"));
        assert_eq!(generator.fingerprint(ProviderKind::Grok, &conversation(), 0.7).len(), 16);
    }

    #[test]
    fn test_key_changes_with_inputs() {
        let generator = CacheKeyGenerator::default();
        let base = generator.cache_key(ProviderKind::Grok, &conversation(), 0.7);

        assert_ne!(base, generator.cache_key(ProviderKind::OpenAi, &conversation(), 0.7));
        assert_ne!(base, generator.cache_key(ProviderKind::Grok, &conversation(), 0.2));

        let mut other = conversation();
        other[1] = Message::assistant("Write about Rust.");
        assert_ne!(base, generator.cache_key(ProviderKind::Grok, &other, 0.7));
    }

    #[test]
    fn test_content_beyond_prefix_is_ignored() {
        let generator = CacheKeyGenerator::new(KeyGeneratorConfig {
            content_chars: 10,
            ..Default::default()
        });
        let a = vec![Message::user("0123456789 tail one")];
        let b = vec![Message::user("0123456789 tail two")];
        assert_eq!(
            generator.fingerprint(ProviderKind::Gemini, &a, 0.7),
            generator.fingerprint(ProviderKind::Gemini, &b, 0.7)
        );
    }

    #[test]
    fn test_provider_pattern_matches_keys() {
        let generator = CacheKeyGenerator::default();
        let key = generator.cache_key(ProviderKind::Anthropic, &conversation(), 0.7);
        let pattern = generator.provider_pattern(ProviderKind::Anthropic);
        assert!(crate::caching::stores::glob_to_regex(&pattern).unwrap().is_match(&key));
    }
}
