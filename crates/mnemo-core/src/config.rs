//! Engine configuration
//!
//! Serde-deserializable settings with defaults mirroring the deployment
//! shape: self-hosted vLLM primaries with a commercial fallback, 30 s
//! provider timeouts, 1024-dimension embeddings. The server crate loads
//! these from a TOML file and environment overrides for secrets.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Provider kinds the factory knows how to build
pub const PROVIDER_VLLM: &str = "vllm";
/// DeepInfra commercial API
pub const PROVIDER_DEEPINFRA: &str = "deepinfra";
/// Disables the fallback slot
pub const PROVIDER_NONE: &str = "none";

// ============================================================================
// PROVIDER SETTINGS
// ============================================================================

/// Primary + fallback configuration shared by the embed and rerank slots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Primary provider kind (`vllm` or `deepinfra`)
    pub primary_provider: String,
    /// Fallback provider kind (`vllm`, `deepinfra`, or `none`)
    pub fallback_provider: String,
    /// Primary endpoint
    pub primary_base_url: String,
    /// Primary credential
    pub primary_api_key: String,
    /// Fallback endpoint; blank disables the fallback
    pub fallback_base_url: String,
    /// Fallback credential
    pub fallback_api_key: String,
    /// Model served by both providers
    pub model: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Retry attempts per request
    pub max_retries: usize,
    /// Items per wire request
    pub batch_size: usize,
    /// Concurrent in-flight requests
    pub max_concurrent_requests: usize,
    /// Warning threshold for consecutive primary failures
    pub max_primary_failures: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            primary_provider: PROVIDER_VLLM.to_string(),
            fallback_provider: PROVIDER_DEEPINFRA.to_string(),
            primary_base_url: String::new(),
            primary_api_key: String::new(),
            fallback_base_url: String::new(),
            fallback_api_key: String::new(),
            model: String::new(),
            timeout_secs: 30,
            max_retries: 3,
            batch_size: 10,
            max_concurrent_requests: 5,
            max_primary_failures: 3,
        }
    }
}

impl ProviderSettings {
    /// Whether a usable fallback is configured.
    ///
    /// Requires a non-`none` provider kind, an endpoint, and (for providers
    /// that need one) a credential. vLLM endpoints run without keys.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_provider != PROVIDER_NONE
            && !self.fallback_base_url.is_empty()
            && (self.fallback_provider == PROVIDER_VLLM || !self.fallback_api_key.is_empty())
    }

    /// Timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ============================================================================
// LLM SETTINGS
// ============================================================================

/// Extractor LLM configuration (any OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// API root
    pub base_url: String,
    /// Credential
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token cap
    pub max_tokens: u32,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Retry attempts per request
    pub max_retries: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            temperature: 0.3,
            max_tokens: 4096,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Database file; `None` uses the platform data directory
    pub db_path: Option<PathBuf>,
    /// Vector index persistence path; `None` keeps it in memory
    pub vector_index_path: Option<PathBuf>,
    /// Embedding dimensions
    pub dimensions: usize,
    /// Default cosine floor for vector retrieval
    pub default_radius: f32,
    /// Profile capacity before compaction thresholds apply
    pub max_profile_items: usize,
    /// Whether the profile manager runs after extraction
    pub enable_profiles: bool,
    /// Embedding provider slot
    pub embedding: ProviderSettings,
    /// Rerank provider slot
    pub rerank: ProviderSettings,
    /// Extractor LLM
    pub llm: LlmSettings,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            vector_index_path: None,
            dimensions: 1024,
            default_radius: 0.6,
            max_profile_items: 25,
            enable_profiles: true,
            embedding: ProviderSettings {
                model: "Qwen/Qwen3-Embedding-4B".to_string(),
                ..Default::default()
            },
            rerank: ProviderSettings {
                model: "Qwen/Qwen3-Reranker-4B".to_string(),
                ..Default::default()
            },
            llm: LlmSettings::default(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_enablement_rules() {
        let mut settings = ProviderSettings::default();
        assert!(!settings.fallback_enabled()); // no url

        settings.fallback_base_url = "https://api.deepinfra.com/v1/inference".to_string();
        assert!(!settings.fallback_enabled()); // deepinfra needs a key

        settings.fallback_api_key = "key".to_string();
        assert!(settings.fallback_enabled());

        settings.fallback_provider = PROVIDER_NONE.to_string();
        assert!(!settings.fallback_enabled());

        // vllm runs without a key
        settings.fallback_provider = PROVIDER_VLLM.to_string();
        settings.fallback_api_key = String::new();
        assert!(settings.fallback_enabled());
    }

    #[test]
    fn test_config_deserializes_with_partial_input() {
        let config: MemoryConfig = serde_json::from_str(r#"{"dimensions": 256}"#).unwrap();
        assert_eq!(config.dimensions, 256);
        assert_eq!(config.max_profile_items, 25);
        assert!((config.default_radius - 0.6).abs() < f32::EPSILON);
    }
}
