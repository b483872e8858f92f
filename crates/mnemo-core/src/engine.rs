//! Memory engine facade
//!
//! Wires the stores, indexes, providers and coordinators into one object
//! the server (and the tests) hold. All public operations of the service
//! surface live here: memorize, fetch, retrieve, delete, conversation-meta
//! CRUD and custom-profile merge.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config::{MemoryConfig, ProviderSettings, PROVIDER_DEEPINFRA, PROVIDER_VLLM};
use crate::error::{EngineError, Result};
use crate::extract::{
    EventLogExtractor, MemCellExtractor, ProfileLifeExtractor, SemanticExtractor,
};
use crate::filter::ScopeFilter;
use crate::ingest::{IngestOutcome, IngestService};
use crate::memory::{ConversationMeta, MemCell, RawMessage, UserProfile, MAX_FETCH_LIMIT};
use crate::profile::ProfileManager;
use crate::providers::{
    ChatModel, EmbeddingConfig, HttpReranker, HttpVectorizer, LlmConfig, OpenAiChatClient,
    PassageReranker, RerankConfig, ResilientReranker, ResilientVectorizer, Vectorizer,
};
use crate::retrieval::{RetrievalService, RetrieveRequest, RetrieveResponse};
use crate::search::{KeywordIndex, VectorIndex, VectorIndexConfig};
use crate::storage::{DocumentStore, SortOrder};
use crate::sync::SyncService;

// ============================================================================
// META PATCH
// ============================================================================

/// Partial update of a conversation-meta record.
///
/// Core fields (`version`, `scene`, `group_id`) are not patchable by
/// construction.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct MetaPatch {
    /// New display name
    pub name: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New scene description
    pub scene_desc: Option<String>,
    /// Replacement tag list
    pub tags: Option<Vec<String>>,
    /// Replacement user-details map
    pub user_details: Option<BTreeMap<String, Value>>,
    /// New default timezone
    pub default_timezone: Option<String>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The assembled memory service
pub struct MemoryEngine {
    store: Arc<DocumentStore>,
    vector: Arc<Mutex<VectorIndex>>,
    keyword: Arc<KeywordIndex>,
    ingest: IngestService,
    retrieval: RetrievalService,
}

impl MemoryEngine {
    /// Assemble the engine with explicit provider implementations.
    ///
    /// This is the constructor tests use: providers are trait objects, so
    /// deterministic stubs slot in without any HTTP.
    pub fn with_providers(
        config: &MemoryConfig,
        chat: Arc<dyn ChatModel>,
        vectorizer: Arc<dyn Vectorizer>,
        reranker: Arc<dyn PassageReranker>,
    ) -> Result<Self> {
        let store = Arc::new(DocumentStore::open(config.db_path.clone())?);
        let keyword = Arc::new(
            KeywordIndex::open(store.db_path())
                .map_err(EngineError::Keyword)?,
        );

        let vector_config = VectorIndexConfig {
            dimensions: config.dimensions,
            ..Default::default()
        };
        let vector_index = match &config.vector_index_path {
            Some(path) if path.exists() => VectorIndex::load(path, vector_config)?,
            Some(path) => {
                VectorIndex::with_config(vector_config)?.with_persistence(path.clone())
            }
            None => VectorIndex::with_config(vector_config)?,
        };
        let vector = Arc::new(Mutex::new(vector_index));

        let sync = SyncService::new(Arc::clone(&store), Arc::clone(&vector), Arc::clone(&keyword));

        let profile_manager = if config.enable_profiles {
            let extractor =
                ProfileLifeExtractor::with_max_items(Arc::clone(&chat), config.max_profile_items);
            Some(Arc::new(ProfileManager::new(Arc::clone(&store), extractor)))
        } else {
            None
        };

        let ingest = IngestService::new(
            Arc::clone(&store),
            MemCellExtractor::new(Arc::clone(&chat)),
            SemanticExtractor::new(Arc::clone(&chat), Arc::clone(&vectorizer)),
            EventLogExtractor::new(Arc::clone(&chat), Arc::clone(&vectorizer)),
            sync,
            Arc::clone(&vectorizer),
            profile_manager,
        );

        let retrieval = RetrievalService::new(
            Arc::clone(&store),
            Arc::clone(&vector),
            Arc::clone(&keyword),
            vectorizer,
            reranker,
        );

        Ok(Self {
            store,
            vector,
            keyword,
            ingest,
            retrieval,
        })
    }

    /// Assemble the engine from configuration, building the HTTP providers
    /// and their resilient wrappers.
    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        let chat: Arc<dyn ChatModel> = Arc::new(OpenAiChatClient::new(
            LlmConfig {
                base_url: config.llm.base_url.clone(),
                api_key: config.llm.api_key.clone(),
                model: config.llm.model.clone(),
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
                timeout: std::time::Duration::from_secs(config.llm.timeout_secs),
                max_retries: config.llm.max_retries,
            },
        )?);

        let vectorizer: Arc<dyn Vectorizer> = Arc::new(build_vectorizer(config)?);
        let reranker: Arc<dyn PassageReranker> = Arc::new(build_reranker(&config.rerank)?);
        Self::with_providers(config, chat, vectorizer, reranker)
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Process one received message through the ingest state machine
    pub async fn memorize(&self, message: RawMessage) -> Result<IngestOutcome> {
        self.ingest.memorize(message).await
    }

    // ========================================================================
    // READ PATHS
    // ========================================================================

    /// Paged MemCell fetch by scope; at least one of user/group required
    pub fn fetch_memories(
        &self,
        filter: &ScopeFilter,
        order: SortOrder,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MemCell>, usize)> {
        if filter.user_id.is_none() && filter.group_id.is_none() {
            return Err(EngineError::InvalidArgument(
                "at least one of user_id and group_id must be a real value".to_string(),
            ));
        }
        Ok(self
            .store
            .find_memcells(filter, order, limit.min(MAX_FETCH_LIMIT), offset)?)
    }

    /// Relevance-ranked retrieval
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse> {
        self.retrieval.retrieve(request).await
    }

    /// Soft-delete with cascade; returns (applied filters, count)
    pub fn delete_memories(
        &self,
        event_id: Option<&str>,
        user_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<(Vec<String>, usize)> {
        self.retrieval.soft_delete(event_id, user_id, group_id)
    }

    // ========================================================================
    // CONVERSATION META
    // ========================================================================

    /// Meta for a group, falling back to the default record.
    ///
    /// The boolean is `true` when the default record answered for a
    /// requested group.
    pub fn conversation_meta(&self, group_id: Option<&str>) -> Result<(ConversationMeta, bool)> {
        let group_key = group_id.unwrap_or("");
        if let Some(meta) = self.store.get_meta(group_key)? {
            return Ok((meta, false));
        }
        if !group_key.is_empty() {
            if let Some(default_meta) = self.store.get_meta("")? {
                return Ok((default_meta, true));
            }
        }
        Err(EngineError::NotFound(format!(
            "Conversation metadata not found for group_id: {}",
            group_id.unwrap_or("<default>")
        )))
    }

    /// Full upsert of a meta record
    pub fn save_conversation_meta(&self, mut meta: ConversationMeta) -> Result<ConversationMeta> {
        let now = Utc::now();
        if meta.created_at.is_none() {
            let existing = self
                .store
                .get_meta(meta.group_id.as_deref().unwrap_or(""))?;
            meta.created_at = existing.and_then(|m| m.created_at).or(Some(now));
        }
        meta.updated_at = Some(now);
        self.store.put_meta(&meta)?;
        Ok(meta)
    }

    /// Patch a meta record in place; returns the new record and the names
    /// of the fields that changed.
    pub fn patch_conversation_meta(
        &self,
        group_id: Option<&str>,
        patch: &MetaPatch,
    ) -> Result<(ConversationMeta, Vec<String>)> {
        let group_key = group_id.unwrap_or("");
        let mut meta = self.store.get_meta(group_key)?.ok_or_else(|| {
            EngineError::NotFound(match group_id {
                Some(id) => format!("Specified conversation metadata not found: group_id={id}"),
                None => "Default config not found".to_string(),
            })
        })?;

        let mut updated_fields = Vec::new();
        if let Some(name) = &patch.name {
            meta.name = Some(name.clone());
            updated_fields.push("name".to_string());
        }
        if let Some(description) = &patch.description {
            meta.description = Some(description.clone());
            updated_fields.push("description".to_string());
        }
        if let Some(scene_desc) = &patch.scene_desc {
            meta.scene_desc = Some(scene_desc.clone());
            updated_fields.push("scene_desc".to_string());
        }
        if let Some(tags) = &patch.tags {
            meta.tags = tags.clone();
            updated_fields.push("tags".to_string());
        }
        if let Some(user_details) = &patch.user_details {
            meta.user_details = user_details.clone();
            updated_fields.push("user_details".to_string());
        }
        if let Some(timezone) = &patch.default_timezone {
            meta.default_timezone = Some(timezone.clone());
            updated_fields.push("default_timezone".to_string());
        }

        if !updated_fields.is_empty() {
            meta.updated_at = Some(Utc::now());
            self.store.put_meta(&meta)?;
        }
        Ok((meta, updated_fields))
    }

    // ========================================================================
    // PROFILES
    // ========================================================================

    /// Merge caller-supplied seed lines into a user's profile record
    /// (top-level field overwrite).
    pub fn merge_custom_profile(
        &self,
        user_id: &str,
        initial_profile: Vec<String>,
    ) -> Result<UserProfile> {
        if user_id.is_empty() {
            return Err(EngineError::InvalidArgument("user_id is required".to_string()));
        }
        let mut profile = self
            .store
            .get_profile(user_id)?
            .unwrap_or_else(|| UserProfile::new(user_id, None));
        profile.initial_profile = initial_profile;
        profile.last_updated = Some(Utc::now());
        self.store.put_profile(&profile)?;
        Ok(profile)
    }

    /// Load a user's profile
    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.store.get_profile(user_id)?)
    }

    // ========================================================================
    // AUDIT
    // ========================================================================

    /// Record one accepted ingest request
    pub fn log_request(
        &self,
        endpoint: &str,
        method: &str,
        url: &str,
        message: &RawMessage,
        payload: &Value,
    ) -> Result<()> {
        Ok(self.store.log_request(
            endpoint,
            method,
            url,
            Some(message.group_key()),
            Some(&message.message_id),
            payload,
        )?)
    }

    /// The backing document store (harness and audit hook)
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Live record counts across the three stores
    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            document_records: self.store.count_records()?,
            vector_records: self.vector.lock().unwrap_or_else(|e| e.into_inner()).len(),
            keyword_records: self.keyword.count().map_err(EngineError::Keyword)?,
        })
    }
}

/// Record counts across the stores (audit/diagnostics)
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    /// Episodic records in the document store
    pub document_records: usize,
    /// Vectors in the ANN index
    pub vector_records: usize,
    /// Documents in the inverted index
    pub keyword_records: usize,
}

// ============================================================================
// PROVIDER FACTORY
// ============================================================================

fn embed_config(settings: &ProviderSettings, provider: &str, base_url: &str, api_key: &str, dimensions: usize) -> Result<EmbeddingConfig> {
    let mut config = match provider {
        PROVIDER_VLLM => EmbeddingConfig::vllm(base_url),
        PROVIDER_DEEPINFRA => EmbeddingConfig::deepinfra(base_url, api_key),
        other => {
            return Err(EngineError::InvalidArgument(format!(
                "unsupported embedding provider: {other}"
            )))
        }
    };
    config.api_key = api_key.to_string();
    config.model = settings.model.clone();
    config.dimensions = dimensions;
    config.timeout = settings.timeout();
    config.max_retries = settings.max_retries;
    config.batch_size = settings.batch_size;
    config.max_concurrent_requests = settings.max_concurrent_requests;
    Ok(config)
}

fn build_vectorizer(config: &MemoryConfig) -> Result<ResilientVectorizer> {
    let settings = &config.embedding;
    let primary: Arc<dyn Vectorizer> = Arc::new(HttpVectorizer::new(embed_config(
        settings,
        &settings.primary_provider,
        &settings.primary_base_url,
        &settings.primary_api_key,
        config.dimensions,
    )?)?);
    let fallback: Option<Arc<dyn Vectorizer>> = if settings.fallback_enabled() {
        Some(Arc::new(HttpVectorizer::new(embed_config(
            settings,
            &settings.fallback_provider,
            &settings.fallback_base_url,
            &settings.fallback_api_key,
            config.dimensions,
        )?)?))
    } else {
        None
    };
    Ok(ResilientVectorizer::new(
        primary,
        fallback,
        settings.max_primary_failures,
    ))
}

fn rerank_config(settings: &ProviderSettings, provider: &str, base_url: &str, api_key: &str) -> Result<RerankConfig> {
    let mut config = match provider {
        PROVIDER_VLLM => RerankConfig::vllm(base_url),
        PROVIDER_DEEPINFRA => RerankConfig::deepinfra(base_url, api_key),
        other => {
            return Err(EngineError::InvalidArgument(format!(
                "unsupported rerank provider: {other}"
            )))
        }
    };
    config.api_key = api_key.to_string();
    config.model = settings.model.clone();
    config.timeout = settings.timeout();
    config.max_retries = settings.max_retries;
    config.batch_size = settings.batch_size;
    config.max_concurrent_requests = settings.max_concurrent_requests;
    Ok(config)
}

fn build_reranker(settings: &ProviderSettings) -> Result<ResilientReranker> {
    let primary: Arc<dyn PassageReranker> = Arc::new(HttpReranker::new(rerank_config(
        settings,
        &settings.primary_provider,
        &settings.primary_base_url,
        &settings.primary_api_key,
    )?)?);
    let fallback: Option<Arc<dyn PassageReranker>> = if settings.fallback_enabled() {
        Some(Arc::new(HttpReranker::new(rerank_config(
            settings,
            &settings.fallback_provider,
            &settings.fallback_base_url,
            &settings.fallback_api_key,
        )?)?))
    } else {
        None
    };
    Ok(ResilientReranker::new(
        primary,
        fallback,
        settings.max_primary_failures,
    ))
}
