//! High-level search service tying the embedding model, the anchor table
//! and the author index registry together.
//!
//! Owns no per-request state: every entry point turns its input into a
//! vector-space query and delegates to the target author's index. Built
//! once at process start and shared behind an `Arc`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SemanticConfig;
use crate::semantic::anchors::{AnchorAxis, AnchorSet, EmotionAnchor};
use crate::semantic::author::{AuthorIndexError, SearchResult};
use crate::semantic::embeddings::{Embedder, EmbeddingError, EmbeddingModel};
use crate::semantic::registry::IndexRegistry;

/// Errors that can occur during search service operations.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("embedding model is unavailable")]
    ModelUnavailable,

    #[error("no index available for author '{0}'")]
    IndexUnavailable(String),

    #[error("comment_ids and texts length mismatch: {ids} vs {texts}")]
    LengthMismatch { ids: usize, texts: usize },

    #[error("no active emotion weights in request")]
    EmptyComposition,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Author(#[from] AuthorIndexError),
}

/// Result of an index update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub added: usize,
    pub total: usize,
}

/// The process-wide search service.
pub struct SearchService {
    embedder: Embedder,
    anchors: AnchorSet,
    registry: IndexRegistry,
    batch_size: usize,
}

impl SearchService {
    /// Build the service, creating the data directories if needed.
    pub fn new(
        config: &SemanticConfig,
        anchors: Vec<EmotionAnchor>,
        base_dir: &Path,
    ) -> std::io::Result<Self> {
        let data_dir = base_dir.join("indexes");
        std::fs::create_dir_all(&data_dir)?;

        let model_id = EmbeddingModel::model_id_hash(&config.model);
        Ok(Self {
            embedder: Embedder::new(
                config.model.clone(),
                base_dir.to_path_buf(),
                Duration::from_secs(config.download_timeout_secs),
            ),
            anchors: AnchorSet::new(anchors),
            registry: IndexRegistry::new(data_dir, model_id),
            batch_size: config.batch_size,
        })
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Emotion axes in configuration order.
    pub fn axes(&self) -> Vec<AnchorAxis> {
        self.anchors.axes()
    }

    /// Eagerly load the model and anchor embeddings. Failures are logged
    /// and non-fatal; first-use initialization takes over in that case.
    pub fn warm(&self) {
        let Some(model) = self.embedder.get() else {
            return;
        };
        if !self.anchors.is_empty() {
            if let Err(err) = self.anchors.warm(&model) {
                log::error!("failed to warm emotion anchor embeddings: {}", err);
            }
        }
    }

    /// Embed a batch of texts.
    pub fn embed(
        &self,
        texts: &[String],
        normalize: bool,
    ) -> Result<Vec<Vec<f32>>, SearchError> {
        let model = self.model()?;
        Ok(model.embed_batch(texts, Some(self.batch_size), normalize)?)
    }

    /// Number of indexed comments for the author.
    pub fn status(&self, login: &str) -> Result<usize, SearchError> {
        let index = self.registry.get_or_create(login)?;
        if !index.is_available() {
            return Err(SearchError::IndexUnavailable(login.to_string()));
        }
        Ok(index.total()?)
    }

    /// Embed a batch of comments and append them to the author's index.
    pub fn update_index(
        &self,
        login: &str,
        comment_ids: Vec<String>,
        texts: Vec<String>,
    ) -> Result<UpdateOutcome, SearchError> {
        if comment_ids.len() != texts.len() {
            return Err(SearchError::LengthMismatch {
                ids: comment_ids.len(),
                texts: texts.len(),
            });
        }

        let index = self.registry.get_or_create(login)?;
        let model = self.model()?;
        let vectors = model.embed_batch(&texts, Some(self.batch_size), true)?;

        let added = index.update(&comment_ids, &vectors)?;
        let total = index.total()?;

        Ok(UpdateOutcome { added, total })
    }

    /// Free-text similarity search against one author's comments.
    pub fn search_similar(
        &self,
        login: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let index = self.registry.get_or_create(login)?;
        if !index.is_available() {
            // Checked before embedding so a missing index costs no model call.
            return Err(SearchError::IndexUnavailable(login.to_string()));
        }

        let model = self.model()?;
        let query_vec = model.embed_one(query)?;
        Ok(index.search(&query_vec, top_k)?)
    }

    /// Typicality window search; needs no embedding at all.
    pub fn search_centroid(
        &self,
        login: &str,
        position: f32,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let index = self.registry.get_or_create(login)?;
        if !index.is_available() {
            return Err(SearchError::IndexUnavailable(login.to_string()));
        }
        Ok(index.search_by_centroid(position, top_k)?)
    }

    /// Search with a query composed from weighted emotion anchors.
    pub fn search_emotion(
        &self,
        login: &str,
        weights: &HashMap<String, f32>,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let index = self.registry.get_or_create(login)?;
        if !index.is_available() {
            return Err(SearchError::IndexUnavailable(login.to_string()));
        }
        if !self.anchors.has_active_weights(weights) {
            // All-zero or unknown weights never reach the model.
            return Err(SearchError::EmptyComposition);
        }

        let model = self.model()?;
        let query_vec = self
            .anchors
            .compose(&model, weights)?
            .ok_or(SearchError::EmptyComposition)?;
        Ok(index.search(&query_vec, top_k)?)
    }

    fn model(&self) -> Result<Arc<EmbeddingModel>, SearchError> {
        self.embedder.get().ok_or(SearchError::ModelUnavailable)
    }
}
