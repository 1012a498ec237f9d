//! Embedding model wrapper for fastembed.
//!
//! `EmbeddingModel` is the loaded model: batched encoding with optional
//! re-normalization to unit length. `Embedder` is the process-wide cell
//! around it: the model is loaded at most once across all concurrent
//! callers, and a failed load is sticky so the rest of the service keeps
//! running without embedding-dependent features.

use fastembed::{InitOptions, TextEmbedding};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::semantic::index::{l2_norm, ZERO_NORM_EPS};

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("model initialization failed: {0}")]
    InitFailed(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("invalid model name: {0}")]
    InvalidModel(String),
}

impl EmbeddingModel {
    /// Load the named model, downloading it on first use.
    ///
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let _timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Generate embeddings for a batch of texts.
    ///
    /// With `normalize` set, every returned vector is rescaled to unit
    /// length; a degenerate zero output is passed through unchanged.
    pub fn embed_batch(
        &self,
        texts: &[String],
        batch_size: Option<usize>,
        normalize_output: bool,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(texts.to_vec(), batch_size)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if !normalize_output {
            return Ok(embeddings);
        }
        Ok(embeddings
            .into_iter()
            .map(|mut v| {
                let norm = l2_norm(&v);
                if norm >= ZERO_NORM_EPS {
                    for x in v.iter_mut() {
                        *x /= norm;
                    }
                }
                v
            })
            .collect())
    }

    /// Generate a single unit-length embedding.
    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()], None, true)?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("no embedding returned".to_string()))
    }

    /// SHA256 hash of a model name, embedded in vector file headers so a
    /// model swap is detected on load.
    pub fn model_id_hash(model_name: &str) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(model_name.as_bytes());
        hasher.finalize().into()
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15)
            }
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" | "bgelargeenv15q" => {
                Ok(fastembed::EmbeddingModel::BGELargeENV15Q)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("model returned no embedding".to_string()))
    }
}

/// Process-wide lazy cell for the embedding model.
///
/// The first caller pays the load; everyone else waits on the cell. A load
/// failure is logged once and pins the cell to `None`, so embedding-backed
/// operations fail fast from then on while the rest of the service stays up.
pub struct Embedder {
    model_name: String,
    cache_dir: PathBuf,
    download_timeout: Duration,
    cell: OnceCell<Option<Arc<EmbeddingModel>>>,
}

impl Embedder {
    pub fn new(model_name: String, cache_dir: PathBuf, download_timeout: Duration) -> Self {
        Self {
            model_name,
            cache_dir,
            download_timeout,
            cell: OnceCell::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// The loaded model, initializing it on first call.
    ///
    /// Returns `None` when initialization failed; the failure does not
    /// repeat on later calls.
    pub fn get(&self) -> Option<Arc<EmbeddingModel>> {
        self.cell
            .get_or_init(|| {
                log::info!("loading embedding model '{}'", self.model_name);
                match EmbeddingModel::new(
                    &self.model_name,
                    self.cache_dir.clone(),
                    Some(self.download_timeout),
                ) {
                    Ok(model) => {
                        log::info!(
                            "embedding model '{}' ready, {} dimensions",
                            self.model_name,
                            model.dimensions()
                        );
                        Some(Arc::new(model))
                    }
                    Err(err) => {
                        log::error!(
                            "embedding model '{}' unavailable, embedding features disabled: {}",
                            self.model_name,
                            err
                        );
                        None
                    }
                }
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::index::l2_norm;

    #[test]
    fn test_invalid_model_name() {
        let dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new("nonexistent-model", dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_id_hash_deterministic() {
        let a = EmbeddingModel::model_id_hash("bge-small-en-v1.5");
        let b = EmbeddingModel::model_id_hash("bge-small-en-v1.5");
        let c = EmbeddingModel::model_id_hash("all-MiniLM-L6-v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_embedder_failure_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Embedder::new(
            "nonexistent-model".to_string(),
            dir.path().to_path_buf(),
            Duration::from_secs(1),
        );
        assert!(embedder.get().is_none());
        // Second call hits the pinned cell, no second load attempt.
        assert!(embedder.get().is_none());
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_embed_batch_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let model =
            EmbeddingModel::new("all-MiniLM-L6-v2", dir.path().to_path_buf(), None).unwrap();
        assert_eq!(model.dimensions(), 384);

        let texts = vec!["hello world".to_string(), "good morning".to_string()];
        let embeddings = model.embed_batch(&texts, None, true).unwrap();
        assert_eq!(embeddings.len(), 2);
        for v in &embeddings {
            assert_eq!(v.len(), 384);
            assert!((l2_norm(v) - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_embedder_initializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Embedder::new(
            "all-MiniLM-L6-v2".to_string(),
            dir.path().to_path_buf(),
            Duration::from_secs(300),
        );
        let first = embedder.get().unwrap();
        let second = embedder.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
