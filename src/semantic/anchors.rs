//! Emotion anchor table for slider-driven search.
//!
//! Each anchor pins one semantic axis ("joy", "anger", ...) to a reference
//! sentence. Anchor embeddings are computed at most once per process and a
//! query vector is composed as the normalized weighted sum of the active
//! anchors.

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::{EmbeddingError, EmbeddingModel};
use crate::semantic::index::normalize;

/// One configured anchor: stable key, display label, reference text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmotionAnchor {
    pub key: String,
    pub label: String,
    pub text: String,
}

/// An axis entry as shown to UI clients.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnchorAxis {
    pub key: String,
    pub label: String,
}

/// The immutable anchor set with lazily computed embeddings.
pub struct AnchorSet {
    anchors: Vec<EmotionAnchor>,
    embeddings: OnceCell<HashMap<String, Vec<f32>>>,
}

impl AnchorSet {
    pub fn new(anchors: Vec<EmotionAnchor>) -> Self {
        Self {
            anchors,
            embeddings: OnceCell::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Axes in configuration order, for UI listings.
    pub fn axes(&self) -> Vec<AnchorAxis> {
        self.anchors
            .iter()
            .map(|a| AnchorAxis {
                key: a.key.clone(),
                label: a.label.clone(),
            })
            .collect()
    }

    /// True when at least one weight is positive and names a known anchor.
    ///
    /// Checked before any model work so an all-zero request never touches
    /// the embedding backend.
    pub fn has_active_weights(&self, weights: &HashMap<String, f32>) -> bool {
        weights
            .iter()
            .any(|(key, w)| *w > 0.0 && self.anchors.iter().any(|a| a.key == *key))
    }

    /// Compose the normalized weighted sum of the active anchor vectors.
    ///
    /// Returns `Ok(None)` when no anchor is active or the sum cancels to a
    /// near-zero norm; callers treat that as "no meaningful query".
    pub fn compose(
        &self,
        model: &EmbeddingModel,
        weights: &HashMap<String, f32>,
    ) -> Result<Option<Vec<f32>>, EmbeddingError> {
        if !self.has_active_weights(weights) {
            return Ok(None);
        }

        let embeddings = self.embeddings(model)?;
        Ok(compose_weighted(embeddings, weights))
    }

    /// Anchor embeddings, computed on first use and cached for the process
    /// lifetime.
    fn embeddings(
        &self,
        model: &EmbeddingModel,
    ) -> Result<&HashMap<String, Vec<f32>>, EmbeddingError> {
        self.embeddings.get_or_try_init(|| {
            let texts: Vec<String> = self.anchors.iter().map(|a| a.text.clone()).collect();
            let vectors = model.embed_batch(&texts, None, true)?;
            let map: HashMap<String, Vec<f32>> = self
                .anchors
                .iter()
                .map(|a| a.key.clone())
                .zip(vectors)
                .collect();
            log::info!(
                "emotion anchor embeddings computed: {:?}",
                self.anchors.iter().map(|a| a.key.as_str()).collect::<Vec<_>>()
            );
            Ok(map)
        })
    }

    /// Warm the anchor embedding cache, used at daemon startup.
    pub fn warm(&self, model: &EmbeddingModel) -> Result<(), EmbeddingError> {
        self.embeddings(model).map(|_| ())
    }
}

/// Weighted sum over the anchor vectors, rescaled to unit length.
/// `None` when nothing contributes or the sum cancels to near-zero norm.
fn compose_weighted(
    embeddings: &HashMap<String, Vec<f32>>,
    weights: &HashMap<String, f32>,
) -> Option<Vec<f32>> {
    let dim = embeddings.values().next()?.len();
    let mut combined = vec![0.0f32; dim];
    let mut contributed = false;
    for (key, weight) in weights {
        if *weight <= 0.0 {
            continue;
        }
        if let Some(anchor_vec) = embeddings.get(key) {
            contributed = true;
            for (acc, x) in combined.iter_mut().zip(anchor_vec.iter()) {
                *acc += weight * x;
            }
        }
    }
    if !contributed {
        return None;
    }
    normalize(combined)
}

/// The default anchor table; overridable through the config file.
pub fn default_anchors() -> Vec<EmotionAnchor> {
    [
        ("joy", "Laughter & fun", "That was hilarious, I can't stop laughing, so much fun!"),
        ("surprise", "Surprise", "What?! I did not see that coming at all, unbelievable!"),
        (
            "admiration",
            "Admiration",
            "That was incredible, truly impressive play, I'm moved by how good that was.",
        ),
        ("anger", "Anger", "This is so frustrating, that call was terrible, I'm really annoyed."),
        ("sadness", "Sadness", "That's heartbreaking, I feel so sad about this, what a loss."),
        ("cheer", "Cheering", "You can do it, keep going, we believe in you, let's go!"),
    ]
    .into_iter()
    .map(|(key, label, text)| EmotionAnchor {
        key: key.to_string(),
        label: label.to_string(),
        text: text.to_string(),
    })
    .collect()
}
