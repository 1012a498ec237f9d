//! One author's index: vectors, comment ids, centroid, and the lock that
//! serializes every operation against them.
//!
//! The vector structure is mutated in place during updates, so reads and
//! writes alike go through the author's mutex. Distinct authors share
//! nothing. Before a read is served the on-disk modification time is
//! compared with the last one seen, picking up indexes rebuilt out of band.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use serde::Serialize;

use crate::semantic::index::{dot, l2_norm, FlatIndex, IndexError, ZERO_NORM_EPS};
use crate::semantic::storage::{IndexMeta, IndexStorage, StorageError};

/// A ranked search hit for one comment.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub comment_id: String,
    pub score: f32,
}

/// Errors surfaced by author index operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthorIndexError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

struct Loaded {
    index: FlatIndex,
    comment_ids: Vec<String>,
    centroid: Vec<f32>,
    centroid_similarities: Vec<f32>,
}

impl Loaded {
    fn empty(dim: usize) -> Self {
        Self {
            index: FlatIndex::new(dim),
            comment_ids: Vec::new(),
            centroid: vec![0.0; dim],
            centroid_similarities: Vec::new(),
        }
    }
}

#[derive(Default)]
struct State {
    loaded: Option<Loaded>,
    last_mtime: Option<SystemTime>,
}

/// Per-author vector index with exclusive-lock semantics.
pub struct AuthorIndex {
    login: String,
    storage: IndexStorage,
    model_id: [u8; 32],
    state: Mutex<State>,
}

impl AuthorIndex {
    pub fn new(data_dir: &Path, login: &str, model_id: [u8; 32]) -> Self {
        Self {
            login: login.to_string(),
            storage: IndexStorage::new(data_dir, login),
            model_id,
            state: Mutex::new(State::default()),
        }
    }

    /// True iff the persisted file pair exists for this author.
    pub fn is_available(&self) -> bool {
        self.storage.exists()
    }

    /// Number of indexed comments, reloading first if the files changed.
    pub fn total(&self) -> Result<usize, AuthorIndexError> {
        let mut state = self.lock()?;
        self.reload_if_stale(&mut state)?;
        Ok(state
            .loaded
            .as_ref()
            .map(|l| l.comment_ids.len())
            .unwrap_or(0))
    }

    /// Append new comments to the index.
    ///
    /// Ids already present are skipped, so resubmitting a batch is a no-op.
    /// The centroid and per-comment centroid similarities are recomputed
    /// over the full index and the pair is persisted atomically before the
    /// lock is released. Returns the number of vectors actually added.
    pub fn update(
        &self,
        new_ids: &[String],
        new_vectors: &[Vec<f32>],
    ) -> Result<usize, AuthorIndexError> {
        if new_ids.len() != new_vectors.len() {
            return Err(AuthorIndexError::Internal(format!(
                "ids and vectors length mismatch: {} vs {}",
                new_ids.len(),
                new_vectors.len()
            )));
        }
        if new_ids.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock()?;
        self.ensure_loaded(&mut state)?;

        if state.loaded.is_none() {
            state.loaded = Some(Loaded::empty(new_vectors[0].len()));
        }
        let loaded = match state.loaded.as_mut() {
            Some(l) => l,
            None => return Ok(0),
        };

        // Dedup against the index and within the batch itself.
        let surviving: Vec<usize> = {
            let mut seen: HashSet<&str> = loaded.comment_ids.iter().map(String::as_str).collect();
            new_ids
                .iter()
                .enumerate()
                .filter(|(_, id)| seen.insert(id.as_str()))
                .map(|(i, _)| i)
                .collect()
        };
        if surviving.is_empty() {
            return Ok(0);
        }

        let dim = loaded.index.dim();
        for &i in &surviving {
            if new_vectors[i].len() != dim {
                return Err(IndexError::DimensionMismatch {
                    expected: dim,
                    got: new_vectors[i].len(),
                }
                .into());
            }
        }

        for &i in &surviving {
            loaded.index.push(&new_vectors[i])?;
            loaded.comment_ids.push(new_ids[i].clone());
        }

        Self::recompute_centroid(loaded);

        let meta = IndexMeta::new(
            loaded.comment_ids.clone(),
            dim,
            loaded.centroid.clone(),
            loaded.centroid_similarities.clone(),
        );
        self.storage.save(&loaded.index, &meta, &self.model_id)?;
        log::info!(
            "index updated [{}]: +{} comments, {} total",
            self.login,
            surviving.len(),
            meta.total_comments
        );

        state.last_mtime = self.storage.mtime();
        Ok(surviving.len())
    }

    /// Rank stored comments against `query` by inner product.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult>, AuthorIndexError> {
        let mut state = self.lock()?;
        self.reload_if_stale(&mut state)?;
        let loaded = match state.loaded.as_ref() {
            Some(l) if !l.index.is_empty() => l,
            _ => return Ok(vec![]),
        };

        let hits = loaded.index.search(query, top_k)?;
        Ok(hits
            .into_iter()
            .map(|h| SearchResult {
                comment_id: loaded.comment_ids[h.position].clone(),
                score: h.score,
            })
            .collect())
    }

    /// Slide a window through the typicality ranking.
    ///
    /// All comments are ordered by centroid similarity, descending. With
    /// `max_offset = total - top_k`, the window starts at
    /// `round(position * max_offset)`: position 0.0 yields the most typical
    /// comments, 1.0 the most unusual, intermediate values move linearly
    /// between them. Order inside the window stays similarity-descending.
    pub fn search_by_centroid(
        &self,
        position: f32,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, AuthorIndexError> {
        let mut state = self.lock()?;
        self.reload_if_stale(&mut state)?;
        let loaded = match state.loaded.as_ref() {
            Some(l) if !l.comment_ids.is_empty() => l,
            _ => return Ok(vec![]),
        };
        if top_k == 0 {
            return Ok(vec![]);
        }

        let mut pairs: Vec<(usize, f32)> = loaded
            .centroid_similarities
            .iter()
            .copied()
            .enumerate()
            .collect();
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let total = pairs.len();
        let max_offset = total.saturating_sub(top_k);
        let position = position.clamp(0.0, 1.0);
        let offset = ((position as f64 * max_offset as f64).round() as usize).min(max_offset);
        let end = (offset + top_k).min(total);

        Ok(pairs[offset..end]
            .iter()
            .map(|&(idx, sim)| SearchResult {
                comment_id: loaded.comment_ids[idx].clone(),
                score: sim,
            })
            .collect())
    }

    /// Mean of all stored vectors, rescaled to unit length. A numerically
    /// zero mean is kept as the zero vector, which makes every similarity
    /// zero until more diverse data arrives.
    fn recompute_centroid(loaded: &mut Loaded) {
        let dim = loaded.index.dim();
        let n = loaded.index.len();
        let mut centroid = vec![0.0f32; dim];
        for row in loaded.index.rows() {
            for (acc, x) in centroid.iter_mut().zip(row) {
                *acc += x;
            }
        }
        for x in centroid.iter_mut() {
            *x /= n as f32;
        }

        let norm = l2_norm(&centroid);
        if norm >= ZERO_NORM_EPS {
            for x in centroid.iter_mut() {
                *x /= norm;
            }
        } else {
            centroid.iter_mut().for_each(|x| *x = 0.0);
        }

        loaded.centroid_similarities = loaded.index.rows().map(|row| dot(row, &centroid)).collect();
        loaded.centroid = centroid;
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AuthorIndexError> {
        self.state
            .lock()
            .map_err(|e| AuthorIndexError::Internal(format!("lock poisoned: {}", e)))
    }

    fn load_into(&self, state: &mut State) -> Result<(), AuthorIndexError> {
        let (index, meta) = self.storage.load(&self.model_id)?;
        log::info!(
            "loaded index [{}]: {} comments",
            self.login,
            meta.total_comments
        );
        state.last_mtime = self.storage.mtime();
        state.loaded = Some(Loaded {
            index,
            comment_ids: meta.comment_ids,
            centroid: meta.centroid,
            centroid_similarities: meta.centroid_similarities,
        });
        Ok(())
    }

    fn ensure_loaded(&self, state: &mut State) -> Result<(), AuthorIndexError> {
        if state.loaded.is_none() && self.storage.exists() {
            self.load_into(state)?;
        }
        Ok(())
    }

    /// Reload when the vector file's mtime moved since the last load. Runs
    /// under the author lock, so racing readers reload at most once.
    fn reload_if_stale(&self, state: &mut State) -> Result<(), AuthorIndexError> {
        if !self.storage.exists() {
            return Ok(());
        }
        let current = self.storage.mtime();
        if state.loaded.is_none() || state.last_mtime != current {
            self.load_into(state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::index::normalize;

    fn model_id() -> [u8; 32] {
        [7u8; 32]
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Unit vector in the plane at the given angle (degrees).
    fn at_angle(degrees: f32) -> Vec<f32> {
        let rad = degrees.to_radians();
        vec![rad.cos(), rad.sin()]
    }

    #[test]
    fn test_unavailable_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        assert!(!author.is_available());
        assert_eq!(author.total().unwrap(), 0);
        assert!(author.search(&[1.0, 0.0], 5).unwrap().is_empty());
        assert!(author.search_by_centroid(0.0, 5).unwrap().is_empty());
    }

    #[test]
    fn test_update_creates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        let added = author
            .update(
                &ids(&["m1", "m2"]),
                &[at_angle(0.0), at_angle(90.0)],
            )
            .unwrap();

        assert_eq!(added, 2);
        assert!(author.is_available());
        assert_eq!(author.total().unwrap(), 2);
    }

    #[test]
    fn test_update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        let batch_ids = ids(&["m1", "m2"]);
        let batch_vecs = vec![at_angle(0.0), at_angle(45.0)];

        assert_eq!(author.update(&batch_ids, &batch_vecs).unwrap(), 2);
        assert_eq!(author.update(&batch_ids, &batch_vecs).unwrap(), 0);
        assert_eq!(author.total().unwrap(), 2);
    }

    #[test]
    fn test_update_skips_known_ids_in_mixed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        author.update(&ids(&["m1"]), &[at_angle(0.0)]).unwrap();
        let added = author
            .update(&ids(&["m1", "m2"]), &[at_angle(0.0), at_angle(30.0)])
            .unwrap();

        assert_eq!(added, 1);
        assert_eq!(author.total().unwrap(), 2);
    }

    #[test]
    fn test_update_dedups_within_batch() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        let added = author
            .update(
                &ids(&["m1", "m1", "m2"]),
                &[at_angle(0.0), at_angle(10.0), at_angle(20.0)],
            )
            .unwrap();

        assert_eq!(added, 2);
        assert_eq!(author.total().unwrap(), 2);
    }

    #[test]
    fn test_update_rejects_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        author.update(&ids(&["m1"]), &[at_angle(0.0)]).unwrap();

        let result = author.update(&ids(&["m2"]), &[vec![1.0, 0.0, 0.0]]);
        assert!(matches!(
            result,
            Err(AuthorIndexError::Index(IndexError::DimensionMismatch { .. }))
        ));
        // Nothing was appended or persisted.
        assert_eq!(author.total().unwrap(), 1);
    }

    #[test]
    fn test_update_empty_batch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        assert_eq!(author.update(&[], &[]).unwrap(), 0);
        assert!(!author.is_available());
    }

    #[test]
    fn test_search_ranks_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        author
            .update(
                &ids(&["m1", "m2", "m3", "m4", "m5"]),
                &[
                    at_angle(0.0),
                    at_angle(20.0),
                    at_angle(50.0),
                    at_angle(90.0),
                    at_angle(170.0),
                ],
            )
            .unwrap();

        let results = author.search(&at_angle(0.0), 100).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].comment_id, "m1");
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        let top2 = author.search(&at_angle(0.0), 2).unwrap();
        assert_eq!(top2.len(), 2);
        assert_eq!(top2[0].comment_id, "m1");
        assert_eq!(top2[1].comment_id, "m2");
    }

    #[test]
    fn test_centroid_window_typical_and_unusual() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        // Angles picked so distance from the mean direction grows strictly
        // from m1 to m4.
        author
            .update(
                &ids(&["m1", "m2", "m3", "m4"]),
                &[
                    at_angle(0.0),
                    at_angle(10.0),
                    at_angle(40.0),
                    at_angle(-60.0),
                ],
            )
            .unwrap();

        // Sanity: similarity to the centroid strictly decreases m1..m4.
        let all = author.search_by_centroid(0.0, 4).unwrap();
        let order: Vec<&str> = all.iter().map(|r| r.comment_id.as_str()).collect();
        assert_eq!(order, vec!["m1", "m2", "m3", "m4"]);
        for pair in all.windows(2) {
            assert!(pair[0].score > pair[1].score);
        }

        let typical = author.search_by_centroid(0.0, 2).unwrap();
        let typical_ids: Vec<&str> = typical.iter().map(|r| r.comment_id.as_str()).collect();
        assert_eq!(typical_ids, vec!["m1", "m2"]);

        let unusual = author.search_by_centroid(1.0, 2).unwrap();
        let unusual_ids: Vec<&str> = unusual.iter().map(|r| r.comment_id.as_str()).collect();
        assert_eq!(unusual_ids, vec!["m3", "m4"]);
    }

    #[test]
    fn test_centroid_window_midpoint() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        author
            .update(
                &ids(&["m1", "m2", "m3", "m4"]),
                &[
                    at_angle(0.0),
                    at_angle(10.0),
                    at_angle(40.0),
                    at_angle(-60.0),
                ],
            )
            .unwrap();

        // total 4, top_k 2 -> max_offset 2, position 0.5 -> offset 1.
        let window = author.search_by_centroid(0.5, 2).unwrap();
        let window_ids: Vec<&str> = window.iter().map(|r| r.comment_id.as_str()).collect();
        assert_eq!(window_ids, vec!["m2", "m3"]);
    }

    #[test]
    fn test_centroid_window_smaller_than_top_k() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        author
            .update(&ids(&["m1", "m2"]), &[at_angle(0.0), at_angle(30.0)])
            .unwrap();

        let window = author.search_by_centroid(1.0, 50).unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_persist_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let vectors = vec![at_angle(0.0), at_angle(25.0), at_angle(70.0)];
        {
            let author = AuthorIndex::new(dir.path(), "alice", model_id());
            author
                .update(&ids(&["m1", "m2", "m3"]), &vectors)
                .unwrap();
        }

        // Fresh instance loads everything back from disk.
        let author = AuthorIndex::new(dir.path(), "alice", model_id());
        assert_eq!(author.total().unwrap(), 3);

        let results = author.search(&at_angle(0.0), 3).unwrap();
        assert_eq!(results[0].comment_id, "m1");

        // Appending after reload keeps earlier positions stable.
        author.update(&ids(&["m4"]), &[at_angle(90.0)]).unwrap();
        let all = author.search(&at_angle(0.0), 4).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].comment_id, "m1");
    }

    #[test]
    fn test_reload_picks_up_external_update() {
        let dir = tempfile::tempdir().unwrap();

        let reader = AuthorIndex::new(dir.path(), "alice", model_id());
        let writer = AuthorIndex::new(dir.path(), "alice", model_id());

        writer.update(&ids(&["m1"]), &[at_angle(0.0)]).unwrap();
        assert_eq!(reader.total().unwrap(), 1);

        // The writer instance stands in for another process rebuilding the
        // files; the reader notices the new mtime and reloads.
        std::thread::sleep(std::time::Duration::from_millis(20));
        writer.update(&ids(&["m2"]), &[at_angle(45.0)]).unwrap();

        assert_eq!(reader.total().unwrap(), 2);
        let results = reader.search(&at_angle(45.0), 2).unwrap();
        assert_eq!(results[0].comment_id, "m2");
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let author = Arc::new(AuthorIndex::new(dir.path(), "alice", model_id()));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let author = author.clone();
                std::thread::spawn(move || {
                    let batch_ids = vec![format!("m{t}a"), format!("m{t}b")];
                    author
                        .update(&batch_ids, &[at_angle(t as f32 * 10.0), at_angle(t as f32 * 20.0)])
                        .unwrap()
                })
            })
            .collect();

        let added: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(added, 8);
        assert_eq!(author.total().unwrap(), 8);
    }

    #[test]
    fn test_centroid_is_unit_mean() {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIndex::new(dir.path(), "alice", model_id());

        let a = at_angle(0.0);
        let b = at_angle(90.0);
        author.update(&ids(&["m1", "m2"]), &[a.clone(), b.clone()]).unwrap();

        let expected = normalize(vec![(a[0] + b[0]) / 2.0, (a[1] + b[1]) / 2.0]).unwrap();
        let results = author.search_by_centroid(0.0, 2).unwrap();

        // Both vectors sit at 45 degrees from the centroid.
        let expected_sim = dot(&a, &expected);
        for r in &results {
            assert!((r.score - expected_sim).abs() < 1e-5);
        }
    }
}
