//! Per-author semantic search over archived chat comments.
//!
//! # Architecture
//!
//! - `embeddings`: fastembed wrapper plus the once-only model cell
//! - `anchors`: emotion anchor table and weighted query composition
//! - `index`: exact inner-product structure over unit vectors
//! - `storage`: atomic (vector file, metadata) pair per author
//! - `author`: one author's index behind its exclusive lock
//! - `registry`: one `AuthorIndex` per author key, process-wide
//! - `service`: the facade the HTTP layer talks to

pub mod anchors;
pub mod author;
pub mod embeddings;
mod index;
mod registry;
mod service;
mod storage;

pub use anchors::{default_anchors, AnchorAxis, EmotionAnchor};
pub use author::{AuthorIndexError, SearchResult};
pub use embeddings::EmbeddingModel;
pub use index::IndexError;
pub use service::{SearchError, SearchService, UpdateOutcome};
