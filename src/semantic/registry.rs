//! Process-wide map of author indexes, one instance per author key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::semantic::author::{AuthorIndex, AuthorIndexError};

/// Registry handing out exactly one `AuthorIndex` per key.
///
/// Lookups take the shared lock; only a first access to a new key takes the
/// exclusive lock, and only for the insert itself. Index operations never
/// run under the registry lock, so authors don't serialize each other.
pub struct IndexRegistry {
    data_dir: PathBuf,
    model_id: [u8; 32],
    indexes: RwLock<HashMap<String, Arc<AuthorIndex>>>,
}

impl IndexRegistry {
    pub fn new(data_dir: PathBuf, model_id: [u8; 32]) -> Self {
        Self {
            data_dir,
            model_id,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// The author's index, created on first access.
    pub fn get_or_create(&self, login: &str) -> Result<Arc<AuthorIndex>, AuthorIndexError> {
        {
            let map = self
                .indexes
                .read()
                .map_err(|e| AuthorIndexError::Internal(format!("registry lock poisoned: {}", e)))?;
            if let Some(index) = map.get(login) {
                return Ok(index.clone());
            }
        }

        let mut map = self
            .indexes
            .write()
            .map_err(|e| AuthorIndexError::Internal(format!("registry lock poisoned: {}", e)))?;
        let index = map
            .entry(login.to_string())
            .or_insert_with(|| Arc::new(AuthorIndex::new(&self.data_dir, login, self.model_id)));
        Ok(index.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let registry = IndexRegistry::new(dir.path().to_path_buf(), [1u8; 32]);

        let a = registry.get_or_create("alice").unwrap();
        let b = registry.get_or_create("alice").unwrap();
        let c = registry.get_or_create("bob").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_concurrent_first_access_yields_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(IndexRegistry::new(dir.path().to_path_buf(), [1u8; 32]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create("alice").unwrap())
            })
            .collect();

        let instances: Vec<Arc<AuthorIndex>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in instances.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }
}
