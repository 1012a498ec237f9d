use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::{default_anchors, EmotionAnchor};

const DEFAULT_LISTEN: &str = "0.0.0.0:8900";

/// Default embedding model (add -q suffix for the quantized variant)
const DEFAULT_MODEL: &str = "bge-small-en-v1.5";
/// Default embedding batch size
const DEFAULT_BATCH_SIZE: usize = 512;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Configuration for the embedding backend
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticConfig {
    /// Model name for embeddings (e.g., "bge-small-en-v1.5")
    #[serde(default = "default_model")]
    pub model: String,

    /// Batch size passed to the embedding backend
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Load the model and anchor embeddings at daemon startup instead of
    /// on first use
    #[serde(default)]
    pub preload_model: bool,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            preload_model: false,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub semantic: SemanticConfig,

    #[serde(default = "default_anchors")]
    pub emotion_anchors: Vec<EmotionAnchor>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            semantic: SemanticConfig::default(),
            emotion_anchors: default_anchors(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    fn validate(&self) {
        if self.listen.parse::<SocketAddr>().is_err() {
            panic!("listen must be a host:port address, got '{}'", self.listen);
        }

        let sem = &self.semantic;
        if sem.batch_size == 0 {
            panic!("semantic.batch_size must be greater than 0");
        }
        if sem.download_timeout_secs == 0 {
            panic!("semantic.download_timeout_secs must be greater than 0");
        }

        for (idx, anchor) in self.emotion_anchors.iter().enumerate() {
            let idx = idx + 1;
            if anchor.key.trim().is_empty() {
                panic!("emotion anchor #{idx} has an empty key");
            }
            if anchor.text.trim().is_empty() {
                panic!("emotion anchor '{}' has no reference text", anchor.key);
            }
        }
        let mut keys: Vec<&str> = self.emotion_anchors.iter().map(|a| a.key.as_str()).collect();
        keys.sort();
        let before = keys.len();
        keys.dedup();
        if keys.len() != before {
            panic!("emotion anchor keys must be unique");
        }
    }

    pub fn load_with(base_path: &Path) -> Self {
        std::fs::create_dir_all(base_path).expect("cannot create base directory");
        let config_path = base_path.join("config.yaml");

        // create new if does not exist
        if !config_path.exists() {
            std::fs::write(
                &config_path,
                serde_yml::to_string(&Self::default()).unwrap(),
            )
            .expect("cannot write default config");
        }

        let config_str = std::fs::read_to_string(&config_path).expect("cannot read config file");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_path_buf();

        config.validate();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config).unwrap() {
            config.save();
        }

        config
    }

    pub fn save(&self) {
        let config_str = serde_yml::to_string(&self).unwrap();
        std::fs::write(self.base_path.join("config.yaml"), config_str)
            .expect("cannot write config file");
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

pub fn default_base_dir() -> PathBuf {
    homedir::my_home()
        .ok()
        .flatten()
        .map(|home| home.join(".vodsearch"))
        .unwrap_or_else(|| PathBuf::from(".vodsearch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate();
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path());

        assert!(dir.path().join("config.yaml").exists());
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.semantic.model, DEFAULT_MODEL);
        assert_eq!(config.emotion_anchors.len(), 6);
    }

    #[test]
    fn test_partial_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "listen: \"127.0.0.1:9000\"\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path());
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.semantic.batch_size, DEFAULT_BATCH_SIZE);
        assert!(!config.emotion_anchors.is_empty());
    }

    #[test]
    #[should_panic(expected = "listen must be")]
    fn test_invalid_listen_panics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "listen: \"not an addr\"\n").unwrap();
        Config::load_with(dir.path());
    }

    #[test]
    #[should_panic(expected = "must be unique")]
    fn test_duplicate_anchor_keys_panic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            concat!(
                "emotion_anchors:\n",
                "  - { key: joy, label: Joy, text: \"so fun\" }\n",
                "  - { key: joy, label: Joy2, text: \"haha\" }\n",
            ),
        )
        .unwrap();
        Config::load_with(dir.path());
    }
}
