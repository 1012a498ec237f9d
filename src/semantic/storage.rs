//! On-disk persistence for one author's index: a vector file plus a
//! metadata JSON, written as an atomic pair.
//!
//! Vector file `<login>.vec`:
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of the embedding model name)
//! - dim: u16 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Rows (repeated `row_count` times): [f32; dim] (little-endian).
//!
//! Metadata file `<login>.meta.json` carries the versioned document defined
//! by [`IndexMeta`]; `comment_ids[i]` and `centroid_similarities[i]` are
//! position-aligned with the i-th vector row.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::semantic::index::FlatIndex;

/// Current vector file format version
const FORMAT_VERSION: u8 = 1;

/// Current metadata schema version
const META_VERSION: u32 = 1;

/// Header size in bytes: version(1) + model_id(32) + dim(2) + row_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported vector file version {0}, supported version {1}")]
    UnsupportedVersion(u8, u8),

    #[error("vector file checksum mismatch, file may be corrupted")]
    ChecksumMismatch,

    #[error("vector file was written with a different embedding model")]
    ModelMismatch,

    #[error("malformed metadata: {0}")]
    MalformedMeta(String),
}

/// The metadata document persisted next to the vector file.
///
/// Every field is required; a document that fails to parse, or whose
/// `version` is not the current one, is rejected rather than defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    pub comment_ids: Vec<String>,
    pub total_comments: usize,
    pub embedding_dim: usize,
    pub centroid: Vec<f32>,
    pub centroid_similarities: Vec<f32>,
}

impl IndexMeta {
    pub fn new(
        comment_ids: Vec<String>,
        embedding_dim: usize,
        centroid: Vec<f32>,
        centroid_similarities: Vec<f32>,
    ) -> Self {
        Self {
            version: META_VERSION,
            total_comments: comment_ids.len(),
            comment_ids,
            embedding_dim,
            centroid,
            centroid_similarities,
        }
    }

    fn validate(&self, index: &FlatIndex) -> Result<(), StorageError> {
        if self.version != META_VERSION {
            return Err(StorageError::MalformedMeta(format!(
                "unknown metadata version {}",
                self.version
            )));
        }
        if self.embedding_dim != index.dim() {
            return Err(StorageError::MalformedMeta(format!(
                "embedding_dim {} does not match vector file dim {}",
                self.embedding_dim,
                index.dim()
            )));
        }
        let rows = index.len();
        if self.comment_ids.len() != rows
            || self.centroid_similarities.len() != rows
            || self.total_comments != rows
        {
            return Err(StorageError::MalformedMeta(format!(
                "metadata counts (ids {}, similarities {}, total {}) do not match {} vector rows",
                self.comment_ids.len(),
                self.centroid_similarities.len(),
                self.total_comments,
                rows
            )));
        }
        if self.centroid.len() != index.dim() {
            return Err(StorageError::MalformedMeta(format!(
                "centroid has {} components, expected {}",
                self.centroid.len(),
                index.dim()
            )));
        }
        Ok(())
    }
}

/// Storage manager for one author's (vector file, metadata) pair.
pub struct IndexStorage {
    vec_path: PathBuf,
    meta_path: PathBuf,
}

impl IndexStorage {
    pub fn new(data_dir: &Path, login: &str) -> Self {
        Self {
            vec_path: data_dir.join(format!("{login}.vec")),
            meta_path: data_dir.join(format!("{login}.meta.json")),
        }
    }

    pub fn vec_path(&self) -> &Path {
        &self.vec_path
    }

    /// True only when both files of the pair are present.
    pub fn exists(&self) -> bool {
        self.vec_path.exists() && self.meta_path.exists()
    }

    /// Modification time of the vector file, used for staleness detection.
    pub fn mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.vec_path)
            .and_then(|m| m.modified())
            .ok()
    }

    /// Load the pair from disk, verifying format, checksum, model identity
    /// and the position alignment between the two files.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<(FlatIndex, IndexMeta), StorageError> {
        let file = File::open(&self.vec_path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(StorageError::ModelMismatch);
        }

        let dim = header.dim as usize;
        let mut data = Vec::with_capacity(dim * header.row_count as usize);
        let mut float_bytes = [0u8; 4];
        for _ in 0..header.row_count as usize * dim {
            reader.read_exact(&mut float_bytes)?;
            data.push(f32::from_le_bytes(float_bytes));
        }
        let index = FlatIndex::from_raw(dim, data)
            .map_err(|e| StorageError::MalformedMeta(e.to_string()))?;

        let meta_file = File::open(&self.meta_path)?;
        let meta: IndexMeta = serde_json::from_reader(BufReader::new(meta_file))
            .map_err(|e| StorageError::MalformedMeta(e.to_string()))?;
        meta.validate(&index)?;

        Ok((index, meta))
    }

    /// Persist the pair crash-safely: both files go to temporary paths,
    /// are fsynced, then renamed into place. A concurrent reader sees
    /// either the old pair or the new pair, never a half-written file.
    pub fn save(
        &self,
        index: &FlatIndex,
        meta: &IndexMeta,
        model_id: &[u8; 32],
    ) -> Result<(), StorageError> {
        meta.validate(index)?;

        let tmp_vec = self.vec_path.with_extension("vec.tmp");
        let tmp_meta = self.meta_path.with_extension("json.tmp");

        let result = self.write_pair(&tmp_vec, &tmp_meta, index, meta, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_vec);
            let _ = std::fs::remove_file(&tmp_meta);
            return result;
        }

        std::fs::rename(&tmp_vec, &self.vec_path)?;
        std::fs::rename(&tmp_meta, &self.meta_path)?;

        Ok(())
    }

    fn write_pair(
        &self,
        tmp_vec: &Path,
        tmp_meta: &Path,
        index: &FlatIndex,
        meta: &IndexMeta,
        model_id: &[u8; 32],
    ) -> Result<(), StorageError> {
        let file = File::create(tmp_vec)?;
        let mut writer = BufWriter::new(file);

        write_header(
            &mut writer,
            &Header {
                version: FORMAT_VERSION,
                model_id: *model_id,
                dim: index.dim() as u16,
                row_count: index.len() as u64,
            },
        )?;
        for value in index.as_slice() {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        let meta_file = File::create(tmp_meta)?;
        let mut meta_writer = BufWriter::new(meta_file);
        serde_json::to_writer(&mut meta_writer, meta)
            .map_err(|e| StorageError::MalformedMeta(e.to_string()))?;
        meta_writer.flush()?;
        let meta_file = meta_writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        meta_file.sync_all()?;

        Ok(())
    }
}

struct Header {
    version: u8,
    model_id: [u8; 32],
    dim: u16,
    row_count: u64,
}

fn read_header(reader: &mut BufReader<File>) -> Result<Header, StorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version != FORMAT_VERSION {
        return Err(StorageError::UnsupportedVersion(version, FORMAT_VERSION));
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    let dim = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[35..43]);
    let row_count = u64::from_le_bytes(count_bytes);

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&header_bytes[43..47]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(StorageError::ChecksumMismatch);
    }

    Ok(Header {
        version,
        model_id,
        dim,
        row_count,
    })
}

fn write_header(writer: &mut BufWriter<File>, header: &Header) -> Result<(), StorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dim.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.row_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}
