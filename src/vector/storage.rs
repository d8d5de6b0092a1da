//! Binary file format for the persistent vector index.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header (47 bytes):
//!   [0]      format version (u8)
//!   [1..33]  model fingerprint, SHA-256 of the model name
//!   [33..35] dimensions (u16), 0 when not yet fixed
//!   [35..43] entry count (u64)
//!   [43..47] CRC32 of bytes 0..43
//! entries (entry_count times):
//!   id (u64) followed by dimensions f32 components
//! ```
//!
//! Saves go through a temp file in the same directory plus a rename, so a
//! crash mid-write never leaves a half-written index behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use super::index::VectorIndex;

const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 47;

/// Errors raised while reading or writing the index file.
#[derive(Debug, thiserror::Error)]
pub enum IndexFileError {
    #[error("index file io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid index file: {0}")]
    InvalidFormat(String),

    #[error("unsupported index file version {found} (expected {expected})")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("index file was built with a different embedding model")]
    ModelMismatch,

    #[error("index file checksum mismatch, file is corrupt")]
    ChecksumMismatch,
}

impl IndexFileError {
    /// Only transient io failures are worth retrying; format and model
    /// problems need an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexFileError::Io(_))
    }
}

/// On-disk face of the vector index.
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the index, verifying version, checksum and model fingerprint.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<VectorIndex, IndexFileError> {
        let mut file = File::open(&self.path)?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                IndexFileError::InvalidFormat("file shorter than header".to_string())
            } else {
                IndexFileError::Io(e)
            }
        })?;

        let stored_crc = u32::from_le_bytes(header[43..47].try_into().unwrap());
        if crc32fast::hash(&header[0..43]) != stored_crc {
            return Err(IndexFileError::ChecksumMismatch);
        }

        let version = header[0];
        if version != FORMAT_VERSION {
            return Err(IndexFileError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: version,
            });
        }

        if &header[1..33] != expected_model_id {
            return Err(IndexFileError::ModelMismatch);
        }

        let dimensions = u16::from_le_bytes(header[33..35].try_into().unwrap()) as usize;
        let entry_count = u64::from_le_bytes(header[35..43].try_into().unwrap());

        if dimensions == 0 {
            if entry_count != 0 {
                return Err(IndexFileError::InvalidFormat(
                    "entries present but dimensions unset".to_string(),
                ));
            }
            return Ok(VectorIndex::new());
        }

        let mut index = VectorIndex::with_dimensions(dimensions);

        let mut id_buf = [0u8; 8];
        let mut vec_buf = vec![0u8; dimensions * 4];
        for _ in 0..entry_count {
            file.read_exact(&mut id_buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    IndexFileError::InvalidFormat("truncated entry".to_string())
                } else {
                    IndexFileError::Io(e)
                }
            })?;
            let id = u64::from_le_bytes(id_buf);

            file.read_exact(&mut vec_buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    IndexFileError::InvalidFormat("truncated vector".to_string())
                } else {
                    IndexFileError::Io(e)
                }
            })?;

            let vector: Vec<f32> = vec_buf
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();

            index.insert(id, vector).map_err(|e| {
                IndexFileError::InvalidFormat(format!("bad stored vector for id {}: {}", id, e))
            })?;
        }

        Ok(index)
    }

    /// Write the index atomically: serialize into a temp file next to the
    /// target, flush, fsync, rename.
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), IndexFileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let dimensions = index.dimensions().unwrap_or(0);
        if dimensions > u16::MAX as usize {
            return Err(IndexFileError::InvalidFormat(format!(
                "dimensions {} exceed the format limit",
                dimensions
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..33].copy_from_slice(model_id);
        header[33..35].copy_from_slice(&(dimensions as u16).to_le_bytes());
        header[35..43].copy_from_slice(&(index.len() as u64).to_le_bytes());
        let crc = crc32fast::hash(&header[0..43]);
        header[43..47].copy_from_slice(&crc.to_le_bytes());

        // saves run under the store lock, so a fixed temp name is safe
        let tmp_path = self.path.with_extension("tmp");

        let result = (|| -> Result<(), IndexFileError> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(&header)?;

            for (id, vector) in index.iter() {
                file.write_all(&id.to_le_bytes())?;
                for component in vector {
                    file.write_all(&component.to_le_bytes())?;
                }
            }

            file.flush()?;
            file.sync_all()?;

            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::model_fingerprint;

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("reqlink-idxfile-{}-{}", name, crate::eid::Eid::new()))
    }

    #[test]
    fn test_save_load_round_trip() {
        let path = temp_file("roundtrip");
        let model_id = model_fingerprint("bge-base-en-v1.5");

        let mut index = VectorIndex::new();
        index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(7, vec![0.0, 3.0, 4.0]).unwrap();

        let file = IndexFile::new(path.clone());
        file.save(&index, &model_id).unwrap();

        let loaded = file.load(&model_id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dimensions(), Some(3));
        assert!(loaded.contains(1));
        assert!(loaded.contains(7));

        // stored vectors are already normalized
        let stored: Vec<f32> = loaded.iter().find(|(id, _)| *id == 7).unwrap().1.clone();
        assert!((stored[1] - 0.6).abs() < 1e-6);
        assert!((stored[2] - 0.8).abs() < 1e-6);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_save_load_empty_index() {
        let path = temp_file("empty");
        let model_id = model_fingerprint("bge-base-en-v1.5");

        let file = IndexFile::new(path.clone());
        file.save(&VectorIndex::new(), &model_id).unwrap();

        let loaded = file.load(&model_id).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.dimensions().is_none());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_wrong_model() {
        let path = temp_file("model");
        let model_id = model_fingerprint("bge-base-en-v1.5");
        let other_id = model_fingerprint("all-MiniLM-L6-v2");

        let file = IndexFile::new(path.clone());
        file.save(&VectorIndex::new(), &model_id).unwrap();

        let result = file.load(&other_id);
        assert!(matches!(result, Err(IndexFileError::ModelMismatch)));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_corrupt_header() {
        let path = temp_file("corrupt");
        let model_id = model_fingerprint("bge-base-en-v1.5");

        let mut index = VectorIndex::new();
        index.insert(1, vec![1.0, 0.0]).unwrap();

        let file = IndexFile::new(path.clone());
        file.save(&index, &model_id).unwrap();

        // flip a byte inside the checksummed region
        let mut bytes = fs::read(&path).unwrap();
        bytes[35] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let result = file.load(&model_id);
        assert!(matches!(result, Err(IndexFileError::ChecksumMismatch)));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let path = temp_file("version");
        let model_id = model_fingerprint("bge-base-en-v1.5");

        let file = IndexFile::new(path.clone());
        file.save(&VectorIndex::new(), &model_id).unwrap();

        // bump the version byte and fix up the checksum so only the
        // version check fires
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] = 99;
        let crc = crc32fast::hash(&bytes[0..43]);
        bytes[43..47].copy_from_slice(&crc.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let result = file.load(&model_id);
        assert!(matches!(
            result,
            Err(IndexFileError::VersionMismatch { found: 99, .. })
        ));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let path = temp_file("truncated");
        let model_id = model_fingerprint("bge-base-en-v1.5");

        let mut index = VectorIndex::new();
        index.insert(1, vec![1.0, 0.0]).unwrap();

        let file = IndexFile::new(path.clone());
        file.save(&index, &model_id).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let result = file.load(&model_id);
        assert!(matches!(result, Err(IndexFileError::InvalidFormat(_))));

        let _ = fs::remove_file(&path);
    }
}
