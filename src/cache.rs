//! Content-addressed store for optimized CSS
//!
//! Entries are named by the SHA256 of their own bytes, so two pages whose
//! optimized CSS is identical share one entry.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::types::ContentHash;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("content does not hash to {0}")]
    HashMismatch(ContentHash),
    #[error("malformed cache key: {0}")]
    BadKey(String),
}

/// What a write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Written,
    /// An entry with this hash already existed; nothing was written
    AlreadyPresent,
}

/// Storage for CSS blobs keyed by their content hash
pub trait CacheStore: Send + Sync {
    /// Store `css` under `hash`. The hash must be the content hash of `css`.
    fn write(&self, hash: &ContentHash, css: &[u8]) -> Result<CacheWrite, CacheError>;

    fn read(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, CacheError>;

    fn contains(&self, hash: &ContentHash) -> Result<bool, CacheError> {
        Ok(self.read(hash)?.is_some())
    }
}

/// One `<hash>.css` file per entry in a flat directory
pub struct FsCacheStore {
    dir: PathBuf,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FsCacheStore {
    /// Open (creating if needed) a cache directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the entry for `hash`
    pub fn entry_path(&self, hash: &ContentHash) -> Result<PathBuf, CacheError> {
        // Re-validate: the key becomes a file name
        let key = ContentHash::from_hex(hash.as_str())
            .ok_or_else(|| CacheError::BadKey(hash.as_str().to_string()))?;
        Ok(self.dir.join(format!("{}.css", key)))
    }

    /// Number of entries on disk
    pub fn entry_count(&self) -> Result<usize, CacheError> {
        let mut count = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "css") {
                count += 1;
            }
        }
        Ok(count)
    }
}

impl CacheStore for FsCacheStore {
    fn write(&self, hash: &ContentHash, css: &[u8]) -> Result<CacheWrite, CacheError> {
        if !hash.verifies(css) {
            return Err(CacheError::HashMismatch(hash.clone()));
        }

        let path = self.entry_path(hash)?;
        if path.exists() {
            debug!("cache entry {} already present", hash);
            return Ok(CacheWrite::AlreadyPresent);
        }

        // Write to a unique temp file, then rename into place
        let temp_path = self.dir.join(format!(
            ".{}.{}-{}.tmp",
            hash,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let result = (|| {
            let mut file = File::create(&temp_path)?;
            file.write_all(css)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!("wrote cache entry {} ({} bytes)", hash, css.len());
        Ok(CacheWrite::Written)
    }

    fn read(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(hash)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, hash: &ContentHash) -> Result<bool, CacheError> {
        Ok(self.entry_path(hash)?.exists())
    }
}
