use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{BackendStats, CacheBackend, CacheEntry, CacheKey, StorageResult};

/// Filesystem-backed cache with git-style 2-char sharding per key prefix.
///
/// Layout: `<root>/entries/<prefix>/<first 2 hex chars>/<remaining hex chars>.json`
///
/// Each file holds one serialized [`CacheEntry`]. Writes go to a temp file in
/// the shard directory and are renamed into place, so concurrent readers see
/// either the old entry or the new one, never a torn write.
pub struct FsCacheBackend {
    entries_dir: PathBuf,
}

enum EntryFile {
    Missing,
    Corrupt(serde_json::Error),
    Entry(CacheEntry),
}

impl FsCacheBackend {
    /// Create a new `FsCacheBackend` rooted at `root`. Creates `root/entries/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let entries_dir = root.as_ref().join("entries");
        fs::create_dir_all(&entries_dir)?;
        Ok(Self { entries_dir })
    }

    fn entry_path(entries_dir: &Path, key: &CacheKey) -> PathBuf {
        let digest = key.digest();
        entries_dir
            .join(key.prefix())
            .join(&digest[..2])
            .join(format!("{}.json", &digest[2..]))
    }

    fn read_entry(path: &Path) -> StorageResult<EntryFile> {
        match fs::read(path) {
            Ok(bytes) => Ok(match serde_json::from_slice(&bytes) {
                Ok(entry) => EntryFile::Entry(entry),
                Err(e) => EntryFile::Corrupt(e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EntryFile::Missing),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn discard(path: &Path, why: &str) {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove {why} entry");
        }
    }

    fn write_entry(path: &Path, entry: &CacheEntry) -> StorageResult<()> {
        let shard_dir = path
            .parent()
            .ok_or_else(|| StorageError::Backend(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(shard_dir)?;

        let bytes = serde_json::to_vec(entry)?;
        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    /// Every entry file below `dir`, recursively.
    fn entry_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for item in fs::read_dir(&current)? {
                let path = item?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> StorageResult<T> + Send + 'static,
    {
        let dir = self.entries_dir.clone();
        tokio::task::spawn_blocking(move || op(dir))
            .await
            .map_err(|e| StorageError::Backend(format!("fs cache task failed: {e}")))?
    }
}

#[async_trait]
impl CacheBackend for FsCacheBackend {
    async fn get(&self, key: &CacheKey) -> StorageResult<Option<serde_json::Value>> {
        let key = key.clone();
        self.blocking(move |dir| {
            let path = Self::entry_path(&dir, &key);
            match Self::read_entry(&path)? {
                EntryFile::Entry(entry) if entry.is_expired() => {
                    debug!(key = %key.short(), "removing expired cache file");
                    Self::discard(&path, "expired");
                    Ok(None)
                }
                EntryFile::Entry(entry) => Ok(Some(entry.value)),
                EntryFile::Corrupt(e) => {
                    warn!(key = %key.short(), error = %e, "undecodable cache file, treating as miss");
                    Self::discard(&path, "corrupt");
                    Ok(None)
                }
                EntryFile::Missing => Ok(None),
            }
        })
        .await
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> StorageResult<()> {
        let entry = CacheEntry::new(key.clone(), value, ttl_seconds);
        self.blocking(move |dir| {
            let path = Self::entry_path(&dir, &entry.key);
            Self::write_entry(&path, &entry)
        })
        .await
    }

    async fn delete(&self, key: &CacheKey) -> StorageResult<()> {
        let key = key.clone();
        self.blocking(move |dir| match fs::remove_file(Self::entry_path(&dir, &key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        })
        .await
    }

    async fn clear(&self, prefix: Option<&str>) -> StorageResult<usize> {
        let prefix = prefix.map(str::to_string);
        self.blocking(move |dir| {
            let root = match &prefix {
                Some(p) => dir.join(p),
                None => dir,
            };
            let files = Self::entry_files(&root)?;
            for file in &files {
                fs::remove_file(file)?;
            }
            Ok(files.len())
        })
        .await
    }

    async fn stats(&self) -> StorageResult<BackendStats> {
        self.blocking(|dir| {
            let now = Utc::now();
            let mut stats = BackendStats::default();
            for file in Self::entry_files(&dir)? {
                let entry = match Self::read_entry(&file)? {
                    EntryFile::Entry(entry) => entry,
                    EntryFile::Corrupt(_) => {
                        stats.corrupt_entries += 1;
                        continue;
                    }
                    EntryFile::Missing => continue,
                };
                if entry.is_expired_at(now) {
                    stats.expired_entries += 1;
                } else {
                    stats.live_entries += 1;
                    *stats
                        .entries_by_prefix
                        .entry(entry.key.prefix().to_string())
                        .or_insert(0) += 1;
                }
            }
            Ok(stats)
        })
        .await
    }
}
