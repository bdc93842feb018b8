//! Where cache entries live.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Source bytes hashed into the entry key, counted from the module start.
pub const KEY_PREFIX_BYTES: usize = 4096;

/// Identifies a cache entry: SHA-256 of the source from the module start
/// up to [`KEY_PREFIX_BYTES`] bytes or the end of the source.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Key for the module starting at `begin`, or `None` if `begin` lies
    /// past the end of `text`.
    pub fn for_source(text: &[u8], begin: usize) -> Option<Self> {
        let rest = text.get(begin..)?;
        let prefix = &rest[..rest.len().min(KEY_PREFIX_BYTES)];
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(prefix));
        Some(CacheKey(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..16])
    }
}

/// Storage for serialized modules. Failures are reported, never fatal:
/// callers treat them as a miss.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;
    fn store(&self, key: &CacheKey, entry: &[u8]) -> Result<(), CacheError>;
}

/// One file per entry, named by the hex key.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.asmc", key.to_hex()))
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &CacheKey, entry: &[u8]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.entry_path(key);
        // Readers never see a partial entry.
        let tmp = path.with_extension(format!("tmp{}", std::process::id()));
        fs::write(&tmp, entry)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Entries kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the stored bytes of `key` in place, if present.
    pub fn update(&self, key: &CacheKey, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &CacheKey, entry: &[u8]) -> Result<(), CacheError> {
        self.entries.lock().insert(*key, entry.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_uses_prefix_only() {
        let mut a = vec![b'x'; KEY_PREFIX_BYTES + 100];
        let key = CacheKey::for_source(&a, 0).unwrap();
        a[KEY_PREFIX_BYTES + 50] = b'y';
        assert_eq!(CacheKey::for_source(&a, 0), Some(key));
        a[10] = b'y';
        assert_ne!(CacheKey::for_source(&a, 0), Some(key));
        assert_ne!(CacheKey::for_source(&a, 1), Some(key));
        assert!(CacheKey::for_source(&a, a.len() + 1).is_none());
    }

    #[test]
    fn test_key_hex() {
        let key = CacheKey::for_source(b"", 0).unwrap();
        assert_eq!(
            key.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path().join("entries"));
        let key = CacheKey::for_source(b"function m() {}", 0).unwrap();
        assert!(store.load(&key).unwrap().is_none());
        store.store(&key, b"entry").unwrap();
        assert_eq!(store.load(&key).unwrap().as_deref(), Some(&b"entry"[..]));
        store.store(&key, b"newer").unwrap();
        assert_eq!(store.load(&key).unwrap().as_deref(), Some(&b"newer"[..]));
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCacheStore::new();
        let key = CacheKey::for_source(b"abc", 0).unwrap();
        assert!(!store.update(&key, |_| {}));
        store.store(&key, b"123").unwrap();
        assert!(store.update(&key, |e| e[0] = b'9'));
        assert_eq!(store.load(&key).unwrap().as_deref(), Some(&b"923"[..]));
        assert_eq!(store.len(), 1);
    }
}
