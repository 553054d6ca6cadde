use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use kiln_schema::ObjectHash;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Content-addressable blob store for packed package archives.
///
/// Blobs are named by their blake3 hash, written atomically, and re-hashed
/// on every read.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    layout: StoreLayout,
}

impl ObjectStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.layout.objects_dir().join(hash)
    }

    /// Store `data` and return its hash. Existing blobs are left untouched.
    pub fn put(&self, data: &[u8]) -> Result<ObjectHash, StoreError> {
        let hash = ObjectHash::new(blake3::hash(data).to_hex().to_string());
        let dest = self.object_path(&hash);
        if dest.exists() {
            return Ok(hash);
        }

        let dir = self.layout.objects_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(hash)
    }

    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(hash);
        if !path.exists() {
            return Err(StoreError::ObjectNotFound(hash.to_owned()));
        }
        let data = fs::read(&path)?;
        let actual = blake3::hash(&data).to_hex();
        if actual.as_str() != hash {
            return Err(StoreError::IntegrityFailure {
                hash: hash.to_owned(),
                expected: hash.to_owned(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    pub fn remove(&self, hash: &str) -> Result<(), StoreError> {
        let path = self.object_path(hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ObjectHash>, StoreError> {
        let dir = self.layout.objects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut hashes: Vec<ObjectHash> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .filter(|name| !name.starts_with('.'))
            .map(ObjectHash::new)
            .collect();
        hashes.sort();
        Ok(hashes)
    }
}
