use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a kiln home.
///
/// ```text
/// <root>/store/objects/<blake3>        packed package archives
/// <root>/store/artifacts/<fingerprint> artifact records (JSON)
/// <root>/store/staging/                scratch trees for packaging
/// <root>/store/.lock                   cross-process lock
/// <root>/packages/<fingerprint>/       unpacked package contents
/// <root>/work/<run>/<name>-<version>/  fetched sources and build output
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn objects_dir(&self) -> PathBuf {
        self.store_dir().join("objects")
    }

    #[inline]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.store_dir().join("artifacts")
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.store_dir().join("staging")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    #[inline]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    #[inline]
    pub fn package_dir(&self, fingerprint: &str) -> PathBuf {
        self.packages_dir().join(fingerprint)
    }

    /// Parent of the per-run scratch directories.
    #[inline]
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.objects_dir())?;
        fs::create_dir_all(self.artifacts_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.packages_dir())?;
        fs::create_dir_all(self.work_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let store_dir = self.store_dir();
            let mut tmp = NamedTempFile::new_in(&store_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&store_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.store_dir().join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;
        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
