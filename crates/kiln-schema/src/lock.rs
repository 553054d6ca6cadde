use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const LOCK_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock file parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("lock file serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported lock_version {0}, expected {LOCK_VERSION}")]
    UnsupportedVersion(u32),
    #[error("lock file digest mismatch: lock has '{lock_digest}', recomputed '{computed_digest}'")]
    DigestMismatch {
        lock_digest: String,
        computed_digest: String,
    },
    #[error("resolution drift: {0}")]
    Drift(String),
}

/// One pinned package and the names it depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub build_requires: Vec<String>,
}

/// Pinned outcome of a resolution.
///
/// The digest covers every locked field, so a hand-edited lock file is
/// detected by [`LockFile::verify_integrity`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockFile {
    pub lock_version: u32,
    pub root: String,
    pub digest: String,
    pub packages: Vec<LockedPackage>,
}

impl LockFile {
    pub fn new(root: impl Into<String>, mut packages: Vec<LockedPackage>) -> Self {
        for pkg in &mut packages {
            pkg.requires.sort();
            pkg.build_requires.sort();
        }
        packages.sort();

        let lock = LockFile {
            lock_version: LOCK_VERSION,
            root: root.into(),
            digest: String::new(),
            packages,
        };
        LockFile {
            digest: lock.compute_digest(),
            ..lock
        }
    }

    pub fn compute_digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("root:{}", self.root).as_bytes());
        for pkg in &self.packages {
            hasher.update(format!("pkg:{}@{}", pkg.name, pkg.version).as_bytes());
            for dep in &pkg.requires {
                hasher.update(format!("req:{}>{dep}", pkg.name).as_bytes());
            }
            for dep in &pkg.build_requires {
                hasher.update(format!("breq:{}>{dep}", pkg.name).as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn verify_integrity(&self) -> Result<(), LockError> {
        if self.lock_version != LOCK_VERSION {
            return Err(LockError::UnsupportedVersion(self.lock_version));
        }
        let computed = self.compute_digest();
        if computed != self.digest {
            return Err(LockError::DigestMismatch {
                lock_digest: self.digest.clone(),
                computed_digest: computed,
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&LockedPackage> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Check that a fresh resolution pins exactly what this lock pins.
    pub fn verify_matches(&self, resolved: &LockFile) -> Result<(), LockError> {
        if self.root != resolved.root {
            return Err(LockError::Drift(format!(
                "root changed: lock has '{}', recipe is '{}'",
                self.root, resolved.root
            )));
        }
        for pkg in &resolved.packages {
            match self.get(&pkg.name) {
                None => {
                    return Err(LockError::Drift(format!(
                        "package '{}' is resolved but not in the lock file",
                        pkg.name
                    )))
                }
                Some(locked) if locked.version != pkg.version => {
                    return Err(LockError::Drift(format!(
                        "package '{}': lock pins {}, resolution chose {}",
                        pkg.name, locked.version, pkg.version
                    )))
                }
                Some(locked) if locked != pkg => {
                    return Err(LockError::Drift(format!(
                        "package '{}': dependency edges changed",
                        pkg.name
                    )))
                }
                Some(_) => {}
            }
        }
        if let Some(stale) = self
            .packages
            .iter()
            .find(|p| resolved.get(&p.name).is_none())
        {
            return Err(LockError::Drift(format!(
                "package '{}' is locked but no longer required",
                stale.name
            )));
        }
        Ok(())
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), LockError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LockError::Io(e.error))?;
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}
