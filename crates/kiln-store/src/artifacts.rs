use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use kiln_schema::{Fingerprint, ObjectHash, ShortId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Persistent record of one successful build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub fingerprint: Fingerprint,
    pub short_id: ShortId,
    pub name: String,
    pub version: String,
    /// Hash of the packed package archive in the object store.
    pub object_hash: ObjectHash,
    /// Package-relative paths of every regular file, sorted.
    pub files: Vec<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ArtifactRecord {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    pub fn reference(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// Artifact records keyed by fingerprint.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: StoreLayout,
}

impl ArtifactStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.layout.artifacts_dir().join(fingerprint)
    }

    /// Write the record, sealing it with a checksum.
    pub fn put(&self, record: &ArtifactRecord) -> Result<(), StoreError> {
        let mut sealed = record.clone();
        sealed.checksum = Some(record.compute_checksum()?);
        let content = serde_json::to_string_pretty(&sealed)?;

        let dir = self.layout.artifacts_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(&record.fingerprint))
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn get(&self, fingerprint: &str) -> Result<ArtifactRecord, StoreError> {
        let path = self.record_path(fingerprint);
        if !path.exists() {
            return Err(StoreError::ArtifactNotFound(fingerprint.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let record: ArtifactRecord = serde_json::from_str(&content)?;

        if let Some(expected) = &record.checksum {
            let actual = record.compute_checksum()?;
            if &actual != expected {
                return Err(StoreError::IntegrityFailure {
                    hash: fingerprint.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    pub fn exists(&self, fingerprint: &str) -> bool {
        self.record_path(fingerprint).exists()
    }

    pub fn remove(&self, fingerprint: &str) -> Result<(), StoreError> {
        let path = self.record_path(fingerprint);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Find the single record whose fingerprint starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<ArtifactRecord, StoreError> {
        let mut matches = self
            .list()?
            .into_iter()
            .filter(|r| r.fingerprint.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(record), None) => Ok(record),
            _ => Err(StoreError::ArtifactNotFound(prefix.to_owned())),
        }
    }

    /// Every readable record, sorted by package then fingerprint.
    /// Corrupted records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<ArtifactRecord>, StoreError> {
        let dir = self.layout.artifacts_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            match self.get(name) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("skipping corrupted artifact record '{name}': {e}"),
            }
        }
        records.sort_by(|a, b| {
            (a.name.as_str(), a.fingerprint.as_str()).cmp(&(b.name.as_str(), b.fingerprint.as_str()))
        });
        Ok(records)
    }
}
