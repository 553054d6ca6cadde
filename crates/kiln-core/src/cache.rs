//! Fingerprint-keyed artifact cache with single-flight builds.
//!
//! A fingerprint is built at most once at a time: the first caller of
//! [`BuildCache::lookup_or_claim`] receives a [`BuildTicket`], later callers
//! block until the ticket is published or failed and then observe its
//! outcome.

use kiln_schema::{Fingerprint, ObjectHash, ShortId};
use kiln_store::{
    list_files, pack_package, unpack_package, ArtifactRecord, ArtifactStore, ObjectStore,
    StoreError, StoreLayout,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache state poisoned")]
    Poisoned,
}

/// A packaged build output available in the package directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildArtifact {
    pub fingerprint: Fingerprint,
    pub short_id: ShortId,
    pub name: String,
    pub version: String,
    pub package_dir: PathBuf,
    pub object_hash: ObjectHash,
    pub files: Vec<String>,
}

impl BuildArtifact {
    fn from_record(record: ArtifactRecord, package_dir: PathBuf) -> Self {
        Self {
            fingerprint: record.fingerprint,
            short_id: record.short_id,
            name: record.name,
            version: record.version,
            package_dir,
            object_hash: record.object_hash,
            files: record.files,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Building,
    Failed(String),
}

pub enum CacheLookup<'a> {
    /// Already built, here or by an earlier run.
    Hit(BuildArtifact),
    /// Caller must build and then publish or fail the ticket.
    Claimed(BuildTicket<'a>),
    /// Another caller's build of this fingerprint failed.
    Failed(String),
}

pub struct BuildCache {
    layout: StoreLayout,
    objects: ObjectStore,
    artifacts: ArtifactStore,
    inflight: Mutex<HashMap<Fingerprint, Slot>>,
    ready: Condvar,
}

impl BuildCache {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            objects: ObjectStore::new(layout.clone()),
            artifacts: ArtifactStore::new(layout.clone()),
            layout,
            inflight: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Return the cached artifact for `fingerprint`, or claim the right to
    /// build it. Blocks while another caller holds the claim.
    ///
    /// The slot is claimed before the store is read, so lookups of one
    /// fingerprint are serialized while other fingerprints proceed.
    pub fn lookup_or_claim(&self, fingerprint: &Fingerprint) -> Result<CacheLookup<'_>, CacheError> {
        let mut inflight = self.inflight.lock().map_err(|_| CacheError::Poisoned)?;
        loop {
            match inflight.get(fingerprint) {
                Some(Slot::Building) => {
                    debug!("waiting for in-flight build {}", fingerprint.short());
                    inflight = self.ready.wait(inflight).map_err(|_| CacheError::Poisoned)?;
                }
                Some(Slot::Failed(reason)) => return Ok(CacheLookup::Failed(reason.clone())),
                None => break,
            }
        }
        inflight.insert(fingerprint.clone(), Slot::Building);
        drop(inflight);

        let ticket = BuildTicket {
            cache: self,
            fingerprint: fingerprint.clone(),
            finished: false,
        };
        match self.load(fingerprint) {
            Ok(Some(artifact)) => {
                ticket.withdraw();
                Ok(CacheLookup::Hit(artifact))
            }
            Ok(None) => Ok(CacheLookup::Claimed(ticket)),
            Err(e) => {
                ticket.withdraw();
                Err(e)
            }
        }
    }

    /// Persistent lookup only. Restores the package directory from the
    /// object store when the record survived but the directory did not.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<BuildArtifact>, CacheError> {
        match self.lookup_or_claim(fingerprint)? {
            CacheLookup::Hit(artifact) => Ok(Some(artifact)),
            CacheLookup::Claimed(ticket) => {
                ticket.withdraw();
                Ok(None)
            }
            CacheLookup::Failed(_) => Ok(None),
        }
    }

    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<BuildArtifact>, CacheError> {
        if !self.artifacts.exists(fingerprint) {
            return Ok(None);
        }
        let record = match self.artifacts.get(fingerprint) {
            Ok(record) => record,
            Err(StoreError::IntegrityFailure { .. } | StoreError::Serialization(_)) => {
                warn!("artifact record {} is corrupted, rebuilding", fingerprint.short());
                self.artifacts.remove(fingerprint)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let package_dir = self.layout.package_dir(fingerprint);
        if !package_dir.is_dir() {
            let data = match self.objects.get(&record.object_hash) {
                Ok(data) => data,
                Err(e @ (StoreError::ObjectNotFound(_) | StoreError::IntegrityFailure { .. })) => {
                    warn!("artifact {} lost its archive ({e}), rebuilding", fingerprint.short());
                    self.artifacts.remove(fingerprint)?;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            self.materialize(&data, &package_dir)?;
            info!("restored {} from the object store", record.reference());
        }
        Ok(Some(BuildArtifact::from_record(record, package_dir)))
    }

    /// Unpack into a scratch directory, then move into place.
    fn materialize(&self, data: &[u8], package_dir: &Path) -> Result<(), CacheError> {
        let staging = self.layout.staging_dir();
        fs::create_dir_all(&staging)?;
        fs::create_dir_all(self.layout.packages_dir())?;
        let scratch = tempfile::Builder::new()
            .prefix(".unpack-")
            .tempdir_in(&staging)?;
        let unpacked = scratch.path().join("package");
        unpack_package(data, &unpacked)?;
        if package_dir.exists() {
            fs::remove_dir_all(package_dir)?;
        }
        fs::rename(&unpacked, package_dir)?;
        Ok(())
    }

    fn store(
        &self,
        fingerprint: &Fingerprint,
        name: &str,
        version: &str,
        staging_dir: &Path,
    ) -> Result<BuildArtifact, CacheError> {
        let data = pack_package(staging_dir)?;
        let object_hash = self.objects.put(&data)?;
        let package_dir = self.layout.package_dir(fingerprint);
        self.materialize(&data, &package_dir)?;

        let record = ArtifactRecord {
            fingerprint: fingerprint.clone(),
            short_id: fingerprint.short(),
            name: name.to_owned(),
            version: version.to_owned(),
            object_hash,
            files: list_files(&package_dir)?,
            created_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        };
        self.artifacts.put(&record)?;
        Ok(BuildArtifact::from_record(record, package_dir))
    }

    fn release(&self, fingerprint: &Fingerprint, failure: Option<String>) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match failure {
            None => {
                inflight.remove(fingerprint);
            }
            Some(reason) => {
                inflight.insert(fingerprint.clone(), Slot::Failed(reason));
            }
        }
        drop(inflight);
        self.ready.notify_all();
    }

    /// Every stored artifact, sorted by package then fingerprint.
    pub fn list(&self) -> Result<Vec<ArtifactRecord>, CacheError> {
        Ok(self.artifacts.list()?)
    }

    /// Remove the artifact whose fingerprint starts with `prefix`, its
    /// package directory, and its archive unless another artifact shares it.
    pub fn remove(&self, prefix: &str) -> Result<ArtifactRecord, CacheError> {
        let _guard = self.inflight.lock().map_err(|_| CacheError::Poisoned)?;
        let record = self.artifacts.find_by_prefix(prefix)?;
        self.artifacts.remove(&record.fingerprint)?;

        let package_dir = self.layout.package_dir(&record.fingerprint);
        if package_dir.exists() {
            fs::remove_dir_all(&package_dir)?;
        }
        let shared = self
            .artifacts
            .list()?
            .iter()
            .any(|r| r.object_hash == record.object_hash);
        if !shared {
            self.objects.remove(&record.object_hash)?;
        }
        info!("removed {} ({})", record.reference(), record.short_id);
        Ok(record)
    }
}

/// Exclusive right to build one fingerprint.
///
/// Dropping an unfinished ticket counts as a failure so waiters never hang.
pub struct BuildTicket<'a> {
    cache: &'a BuildCache,
    fingerprint: Fingerprint,
    finished: bool,
}

impl BuildTicket<'_> {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Pack `staging_dir`, store it, and wake every waiter with the result.
    pub fn publish(
        mut self,
        name: &str,
        version: &str,
        staging_dir: &Path,
    ) -> Result<BuildArtifact, CacheError> {
        self.finished = true;
        let result = self
            .cache
            .store(&self.fingerprint, name, version, staging_dir);
        let failure = result.as_ref().err().map(ToString::to_string);
        self.cache.release(&self.fingerprint, failure);
        result
    }

    pub fn fail(mut self, reason: impl Into<String>) {
        self.finished = true;
        self.cache.release(&self.fingerprint, Some(reason.into()));
    }

    /// Give the claim back without recording an outcome.
    fn withdraw(mut self) {
        self.finished = true;
        self.cache.release(&self.fingerprint, None);
    }
}

impl Drop for BuildTicket<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache
                .release(&self.fingerprint, Some("build abandoned".to_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, BuildCache) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, BuildCache::new(layout))
    }

    fn fp(seed: &str) -> Fingerprint {
        Fingerprint::new(blake3::hash(seed.as_bytes()).to_hex().to_string())
    }

    fn staged(root: &Path, content: &str) -> PathBuf {
        let staging = root.join(format!("stage-{content}"));
        fs::create_dir_all(staging.join("lib")).unwrap();
        fs::write(staging.join("lib/libz.a"), content).unwrap();
        staging
    }

    fn claim<'a>(cache: &'a BuildCache, fingerprint: &Fingerprint) -> BuildTicket<'a> {
        match cache.lookup_or_claim(fingerprint).unwrap() {
            CacheLookup::Claimed(ticket) => ticket,
            _ => panic!("expected a claim"),
        }
    }

    #[test]
    fn miss_then_publish_then_hit() {
        let (dir, cache) = setup();
        let key = fp("zlib");
        let ticket = claim(&cache, &key);
        let artifact = ticket
            .publish("zlib", "1.3", &staged(dir.path(), "z"))
            .unwrap();
        assert_eq!(artifact.files, ["lib/libz.a"]);
        assert!(artifact.package_dir.join("lib/libz.a").is_file());

        match cache.lookup_or_claim(&key).unwrap() {
            CacheLookup::Hit(hit) => assert_eq!(hit, artifact),
            _ => panic!("expected a hit"),
        };
    }

    #[test]
    fn hit_survives_new_cache_instance() {
        let (dir, cache) = setup();
        let key = fp("zlib");
        claim(&cache, &key)
            .publish("zlib", "1.3", &staged(dir.path(), "z"))
            .unwrap();

        let reopened = BuildCache::new(StoreLayout::new(dir.path()));
        assert!(reopened.get(&key).unwrap().is_some());
    }

    #[test]
    fn missing_package_dir_is_restored() {
        let (dir, cache) = setup();
        let key = fp("zlib");
        let artifact = claim(&cache, &key)
            .publish("zlib", "1.3", &staged(dir.path(), "zz"))
            .unwrap();
        fs::remove_dir_all(&artifact.package_dir).unwrap();

        let restored = cache.get(&key).unwrap().unwrap();
        assert_eq!(
            fs::read_to_string(restored.package_dir.join("lib/libz.a")).unwrap(),
            "zz"
        );
    }

    #[test]
    fn lost_archive_is_a_miss() {
        let (dir, cache) = setup();
        let key = fp("zlib");
        let artifact = claim(&cache, &key)
            .publish("zlib", "1.3", &staged(dir.path(), "z"))
            .unwrap();
        fs::remove_dir_all(&artifact.package_dir).unwrap();
        ObjectStore::new(cache.layout().clone())
            .remove(&artifact.object_hash)
            .unwrap();

        assert!(matches!(
            cache.lookup_or_claim(&key).unwrap(),
            CacheLookup::Claimed(_)
        ));
    }

    #[test]
    fn failed_ticket_reported_to_later_lookups() {
        let (_dir, cache) = setup();
        let key = fp("openssl");
        claim(&cache, &key).fail("exit code 2");
        match cache.lookup_or_claim(&key).unwrap() {
            CacheLookup::Failed(reason) => assert_eq!(reason, "exit code 2"),
            _ => panic!("expected failure"),
        };
    }

    #[test]
    fn dropped_ticket_counts_as_failure() {
        let (_dir, cache) = setup();
        let key = fp("openssl");
        drop(claim(&cache, &key));
        assert!(matches!(
            cache.lookup_or_claim(&key).unwrap(),
            CacheLookup::Failed(_)
        ));
    }

    #[test]
    fn concurrent_lookups_build_once() {
        let (dir, cache) = setup();
        let key = fp("boost");
        let staging = staged(dir.path(), "b");
        let builds = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    match cache.lookup_or_claim(&key).unwrap() {
                        CacheLookup::Claimed(ticket) => {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            ticket.publish("boost", "1.83", &staging).unwrap();
                        }
                        CacheLookup::Hit(hit) => assert_eq!(hit.name, "boost"),
                        CacheLookup::Failed(reason) => panic!("unexpected failure: {reason}"),
                    }
                });
            }
        });
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hit_releases_its_slot() {
        let (dir, cache) = setup();
        let key = fp("zlib");
        claim(&cache, &key)
            .publish("zlib", "1.3", &staged(dir.path(), "z"))
            .unwrap();
        assert!(cache.get(&key).unwrap().is_some());
        assert!(cache.get(&fp("absent")).unwrap().is_none());
        assert!(cache.inflight.lock().unwrap().is_empty());
    }

    #[test]
    fn other_fingerprints_proceed_while_one_is_claimed() {
        let (dir, cache) = setup();
        let built = fp("fmt");
        claim(&cache, &built)
            .publish("fmt", "10.1", &staged(dir.path(), "f"))
            .unwrap();

        let held = claim(&cache, &fp("boost"));
        thread::scope(|s| {
            let hit = s.spawn(|| cache.get(&built).unwrap());
            assert!(hit.join().unwrap().is_some());
            let miss = s.spawn(|| {
                matches!(
                    cache.lookup_or_claim(&fp("spdlog")).unwrap(),
                    CacheLookup::Claimed(_)
                )
            });
            assert!(miss.join().unwrap());
        });
        held.fail("cancelled");
    }

    #[test]
    fn concurrent_restores_of_one_artifact() {
        let (dir, cache) = setup();
        let key = fp("zlib");
        let artifact = claim(&cache, &key)
            .publish("zlib", "1.3", &staged(dir.path(), "zz"))
            .unwrap();
        fs::remove_dir_all(&artifact.package_dir).unwrap();
        let barrier = Barrier::new(8);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    let restored = cache.get(&key).unwrap().unwrap();
                    assert_eq!(
                        fs::read_to_string(restored.package_dir.join("lib/libz.a")).unwrap(),
                        "zz"
                    );
                });
            }
        });
        assert!(cache.inflight.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_keeps_shared_archive() {
        let (dir, cache) = setup();
        let staging = staged(dir.path(), "same");
        let a = claim(&cache, &fp("a"))
            .publish("zlib", "1.3", &staging)
            .unwrap();
        let b = claim(&cache, &fp("b"))
            .publish("zlib", "1.3", &staging)
            .unwrap();
        assert_eq!(a.object_hash, b.object_hash);

        let removed = cache.remove(&a.fingerprint).unwrap();
        assert_eq!(removed.fingerprint, a.fingerprint);
        assert!(!a.package_dir.exists());
        let objects = ObjectStore::new(cache.layout().clone());
        assert!(objects.exists(&b.object_hash));

        cache.remove(&b.short_id).unwrap();
        assert!(!objects.exists(&b.object_hash));
        assert!(cache.list().unwrap().is_empty());
    }
}
