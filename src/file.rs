//! The per-path file record: a small state machine tying a filesystem
//! object to its fingerprints and to the two indices.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{instrument, trace};

use crate::error::Result;
use crate::extent;
use crate::fingerprint::Fingerprint;
use crate::gateway::FilesystemGateway;
use crate::index::PersistentIndex;
use crate::store::HashStore;

/// A single observed file, tracked across the discover/replay/refresh
/// phases of one run.
#[derive(Debug, Clone)]
pub struct FileRecord {
    path: PathBuf,
    size: u64,
    mtime: i64,
    extents_fp: Option<Fingerprint>,
    data_fp: Option<Fingerprint>,
    /// Both fingerprints are current as of this run.
    clean: bool,
    /// No prior persistent entry has been adopted for this path.
    new: bool,
}

impl FileRecord {
    pub fn new(path: PathBuf, size: u64, mtime: i64) -> Self {
        Self {
            path,
            size,
            mtime,
            extents_fp: None,
            data_fp: None,
            clean: false,
            new: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn extents_fingerprint(&self) -> Option<Fingerprint> {
        self.extents_fp
    }

    pub fn data_fingerprint(&self) -> Option<Fingerprint> {
        self.data_fp
    }

    /// Apply a persistent-index replay row. If the cached mtime matches the
    /// file's current mtime, the cached fingerprints are adopted and
    /// published to `store`; otherwise the record is left dirty so refresh
    /// will recompute it and overwrite the stale row.
    #[instrument(skip(self, store))]
    pub fn update_from_cache(&mut self, cached_mtime: i64, extents_fp: Fingerprint, data_fp: Fingerprint, store: &mut HashStore) {
        self.new = false;
        if self.mtime == cached_mtime {
            self.clean = true;
            self.extents_fp = Some(extents_fp);
            self.data_fp = Some(data_fp);
            store.adopt_from_cache(self.path.clone(), extents_fp, data_fp);
        } else {
            self.clean = false;
            trace!(path = ?self.path, "stale cache entry, will re-hash on refresh");
        }
    }

    /// Bring this record's fingerprints up to date.
    ///
    /// If the record is not clean, the extents-fingerprint is recomputed and
    /// published (registering a new extents-group if needed, which computes
    /// the data-fingerprint from file bytes); the record becomes clean.
    ///
    /// If the record is already clean and `update_extents` is set, the
    /// extent map is re-read; on change, membership migrates within `store`
    /// without re-reading file bytes. `InvalidArgument` here means the file
    /// vanished: the record is dropped from `store` and the error is
    /// propagated so the driver can drop it from the live map too.
    #[instrument(skip(self, gateway, store, persistent))]
    pub fn refresh(
        &mut self,
        update_extents: bool,
        gateway: &impl FilesystemGateway,
        store: &mut HashStore,
        persistent: &PersistentIndex,
    ) -> Result<()> {
        if !self.clean {
            let extents = gateway.extent_map(&self.path, self.size)?;
            let extents_fp = Fingerprint::digest_of_bytes(extent::to_wire_bytes(&extents));

            let data_fp = if self.new {
                store.register_new(&self.path, extents_fp, self.mtime, persistent)?
            } else {
                store.register_refreshed(&self.path, extents_fp, self.mtime, persistent)?
            };

            self.extents_fp = Some(extents_fp);
            self.data_fp = Some(data_fp);
            self.clean = true;
            trace!(path = ?self.path, "refreshed");
        } else if update_extents {
            let old_extents_fp = self.extents_fp.expect("clean record always has an extents-fingerprint");

            match gateway.extent_map(&self.path, self.size) {
                Ok(extents) => {
                    let new_extents_fp = Fingerprint::digest_of_bytes(extent::to_wire_bytes(&extents));
                    if new_extents_fp != old_extents_fp {
                        let data_fp = self.data_fp.expect("clean record always has a data-fingerprint");
                        store.migrate_extents(&self.path, old_extents_fp, new_extents_fp, data_fp, self.mtime, persistent)?;
                        self.extents_fp = Some(new_extents_fp);
                        trace!(path = ?self.path, "extents migrated");
                    }
                }
                Err(err) if err.is_invalid_argument() => {
                    store.remove_file(&self.path, old_extents_fp, persistent)?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<40} {:>12} {:>12}", self.path.display(), self.size, self.mtime)?;
        if self.clean {
            write!(
                f,
                " {} {}",
                self.data_fp.expect("clean implies data_fp"),
                self.extents_fp.expect("clean implies extents_fp")
            )
        } else {
            write!(f, " {} {}", "?".repeat(64), "?".repeat(64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::FakeGateway;
    use crate::index::PersistentIndex;

    #[test]
    fn update_from_cache_matching_mtime_is_clean() {
        let mut store = HashStore::new();
        let mut file = FileRecord::new(PathBuf::from("/a"), 10, 100);
        let ext_fp = Fingerprint::digest_of_bytes(b"e");
        let data_fp = Fingerprint::digest_of_bytes(b"d");

        file.update_from_cache(100, ext_fp, data_fp, &mut store);

        assert!(file.is_clean());
        assert_eq!(file.extents_fingerprint(), Some(ext_fp));
    }

    #[test]
    fn update_from_cache_stale_mtime_stays_dirty() {
        let mut store = HashStore::new();
        let mut file = FileRecord::new(PathBuf::from("/a"), 10, 100);
        let ext_fp = Fingerprint::digest_of_bytes(b"e");
        let data_fp = Fingerprint::digest_of_bytes(b"d");

        file.update_from_cache(99, ext_fp, data_fp, &mut store);

        assert!(!file.is_clean());
    }

    /// `register_new`/`register_refreshed` hash file bytes straight off
    /// disk via `Fingerprint::digest_of_file`, bypassing the gateway seam —
    /// so any test that reaches that path needs a real file underneath the
    /// path it registers, not just a `FakeGateway`-registered extent map.
    fn real_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn refresh_not_clean_registers_and_becomes_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = real_file(&dir, "a", b"hello world");

        let mut store = HashStore::new();
        let persistent = PersistentIndex::in_memory().unwrap();
        let gateway = FakeGateway::new();
        gateway.set_extents(&path, vec![extent::Extent { logical: 0, physical: 0, length: 4096 }]);

        let mut file = FileRecord::new(path, 4096, 100);
        file.refresh(false, &gateway, &mut store, &persistent).unwrap();

        assert!(file.is_clean());
        assert!(file.extents_fingerprint().is_some());
    }

    #[test]
    fn refresh_clean_with_update_extents_migrates_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = real_file(&dir, "a", b"hello world");

        let mut store = HashStore::new();
        let persistent = PersistentIndex::in_memory().unwrap();
        let gateway = FakeGateway::new();
        gateway.set_extents(&path, vec![extent::Extent { logical: 0, physical: 0, length: 4096 }]);

        let mut file = FileRecord::new(path.clone(), 4096, 100);
        file.refresh(false, &gateway, &mut store, &persistent).unwrap();
        let before = file.extents_fingerprint();

        gateway.set_extents(&path, vec![extent::Extent { logical: 0, physical: 999, length: 4096 }]);
        file.refresh(true, &gateway, &mut store, &persistent).unwrap();

        assert_ne!(file.extents_fingerprint(), before);
    }

    #[test]
    fn refresh_clean_without_update_extents_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = real_file(&dir, "a", b"hello world");

        let mut store = HashStore::new();
        let persistent = PersistentIndex::in_memory().unwrap();
        let gateway = FakeGateway::new();
        gateway.set_extents(&path, vec![extent::Extent { logical: 0, physical: 0, length: 4096 }]);

        let mut file = FileRecord::new(path.clone(), 4096, 100);
        file.refresh(false, &gateway, &mut store, &persistent).unwrap();
        let before = file.extents_fingerprint();

        gateway.set_extents(&path, vec![extent::Extent { logical: 0, physical: 999, length: 4096 }]);
        file.refresh(false, &gateway, &mut store, &persistent).unwrap();

        assert_eq!(file.extents_fingerprint(), before);
    }

    #[test]
    fn refresh_vanished_file_removes_and_propagates_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = real_file(&dir, "a", b"hello world");

        let mut store = HashStore::new();
        let persistent = PersistentIndex::in_memory().unwrap();
        let gateway = FakeGateway::new();
        gateway.set_extents(&path, vec![extent::Extent { logical: 0, physical: 0, length: 4096 }]);

        let mut file = FileRecord::new(path.clone(), 4096, 100);
        file.refresh(false, &gateway, &mut store, &persistent).unwrap();

        gateway.remove(&path);
        let err = file.refresh(true, &gateway, &mut store, &persistent).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(store.candidates().is_empty());
    }
}
