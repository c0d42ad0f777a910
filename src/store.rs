//! The in-memory index (`HashStore`): two maps kept in lock-step by
//! extents-fingerprint and by data-fingerprint, and the sole authority on
//! dedupe candidates.
//!
//! Files are identified by their canonical path rather than by a live
//! reference into an arena, so this type carries no lifetime parameter and
//! no ownership cycle with [`crate::file::FileRecord`] — the two collaborate
//! by path, the same way the persistent index does.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{instrument, trace};

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::index::PersistentIndex;

/// The set of files currently sharing one extents-fingerprint, plus the
/// data-fingerprint authoritative for all of them.
#[derive(Debug)]
struct ExtentsGroup {
    data_fp: Fingerprint,
    files: BTreeSet<PathBuf>,
}

#[derive(Debug, Default)]
pub struct HashStore {
    by_extents: BTreeMap<Fingerprint, ExtentsGroup>,
    by_data: BTreeMap<Fingerprint, BTreeSet<Fingerprint>>,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file whose fingerprints were just replayed from the
    /// persistent index. No persistent writes: the row already exists.
    #[instrument(skip(self))]
    pub fn adopt_from_cache(&mut self, path: PathBuf, ext_fp: Fingerprint, data_fp: Fingerprint) {
        if !self.by_extents.contains_key(&ext_fp) {
            self.by_data.entry(data_fp).or_default().insert(ext_fp);
        }
        let group = self
            .by_extents
            .entry(ext_fp)
            .or_insert_with(|| ExtentsGroup { data_fp, files: BTreeSet::new() });
        group.files.insert(path);
    }

    /// Register a file with no usable cache entry, issuing a `files` insert.
    #[instrument(skip(self, persistent))]
    pub fn register_new(
        &mut self,
        path: &Path,
        ext_fp: Fingerprint,
        mtime: i64,
        persistent: &PersistentIndex,
    ) -> Result<Fingerprint> {
        self.register(path, ext_fp, mtime, persistent, true)
    }

    /// Register a file whose cached fingerprints have changed, issuing a
    /// `files` update.
    #[instrument(skip(self, persistent))]
    pub fn register_refreshed(
        &mut self,
        path: &Path,
        ext_fp: Fingerprint,
        mtime: i64,
        persistent: &PersistentIndex,
    ) -> Result<Fingerprint> {
        self.register(path, ext_fp, mtime, persistent, false)
    }

    fn register(
        &mut self,
        path: &Path,
        ext_fp: Fingerprint,
        mtime: i64,
        persistent: &PersistentIndex,
        is_new: bool,
    ) -> Result<Fingerprint> {
        let data_fp = self.data_fp_for_group(ext_fp, persistent, || Fingerprint::digest_of_file(path))?;
        self.insert_member(path.to_path_buf(), ext_fp);
        if is_new {
            persistent.insert_file(path, mtime, ext_fp)?;
        } else {
            persistent.update_file(path, mtime, ext_fp)?;
        }
        Ok(data_fp)
    }

    /// Register a file under `ext_fp` using a data-fingerprint already known
    /// to the caller (the extent-migration path), rather than re-hashing
    /// file bytes.
    #[instrument(skip(self, persistent))]
    pub fn register_without_rehash(
        &mut self,
        path: &Path,
        ext_fp: Fingerprint,
        data_fp: Fingerprint,
        mtime: i64,
        persistent: &PersistentIndex,
    ) -> Result<()> {
        self.data_fp_for_group(ext_fp, persistent, || Ok(data_fp))?;
        self.insert_member(path.to_path_buf(), ext_fp);
        persistent.update_file(path, mtime, ext_fp)?;
        Ok(())
    }

    /// Remove `path` from `old_ext_fp`'s group and re-register it under a
    /// newly observed extents-fingerprint, preserving its data-fingerprint.
    #[instrument(skip(self, persistent))]
    pub fn migrate_extents(
        &mut self,
        path: &Path,
        old_ext_fp: Fingerprint,
        new_ext_fp: Fingerprint,
        data_fp: Fingerprint,
        mtime: i64,
        persistent: &PersistentIndex,
    ) -> Result<()> {
        self.remove_extent_membership(path, old_ext_fp);
        self.register_without_rehash(path, new_ext_fp, data_fp, mtime, persistent)
    }

    /// Remove a file entirely: drop it from its extents group and delete its
    /// persistent `files` row.
    #[instrument(skip(self, persistent))]
    pub fn remove_file(&mut self, path: &Path, ext_fp: Fingerprint, persistent: &PersistentIndex) -> Result<()> {
        self.remove_extent_membership(path, ext_fp);
        persistent.remove_file(path)?;
        Ok(())
    }

    fn remove_extent_membership(&mut self, path: &Path, ext_fp: Fingerprint) {
        let Some(group) = self.by_extents.get_mut(&ext_fp) else { return };
        group.files.remove(path);
        if group.files.is_empty() {
            let data_fp = group.data_fp;
            self.by_extents.remove(&ext_fp);
            if let Some(siblings) = self.by_data.get_mut(&data_fp) {
                siblings.remove(&ext_fp);
                if siblings.is_empty() {
                    self.by_data.remove(&data_fp);
                }
            }
        }
    }

    /// Look up (or create) the group for `ext_fp`, computing its
    /// data-fingerprint via `compute` only when the group is newly created.
    /// A newly created group's `(ext_fp, data_fp)` pair is upserted into the
    /// persistent `hashes` relation immediately, so a subsequent run's
    /// `replay` can find it without re-hashing file bytes.
    fn data_fp_for_group(
        &mut self,
        ext_fp: Fingerprint,
        persistent: &PersistentIndex,
        compute: impl FnOnce() -> Result<Fingerprint>,
    ) -> Result<Fingerprint> {
        if let Some(group) = self.by_extents.get(&ext_fp) {
            return Ok(group.data_fp);
        }
        let data_fp = compute()?;
        persistent.upsert_hash(ext_fp, data_fp)?;
        self.by_data.entry(data_fp).or_default().insert(ext_fp);
        self.by_extents.insert(ext_fp, ExtentsGroup { data_fp, files: BTreeSet::new() });
        Ok(data_fp)
    }

    /// Insert `path` into `ext_fp`'s group, which must already exist.
    fn insert_member(&mut self, path: PathBuf, ext_fp: Fingerprint) {
        if let Some(group) = self.by_extents.get_mut(&ext_fp) {
            group.files.insert(path);
        }
    }

    /// Compute the dedupe candidate groups: for every data-fingerprint with
    /// more than one surviving extents-fingerprint, the largest file-set
    /// becomes the reference and every other file is a duplicate of it.
    #[instrument(skip(self))]
    pub fn candidates(&self) -> BTreeMap<PathBuf, BTreeSet<PathBuf>> {
        let mut candidates = BTreeMap::new();

        for extents_hashes in self.by_data.values() {
            if extents_hashes.len() < 2 {
                continue;
            }

            let reference_ext_fp = extents_hashes
                .iter()
                .max_by_key(|ext_fp| self.by_extents[ext_fp].files.len())
                .expect("data-fingerprint group is never empty");
            let reference_file = self.by_extents[reference_ext_fp]
                .files
                .iter()
                .next()
                .expect("extents group is never empty")
                .clone();

            let duplicates: BTreeSet<PathBuf> = extents_hashes
                .iter()
                .filter(|ext_fp| *ext_fp != reference_ext_fp)
                .flat_map(|ext_fp| self.by_extents[ext_fp].files.iter().cloned())
                .collect();

            if !duplicates.is_empty() {
                candidates.insert(reference_file, duplicates);
            }
        }

        trace!(groups = candidates.len(), "computed dedupe candidates");
        candidates
    }

    /// Verify the two maps are a consistent mirror of each other: every
    /// extents-group is non-empty and agrees with its data-fingerprint's
    /// reverse entry, and every data-fingerprint group is non-empty.
    /// Test-only; cheap enough to call after every mutating operation in a
    /// scenario test.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for (ext_fp, group) in &self.by_extents {
            assert!(!group.files.is_empty(), "empty extents-group for {ext_fp:?}");
            assert!(
                self.by_data.get(&group.data_fp).is_some_and(|s| s.contains(ext_fp)),
                "by_data missing reverse entry for {ext_fp:?}"
            );
        }
        for (data_fp, ext_fps) in &self.by_data {
            assert!(!ext_fps.is_empty(), "empty data-fingerprint group for {data_fp:?}");
            for ext_fp in ext_fps {
                assert_eq!(self.by_extents[ext_fp].data_fp, *data_fp, "data-fingerprint mismatch for {ext_fp:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::PersistentIndex;

    fn persistent() -> PersistentIndex {
        PersistentIndex::in_memory().unwrap()
    }

    #[test]
    fn adopt_from_cache_groups_by_extents_then_data() {
        let mut store = HashStore::new();
        let ext_a = Fingerprint::digest_of_bytes(b"ext-a");
        let data = Fingerprint::digest_of_bytes(b"data");

        store.adopt_from_cache(PathBuf::from("/a"), ext_a, data);
        store.adopt_from_cache(PathBuf::from("/b"), ext_a, data);
        store.check_invariants();

        let candidates = store.candidates();
        assert!(candidates.is_empty(), "single extents group is never a candidate");
    }

    #[test]
    fn two_extents_groups_same_data_yield_one_candidate_pair() {
        let mut store = HashStore::new();
        let ext_a = Fingerprint::digest_of_bytes(b"ext-a");
        let ext_b = Fingerprint::digest_of_bytes(b"ext-b");
        let data = Fingerprint::digest_of_bytes(b"data");

        store.adopt_from_cache(PathBuf::from("/a"), ext_a, data);
        store.adopt_from_cache(PathBuf::from("/b"), ext_b, data);
        store.check_invariants();

        let candidates = store.candidates();
        assert_eq!(candidates.len(), 1);
        let (reference, dups) = candidates.iter().next().unwrap();
        assert!(reference == &PathBuf::from("/a") || reference == &PathBuf::from("/b"));
        assert_eq!(dups.len(), 1);
    }

    #[test]
    fn largest_group_is_preferred_as_reference() {
        let mut store = HashStore::new();
        let ext_a = Fingerprint::digest_of_bytes(b"ext-a");
        let ext_b = Fingerprint::digest_of_bytes(b"ext-b");
        let data = Fingerprint::digest_of_bytes(b"data");

        store.adopt_from_cache(PathBuf::from("/a1"), ext_a, data);
        store.adopt_from_cache(PathBuf::from("/a2"), ext_a, data);
        store.adopt_from_cache(PathBuf::from("/b1"), ext_b, data);
        store.check_invariants();

        let candidates = store.candidates();
        assert_eq!(candidates.len(), 1);
        let (reference, dups) = candidates.iter().next().unwrap();
        assert!(reference == &PathBuf::from("/a1") || reference == &PathBuf::from("/a2"));
        assert_eq!(dups, &BTreeSet::from([PathBuf::from("/b1")]));
    }

    #[test]
    fn distinct_data_fingerprints_never_collide() {
        let mut store = HashStore::new();
        let ext_a = Fingerprint::digest_of_bytes(b"ext-a");
        let ext_b = Fingerprint::digest_of_bytes(b"ext-b");
        let data_1 = Fingerprint::digest_of_bytes(b"data-1");
        let data_2 = Fingerprint::digest_of_bytes(b"data-2");

        store.adopt_from_cache(PathBuf::from("/a"), ext_a, data_1);
        store.adopt_from_cache(PathBuf::from("/b"), ext_b, data_2);
        store.check_invariants();

        assert!(store.candidates().is_empty());
    }

    #[test]
    fn remove_file_drains_empty_groups() {
        let mut store = HashStore::new();
        let ext_a = Fingerprint::digest_of_bytes(b"ext-a");
        let data = Fingerprint::digest_of_bytes(b"data");
        let index = persistent();

        store.adopt_from_cache(PathBuf::from("/a"), ext_a, data);
        store.remove_file(Path::new("/a"), ext_a, &index).unwrap();
        store.check_invariants();

        assert!(store.by_extents.is_empty());
        assert!(store.by_data.is_empty());
    }

    #[test]
    fn migrate_extents_preserves_data_fingerprint_without_rehash() {
        let mut store = HashStore::new();
        let ext_old = Fingerprint::digest_of_bytes(b"ext-old");
        let ext_new = Fingerprint::digest_of_bytes(b"ext-new");
        let data = Fingerprint::digest_of_bytes(b"data");
        let index = persistent();

        store.adopt_from_cache(PathBuf::from("/a"), ext_old, data);
        store
            .migrate_extents(Path::new("/a"), ext_old, ext_new, data, 123, &index)
            .unwrap();
        store.check_invariants();

        assert!(!store.by_extents.contains_key(&ext_old));
        assert!(store.by_extents.contains_key(&ext_new));
    }
}
