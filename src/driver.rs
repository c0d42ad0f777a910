//! The scan/reconcile/dedupe driver: orchestrates discover → replay →
//! refresh → dedupe over one run.
//!
//! Restructured from a prior `listFiles`/`updateFiles`/`doDedupe` free-
//! function design into methods on a `Driver` value that owns the gateway
//! and persistent index for the run's lifetime as ordinary, explicitly
//! passed values rather than process-global pointers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::file::FileRecord;
use crate::gateway::FilesystemGateway;
use crate::index::PersistentIndex;
use crate::store::HashStore;

/// Per-destination dedupe failure reasons, keyed by reference file then by
/// destination path, accumulated across every candidate group in one run
/// for the caller to report.
pub type DedupeFailures = BTreeMap<PathBuf, BTreeMap<PathBuf, String>>;

pub struct Driver<'a, G: FilesystemGateway> {
    gateway: &'a G,
    persistent: PersistentIndex,
    store: HashStore,
    live: BTreeMap<PathBuf, FileRecord>,
}

impl<'a, G: FilesystemGateway> Driver<'a, G> {
    pub fn new(gateway: &'a G, persistent: PersistentIndex) -> Self {
        Self { gateway, persistent, store: HashStore::new(), live: BTreeMap::new() }
    }

    /// Phase 1: enumerate seeds (and, if `recursive`, their directory
    /// contents), purging persistent rows for entries that vanished
    /// (`NotFound`) and populating the live map with one record per regular
    /// file. Returns the canonical seed-path pattern set phase 2 scopes
    /// replay to.
    #[instrument(skip(self))]
    pub fn discover(&mut self, seeds: &[PathBuf], recursive: bool) -> Result<BTreeSet<PathBuf>> {
        let (infos, ignored, patterns) = self.gateway.discover(seeds, recursive);

        for entry in &ignored {
            if entry.errno == Some(libc::ENOENT) {
                self.persistent.remove_file(&entry.path)?;
            }
            warn!(path = ?entry.path, message = %entry.message, "ignored during discover");
        }

        for info in infos.into_iter().filter(|info| info.is_regular) {
            self.live
                .insert(info.path.clone(), FileRecord::new(info.path, info.size, info.mtime));
        }

        info!(files = self.live.len(), ignored = ignored.len(), "discover complete");
        Ok(patterns)
    }

    /// Phase 2: replay cached fingerprints from the persistent index,
    /// purging rows for paths that are no longer live (present in the store
    /// but not observed this run within the seed patterns).
    #[instrument(skip(self, patterns))]
    pub fn replay(&mut self, patterns: &BTreeSet<PathBuf>) -> Result<()> {
        let removed = self.persistent.replay(patterns, &mut self.live, &mut self.store)?;
        for path in &removed {
            info!(?path, "cleaning removed file");
            self.persistent.remove_file(path)?;
        }
        Ok(())
    }

    /// Phase 3: bring every live record's fingerprints up to date, dropping
    /// records whose file vanished between stat and open, then purge
    /// orphaned `hashes` rows.
    #[instrument(skip(self))]
    pub fn refresh(&mut self, update_extents: bool) -> Result<()> {
        let paths: Vec<PathBuf> = self.live.keys().cloned().collect();
        for path in paths {
            let Some(file) = self.live.get_mut(&path) else { continue };
            match file.refresh(update_extents, self.gateway, &mut self.store, &self.persistent) {
                Ok(()) => {
                    let file = &self.live[&path];
                    info!(%file, "refreshed");
                }
                Err(err) if err.is_invalid_argument() => {
                    warn!(?path, %err, "ignoring vanished file");
                    self.live.remove(&path);
                }
                Err(err) => return Err(err),
            }
        }
        self.persistent.clean_hashes()
    }

    /// Phase 4: plan dedupe candidate groups and drive the gateway's
    /// dedupe primitive over each, then verify that every destination now
    /// shares extents with its reference.
    #[instrument(skip(self))]
    pub fn dedupe(&mut self) -> Result<DedupeFailures> {
        let candidates = self.store.candidates();
        if candidates.is_empty() {
            info!("no duplicates pending deduplication");
            return Ok(DedupeFailures::new());
        }

        let mut all_failures = DedupeFailures::new();

        for (reference, destinations) in candidates {
            let Some(reference_file) = self.live.get(&reference) else { continue };
            let size = reference_file.size();

            info!(reference = %reference.display(), destinations = destinations.len(), "deduplicating");
            let mut failures = self.gateway.dedupe(&reference, &destinations, size)?;

            for dest in &destinations {
                let Some(file) = self.live.get_mut(dest) else {
                    failures.entry(dest.clone()).or_insert_with(|| "File removed".to_string());
                    continue;
                };
                match file.refresh(true, self.gateway, &mut self.store, &self.persistent) {
                    Ok(()) => {
                        let reference_ext = self.live.get(&reference).and_then(FileRecord::extents_fingerprint);
                        let dest_ext = self.live.get(dest).and_then(FileRecord::extents_fingerprint);
                        if reference_ext != dest_ext {
                            failures
                                .entry(dest.clone())
                                .or_insert_with(|| "Check shows not deduped".to_string());
                        }
                    }
                    Err(err) if err.is_invalid_argument() => {
                        self.live.remove(dest);
                        failures.entry(dest.clone()).or_insert_with(|| "File removed".to_string());
                    }
                    Err(err) => return Err(err),
                }
            }

            if !failures.is_empty() {
                for (dest, reason) in &failures {
                    warn!(?dest, %reason, "could not dedupe");
                }
                all_failures.insert(reference, failures);
            }
        }

        Ok(all_failures)
    }

    /// Commit the run's persistent-index transaction. Must be called once,
    /// on the success path, after the last phase that runs.
    pub fn close(self) -> Result<()> {
        self.persistent.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;
    use crate::gateway::tests::FakeGateway;

    fn driver(gateway: &FakeGateway) -> Driver<'_, FakeGateway> {
        Driver::new(gateway, PersistentIndex::in_memory().unwrap())
    }

    /// `refresh` hashes new files' content straight off disk
    /// (`Fingerprint::digest_of_file`), bypassing the gateway seam — so
    /// every path registered with a `FakeGateway` also needs a real file
    /// underneath it.
    fn real_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn two_identical_files_become_one_candidate_then_none_after_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let a = real_file(&dir, "a", b"identical content");
        let b = real_file(&dir, "b", b"identical content");

        let gateway = FakeGateway::new();
        gateway.set_extents(&a, vec![Extent { logical: 0, physical: 0, length: 4096 }]);
        gateway.set_extents(&b, vec![Extent { logical: 0, physical: 4096, length: 4096 }]);

        let mut driver = driver(&gateway);
        let seeds = vec![a.clone(), b.clone()];
        let patterns = driver.discover(&seeds, false).unwrap();
        driver.replay(&patterns).unwrap();
        driver.refresh(false).unwrap();

        let candidates = driver.store.candidates();
        assert_eq!(candidates.len(), 1);

        // Simulate the kernel call succeeding by making both extents equal,
        // the way a real FIDEDUPERANGE would collapse physical layout.
        gateway.set_extents(&b, vec![Extent { logical: 0, physical: 0, length: 4096 }]);
        let failures = driver.dedupe().unwrap();
        assert!(failures.is_empty(), "{failures:?}");

        assert!(driver.store.candidates().is_empty());
    }

    #[test]
    fn empty_candidates_never_calls_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let a = real_file(&dir, "a", b"solo content");

        let gateway = FakeGateway::new();
        gateway.set_extents(&a, vec![Extent { logical: 0, physical: 0, length: 4096 }]);

        let mut driver = driver(&gateway);
        let seeds = vec![a];
        let patterns = driver.discover(&seeds, false).unwrap();
        driver.replay(&patterns).unwrap();
        driver.refresh(false).unwrap();

        let failures = driver.dedupe().unwrap();
        assert!(failures.is_empty());
    }

    #[test]
    fn discover_purges_not_found_entries() {
        let gateway = FakeGateway::new();
        let mut driver = driver(&gateway);
        let seeds = vec![PathBuf::from("/missing")];
        let patterns = driver.discover(&seeds, false).unwrap();
        assert!(patterns.contains(&PathBuf::from("/missing")) || patterns.is_empty());
        assert!(driver.live.is_empty());
    }

    #[test]
    fn dedupe_failure_is_recorded_without_aborting_run() {
        let dir = tempfile::tempdir().unwrap();
        let a = real_file(&dir, "a", b"identical content");
        let b = real_file(&dir, "b", b"identical content");

        let gateway = FakeGateway::new();
        gateway.set_extents(&a, vec![Extent { logical: 0, physical: 0, length: 4096 }]);
        gateway.set_extents(&b, vec![Extent { logical: 0, physical: 4096, length: 4096 }]);
        gateway.fail_dedupe(&b, "Files differ");

        let mut driver = driver(&gateway);
        let seeds = vec![a, b];
        let patterns = driver.discover(&seeds, false).unwrap();
        driver.replay(&patterns).unwrap();
        driver.refresh(false).unwrap();

        let failures = driver.dedupe().unwrap();
        assert_eq!(failures.len(), 1);
        let (_, dest_failures) = failures.iter().next().unwrap();
        assert_eq!(dest_failures.len(), 1);
    }
}
