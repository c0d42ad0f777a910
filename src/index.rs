//! The persistent index: a SQLite-backed durable mapping from
//! extents-fingerprint to data-fingerprint, and from canonical path to
//! `(mtime, extents-fingerprint)`.
//!
//! The whole run executes inside one long-lived transaction, opened right
//! after schema bootstrap and committed only by an explicit [`PersistentIndex::close`].
//! If the process aborts or an error propagates out of the driver before
//! `close` runs, the connection is dropped with the transaction still open;
//! SQLite rolls it back, leaving the pre-run state intact.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::{instrument, trace};

use crate::error::{DedupeError, Result};
use crate::file::FileRecord;
use crate::fingerprint::Fingerprint;
use crate::store::HashStore;

/// Canonicalize `path`'s parent directory and re-attach the filename, so a
/// symlinked ancestor directory is resolved before SQLite ever opens the
/// file — the same bar `SQLITE_OPEN_NOFOLLOW` enforces, without requiring
/// the database file itself to already exist (it may not, on a first run).
fn resolve_db_path(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| DedupeError::InvalidArgument(format!("{path:?} has no filename component")))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let canonical_parent = std::fs::canonicalize(parent).map_err(|err| DedupeError::io(format!("resolve db directory {parent:?}"), &err))?;
    Ok(canonical_parent.join(file_name))
}

pub struct PersistentIndex {
    conn: Connection,
}

impl PersistentIndex {
    /// Open (creating if absent) the database at `path`, bootstrap its
    /// schema, and begin the run's single transaction.
    #[instrument(name = "PersistentIndex::open", skip(path))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_db_path(path.as_ref())?;
        let conn = Connection::open(&path).map_err(DedupeError::from)?;
        let index = Self { conn };
        index.init_schema()?;
        index.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(index)
    }

    /// An in-memory database for tests; still runs the same schema
    /// bootstrap and transaction lifecycle as a real run.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DedupeError::from)?;
        let index = Self { conn };
        index.init_schema()?;
        index.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS hashes (
                extents_hash BLOB PRIMARY KEY NOT NULL,
                data_hash BLOB
            );
            CREATE TABLE IF NOT EXISTS files (
                filename VARCHAR PRIMARY KEY NOT NULL,
                m_time INTEGER,
                extents_hash BLOB REFERENCES hashes
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert-or-replace a `(extents_hash, data_hash)` row.
    #[instrument(name = "PersistentIndex::upsert_hash", skip(self))]
    pub fn upsert_hash(&self, ext_fp: Fingerprint, data_fp: Fingerprint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO hashes (extents_hash, data_hash) VALUES (?1, ?2) \
             ON CONFLICT (extents_hash) DO UPDATE SET data_hash = ?2 WHERE extents_hash = ?1",
            params![ext_fp.to_canonical_bytes().to_vec(), data_fp.to_canonical_bytes().to_vec()],
        )?;
        Ok(())
    }

    /// Insert a new `files` row.
    #[instrument(name = "PersistentIndex::insert_file", skip(self))]
    pub fn insert_file(&self, path: &Path, mtime: i64, ext_fp: Fingerprint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO files (filename, m_time, extents_hash) VALUES (?1, ?2, ?3)",
            params![path_text(path), mtime, ext_fp.to_canonical_bytes().to_vec()],
        )?;
        Ok(())
    }

    /// Update an existing `files` row's mtime and extents-fingerprint.
    #[instrument(name = "PersistentIndex::update_file", skip(self))]
    pub fn update_file(&self, path: &Path, mtime: i64, ext_fp: Fingerprint) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET m_time = ?1, extents_hash = ?2 WHERE filename = ?3",
            params![mtime, ext_fp.to_canonical_bytes().to_vec(), path_text(path)],
        )?;
        Ok(())
    }

    /// Delete a `files` row.
    #[instrument(name = "PersistentIndex::remove_file", skip(self))]
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE filename = ?1", params![path_text(path)])?;
        Ok(())
    }

    /// Replay cached fingerprints for every `files` row whose path is, or is
    /// a descendant of, one of `patterns`. Rows matching a live file are
    /// played into that [`FileRecord`] via `update_from_cache`; rows with no
    /// corresponding live file are returned for the caller to purge.
    #[instrument(name = "PersistentIndex::replay", skip(self, live, store))]
    pub fn replay(
        &self,
        patterns: &BTreeSet<PathBuf>,
        live: &mut BTreeMap<PathBuf, FileRecord>,
        store: &mut HashStore,
    ) -> Result<Vec<PathBuf>> {
        let mut ignored = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT filename, m_time, data_hash, extents_hash FROM files NATURAL JOIN hashes \
             WHERE filename = ?1 OR filename LIKE ?1 || '/%'",
        )?;

        for pattern in patterns {
            let pattern_text = path_text(pattern);
            let rows = stmt.query_map(params![pattern_text], |row| {
                let filename: String = row.get(0)?;
                let mtime: i64 = row.get(1)?;
                let data_hash: Vec<u8> = row.get(2)?;
                let ext_hash: Vec<u8> = row.get(3)?;
                Ok((filename, mtime, data_hash, ext_hash))
            })?;

            for row in rows {
                let (filename, mtime, data_hash, ext_hash) = row?;
                let path = PathBuf::from(filename);
                let data_fp = Fingerprint::from_canonical_bytes(&data_hash)?;
                let ext_fp = Fingerprint::from_canonical_bytes(&ext_hash)?;

                match live.get_mut(&path) {
                    Some(file) => file.update_from_cache(mtime, ext_fp, data_fp, store),
                    None => ignored.push(path),
                }
            }
        }

        trace!(ignored = ignored.len(), "replayed persistent index");
        Ok(ignored)
    }

    /// Delete every `hashes` row no longer referenced by any `files` row.
    /// Restores invariant P2 at the end of a run.
    #[instrument(name = "PersistentIndex::clean_hashes", skip(self))]
    pub fn clean_hashes(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM hashes WHERE extents_hash IN \
             (SELECT extents_hash FROM hashes NATURAL LEFT JOIN files \
              WHERE filename IS NULL GROUP BY extents_hash)",
        )?;
        Ok(())
    }

    /// Commit the run's transaction. Only the success path should reach
    /// this; dropping a `PersistentIndex` without calling `close` leaves the
    /// transaction uncommitted.
    #[instrument(name = "PersistentIndex::close", skip(self))]
    pub fn close(self) -> Result<()> {
        self.conn.execute_batch("END TRANSACTION")?;
        Ok(())
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
