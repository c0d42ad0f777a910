//! The filesystem gateway: the single seam between this crate's domain
//! logic and the Linux kernel's stat/walk/extent-map/dedupe primitives.
//!
//! Expressed as a trait so the driver and the rest of the test suite can run
//! against an in-memory fake instead of real FIEMAP/FIDEDUPERANGE ioctls,
//! which require a filesystem with reflink support to exercise for real.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use crate::error::{DedupeError, Result};
use crate::extent::Extent;

/// What kind of filesystem entry `stat` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct StatInfo {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
}

/// Ephemeral discovery output: one per observed seed or walked regular
/// file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: i64,
    pub is_dir: bool,
    pub is_regular: bool,
}

/// A path that could not be stat'd or walked, with the OS error that
/// explains why.
#[derive(Debug, Clone)]
pub struct IgnoredFile {
    pub path: PathBuf,
    pub errno: Option<i32>,
    pub message: String,
}

/// The default size threshold below which recursively discovered files are
/// not worth deduping.
pub const RECURSIVE_DEFAULT_MIN_SIZE: u64 = 128 * 1024;

pub trait FilesystemGateway {
    /// Symlink-non-following stat.
    fn stat(&self, path: &Path) -> Result<StatInfo>;

    /// Resolve to an absolute, symlink-resolved path.
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Enumerate `seeds` (and, if `recursive`, their directory contents) as
    /// [`FileInfo`]s, collecting per-entry failures into the ignored list
    /// rather than aborting. Returns the set of canonical seed paths too,
    /// which scopes the persistent-index replay.
    fn discover(&self, seeds: &[PathBuf], recursive: bool) -> (Vec<FileInfo>, Vec<IgnoredFile>, BTreeSet<PathBuf>);

    /// The file's extent-descriptor list, inline-data extents excluded.
    fn extent_map(&self, path: &Path, size: u64) -> Result<Vec<Extent>>;

    /// Dedupe `src`'s bytes into every file in `dests`, batched per the
    /// kernel's destination-count and per-call byte-size limits. Returns a
    /// map of destination path to human-readable failure reason for every
    /// destination that did not end up sharing extents with `src`.
    fn dedupe(&self, src: &Path, dests: &BTreeSet<PathBuf>, size: u64) -> Result<BTreeMap<PathBuf, String>>;
}

/// The sole production implementation, backed by real Linux syscalls and
/// ioctls. Not safe to share across threads — matches the single-threaded
/// contract the rest of the engine assumes.
pub struct LinuxGateway {
    min_size: u64,
}

impl LinuxGateway {
    pub fn new(min_size: u64) -> Self {
        Self { min_size }
    }

    fn fetch_info(&self, path: &Path, ignored: &mut Vec<IgnoredFile>) -> Option<(PathBuf, FileInfo)> {
        let stat = match self.stat(path) {
            Ok(stat) => stat,
            Err(err) => {
                ignored.push(to_ignored(path, err));
                return None;
            }
        };
        let canonical = match self.canonicalize(path) {
            Ok(canonical) => canonical,
            Err(err) => {
                ignored.push(to_ignored(path, err));
                return None;
            }
        };

        match stat.kind {
            EntryKind::Regular => Some((
                canonical.clone(),
                FileInfo { path: canonical, size: stat.size, mtime: stat.mtime, is_dir: false, is_regular: true },
            )),
            EntryKind::Directory => Some((
                canonical.clone(),
                FileInfo { path: canonical, size: stat.size, mtime: stat.mtime, is_dir: true, is_regular: false },
            )),
            EntryKind::Other => None,
        }
    }

    fn walk_directory(&self, root: &Path, out: &mut Vec<FileInfo>, ignored: &mut Vec<IgnoredFile>) {
        for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
            match entry {
                Ok(entry) => {
                    let file_type = entry.file_type();
                    if file_type.is_symlink() || file_type.is_dir() {
                        continue;
                    }
                    if !file_type.is_file() {
                        trace!(path = ?entry.path(), "skipped non-regular entry");
                        continue;
                    }
                    match entry.metadata() {
                        Ok(meta) => {
                            let size = meta.size();
                            if size > self.min_size {
                                out.push(FileInfo {
                                    path: entry.path().to_path_buf(),
                                    size,
                                    mtime: meta.mtime(),
                                    is_dir: false,
                                    is_regular: true,
                                });
                            }
                        }
                        Err(err) => ignored.push(IgnoredFile {
                            path: entry.path().to_path_buf(),
                            errno: err.io_error().and_then(std::io::Error::raw_os_error),
                            message: err.to_string(),
                        }),
                    }
                }
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    ignored.push(IgnoredFile {
                        path,
                        errno: err.io_error().and_then(std::io::Error::raw_os_error),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl FilesystemGateway for LinuxGateway {
    #[instrument(skip(self))]
    fn stat(&self, path: &Path) -> Result<StatInfo> {
        let stat = nix::sys::stat::lstat(path).map_err(|err| nix_to_error(path, err))?;
        let mode = stat.st_mode as libc::mode_t;
        let kind = match mode & libc::S_IFMT {
            libc::S_IFREG => EntryKind::Regular,
            libc::S_IFDIR => EntryKind::Directory,
            _ => EntryKind::Other,
        };
        Ok(StatInfo { kind, size: stat.st_size as u64, mtime: stat.st_mtime })
    }

    #[instrument(skip(self))]
    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).map_err(|err| DedupeError::io(format!("canonicalize {path:?}"), &err))
    }

    #[instrument(skip(self))]
    fn discover(&self, seeds: &[PathBuf], recursive: bool) -> (Vec<FileInfo>, Vec<IgnoredFile>, BTreeSet<PathBuf>) {
        let mut infos = Vec::new();
        let mut ignored = Vec::new();
        let mut patterns = BTreeSet::new();
        let mut directories = Vec::new();

        for seed in seeds {
            if let Some((canonical, info)) = self.fetch_info(seed, &mut ignored) {
                patterns.insert(canonical.clone());
                if info.is_dir {
                    directories.push(canonical);
                }
                infos.push(info);
            }
        }

        if recursive {
            for dir in directories {
                self.walk_directory(&dir, &mut infos, &mut ignored);
            }
        }

        debug!(files = infos.len(), ignored = ignored.len(), "discover complete");
        (infos, ignored, patterns)
    }

    #[instrument(skip(self))]
    fn extent_map(&self, path: &Path, size: u64) -> Result<Vec<Extent>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_NOATIME)
            .open(path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    DedupeError::InvalidArgument(format!("{path:?} vanished"))
                } else {
                    DedupeError::io(format!("open {path:?}"), &err)
                }
            })?;

        let fd = file.as_raw_fd();
        let mut extents = Vec::new();
        let mut m = ffi::Fiemap::new(size);

        loop {
            m.fm_start = extents.last().map(|e: &Extent| e.logical + e.length).unwrap_or(0);

            unsafe { ffi::ioctl::fs_ioc_fiemap(fd, &mut m) }.map_err(|err| nix_to_error(path, err))?;

            if m.fm_mapped_extents == 0 {
                break;
            }

            let mut saw_last = false;
            for raw in m.fm_extents.iter().take(m.fm_mapped_extents as usize) {
                if raw.fe_flags & ffi::FIEMAP_EXTENT_DATA_INLINE == 0 {
                    extents.push(Extent { logical: raw.fe_logical, physical: raw.fe_physical, length: raw.fe_length });
                }
                if raw.fe_flags & ffi::FIEMAP_EXTENT_LAST != 0 {
                    saw_last = true;
                }
            }

            if extents.is_empty() {
                return Err(DedupeError::InvalidArgument("No mapped extents".to_string()));
            }
            if saw_last {
                break;
            }
        }

        Ok(extents)
    }

    #[instrument(skip(self))]
    fn dedupe(&self, src: &Path, dests: &BTreeSet<PathBuf>, size: u64) -> Result<BTreeMap<PathBuf, String>> {
        let mut failures = BTreeMap::new();

        let src_file = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_NOATIME)
            .open(src)
            .map_err(|err| DedupeError::InvalidArgument(format!("open source {src:?}: {err}")))?;
        let src_fd = src_file.as_raw_fd();

        let mut pending_error: Option<DedupeError> = None;

        for batch in dests.iter().collect::<Vec<_>>().chunks(ffi::DEDUPE_MAX_DESTS) {
            let mut open_dests = Vec::with_capacity(batch.len());
            for dest in batch {
                match fs::OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NOFOLLOW | libc::O_NOATIME)
                    .open(dest)
                {
                    Ok(file) => open_dests.push(Some((*dest, file))),
                    Err(err) => {
                        failures.insert((*dest).clone(), err.to_string());
                        open_dests.push(None);
                    }
                }
            }

            let active: Vec<(&PathBuf, &fs::File)> = open_dests
                .iter()
                .filter_map(|entry| entry.as_ref().map(|(path, file)| (*path, file)))
                .collect();
            if active.is_empty() {
                continue;
            }

            let mut remaining = size;
            let mut src_offset = 0u64;
            let mut dest_offsets = vec![0u64; active.len()];

            while remaining > 0 {
                let chunk_len = remaining.min(ffi::DEDUPE_MAX_SIZE);
                let mut request = ffi::DedupeRange::new(src_offset, chunk_len, active.len());
                for (slot, (_, file)) in request.info.iter_mut().zip(active.iter()).take(active.len()) {
                    slot.dest_fd = file.as_raw_fd() as i64;
                }
                for (slot, offset) in request.info.iter_mut().zip(dest_offsets.iter()).take(active.len()) {
                    slot.dest_offset = *offset;
                }

                if let Err(err) = unsafe { ffi::ioctl::fideduperange(src_fd, &mut request) } {
                    pending_error = Some(nix_to_error(src, err));
                }

                for (i, (path, _)) in active.iter().enumerate() {
                    let status = request.info[i].status;
                    if status == ffi::FILE_DEDUPE_RANGE_DIFFERS {
                        failures.entry((*path).clone()).or_insert_with(|| "Files differ".to_string());
                    } else if status != ffi::FILE_DEDUPE_RANGE_SAME {
                        failures.entry((*path).clone()).or_insert_with(|| "Unknown error".to_string());
                    }
                    dest_offsets[i] += chunk_len;
                }

                src_offset += chunk_len;
                remaining -= chunk_len;
            }
        }

        if let Some(err) = pending_error {
            return Err(err);
        }

        Ok(failures)
    }
}

fn to_ignored(path: &Path, err: DedupeError) -> IgnoredFile {
    match err {
        DedupeError::NotFound(path) => IgnoredFile { path, errno: Some(libc::ENOENT), message: "not found".to_string() },
        DedupeError::InvalidArgument(message) => IgnoredFile { path: path.to_path_buf(), errno: None, message },
        DedupeError::Io { errno, message } => IgnoredFile { path: path.to_path_buf(), errno, message },
        DedupeError::Store(err) => IgnoredFile { path: path.to_path_buf(), errno: None, message: err.to_string() },
    }
}

fn nix_to_error(path: &Path, err: nix::Error) -> DedupeError {
    if err == nix::errno::Errno::ENOENT {
        DedupeError::NotFound(path.to_path_buf())
    } else {
        DedupeError::nix(format!("{path:?}"), err)
    }
}

/// Raw ioctl plumbing for `FS_IOC_FIEMAP` and `FIDEDUPERANGE`. Nested so the
/// kernel ABI structs stay private to this module; only [`Extent`] crosses
/// the boundary.
mod ffi {
    use std::mem::{size_of, zeroed};

    pub(super) const EXTENT_COUNT: usize = 32;

    const FIEMAP_SIZE: u32 = (size_of::<Fiemap>() as u32) - (size_of::<[RawExtent; EXTENT_COUNT]>() as u32);

    pub(super) const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
    pub(super) const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x0000_0200;

    #[repr(C)]
    #[derive(Debug)]
    pub(super) struct Fiemap {
        pub fm_start: u64,
        pub fm_length: u64,
        pub fm_flags: u32,
        pub fm_mapped_extents: u32,
        pub fm_extent_count: u32,
        pub fm_reserved: u32,
        pub fm_extents: [RawExtent; EXTENT_COUNT],
    }

    impl Fiemap {
        pub(super) fn new(length: u64) -> Self {
            let mut raw: Self = unsafe { zeroed() };
            raw.fm_length = length;
            raw.fm_extent_count = EXTENT_COUNT as u32;
            raw
        }
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub(super) struct RawExtent {
        pub fe_logical: u64,
        pub fe_physical: u64,
        pub fe_length: u64,
        pub fe_reserved64: [u64; 2],
        pub fe_flags: u32,
        pub fe_reserved: [u32; 3],
    }

    // Page size assumed at its common x86_64/aarch64 default; matches the
    // fixed-size stack buffer approach used for `Fiemap` above rather than
    // querying `sysconf(_SC_PAGESIZE)` per call.
    const PAGE_SIZE: usize = 4096;
    const DEDUPE_RANGE_HEADER_SIZE: usize = size_of::<u64>() * 2 + size_of::<u16>() * 2 + size_of::<u32>();
    pub(super) const DEDUPE_MAX_DESTS: usize = (PAGE_SIZE - DEDUPE_RANGE_HEADER_SIZE) / size_of::<DedupeRangeInfo>();
    pub(super) const DEDUPE_MAX_SIZE: u64 = 16 * 1024 * 1024;

    pub(super) const FILE_DEDUPE_RANGE_SAME: i32 = 0;
    pub(super) const FILE_DEDUPE_RANGE_DIFFERS: i32 = 1;

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub(super) struct DedupeRangeInfo {
        pub dest_fd: i64,
        pub dest_offset: u64,
        pub bytes_deduped: u64,
        pub status: i32,
        pub reserved: u32,
    }

    #[repr(C)]
    pub(super) struct DedupeRange {
        pub src_offset: u64,
        pub src_length: u64,
        pub dest_count: u16,
        pub reserved1: u16,
        pub reserved2: u32,
        pub info: [DedupeRangeInfo; DEDUPE_MAX_DESTS],
    }

    impl DedupeRange {
        pub(super) fn new(src_offset: u64, src_length: u64, dest_count: usize) -> Self {
            let mut raw: Self = unsafe { zeroed() };
            raw.src_offset = src_offset;
            raw.src_length = src_length;
            raw.dest_count = dest_count as u16;
            raw
        }
    }

    #[allow(clippy::missing_safety_doc)]
    pub(super) mod ioctl {
        use nix::{ioctl_readwrite_bad, request_code_readwrite};
        ioctl_readwrite_bad!(fs_ioc_fiemap, request_code_readwrite!(b'f', 11, super::FIEMAP_SIZE), super::Fiemap);
        // FIDEDUPERANGE's ioctl magic is 0x94, not an ASCII letter
        // (`<linux/fs.h>`: `_IOWR(0x94, 54, struct file_dedupe_range)`).
        ioctl_readwrite_bad!(
            fideduperange,
            request_code_readwrite!(0x94, 54, size_of::<super::DedupeRange>() as u32),
            super::DedupeRange
        );
        use std::mem::size_of;
    }
}
