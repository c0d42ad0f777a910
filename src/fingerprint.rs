//! Fingerprints: the fixed-width digest value type shared by both index
//! roles (extents-fingerprint and data-fingerprint).

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::{instrument, trace};

use crate::error::{DedupeError, Result};

/// Digests are streamed in fixed-size chunks so a single call never holds
/// more than this many bytes of file content in memory at once.
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// An opaque 32-byte BLAKE3 digest, used for both the extents-fingerprint
/// and the data-fingerprint roles. The two roles share this type because
/// the store only ever compares fingerprints for equality and ordering; it
/// never interprets their bytes.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Fingerprint([u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Fingerprint {
    /// Digest a byte buffer in one shot.
    #[instrument(skip_all, name = "Fingerprint::digest_of_bytes")]
    pub fn digest_of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        let hash = blake3::hash(bytes);
        trace!(bytes = bytes.len(), "digest bytes");
        Self(*hash.as_bytes())
    }

    /// Digest the full contents of a file, streaming it in fixed-size
    /// chunks rather than reading it into memory all at once.
    #[instrument(name = "Fingerprint::digest_of_file")]
    pub fn digest_of_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| DedupeError::io(format!("open {path:?}"), &err))?;
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = reader
                .read(&mut buf)
                .map_err(|err| DedupeError::io(format!("read {path:?}"), &err))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            total += read as u64;
        }
        trace!(?path, bytes = total, "digest file");
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Lowercase hex encoding, 64 characters long.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse the lowercase hex encoding produced by [`Fingerprint::to_hex`].
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text)
            .map_err(|err| DedupeError::InvalidArgument(format!("malformed fingerprint hex: {err}")))?;
        Self::from_canonical_bytes(&bytes)
    }

    /// Build a fingerprint from its canonical byte representation.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DedupeError::InvalidArgument(format!("fingerprint must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(array))
    }

    /// The canonical byte representation, suitable for persistent storage.
    pub fn to_canonical_bytes(self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_canonical_bytes() {
        let fp = Fingerprint::digest_of_bytes(b"hello world");
        let bytes = fp.to_canonical_bytes();
        assert_eq!(Fingerprint::from_canonical_bytes(&bytes).unwrap(), fp);
    }

    #[test]
    fn round_trip_hex() {
        let fp = Fingerprint::digest_of_bytes(b"hello world");
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()).unwrap(), fp);
    }

    #[test]
    fn distinct_content_distinct_fingerprint() {
        let a = Fingerprint::digest_of_bytes(b"a");
        let b = Fingerprint::digest_of_bytes(b"b");
        assert_ne!(a, b);
    }

    #[test]
    fn digest_of_file_streams_large_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content = vec![0x42u8; CHUNK_SIZE * 2 + 17];
        std::fs::write(&path, &content).unwrap();

        let streamed = Fingerprint::digest_of_file(&path).unwrap();
        let oneshot = Fingerprint::digest_of_bytes(&content);
        assert_eq!(streamed, oneshot);
    }

    #[test]
    fn digest_of_file_missing_is_io_error() {
        let err = Fingerprint::digest_of_file("/nonexistent/path/does/not/exist").unwrap_err();
        assert!(matches!(err, DedupeError::Io { .. }));
    }
}
