//! Extent descriptors returned by the kernel's extent-map query, and the
//! wire format fed to the fingerprint function.

/// One contiguous run of a file's logical bytes mapped to a contiguous run
/// of the underlying block device, as reported by `FS_IOC_FIEMAP`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

/// Serialize an extent sequence into the byte layout the extents-fingerprint
/// is computed over: a flat concatenation of `(logical, physical, length)`
/// little-endian `u64` triples, in kernel-return order. This layout is part
/// of the persistent format — changing it invalidates every stored
/// extents-fingerprint.
pub fn to_wire_bytes(extents: &[Extent]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(extents.len() * 24);
    for extent in extents {
        bytes.extend_from_slice(&extent.logical.to_le_bytes());
        bytes.extend_from_slice(&extent.physical.to_le_bytes());
        bytes.extend_from_slice(&extent.length.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes_are_little_endian_triples() {
        let extents = [Extent { logical: 0, physical: 4096, length: 512 }];
        let bytes = to_wire_bytes(&extents);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..8], &0u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &4096u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &512u64.to_le_bytes());
    }

    #[test]
    fn empty_extents_is_empty_bytes() {
        assert!(to_wire_bytes(&[]).is_empty());
    }
}
