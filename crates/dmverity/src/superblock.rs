//! The verity superblock found at the start of a hash device.
//!
//! `veritysetup format` writes a 512-byte header in front of the hash tree
//! describing how the tree was built.  All integers are little-endian.
//! See <https://gitlab.com/cryptsetup/cryptsetup/-/wikis/DMVerity>.

use std::{
    fmt,
    fs::File,
    io::{Error, Read},
    path::Path,
};

use rustix::fs::{open, Mode, OFlags};
use thiserror::Error;
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::util::read_full;

/// The magic at offset 0 of every verity superblock.
pub const SIGNATURE: &[u8; 8] = b"verity\0\0";
/// Size of the on-disk superblock.
pub const SUPERBLOCK_SIZE: usize = 512;
/// Size of the salt field; `salt_size` may never exceed it.
pub const MAX_SALT_SIZE: usize = 256;

/// Decoding a superblock failed.
#[derive(Error, Debug)]
pub enum SuperblockError {
    #[error("failed to open hash device: {0}")]
    Open(#[source] Error),
    #[error("failed to read superblock: {0}")]
    Read(#[source] Error),
    #[error("superblock truncated: got {found} of {SUPERBLOCK_SIZE} bytes")]
    Truncated { found: usize },
    #[error("no verity superblock signature")]
    SignatureMismatch,
    #[error("salt size {0} exceeds the {MAX_SALT_SIZE} byte salt field")]
    SaltTooLarge(u16),
    #[error("hash algorithm name is not ASCII")]
    InvalidAlgorithm,
}

// struct verity_sb from cryptsetup's lib/verity/verity.c.  Every field is unaligned so the layout
// has no padding and the byte offsets are exactly the declaration order.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct RawSuperblock {
    signature: [u8; 8],
    version: U32,
    hash_type: U32,
    uuid: [u8; 16],
    algorithm: [u8; 32],
    data_block_size: U32,
    hash_block_size: U32,
    data_blocks: U64,
    salt_size: U16,
    _pad1: [u8; 6],
    salt: [u8; MAX_SALT_SIZE],
    _pad2: [u8; 168],
}

const _: () = assert!(size_of::<RawSuperblock>() == SUPERBLOCK_SIZE);

/// A decoded verity superblock.
///
/// Nothing in here is trusted: the values only mean something together with a root digest
/// obtained out of band.
#[derive(Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub hash_type: u32,
    pub uuid: [u8; 16],
    pub algorithm: String,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub data_blocks: u64,
    pub salt: Vec<u8>,
}

/// Returns the part of a NUL-padded field before the first NUL (or all of it).
fn trim_nul(field: &[u8]) -> &[u8] {
    match field.iter().position(|&c| c == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

impl Superblock {
    /// Decodes a superblock from the first [`SUPERBLOCK_SIZE`] bytes of `data`.
    ///
    /// Trailing bytes are ignored, as are the reserved regions inside the header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SuperblockError> {
        let Ok((raw, _)) = RawSuperblock::ref_from_prefix(data) else {
            return Err(SuperblockError::Truncated { found: data.len() });
        };

        if &raw.signature != SIGNATURE {
            return Err(SuperblockError::SignatureMismatch);
        }

        let salt_size = raw.salt_size.get();
        let Some(salt) = raw.salt.get(..salt_size as usize) else {
            return Err(SuperblockError::SaltTooLarge(salt_size));
        };

        let algorithm = trim_nul(&raw.algorithm);
        if !algorithm.is_ascii() {
            return Err(SuperblockError::InvalidAlgorithm);
        }

        Ok(Superblock {
            version: raw.version.get(),
            hash_type: raw.hash_type.get(),
            uuid: raw.uuid,
            algorithm: String::from_utf8_lossy(algorithm).into_owned(),
            data_block_size: raw.data_block_size.get(),
            hash_block_size: raw.hash_block_size.get(),
            data_blocks: raw.data_blocks.get(),
            salt: salt.to_vec(),
        })
    }

    /// Reads exactly [`SUPERBLOCK_SIZE`] bytes from `reader` and decodes them.
    pub fn read_from(reader: &mut impl Read) -> Result<Self, SuperblockError> {
        let mut data = [0u8; SUPERBLOCK_SIZE];
        match read_full(reader, &mut data) {
            Ok(SUPERBLOCK_SIZE) => Self::from_bytes(&data),
            Ok(found) => Err(SuperblockError::Truncated { found }),
            Err(err) => Err(SuperblockError::Read(err)),
        }
    }

    /// Opens the hash device at `path` read-only and decodes its superblock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SuperblockError> {
        let fd = open(
            path.as_ref(),
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| SuperblockError::Open(e.into()))?;
        Self::read_from(&mut File::from(fd))
    }

    /// The UUID in the canonical `8-4-4-4-12` form printed by `veritysetup dump`.
    pub fn uuid_string(&self) -> String {
        let hex = hex::encode(self.uuid);
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }

    pub fn salt_hex(&self) -> String {
        hex::encode(&self.salt)
    }

    /// Number of bytes of the data device covered by the hash tree, if it fits in a `u64`.
    pub fn data_size(&self) -> Option<u64> {
        self.data_blocks.checked_mul(self.data_block_size as u64)
    }

    /// Encodes the superblock in its on-disk form.
    ///
    /// Only needed for building fixtures; real hash devices are written by `veritysetup`.
    #[cfg(any(test, feature = "test"))]
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        use zerocopy::FromZeros;

        assert!(self.salt.len() <= MAX_SALT_SIZE);
        assert!(self.algorithm.len() <= 32);

        let mut raw = RawSuperblock::new_zeroed();
        raw.signature = *SIGNATURE;
        raw.version = self.version.into();
        raw.hash_type = self.hash_type.into();
        raw.uuid = self.uuid;
        raw.algorithm[..self.algorithm.len()].copy_from_slice(self.algorithm.as_bytes());
        raw.data_block_size = self.data_block_size.into();
        raw.hash_block_size = self.hash_block_size.into();
        raw.data_blocks = self.data_blocks.into();
        raw.salt_size = (self.salt.len() as u16).into();
        raw.salt[..self.salt.len()].copy_from_slice(&self.salt);

        let mut data = [0u8; SUPERBLOCK_SIZE];
        data.copy_from_slice(raw.as_bytes());
        data
    }
}

impl fmt::Debug for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Superblock")
            .field("version", &self.version)
            .field("hash_type", &self.hash_type)
            .field("uuid", &self.uuid_string())
            .field("algorithm", &self.algorithm)
            .field("data_block_size", &self.data_block_size)
            .field("hash_block_size", &self.hash_block_size)
            .field("data_blocks", &self.data_blocks)
            .field("salt", &self.salt_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, mem::offset_of};

    use proptest::prelude::*;
    use similar_asserts::assert_eq;

    use super::*;

    const UUID: [u8; 16] = [
        0x2e, 0x7b, 0x1c, 0x0a, 0x45, 0x92, 0x4d, 0x3f, 0x9a, 0x61, 0x0c, 0x5e, 0x8b, 0x77, 0xd4,
        0x10,
    ];

    // A header laid out by hand, byte offset by byte offset, the way veritysetup writes it for a
    // 32k data device with 4k blocks and a 32 byte salt.
    fn reference_header() -> [u8; SUPERBLOCK_SIZE] {
        let mut data = [0xa5u8; SUPERBLOCK_SIZE]; // reserved regions must not matter
        data[0..8].copy_from_slice(b"verity\0\0");
        data[8..12].copy_from_slice(&1u32.to_le_bytes());
        data[12..16].copy_from_slice(&1u32.to_le_bytes());
        data[16..32].copy_from_slice(&UUID);
        data[32..64].fill(0);
        data[32..38].copy_from_slice(b"sha256");
        data[64..68].copy_from_slice(&4096u32.to_le_bytes());
        data[68..72].copy_from_slice(&4096u32.to_le_bytes());
        data[72..80].copy_from_slice(&8u64.to_le_bytes());
        data[80..82].copy_from_slice(&32u16.to_le_bytes());
        for (i, b) in data[88..120].iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        data
    }

    #[test]
    fn test_layout() {
        assert_eq!(offset_of!(RawSuperblock, version), 8);
        assert_eq!(offset_of!(RawSuperblock, hash_type), 12);
        assert_eq!(offset_of!(RawSuperblock, uuid), 16);
        assert_eq!(offset_of!(RawSuperblock, algorithm), 32);
        assert_eq!(offset_of!(RawSuperblock, data_block_size), 64);
        assert_eq!(offset_of!(RawSuperblock, hash_block_size), 68);
        assert_eq!(offset_of!(RawSuperblock, data_blocks), 72);
        assert_eq!(offset_of!(RawSuperblock, salt_size), 80);
        assert_eq!(offset_of!(RawSuperblock, salt), 88);
        assert_eq!(offset_of!(RawSuperblock, _pad2), 344);
    }

    #[test]
    fn test_decode_reference() {
        let sb = Superblock::from_bytes(&reference_header()).unwrap();
        assert_eq!(sb.version, 1);
        assert_eq!(sb.hash_type, 1);
        assert_eq!(sb.uuid, UUID);
        assert_eq!(sb.algorithm, "sha256");
        assert_eq!(sb.data_block_size, 4096);
        assert_eq!(sb.hash_block_size, 4096);
        assert_eq!(sb.data_blocks, 8);
        assert_eq!(sb.salt, (1..=32).collect::<Vec<u8>>());
        assert_eq!(sb.data_size(), Some(32768));
        assert_eq!(sb.uuid_string(), "2e7b1c0a-4592-4d3f-9a61-0c5e8b77d410");
        assert_eq!(
            sb.salt_hex(),
            "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20"
        );
    }

    #[test]
    fn test_encode_matches_reference() {
        let sb = Superblock::from_bytes(&reference_header()).unwrap();
        let encoded = sb.to_bytes();
        // identical apart from the reserved regions and the unused salt tail, which are zeroed by
        // the encoder
        assert_eq!(&encoded[..82], &reference_header()[..82]);
        assert_eq!(&encoded[88..120], &reference_header()[88..120]);
        assert!(encoded[120..344].iter().all(|&b| b == 0));
        assert_eq!(Superblock::from_bytes(&encoded).unwrap(), sb);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            SuperblockError::SaltTooLarge(300).to_string(),
            "salt size 300 exceeds the 256 byte salt field"
        );
        assert_eq!(
            SuperblockError::Truncated { found: 100 }.to_string(),
            "superblock truncated: got 100 of 512 bytes"
        );
    }

    #[test]
    fn test_algorithm_without_terminator() {
        let mut data = reference_header();
        data[32..64].copy_from_slice(&[b'x'; 32]);
        let sb = Superblock::from_bytes(&data).unwrap();
        assert_eq!(sb.algorithm, "x".repeat(32));
    }

    #[test]
    fn test_algorithm_garbage_after_nul() {
        let mut data = reference_header();
        data[39..64].fill(0xff);
        let sb = Superblock::from_bytes(&data).unwrap();
        assert_eq!(sb.algorithm, "sha256");
    }

    #[test]
    fn test_algorithm_not_ascii() {
        let mut data = reference_header();
        data[32] = 0xc3;
        assert!(matches!(
            Superblock::from_bytes(&data),
            Err(SuperblockError::InvalidAlgorithm)
        ));
    }

    #[test]
    fn test_empty_salt() {
        let mut data = reference_header();
        data[80..82].copy_from_slice(&0u16.to_le_bytes());
        let sb = Superblock::from_bytes(&data).unwrap();
        assert!(sb.salt.is_empty());
    }

    #[test]
    fn test_full_salt() {
        let mut data = reference_header();
        data[80..82].copy_from_slice(&256u16.to_le_bytes());
        let sb = Superblock::from_bytes(&data).unwrap();
        assert_eq!(sb.salt.len(), 256);
        assert_eq!(&sb.salt[..], &data[88..344]);
    }

    #[test]
    fn test_truncated() {
        let data = reference_header();
        assert!(matches!(
            Superblock::from_bytes(&data[..511]),
            Err(SuperblockError::Truncated { found: 511 })
        ));
        assert!(matches!(
            Superblock::read_from(&mut &data[..100]),
            Err(SuperblockError::Truncated { found: 100 })
        ));
        assert!(matches!(
            Superblock::read_from(&mut &[0u8; 0][..]),
            Err(SuperblockError::Truncated { found: 0 })
        ));
    }

    #[test]
    fn test_read_error() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(Error::other("device went away"))
            }
        }
        assert!(matches!(
            Superblock::read_from(&mut Broken),
            Err(SuperblockError::Read(_))
        ));
    }

    #[test]
    fn test_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&reference_header()).unwrap();
        file.write_all(&[0u8; 4096]).unwrap();
        file.flush().unwrap();

        let sb = Superblock::open(file.path()).unwrap();
        assert_eq!(sb.algorithm, "sha256");

        assert!(matches!(
            Superblock::open("/nonexistent/hash/device"),
            Err(SuperblockError::Open(_))
        ));
    }

    #[test]
    fn test_debug() {
        let sb = Superblock::from_bytes(&reference_header()).unwrap();
        let debug = format!("{sb:?}");
        assert!(debug.contains("2e7b1c0a-4592-4d3f-9a61-0c5e8b77d410"));
        assert!(debug.contains("sha256"));
    }

    proptest! {
        #[test]
        fn prop_signature_byte_flip(index in 0usize..8, value: u8) {
            let mut data = reference_header();
            prop_assume!(data[index] != value);
            data[index] = value;
            prop_assert!(matches!(
                Superblock::from_bytes(&data),
                Err(SuperblockError::SignatureMismatch)
            ));
        }

        #[test]
        fn prop_salt_size_too_large(salt_size in 257u16..=u16::MAX) {
            let mut data = reference_header();
            data[80..82].copy_from_slice(&salt_size.to_le_bytes());
            prop_assert!(matches!(
                Superblock::from_bytes(&data),
                Err(SuperblockError::SaltTooLarge(s)) if s == salt_size
            ));
        }

        #[test]
        fn prop_reserved_ignored(pad1 in any::<[u8; 6]>(), pad2 in prop::collection::vec(any::<u8>(), 168)) {
            let mut data = reference_header();
            data[82..88].copy_from_slice(&pad1);
            data[344..].copy_from_slice(&pad2);
            prop_assert_eq!(
                Superblock::from_bytes(&data).unwrap(),
                Superblock::from_bytes(&reference_header()).unwrap()
            );
        }

        #[test]
        fn prop_fields_decode(
            version: u32,
            hash_type: u32,
            uuid: [u8; 16],
            algorithm in "[a-z0-9()-]{1,31}",
            data_block_size: u32,
            hash_block_size: u32,
            data_blocks: u64,
            salt in prop::collection::vec(any::<u8>(), 0..=MAX_SALT_SIZE),
        ) {
            let mut data = [0u8; SUPERBLOCK_SIZE];
            data[0..8].copy_from_slice(SIGNATURE);
            data[8..12].copy_from_slice(&version.to_le_bytes());
            data[12..16].copy_from_slice(&hash_type.to_le_bytes());
            data[16..32].copy_from_slice(&uuid);
            data[32..32 + algorithm.len()].copy_from_slice(algorithm.as_bytes());
            data[64..68].copy_from_slice(&data_block_size.to_le_bytes());
            data[68..72].copy_from_slice(&hash_block_size.to_le_bytes());
            data[72..80].copy_from_slice(&data_blocks.to_le_bytes());
            data[80..82].copy_from_slice(&(salt.len() as u16).to_le_bytes());
            data[88..88 + salt.len()].copy_from_slice(&salt);

            let sb = Superblock::from_bytes(&data).unwrap();
            prop_assert_eq!(sb.version, version);
            prop_assert_eq!(sb.hash_type, hash_type);
            prop_assert_eq!(sb.uuid, uuid);
            prop_assert_eq!(&sb.algorithm, &algorithm);
            prop_assert_eq!(sb.data_block_size, data_block_size);
            prop_assert_eq!(sb.hash_block_size, hash_block_size);
            prop_assert_eq!(sb.data_blocks, data_blocks);
            prop_assert_eq!(&sb.salt, &salt);
        }
    }
}
