//! Building dm-verity mapping tables.
//!
//! A [`VerityTable`] combines a decoded [`Superblock`] with the device paths and the trusted root
//! digest supplied by the caller, and renders the parameter string of the kernel `verity` target
//! (see `Documentation/admin-guide/device-mapper/verity.rst`):
//!
//! ```text
//! <version> <dev> <hash_dev> <data_block_size> <hash_block_size>
//! <num_data_blocks> <hash_start_block> <algorithm> <digest> <salt>
//! [<#opt_params> <opt_params>]
//! ```

use std::{fmt, path::Path};

use hex::FromHexError;
use thiserror::Error;

use crate::{dm::TargetSpec, superblock::Superblock};

/// Size of the sectors device-mapper tables are measured in.
pub const SECTOR_SIZE: u64 = 512;
/// The hash tree starts in the hash block right after the superblock.
pub const HASH_START_BLOCK: u64 = 1;
/// Name of the kernel target type.
pub const TARGET_TYPE: &str = "verity";

/// Building a table from a superblock failed.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("{kind} block size {size} is not a power of two of at least 512 bytes")]
    InvalidBlockSize { kind: &'static str, size: u32 },
    #[error("{data_blocks} data blocks of {data_block_size} bytes overflow the sector count")]
    DataTooLarge {
        data_blocks: u64,
        data_block_size: u32,
    },
    #[error("superblock names no hash algorithm")]
    MissingAlgorithm,
    #[error("root digest is empty")]
    EmptyRootDigest,
    #[error("root digest is not a hex string: {0}")]
    InvalidRootDigest(#[from] FromHexError),
    #[error("device path {0:?} can't be used in a table")]
    InvalidDevicePath(String),
}

/// What the kernel does when a block fails verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorruptionMode {
    /// Fail the read with `EIO`.
    #[default]
    IoError,
    /// Log the mismatch and return the data anyway.
    Ignore,
    /// Reboot the machine.
    Restart,
    /// Panic the kernel.
    Panic,
}

impl CorruptionMode {
    fn param(self) -> Option<&'static str> {
        match self {
            Self::IoError => None,
            Self::Ignore => Some("ignore_corruption"),
            Self::Restart => Some("restart_on_corruption"),
            Self::Panic => Some("panic_on_corruption"),
        }
    }
}

/// Optional target parameters.  The defaults add none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub corruption: CorruptionMode,
    /// Don't verify blocks that are expected to contain zeroes, always return zeroes instead.
    pub ignore_zero_blocks: bool,
    /// Verify each data block only the first time it is read.
    pub check_at_most_once: bool,
}

impl TableOptions {
    fn params(&self) -> Vec<&'static str> {
        let mut params = vec![];
        params.extend(self.corruption.param());
        if self.ignore_zero_blocks {
            params.push("ignore_zero_blocks");
        }
        if self.check_at_most_once {
            params.push("check_at_most_once");
        }
        params
    }
}

/// A complete `verity` target, ready to be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTable {
    /// Length of the mapped device in 512-byte sectors.
    pub length: u64,
    /// On-disk hash format revision, taken from the superblock's hash type.
    pub version: u32,
    pub data_device: String,
    pub hash_device: String,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub data_blocks: u64,
    pub hash_start_block: u64,
    pub algorithm: String,
    pub root_digest: String,
    /// Hex-encoded salt, or `-` if there is none.
    pub salt: String,
    pub options: TableOptions,
}

fn check_block_size(kind: &'static str, size: u32) -> Result<(), TableError> {
    if size.is_power_of_two() && size as u64 >= SECTOR_SIZE {
        Ok(())
    } else {
        Err(TableError::InvalidBlockSize { kind, size })
    }
}

// Table parameters are split on whitespace by the kernel.
fn table_path(path: &Path) -> Result<String, TableError> {
    match path.to_str() {
        Some(s) if !s.is_empty() && !s.contains(char::is_whitespace) => Ok(s.to_string()),
        _ => Err(TableError::InvalidDevicePath(
            path.to_string_lossy().into_owned(),
        )),
    }
}

/// Checks that `root_digest` is a non-empty hex string.
pub fn check_root_digest(root_digest: &str) -> Result<(), TableError> {
    if root_digest.is_empty() {
        return Err(TableError::EmptyRootDigest);
    }
    hex::decode(root_digest)?;
    Ok(())
}

impl VerityTable {
    /// Builds the table for `superblock`, read from `hash_device`, protecting `data_device` and
    /// anchored at `root_digest`.
    ///
    /// The root digest is checked to be hex but otherwise passed through untouched: it comes
    /// from the caller, never from the superblock.
    pub fn new(
        superblock: &Superblock,
        data_device: &Path,
        hash_device: &Path,
        root_digest: &str,
        options: TableOptions,
    ) -> Result<Self, TableError> {
        check_block_size("data", superblock.data_block_size)?;
        check_block_size("hash", superblock.hash_block_size)?;

        let length = superblock
            .data_blocks
            .checked_mul(superblock.data_block_size as u64 / SECTOR_SIZE)
            .ok_or(TableError::DataTooLarge {
                data_blocks: superblock.data_blocks,
                data_block_size: superblock.data_block_size,
            })?;

        if superblock.algorithm.is_empty() {
            return Err(TableError::MissingAlgorithm);
        }

        check_root_digest(root_digest)?;

        let salt = if superblock.salt.is_empty() {
            "-".to_string()
        } else {
            superblock.salt_hex()
        };

        Ok(Self {
            length,
            version: superblock.hash_type,
            data_device: table_path(data_device)?,
            hash_device: table_path(hash_device)?,
            data_block_size: superblock.data_block_size,
            hash_block_size: superblock.hash_block_size,
            data_blocks: superblock.data_blocks,
            hash_start_block: HASH_START_BLOCK,
            algorithm: superblock.algorithm.clone(),
            root_digest: root_digest.to_string(),
            salt,
            options,
        })
    }

    /// The parameter string of the target.
    pub fn params(&self) -> String {
        let mut params = format!(
            "{} {} {} {} {} {} {} {} {} {}",
            self.version,
            self.data_device,
            self.hash_device,
            self.data_block_size,
            self.hash_block_size,
            self.data_blocks,
            self.hash_start_block,
            self.algorithm,
            self.root_digest,
            self.salt
        );
        let optional = self.options.params();
        if !optional.is_empty() {
            params.push_str(&format!(" {} {}", optional.len(), optional.join(" ")));
        }
        params
    }

    pub fn to_target(&self) -> TargetSpec {
        TargetSpec {
            sector_start: 0,
            length: self.length,
            target_type: TARGET_TYPE.to_string(),
            params: self.params(),
        }
    }
}

/// Formats the table the way `dmsetup table` prints it.
impl fmt::Display for VerityTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0 {} {} {}", self.length, TARGET_TYPE, self.params())
    }
}
