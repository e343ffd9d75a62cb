//! Error types for activating and removing verity devices.
//!
//! Every variant names the device path or the logical device name it concerns.
//! Nothing is retried internally: all of these are configuration or environment
//! problems for the caller to act on.
//!
//! - **Hash device problems**: [`Io`], [`Format`], [`SignatureMismatch`]
//! - **Argument problems**: [`InvalidName`], [`InvalidRootDigest`], [`InvalidTable`]
//! - **Activation**: [`AlreadyActive`], [`ResourceCreate`]
//! - **Removal and queries**: [`NotFound`], [`ResourceBusy`], [`ResourceRemove`], [`Query`]
//!
//! [`Io`]: VerityError::Io
//! [`Format`]: VerityError::Format
//! [`SignatureMismatch`]: VerityError::SignatureMismatch
//! [`InvalidName`]: VerityError::InvalidName
//! [`InvalidRootDigest`]: VerityError::InvalidRootDigest
//! [`InvalidTable`]: VerityError::InvalidTable
//! [`AlreadyActive`]: VerityError::AlreadyActive
//! [`ResourceCreate`]: VerityError::ResourceCreate
//! [`NotFound`]: VerityError::NotFound
//! [`ResourceBusy`]: VerityError::ResourceBusy
//! [`ResourceRemove`]: VerityError::ResourceRemove
//! [`Query`]: VerityError::Query

use std::path::{Path, PathBuf};

use crate::{dm::DmError, superblock::SuperblockError, table::TableError};

/// Result type alias for verity device operations.
pub type Result<T> = std::result::Result<T, VerityError>;

#[derive(Debug, thiserror::Error)]
pub enum VerityError {
    /// The hash device could not be opened.
    #[error("failed to open {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The superblock is truncated, unreadable or malformed.
    #[error("invalid verity superblock on {}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: SuperblockError,
    },

    /// The hash device doesn't start with a verity superblock.
    #[error("{} does not contain a verity superblock", path.display())]
    SignatureMismatch { path: PathBuf },

    #[error("invalid device name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid root digest for {name}")]
    InvalidRootDigest {
        name: String,
        #[source]
        source: TableError,
    },

    /// The superblock describes a table that can't be built.
    #[error("can't build verity table for {name}")]
    InvalidTable {
        name: String,
        #[source]
        source: TableError,
    },

    /// A device with this name (or the same identifier) is already active.
    #[error("device {name} is already active")]
    AlreadyActive { name: String },

    /// The kernel refused to create the device or load its table.
    #[error("failed to create device {name}")]
    ResourceCreate {
        name: String,
        #[source]
        source: DmError,
    },

    #[error("device {name} does not exist")]
    NotFound { name: String },

    /// The device is still open, e.g. mounted.
    #[error("device {name} is busy")]
    ResourceBusy { name: String },

    #[error("failed to remove device {name}")]
    ResourceRemove {
        name: String,
        #[source]
        source: DmError,
    },

    #[error("failed to query device {name}")]
    Query {
        name: String,
        #[source]
        source: DmError,
    },

    /// The device-mapper control node could not be opened.
    #[error("failed to open device-mapper control")]
    Control(#[source] DmError),
}

impl VerityError {
    /// Attributes a superblock decoding failure to the hash device at `path`.
    pub(crate) fn from_superblock(path: &Path, source: SuperblockError) -> Self {
        let path = path.to_path_buf();
        match source {
            SuperblockError::Open(source) => Self::Io { path, source },
            SuperblockError::SignatureMismatch => Self::SignatureMismatch { path },
            source => Self::Format { path, source },
        }
    }
}
