//! Activating dm-verity block devices.
//!
//! dm-verity maps a data device read-only and checks every block read from it
//! against a Merkle tree stored on a hash device.  The tree is anchored by a
//! root digest that the caller obtains from somewhere it trusts; everything
//! else needed to set up the mapping is described by the superblock that
//! `veritysetup format` writes at the start of the hash device.
//!
//! This crate decodes that [`Superblock`], turns it into a [`VerityTable`] and
//! loads the table through device-mapper:
//!
//! ```no_run
//! # fn main() -> dmverity::error::Result<()> {
//! let vm = dmverity::VerityManager::open()?;
//! vm.activate("root", "/dev/vda2", "/dev/vda3", "4392712b2a3e1b2a...")?;
//! dmverity::wait_for_device(dmverity::device_path("root"), std::time::Duration::from_secs(5))
//!     .expect("device node");
//! // read from /dev/mapper/root
//! vm.deactivate("root")?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod dm;
pub mod error;
pub mod session;
pub mod superblock;
pub mod table;
pub mod util;


pub use error::VerityError;
pub use session::{activate, deactivate, VerityManager};
pub use superblock::Superblock;
pub use table::{CorruptionMode, TableOptions, VerityTable};
pub use util::{device_path, wait_for_device};
