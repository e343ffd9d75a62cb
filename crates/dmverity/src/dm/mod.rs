//! Access to the kernel's device-mapper.
//!
//! Everything the session layer needs from device-mapper is behind the narrow
//! [`DeviceMapper`] trait: create a device with a table, remove it, and ask
//! about it.  [`Control`] talks to the kernel through `/dev/mapper/control`;
//! with the `test` feature, [`fake::FakeDeviceMapper`] keeps devices in memory
//! so that everything above it can be tested without privileges.

mod control;
#[cfg(any(test, feature = "test"))]
pub mod fake;

pub use control::Control;
pub use dmverity_ioctls::dm::DmError;

/// One target line of a mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub sector_start: u64,
    /// Length in 512-byte sectors.
    pub length: u64,
    pub target_type: String,
    pub params: String,
}

/// What device-mapper reports about a mapped device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub major: u32,
    pub minor: u32,
    pub open_count: u32,
    pub read_only: bool,
    pub suspended: bool,
    /// Whether a table is live, i.e. the device can be read.
    pub live_table: bool,
}

/// The operations the verity layer needs from device-mapper.
///
/// Implementations must report a name that is already taken as [`DmError::AlreadyExists`], a
/// missing device as [`DmError::NoSuchDevice`] and an open device that can't be removed as
/// [`DmError::DeviceBusy`].
pub trait DeviceMapper {
    /// Creates the device `name`, loads `table` into it and makes it live.
    ///
    /// This is all or nothing: if any step fails, no device named `name` is left behind.
    fn create_and_load(
        &self,
        name: &str,
        uuid: &str,
        read_only: bool,
        table: &[TargetSpec],
    ) -> Result<(), DmError>;

    /// Removes the device `name`.
    fn remove(&self, name: &str) -> Result<(), DmError>;

    fn info(&self, name: &str) -> Result<DeviceInfo, DmError>;
}

impl<T: DeviceMapper + ?Sized> DeviceMapper for &T {
    fn create_and_load(
        &self,
        name: &str,
        uuid: &str,
        read_only: bool,
        table: &[TargetSpec],
    ) -> Result<(), DmError> {
        (**self).create_and_load(name, uuid, read_only, table)
    }

    fn remove(&self, name: &str) -> Result<(), DmError> {
        (**self).remove(name)
    }

    fn info(&self, name: &str) -> Result<DeviceInfo, DmError> {
        (**self).info(name)
    }
}
