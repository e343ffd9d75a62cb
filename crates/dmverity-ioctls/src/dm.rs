//! Low-level device-mapper control ioctls.
//!
//! This module provides safe wrappers around the ioctls accepted by
//! `/dev/mapper/control` (see `include/uapi/linux/dm-ioctl.h`).  Every request
//! is a `struct dm_ioctl` header followed by a command-specific payload in one
//! contiguous buffer.  Devices are always addressed by name.

#![allow(unsafe_code)]

use std::{
    io::Error,
    mem::size_of,
    os::fd::{AsFd, OwnedFd},
};

use rustix::{
    fs::{open, Mode, OFlags},
    io::Errno,
    ioctl::{ioctl, opcode, Opcode, Updater},
};
use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Path of the device-mapper control node.
pub const DM_CONTROL_PATH: &str = "/dev/mapper/control";

/// Size of the name field in `struct dm_ioctl`, including the terminating NUL.
pub const DM_NAME_LEN: usize = 128;
/// Size of the uuid field in `struct dm_ioctl`, including the terminating NUL.
pub const DM_UUID_LEN: usize = 129;
const DM_MAX_TYPE_NAME: usize = 16;

// The oldest interface revision that knows every command used here.
const DM_VERSION_MAJOR: u32 = 4;
const DM_VERSION_MINOR: u32 = 0;
const DM_VERSION_PATCHLEVEL: u32 = 0;

/// Flags for the `flags` field of `struct dm_ioctl`.
pub mod flags {
    /// Load the table read-only / the device is read-only.
    pub const DM_READONLY_FLAG: u32 = 1 << 0;
    /// Suspend instead of resume (for `DM_DEV_SUSPEND`) / the device is suspended.
    pub const DM_SUSPEND_FLAG: u32 = 1 << 1;
    /// A live table is present.
    pub const DM_ACTIVE_PRESENT_FLAG: u32 = 1 << 5;
    /// An inactive table is present.
    pub const DM_INACTIVE_PRESENT_FLAG: u32 = 1 << 6;
    /// The kernel sent a uevent for this operation.
    pub const DM_UEVENT_GENERATED_FLAG: u32 = 1 << 13;
}

/// A device-mapper request failed.
#[derive(Error, Debug)]
pub enum DmError {
    /// I/O operation failed.
    #[error("{0}")]
    Io(#[from] Error),
    /// A device with the same name or uuid already exists.
    #[error("device name or uuid already in use")]
    AlreadyExists,
    /// No device with the given name exists.
    #[error("no such device")]
    NoSuchDevice,
    /// The device is open and can't be removed.
    #[error("device is busy")]
    DeviceBusy,
    /// An argument can't be represented in a `struct dm_ioctl`.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The target table doesn't fit in the request buffer.
    #[error("table of {0} bytes does not fit in the ioctl buffer")]
    TableTooLarge(usize),
    /// The kernel speaks an incompatible interface revision.
    #[error("unsupported device-mapper interface version {0}.{1}.{2}")]
    UnsupportedVersion(u32, u32, u32),
}

// See /usr/include/linux/dm-ioctl.h
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DmIoctl {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; DM_UUID_LEN],
    data: [u8; 7],
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DmTargetSpec {
    sector_start: u64,
    length: u64,
    status: i32,
    next: u32,
    target_type: [u8; DM_MAX_TYPE_NAME],
}

// Same default as libdevmapper; plenty for a handful of verity targets.
const DM_PAYLOAD_SIZE: usize = 16 * 1024;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DmBuffer {
    header: DmIoctl,
    payload: [u8; DM_PAYLOAD_SIZE],
}

const DM_IOCTL: u8 = 0xfd;

// #define DM_VERSION       _IOWR(DM_IOCTL, DM_VERSION_CMD, struct dm_ioctl)
const DM_VERSION: Opcode = opcode::read_write::<DmIoctl>(DM_IOCTL, 0);
const DM_DEV_CREATE: Opcode = opcode::read_write::<DmIoctl>(DM_IOCTL, 3);
const DM_DEV_REMOVE: Opcode = opcode::read_write::<DmIoctl>(DM_IOCTL, 4);
const DM_DEV_SUSPEND: Opcode = opcode::read_write::<DmIoctl>(DM_IOCTL, 6);
const DM_DEV_STATUS: Opcode = opcode::read_write::<DmIoctl>(DM_IOCTL, 7);
const DM_TABLE_LOAD: Opcode = opcode::read_write::<DmIoctl>(DM_IOCTL, 9);

/// One entry of a device-mapper table.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    /// First sector of the mapped device covered by this target.
    pub sector_start: u64,
    /// Number of 512-byte sectors covered by this target.
    pub length: u64,
    /// Target type name, e.g. "verity".
    pub target_type: &'a str,
    /// Target-specific parameter string.
    pub params: &'a str,
}

/// The state of a mapped device as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Encoded device number (`huge_encode_dev()` format).
    pub dev: u64,
    /// Number of openers of the mapped device.
    pub open_count: i32,
    /// Number of targets in the live table.
    pub target_count: u32,
    /// Current event counter.
    pub event_nr: u32,
    /// Raw `DM_*_FLAG` bits.
    pub flags: u32,
}

impl DeviceStatus {
    /// Major number of the mapped block device.
    pub fn major(&self) -> u32 {
        ((self.dev & 0xfff00) >> 8) as u32
    }

    /// Minor number of the mapped block device.
    pub fn minor(&self) -> u32 {
        ((self.dev & 0xff) | ((self.dev >> 12) & 0xfff00)) as u32
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & flags::DM_READONLY_FLAG != 0
    }

    pub fn is_suspended(&self) -> bool {
        self.flags & flags::DM_SUSPEND_FLAG != 0
    }

    pub fn has_live_table(&self) -> bool {
        self.flags & flags::DM_ACTIVE_PRESENT_FLAG != 0
    }
}

impl DmBuffer {
    fn new(name: Option<&str>, flags: u32) -> Result<Box<Self>, DmError> {
        let mut buf = Box::new(Self::new_zeroed());
        buf.header.version = [DM_VERSION_MAJOR, DM_VERSION_MINOR, DM_VERSION_PATCHLEVEL];
        buf.header.data_size = size_of::<Self>() as u32;
        buf.header.data_start = size_of::<DmIoctl>() as u32;
        buf.header.flags = flags;
        if let Some(name) = name {
            if name.is_empty() {
                return Err(DmError::InvalidArgument("empty device name"));
            }
            copy_cstr(&mut buf.header.name, name, "device name too long")?;
        }
        Ok(buf)
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            dev: self.header.dev,
            open_count: self.header.open_count,
            target_count: self.header.target_count,
            event_nr: self.header.event_nr,
            flags: self.header.flags,
        }
    }
}

/// Copies `src` into the fixed-size NUL-terminated field `dst`.
fn copy_cstr(dst: &mut [u8], src: &str, too_long: &'static str) -> Result<(), DmError> {
    let bytes = src.as_bytes();
    if bytes.contains(&0) {
        return Err(DmError::InvalidArgument("embedded NUL byte"));
    }
    // Room for the terminator is required.
    if bytes.len() >= dst.len() {
        return Err(DmError::InvalidArgument(too_long));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Serializes `targets` as a chain of `struct dm_target_spec` entries, each followed by its
/// NUL-terminated parameter string and padded to an 8-byte boundary.
fn write_targets(payload: &mut [u8], targets: &[Target<'_>]) -> Result<(), DmError> {
    let mut offset = 0;
    for target in targets {
        let params = target.params.as_bytes();
        if params.contains(&0) {
            return Err(DmError::InvalidArgument("embedded NUL byte in target parameters"));
        }
        let size = (size_of::<DmTargetSpec>() + params.len() + 1).next_multiple_of(8);
        if offset + size > payload.len() {
            return Err(DmError::TableTooLarge(offset + size));
        }

        let mut spec = DmTargetSpec {
            sector_start: target.sector_start,
            length: target.length,
            status: 0,
            next: size as u32,
            target_type: [0; DM_MAX_TYPE_NAME],
        };
        copy_cstr(&mut spec.target_type, target.target_type, "target type too long")?;

        let params_start = offset + size_of::<DmTargetSpec>();
        payload[offset..params_start].copy_from_slice(spec.as_bytes());
        payload[params_start..params_start + params.len()].copy_from_slice(params);
        // the terminator and the padding are already zero
        offset += size;
    }
    Ok(())
}

fn dm_ioctl<const OPCODE: Opcode>(control: impl AsFd, buf: &mut DmBuffer) -> Result<(), Errno> {
    unsafe { ioctl(control, Updater::<{ OPCODE }, DmBuffer>::new(buf)) }
}

/// Opens the device-mapper control node and checks its interface version.
pub fn open_control() -> Result<OwnedFd, DmError> {
    let control = open(
        DM_CONTROL_PATH,
        OFlags::RDWR | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(Error::from)?;
    let [major, minor, patch] = version(&control)?;
    if major != DM_VERSION_MAJOR {
        return Err(DmError::UnsupportedVersion(major, minor, patch));
    }
    Ok(control)
}

/// Queries the interface version of the kernel driver (`DM_VERSION`).
pub fn version(control: impl AsFd) -> Result<[u32; 3], DmError> {
    let mut buf = DmBuffer::new(None, 0)?;
    dm_ioctl::<DM_VERSION>(control, &mut buf).map_err(Error::from)?;
    Ok(buf.header.version)
}

/// Creates a new, empty mapped device (`DM_DEV_CREATE`).
///
/// The device has no table and can't be read until a table is loaded and the device resumed.
pub fn dev_create(
    control: impl AsFd,
    name: &str,
    uuid: Option<&str>,
) -> Result<DeviceStatus, DmError> {
    let mut buf = DmBuffer::new(Some(name), 0)?;
    if let Some(uuid) = uuid {
        copy_cstr(&mut buf.header.uuid, uuid, "device uuid too long")?;
    }
    match dm_ioctl::<DM_DEV_CREATE>(control, &mut buf) {
        Ok(()) => Ok(buf.status()),
        Err(Errno::BUSY) => Err(DmError::AlreadyExists),
        Err(e) => Err(Error::from(e).into()),
    }
}

/// Loads `targets` into the inactive table slot of the named device (`DM_TABLE_LOAD`).
///
/// Pass [`flags::DM_READONLY_FLAG`] to open the underlying devices read-only.  The kernel
/// validates the table here: unknown target types, unreadable devices or malformed parameters
/// are reported as `EINVAL`.
pub fn table_load(
    control: impl AsFd,
    name: &str,
    flags: u32,
    targets: &[Target<'_>],
) -> Result<(), DmError> {
    let mut buf = DmBuffer::new(Some(name), flags)?;
    write_targets(&mut buf.payload, targets)?;
    buf.header.target_count = targets.len() as u32;
    match dm_ioctl::<DM_TABLE_LOAD>(control, &mut buf) {
        Ok(()) => Ok(()),
        Err(Errno::NXIO) => Err(DmError::NoSuchDevice),
        Err(e) => Err(Error::from(e).into()),
    }
}

/// Resumes the named device, swapping in its inactive table (`DM_DEV_SUSPEND` without
/// `DM_SUSPEND_FLAG`).
pub fn dev_resume(control: impl AsFd, name: &str) -> Result<DeviceStatus, DmError> {
    let mut buf = DmBuffer::new(Some(name), 0)?;
    match dm_ioctl::<DM_DEV_SUSPEND>(control, &mut buf) {
        Ok(()) => Ok(buf.status()),
        Err(Errno::NXIO) => Err(DmError::NoSuchDevice),
        Err(e) => Err(Error::from(e).into()),
    }
}

/// Removes the named device (`DM_DEV_REMOVE`).
pub fn dev_remove(control: impl AsFd, name: &str) -> Result<(), DmError> {
    let mut buf = DmBuffer::new(Some(name), 0)?;
    match dm_ioctl::<DM_DEV_REMOVE>(control, &mut buf) {
        Ok(()) => Ok(()),
        Err(Errno::NXIO) => Err(DmError::NoSuchDevice),
        Err(Errno::BUSY) => Err(DmError::DeviceBusy),
        Err(e) => Err(Error::from(e).into()),
    }
}

/// Reports the state of the named device (`DM_DEV_STATUS`).
pub fn dev_status(control: impl AsFd, name: &str) -> Result<DeviceStatus, DmError> {
    let mut buf = DmBuffer::new(Some(name), 0)?;
    match dm_ioctl::<DM_DEV_STATUS>(control, &mut buf) {
        Ok(()) => Ok(buf.status()),
        Err(Errno::NXIO) => Err(DmError::NoSuchDevice),
        Err(e) => Err(Error::from(e).into()),
    }
}
