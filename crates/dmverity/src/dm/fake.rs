//! An in-memory device-mapper for tests.
//!
//! [`FakeDeviceMapper`] enforces the same rules the kernel does for the
//! operations it models (unique names and identifiers, removal of open devices,
//! rejection of tables it can't satisfy) but maps nothing.  Reads through
//! [`FakeDeviceMapper::read`] return the data-device bytes a linear mapping of
//! the table would expose, without any verification.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{Error, ErrorKind, Read},
    sync::Mutex,
};

use dmverity_ioctls::dm::{DM_NAME_LEN, DM_UUID_LEN};

use super::{DeviceInfo, DeviceMapper, DmError, TargetSpec};
use crate::table::SECTOR_SIZE;

// The major number Linux usually hands to device-mapper.
const FAKE_MAJOR: u32 = 253;

// Hash algorithms the fake pretends the kernel crypto API knows.
const ALGORITHMS: &[&str] = &["sha1", "sha256", "sha512", "blake2b-256"];

/// A device known to a [`FakeDeviceMapper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDevice {
    pub uuid: String,
    pub read_only: bool,
    pub table: Vec<TargetSpec>,
    pub minor: u32,
    pub open_count: u32,
}

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<String, FakeDevice>,
    next_minor: u32,
    reject_tables: bool,
}

/// See the module documentation.
#[derive(Debug, Default)]
pub struct FakeDeviceMapper {
    state: Mutex<State>,
}

fn check_table(table: &[TargetSpec]) -> Result<(), DmError> {
    let invalid = || DmError::Io(ErrorKind::InvalidInput.into());

    if table.is_empty() {
        return Err(invalid());
    }
    for target in table {
        if target.target_type != "verity" || target.length == 0 {
            return Err(invalid());
        }
        let params: Vec<&str> = target.params.split_whitespace().collect();
        if params.len() < 10 || !ALGORITHMS.contains(&params[7]) {
            return Err(invalid());
        }
        // the data device has to be large enough for the mapping
        let metadata = std::fs::metadata(params[1])?;
        if metadata.is_file() && metadata.len() < (target.sector_start + target.length) * SECTOR_SIZE
        {
            return Err(invalid());
        }
    }
    Ok(())
}

impl FakeDeviceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the device called `name`, if there is one.
    pub fn device(&self, name: &str) -> Option<FakeDevice> {
        self.state.lock().unwrap().devices.get(name).cloned()
    }

    /// The names of all devices, sorted.
    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().devices.keys().cloned().collect()
    }

    /// Pretends `count` openers hold the device, as a mount would.  Returns false if there is no
    /// such device.
    pub fn set_open_count(&self, name: &str, count: u32) -> bool {
        match self.state.lock().unwrap().devices.get_mut(name) {
            Some(device) => {
                device.open_count = count;
                true
            }
            None => false,
        }
    }

    /// Makes every following table load fail with `EINVAL`, like a kernel without the verity
    /// target would.
    pub fn reject_tables(&self, reject: bool) {
        self.state.lock().unwrap().reject_tables = reject;
    }

    /// Reads the whole mapped device.
    pub fn read(&self, name: &str) -> std::io::Result<Vec<u8>> {
        let device = self
            .device(name)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no device {name}")))?;

        let mut data = vec![];
        for target in &device.table {
            let path = target
                .params
                .split_whitespace()
                .nth(1)
                .ok_or(ErrorKind::InvalidData)?;
            let mut extent = vec![0u8; (target.length * SECTOR_SIZE) as usize];
            File::open(path)?.read_exact(&mut extent)?;
            data.extend(extent);
        }
        Ok(data)
    }
}

impl DeviceMapper for FakeDeviceMapper {
    fn create_and_load(
        &self,
        name: &str,
        uuid: &str,
        read_only: bool,
        table: &[TargetSpec],
    ) -> Result<(), DmError> {
        if name.is_empty() || name.len() >= DM_NAME_LEN || name.contains('\0') {
            return Err(DmError::InvalidArgument("bad device name"));
        }
        if uuid.len() >= DM_UUID_LEN || uuid.contains('\0') {
            return Err(DmError::InvalidArgument("bad device uuid"));
        }

        let mut state = self.state.lock().unwrap();
        if state.devices.contains_key(name)
            || (!uuid.is_empty() && state.devices.values().any(|d| d.uuid == uuid))
        {
            return Err(DmError::AlreadyExists);
        }

        // Nothing has been registered yet, so a rejected table leaves no trace.
        if state.reject_tables {
            return Err(DmError::Io(ErrorKind::InvalidInput.into()));
        }
        check_table(table)?;

        let minor = state.next_minor;
        state.next_minor += 1;
        state.devices.insert(
            name.to_string(),
            FakeDevice {
                uuid: uuid.to_string(),
                read_only,
                table: table.to_vec(),
                minor,
                open_count: 0,
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), DmError> {
        let mut state = self.state.lock().unwrap();
        match state.devices.get(name) {
            None => Err(DmError::NoSuchDevice),
            Some(device) if device.open_count > 0 => Err(DmError::DeviceBusy),
            Some(_) => {
                state.devices.remove(name);
                Ok(())
            }
        }
    }

    fn info(&self, name: &str) -> Result<DeviceInfo, DmError> {
        let state = self.state.lock().unwrap();
        let device = state.devices.get(name).ok_or(DmError::NoSuchDevice)?;
        Ok(DeviceInfo {
            major: FAKE_MAJOR,
            minor: device.minor,
            open_count: device.open_count,
            read_only: device.read_only,
            suspended: false,
            live_table: true,
        })
    }
}
