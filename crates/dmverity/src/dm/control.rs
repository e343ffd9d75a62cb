use std::os::fd::OwnedFd;

use dmverity_ioctls::dm::{self, flags::DM_READONLY_FLAG, Target};
use log::{debug, trace, warn};

use super::{DeviceInfo, DeviceMapper, DmError, TargetSpec};

/// The kernel device-mapper, reached through `/dev/mapper/control`.
///
/// Opening it requires `CAP_SYS_ADMIN`.
#[derive(Debug)]
pub struct Control {
    fd: OwnedFd,
}

impl Control {
    pub fn open() -> Result<Self, DmError> {
        let fd = dm::open_control()?;
        Ok(Self { fd })
    }

    /// The interface version of the kernel driver.
    pub fn version(&self) -> Result<[u32; 3], DmError> {
        dm::version(&self.fd)
    }

    fn load_and_resume(
        &self,
        name: &str,
        read_only: bool,
        table: &[TargetSpec],
    ) -> Result<(), DmError> {
        let targets: Vec<Target> = table
            .iter()
            .map(|t| Target {
                sector_start: t.sector_start,
                length: t.length,
                target_type: &t.target_type,
                params: &t.params,
            })
            .collect();
        for target in &targets {
            trace!(
                "{name}: {} {} {} {}",
                target.sector_start,
                target.length,
                target.target_type,
                target.params
            );
        }

        let flags = if read_only { DM_READONLY_FLAG } else { 0 };
        dm::table_load(&self.fd, name, flags, &targets)?;
        dm::dev_resume(&self.fd, name)?;
        Ok(())
    }
}

impl DeviceMapper for Control {
    fn create_and_load(
        &self,
        name: &str,
        uuid: &str,
        read_only: bool,
        table: &[TargetSpec],
    ) -> Result<(), DmError> {
        debug!("creating device {name} ({uuid})");
        dm::dev_create(&self.fd, name, Some(uuid))?;

        let result = self.load_and_resume(name, read_only, table);
        if let Err(err) = &result {
            debug!("activating {name} failed, removing it again: {err}");
            if let Err(remove_err) = dm::dev_remove(&self.fd, name) {
                warn!("failed to remove {name} after failed activation: {remove_err}");
            }
        }
        result
    }

    fn remove(&self, name: &str) -> Result<(), DmError> {
        debug!("removing device {name}");
        dm::dev_remove(&self.fd, name)
    }

    fn info(&self, name: &str) -> Result<DeviceInfo, DmError> {
        let status = dm::dev_status(&self.fd, name)?;
        Ok(DeviceInfo {
            major: status.major(),
            minor: status.minor(),
            open_count: status.open_count.max(0) as u32,
            read_only: status.is_read_only(),
            suspended: status.is_suspended(),
            live_table: status.has_live_table(),
        })
    }
}
