//! Activating and removing verity devices.
//!
//! [`VerityManager`] strings the pieces together: it validates the caller's
//! arguments, decodes the superblock from the hash device, builds the table and
//! hands it to a [`DeviceMapper`].  Devices are identified by their logical name;
//! the manager keeps no state of its own, so several managers (or processes)
//! can work on the same system and the kernel arbitrates between them.

use std::path::Path;

use dmverity_ioctls::dm::{DM_NAME_LEN, DM_UUID_LEN};
use log::debug;

use crate::{
    dm::{Control, DeviceInfo, DeviceMapper, DmError},
    error::{Result, VerityError},
    superblock::Superblock,
    table::{check_root_digest, TableOptions, VerityTable},
};

/// Prefix of the device-mapper identifier of every device we create.
pub const UUID_PREFIX: &str = "CRYPT-VERITY-";

fn check_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() >= DM_NAME_LEN {
        "too long"
    } else if name.contains('/') {
        "contains '/'"
    } else if name.contains('\0') {
        "contains NUL"
    } else if name == "." || name == ".." {
        "reserved"
    } else {
        return Ok(());
    };
    Err(VerityError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// The device-mapper identifier for the device `name` backed by `superblock`.
///
/// This has the form `CRYPT-VERITY-<superblock uuid in hex>-<name>`, cut short to fit the kernel's
/// identifier field.  It only helps tools like `dmsetup ls` tell what a device is, nothing ever
/// reads it back.
pub fn device_uuid(superblock: &Superblock, name: &str) -> String {
    let mut uuid = format!("{UUID_PREFIX}{}-{name}", hex::encode(superblock.uuid));
    let mut len = uuid.len().min(DM_UUID_LEN - 1);
    while !uuid.is_char_boundary(len) {
        len -= 1;
    }
    uuid.truncate(len);
    uuid
}

/// Validates the arguments and builds the table [`VerityManager::activate_with_options`] would
/// load, along with the superblock it came from, without touching device-mapper.
pub fn build_table(
    name: &str,
    data_device: &Path,
    hash_device: &Path,
    root_digest: &str,
    options: TableOptions,
) -> Result<(Superblock, VerityTable)> {
    check_name(name)?;
    check_root_digest(root_digest).map_err(|source| VerityError::InvalidRootDigest {
        name: name.to_string(),
        source,
    })?;

    let superblock =
        Superblock::open(hash_device).map_err(|e| VerityError::from_superblock(hash_device, e))?;
    debug!("{}: {superblock:?}", hash_device.display());

    let table = VerityTable::new(&superblock, data_device, hash_device, root_digest, options)
        .map_err(|source| VerityError::InvalidTable {
            name: name.to_string(),
            source,
        })?;
    Ok((superblock, table))
}

/// Activates and removes verity devices through a [`DeviceMapper`].
#[derive(Debug)]
pub struct VerityManager<D: DeviceMapper = Control> {
    dm: D,
}

impl VerityManager<Control> {
    /// A manager for the kernel's device-mapper.  Requires `CAP_SYS_ADMIN`.
    pub fn open() -> Result<Self> {
        Control::open()
            .map(Self::new)
            .map_err(VerityError::Control)
    }
}

impl<D: DeviceMapper> VerityManager<D> {
    pub fn new(dm: D) -> Self {
        Self { dm }
    }

    pub fn device_mapper(&self) -> &D {
        &self.dm
    }

    /// Activates `data_device` as the read-only device `name`, verified against the hash tree on
    /// `hash_device` and the trusted `root_digest` (hex).
    ///
    /// Once this returns, the device exists with its table live.  On any error, no device has been
    /// created.
    pub fn activate(
        &self,
        name: &str,
        data_device: impl AsRef<Path>,
        hash_device: impl AsRef<Path>,
        root_digest: &str,
    ) -> Result<()> {
        self.activate_with_options(
            name,
            data_device,
            hash_device,
            root_digest,
            TableOptions::default(),
        )
    }

    pub fn activate_with_options(
        &self,
        name: &str,
        data_device: impl AsRef<Path>,
        hash_device: impl AsRef<Path>,
        root_digest: &str,
        options: TableOptions,
    ) -> Result<()> {
        let (superblock, table) = build_table(
            name,
            data_device.as_ref(),
            hash_device.as_ref(),
            root_digest,
            options,
        )?;
        self.load(name, &table, &superblock)
    }

    fn load(&self, name: &str, table: &VerityTable, superblock: &Superblock) -> Result<()> {
        let uuid = device_uuid(superblock, name);
        debug!("activating {name}: {table}");

        match self
            .dm
            .create_and_load(name, &uuid, true, &[table.to_target()])
        {
            Ok(()) => Ok(()),
            Err(DmError::AlreadyExists) => Err(VerityError::AlreadyActive {
                name: name.to_string(),
            }),
            Err(source) => Err(VerityError::ResourceCreate {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Removes the device `name`.
    ///
    /// Fails with [`VerityError::ResourceBusy`] while the device is open; nothing is forced.
    pub fn deactivate(&self, name: &str) -> Result<()> {
        check_name(name)?;
        debug!("deactivating {name}");

        self.dm.remove(name).map_err(|source| match source {
            DmError::NoSuchDevice => VerityError::NotFound {
                name: name.to_string(),
            },
            DmError::DeviceBusy => VerityError::ResourceBusy {
                name: name.to_string(),
            },
            source => VerityError::ResourceRemove {
                name: name.to_string(),
                source,
            },
        })
    }

    /// What device-mapper knows about the device `name`.
    pub fn status(&self, name: &str) -> Result<DeviceInfo> {
        check_name(name)?;

        self.dm.info(name).map_err(|source| match source {
            DmError::NoSuchDevice => VerityError::NotFound {
                name: name.to_string(),
            },
            source => VerityError::Query {
                name: name.to_string(),
                source,
            },
        })
    }
}

/// Activates a verity device through the kernel's device-mapper.
///
/// See [`VerityManager::activate`].
pub fn activate(
    name: &str,
    data_device: impl AsRef<Path>,
    hash_device: impl AsRef<Path>,
    root_digest: &str,
) -> Result<()> {
    VerityManager::open()?.activate(name, data_device, hash_device, root_digest)
}

/// Removes a verity device through the kernel's device-mapper.
pub fn deactivate(name: &str) -> Result<()> {
    VerityManager::open()?.deactivate(name)
}

#[cfg(test)]
mod tests {
    use std::fs::{write, OpenOptions};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        dm::fake::FakeDeviceMapper,
        superblock::SuperblockError,
        test::{random_name, VerityFixture, ROOT_DIGEST},
    };

    fn manager() -> VerityManager<FakeDeviceMapper> {
        VerityManager::new(FakeDeviceMapper::new())
    }

    #[test]
    fn test_activate_and_deactivate() {
        let fixture = VerityFixture::new(8);
        let vm = manager();
        let name = random_name();

        vm.activate(&name, &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap();

        let device = vm.device_mapper().device(&name).unwrap();
        assert!(device.read_only);
        assert_eq!(device.table.len(), 1);
        assert_eq!(device.table[0].length, 64);
        assert_eq!(
            device.table[0].params,
            format!(
                "1 {} {} 4096 4096 8 1 sha256 {ROOT_DIGEST} {}",
                fixture.data.display(),
                fixture.hash.display(),
                fixture.superblock.salt_hex()
            )
        );
        assert_eq!(
            device.uuid,
            format!(
                "CRYPT-VERITY-{}-{name}",
                hex::encode(fixture.superblock.uuid)
            )
        );

        let data = vm.device_mapper().read(&name).unwrap();
        assert!(data.starts_with(b"Hello verity!!!!"));
        assert_eq!(data, fixture.data_contents());

        let info = vm.status(&name).unwrap();
        assert!(info.read_only && info.live_table);
        assert_eq!(info.open_count, 0);

        vm.deactivate(&name).unwrap();
        assert!(vm.device_mapper().names().is_empty());
        assert!(matches!(
            vm.status(&name),
            Err(VerityError::NotFound { .. })
        ));
    }

    #[test]
    fn test_options_reach_the_table() {
        let fixture = VerityFixture::new(1);
        let vm = manager();
        let options = TableOptions {
            check_at_most_once: true,
            ..Default::default()
        };
        vm.activate_with_options("opts", &fixture.data, &fixture.hash, ROOT_DIGEST, options)
            .unwrap();
        let device = vm.device_mapper().device("opts").unwrap();
        assert!(device.table[0].params.ends_with(" 1 check_at_most_once"));
    }

    #[test]
    fn test_activate_twice() {
        let fixture = VerityFixture::new(8);
        let vm = manager();

        vm.activate("twice", &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap();
        let err = vm
            .activate("twice", &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap_err();
        assert!(matches!(err, VerityError::AlreadyActive { ref name } if name == "twice"));
        assert_eq!(vm.device_mapper().names(), vec!["twice".to_string()]);
    }

    #[test]
    fn test_concurrent_activate() {
        let fixture = VerityFixture::new(8);
        let vm = manager();

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| vm.activate("race", &fixture.data, &fixture.hash, ROOT_DIGEST))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, VerityError::AlreadyActive { .. })));
        assert_eq!(vm.device_mapper().names(), vec!["race".to_string()]);
    }

    #[test]
    fn test_deactivate_missing() {
        let vm = manager();
        let err = vm.deactivate("nothing-here").unwrap_err();
        assert!(matches!(err, VerityError::NotFound { ref name } if name == "nothing-here"));
        assert!(vm.device_mapper().names().is_empty());
    }

    #[test]
    fn test_deactivate_busy() {
        let fixture = VerityFixture::new(8);
        let vm = manager();

        vm.activate("busy", &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap();
        vm.device_mapper().set_open_count("busy", 1);
        assert!(matches!(
            vm.deactivate("busy"),
            Err(VerityError::ResourceBusy { .. })
        ));
        assert!(vm.device_mapper().device("busy").is_some());

        vm.device_mapper().set_open_count("busy", 0);
        vm.deactivate("busy").unwrap();
        assert!(matches!(
            vm.deactivate("busy"),
            Err(VerityError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rejected_table() {
        let fixture = VerityFixture::new(8);
        let vm = manager();
        vm.device_mapper().reject_tables(true);

        let err = vm
            .activate("rejected", &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap_err();
        assert!(matches!(err, VerityError::ResourceCreate { .. }));
        assert!(vm.device_mapper().names().is_empty());

        // the name is free again afterwards
        vm.device_mapper().reject_tables(false);
        vm.activate("rejected", &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap();
    }

    #[test]
    fn test_short_data_device() {
        let fixture = VerityFixture::new(8);
        OpenOptions::new()
            .write(true)
            .open(&fixture.data)
            .unwrap()
            .set_len(4096)
            .unwrap();

        let vm = manager();
        let err = vm
            .activate("short", &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap_err();
        assert!(matches!(err, VerityError::ResourceCreate { .. }));
        assert!(vm.device_mapper().names().is_empty());
    }

    #[test]
    fn test_bad_hash_device() {
        let fixture = VerityFixture::new(8);
        let vm = manager();

        let missing = fixture.dir().join("missing");
        assert!(matches!(
            vm.activate("bad", &fixture.data, &missing, ROOT_DIGEST),
            Err(VerityError::Io { ref path, .. }) if path == &missing
        ));

        // the data device has no superblock
        assert!(matches!(
            vm.activate("bad", &fixture.data, &fixture.data, ROOT_DIGEST),
            Err(VerityError::SignatureMismatch { .. })
        ));

        let truncated = fixture.dir().join("truncated");
        write(&truncated, &fixture.superblock.to_bytes()[..100]).unwrap();
        assert!(matches!(
            vm.activate("bad", &fixture.data, &truncated, ROOT_DIGEST),
            Err(VerityError::Format {
                source: SuperblockError::Truncated { found: 100 },
                ..
            })
        ));

        assert!(vm.device_mapper().names().is_empty());
    }

    #[test]
    fn test_invalid_table() {
        let mut superblock = VerityFixture::new(1).superblock;
        superblock.hash_block_size = 3000;
        let fixture = VerityFixture::with_superblock(superblock);

        let vm = manager();
        assert!(matches!(
            vm.activate("odd", &fixture.data, &fixture.hash, ROOT_DIGEST),
            Err(VerityError::InvalidTable { .. })
        ));
        assert!(vm.device_mapper().names().is_empty());
    }

    #[test]
    fn test_invalid_arguments() {
        let fixture = VerityFixture::new(1);
        let vm = manager();

        for name in ["", ".", "..", "a/b", "nul\0", "x".repeat(128).as_str()] {
            assert!(
                matches!(
                    vm.activate(name, &fixture.data, &fixture.hash, ROOT_DIGEST),
                    Err(VerityError::InvalidName { .. })
                ),
                "{name:?}"
            );
        }
        vm.activate(&"x".repeat(127), &fixture.data, &fixture.hash, ROOT_DIGEST)
            .unwrap();

        for digest in ["", "not hex", "abc"] {
            assert!(matches!(
                vm.activate("digest", &fixture.data, &fixture.hash, digest),
                Err(VerityError::InvalidRootDigest { .. })
            ));
        }

        assert!(matches!(
            vm.deactivate("a/b"),
            Err(VerityError::InvalidName { .. })
        ));
        assert_eq!(vm.device_mapper().names(), vec!["x".repeat(127)]);
    }

    #[test]
    fn test_device_uuid_is_truncated() {
        let superblock = VerityFixture::new(1).superblock;
        let uuid = device_uuid(&superblock, "short");
        assert_eq!(uuid.len(), UUID_PREFIX.len() + 32 + 1 + 5);

        let name = "é".repeat(60);
        let uuid = device_uuid(&superblock, &name);
        assert!(uuid.len() <= 128);
        assert!(uuid.starts_with(UUID_PREFIX));
        assert!(name.starts_with(&uuid[UUID_PREFIX.len() + 33..]));
    }
}
