//! Command-line control utility for dm-verity devices.
//!
//! `verityctl` activates and removes verity devices through device-mapper,
//! reports on active devices, and inspects hash devices.  `dump` and `table`
//! only read files and need no privileges.

use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dmverity::{
    device_path,
    dm::{Control, DeviceMapper},
    session::build_table,
    wait_for_device, CorruptionMode, Superblock, TableOptions, VerityManager,
};

/// verityctl
#[derive(Debug, Parser)]
#[clap(name = "verityctl", version)]
pub struct App {
    #[clap(subcommand)]
    cmd: Command,
}

/// Optional parameters of the verity target
#[derive(Debug, Parser)]
struct TableArgs {
    /// Log corrupted blocks but return their data anyway
    #[clap(long, group = "corruption")]
    ignore_corruption: bool,
    /// Reboot when a corrupted block is read
    #[clap(long, group = "corruption")]
    restart_on_corruption: bool,
    /// Panic when a corrupted block is read
    #[clap(long, group = "corruption")]
    panic_on_corruption: bool,
    /// Return zeroes for blocks expected to be zero without reading them
    #[clap(long)]
    ignore_zero_blocks: bool,
    /// Verify every data block only the first time it is read
    #[clap(long)]
    check_at_most_once: bool,
}

impl TableArgs {
    fn options(&self) -> TableOptions {
        let corruption = if self.ignore_corruption {
            CorruptionMode::Ignore
        } else if self.restart_on_corruption {
            CorruptionMode::Restart
        } else if self.panic_on_corruption {
            CorruptionMode::Panic
        } else {
            CorruptionMode::IoError
        };
        TableOptions {
            corruption,
            ignore_zero_blocks: self.ignore_zero_blocks,
            check_at_most_once: self.check_at_most_once,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Activates a verity device at /dev/mapper/NAME
    Open {
        name: String,
        data_device: PathBuf,
        hash_device: PathBuf,
        /// the trusted root digest of the hash tree, in hex
        root_digest: String,
        /// wait up to this many seconds for the device node to appear
        #[clap(long, value_name = "SECS")]
        wait: Option<u64>,
        #[clap(flatten)]
        table: TableArgs,
    },
    /// Removes a verity device
    Close { name: String },
    /// Shows what device-mapper knows about a device
    Status { name: String },
    /// Prints the superblock of a hash device
    Dump { hash_device: PathBuf },
    /// Prints the table `open` would load, without loading it
    Table {
        name: String,
        data_device: PathBuf,
        hash_device: PathBuf,
        root_digest: String,
        #[clap(flatten)]
        table: TableArgs,
    },
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn dump(out: &mut impl Write, path: &Path) -> Result<()> {
    let sb = Superblock::open(path)
        .with_context(|| format!("Reading superblock from {}", path.display()))?;
    let salt = if sb.salt.is_empty() {
        "-".to_string()
    } else {
        sb.salt_hex()
    };

    writeln!(out, "VERITY header information for {}", path.display())?;
    writeln!(out, "UUID:            \t{}", sb.uuid_string())?;
    writeln!(out, "Version:         \t{}", sb.version)?;
    writeln!(out, "Hash type:       \t{}", sb.hash_type)?;
    writeln!(out, "Data blocks:     \t{}", sb.data_blocks)?;
    writeln!(out, "Data block size: \t{}", sb.data_block_size)?;
    writeln!(out, "Hash block size: \t{}", sb.hash_block_size)?;
    writeln!(out, "Hash algorithm:  \t{}", sb.algorithm)?;
    writeln!(out, "Salt:            \t{salt}")?;
    Ok(())
}

fn run<D: DeviceMapper>(
    cmd: Command,
    open: impl FnOnce() -> dmverity::error::Result<VerityManager<D>>,
    out: &mut impl Write,
) -> Result<()> {
    match cmd {
        Command::Open {
            name,
            data_device,
            hash_device,
            root_digest,
            wait,
            table,
        } => {
            open()?.activate_with_options(
                &name,
                &data_device,
                &hash_device,
                &root_digest,
                table.options(),
            )?;
            let path = device_path(&name);
            if let Some(secs) = wait {
                wait_for_device(&path, Duration::from_secs(secs)).with_context(|| {
                    format!("{name} is active, but {} did not appear", path.display())
                })?;
            }
            writeln!(out, "{}", path.display())?;
        }
        Command::Close { name } => {
            open()?.deactivate(&name)?;
        }
        Command::Status { name } => {
            let info = open()?.status(&name)?;
            writeln!(out, "{name} is active")?;
            writeln!(
                out,
                "  device:     {} ({}:{})",
                device_path(&name).display(),
                info.major,
                info.minor
            )?;
            writeln!(out, "  read-only:  {}", yes_no(info.read_only))?;
            writeln!(out, "  suspended:  {}", yes_no(info.suspended))?;
            writeln!(out, "  live table: {}", yes_no(info.live_table))?;
            writeln!(out, "  open count: {}", info.open_count)?;
        }
        Command::Dump { hash_device } => {
            dump(out, &hash_device)?;
        }
        Command::Table {
            name,
            data_device,
            hash_device,
            root_digest,
            table,
        } => {
            let (_, table) = build_table(
                &name,
                &data_device,
                &hash_device,
                &root_digest,
                table.options(),
            )?;
            writeln!(out, "{table}")?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    run(
        args.cmd,
        VerityManager::<Control>::open,
        &mut std::io::stdout().lock(),
    )
}
