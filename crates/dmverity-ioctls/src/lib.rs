//! Low-level ioctl wrappers for dmverity.
//!
//! This crate provides safe Rust wrappers around the Linux ioctls used to
//! activate verity mappings:
//!
//! - **device-mapper ioctls**: create, load, resume, query and remove mapped
//!   devices through `/dev/mapper/control`
//! - **Loop device ioctls**: attach a backing file to a loop device (behind the
//!   `loop-device` feature)
//!
//! # Safety
//!
//! All unsafe ioctl code is contained within this crate, allowing dependent
//! crates to use `#![forbid(unsafe_code)]`.
//!
//! # Example
//!
//! ```ignore
//! use dmverity_ioctls::dm::{self, Target};
//!
//! let control = dm::open_control()?;
//! dm::dev_create(&control, "root", Some("CRYPT-VERITY-...-root"))?;
//! dm::table_load(&control, "root", dm::flags::DM_READONLY_FLAG, &[target])?;
//! dm::dev_resume(&control, "root")?;
//! ```

#![deny(unsafe_code)]

pub mod dm;

#[cfg(feature = "loop-device")]
pub mod loop_device;
