use std::{
    io::{Error, ErrorKind, Read, Result},
    path::{Path, PathBuf},
    thread::sleep,
    time::{Duration, Instant},
};

use rustix::{
    fs::{stat, FileType},
    io::Errno,
};

/// Reads into `buf` until it is full or the reader reports EOF, retrying on EINTR.
///
/// Unlike `Read::read_exact()` this reports how many bytes were actually read, so that a short
/// device can be told apart from a failing one.
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// The node udev creates for a mapped device named `name`.
pub fn device_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{name}"))
}

/// Polls until `path` exists and is a block device.
///
/// Device nodes for newly activated mappings are created asynchronously by udev, so callers that
/// want to open the device right after activation need to wait for it.  Returns
/// `ErrorKind::TimedOut` if the node doesn't show up within `timeout`.  A timeout too large to
/// represent waits forever.
pub fn wait_for_device(path: impl AsRef<Path>, timeout: Duration) -> Result<()> {
    let path = path.as_ref();
    let limit = Instant::now().checked_add(timeout);
    loop {
        match stat(path) {
            Ok(st) if FileType::from_raw_mode(st.st_mode) == FileType::BlockDevice => {
                return Ok(())
            }
            Ok(_) => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("{} is not a block device", path.display()),
                ))
            }
            Err(Errno::NOENT) => {}
            Err(e) => return Err(e.into()),
        }
        if limit.is_some_and(|limit| Instant::now() >= limit) {
            return Err(Error::new(
                ErrorKind::TimedOut,
                format!("timeout waiting for {}", path.display()),
            ));
        }
        sleep(Duration::from_millis(5));
    }
}
