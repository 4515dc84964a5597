//! Open options for raw device handles.
use std::fs::OpenOptions;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Options for opening a device for writing.
///
/// On Linux, `O_EXCL` on a block device (without `O_CREAT`) makes the open
/// fail with `EBUSY` while any partition is mounted, so a restore cannot
/// overwrite a filesystem that is in use.
pub(crate) fn device_write() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(unix)]
    options.custom_flags(libc::O_EXCL);
    options
}

pub(crate) fn device_read() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true);
    options
}
