//! Handle acquisition capabilities injected into the pipeline.
//!
//! The pipeline never opens a device itself; it asks a [`DeviceIo`]. The
//! production implementation is [`crate::platform::RawDeviceIo`]; tests plug in
//! in-memory devices or writers that fail on purpose.

use crate::device::Device;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// A writer whose contents can be made durable.
pub trait SyncWrite: Write + Send {
    /// Flushes OS buffers to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl SyncWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

pub trait DeviceIo: Send + Sync {
    fn open_read(&self, device: &Device) -> io::Result<Box<dyn Read + Send>>;

    fn open_write(&self, device: &Device) -> io::Result<Box<dyn SyncWrite>>;

    /// Creates (truncating) the temporary image file a backup writes into.
    fn create_image(&self, path: &Path) -> io::Result<Box<dyn SyncWrite>> {
        Ok(Box::new(File::create(path)?))
    }
}

/// Reads until `buf` is full or the source is exhausted.
///
/// Device reads may legitimately return short counts; only a zero-length read
/// marks the end.
pub(crate) fn read_full<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
