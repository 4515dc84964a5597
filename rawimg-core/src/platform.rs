//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! perform tasks that are not cross-platform, such as discovering removable
//! block devices and measuring them.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS (e.g., Linux, Windows). Each submodule exposes the same
//! public API, so that the rest of the library can use it without worrying
//! about the underlying platform.

use crate::device::Device;
use crate::io::{DeviceIo, SyncWrite};
use crate::os_options;
use std::io::{self, Read};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;

/// Opens devices directly through the filesystem.
///
/// Reads are plain sequential reads; writes use an exclusive open so a mounted
/// device is refused rather than silently overwritten.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDeviceIo;

impl DeviceIo for RawDeviceIo {
    fn open_read(&self, device: &Device) -> io::Result<Box<dyn Read + Send>> {
        let file = os_options::device_read().open(&device.path)?;
        Ok(Box::new(file))
    }

    fn open_write(&self, device: &Device) -> io::Result<Box<dyn SyncWrite>> {
        let file = os_options::device_write().open(&device.path)?;
        Ok(Box::new(file))
    }
}
