//! Rename-on-success commit for image files.
//!
//! A backup never writes to its destination directly. It writes to a sibling
//! `<destination>.partial` file, and only a fully synced temp file is renamed
//! over the destination. Until [`AtomicSink::commit`] succeeds, dropping the
//! sink removes the temp file, whichever way the run ends.

use crate::io::SyncWrite;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug)]
pub struct AtomicSink {
    destination: PathBuf,
    temp: PathBuf,
    committed: bool,
}

impl AtomicSink {
    /// Reserves the temp path for `destination`, removing a stale one left by
    /// an earlier aborted run.
    pub fn prepare(destination: &Path) -> io::Result<Self> {
        let temp = temp_path(destination);
        match fs::remove_file(&temp) {
            Ok(()) => tracing::debug!(path = %temp.display(), "removed stale partial image"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            destination: destination.to_path_buf(),
            temp,
            committed: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Flushes and syncs `writer`, then atomically renames the temp file over
    /// the destination.
    ///
    /// `writer` must be the handle the temp file was written through; it is
    /// closed before the rename.
    pub fn commit(mut self, mut writer: Box<dyn SyncWrite>) -> io::Result<()> {
        writer.flush()?;
        writer.sync()?;
        drop(writer);

        fs::rename(&self.temp, &self.destination)?;
        self.committed = true;
        tracing::debug!(path = %self.destination.display(), "committed image");
        Ok(())
    }
}

impl Drop for AtomicSink {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.temp) {
            Ok(()) => tracing::debug!(path = %self.temp.display(), "discarded partial image"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.temp.display(),
                error = %e,
                "failed to remove partial image"
            ),
        }
    }
}

/// `<destination>.partial`, in the destination's directory so the final
/// rename never crosses filesystems.
pub fn temp_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
