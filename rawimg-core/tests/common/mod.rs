#![allow(dead_code)]

use rawimg_core::io::{DeviceIo, SyncWrite};
use rawimg_core::{CancelToken, Device, Event, Outcome, ProgressSample};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const MIB: usize = 1024 * 1024;

/// Deterministic, non-repeating bytes so misordered chunks are detectable.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Bytes that compress to roughly an eighth of their size.
pub fn sparse(len: usize, seed: u64) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let random = noise(len / 8 + 1, seed);
    for (block, fill) in out.chunks_mut(4096).zip(random.chunks(512)) {
        block[..fill.len()].copy_from_slice(fill);
    }
    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// How reads of an in-memory device misbehave.
#[derive(Clone, Copy)]
pub enum ReadFault {
    /// Fail with this error once `after` bytes have been read.
    Error { after: u64, kind: FaultKind },
    /// Report end of data after `after` bytes.
    Truncate { after: u64 },
}

#[derive(Clone, Copy)]
pub enum FaultKind {
    BadSector,
    Unplugged,
}

impl FaultKind {
    fn error(self) -> io::Error {
        match self {
            FaultKind::BadSector => io::Error::new(io::ErrorKind::Other, "bad sector"),
            FaultKind::Unplugged => io::Error::from(io::ErrorKind::NotFound),
        }
    }
}

type ImageHook = Box<dyn Fn(File) -> Box<dyn SyncWrite> + Send + Sync>;

/// Devices backed by byte vectors; images still go to real files so the
/// rename-on-commit path is exercised.
#[derive(Default)]
pub struct MemoryIo {
    devices: Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>,
    fault: Mutex<Option<ReadFault>>,
    image_hook: Mutex<Option<ImageHook>>,
    write_cancel: Mutex<Option<(u64, CancelToken)>>,
    /// Total bytes handed out by device readers.
    pub bytes_read: Arc<AtomicU64>,
}

impl MemoryIo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_device(&self, name: &str, data: Vec<u8>) -> Device {
        let path = PathBuf::from("/mem").join(name);
        let device = Device::new(&path, name, data.len() as u64);
        self.devices
            .lock()
            .unwrap()
            .insert(path, Arc::new(Mutex::new(data)));
        device
    }

    pub fn contents(&self, device: &Device) -> Vec<u8> {
        self.slot(&device.path).unwrap().lock().unwrap().clone()
    }

    pub fn set_fault(&self, fault: ReadFault) {
        *self.fault.lock().unwrap() = Some(fault);
    }

    /// Cancels `token` once a device writer has written `after` bytes.
    pub fn cancel_writes_after(&self, after: u64, token: CancelToken) {
        *self.write_cancel.lock().unwrap() = Some((after, token));
    }

    /// Wraps every image file a backup creates.
    pub fn wrap_images(&self, hook: impl Fn(File) -> Box<dyn SyncWrite> + Send + Sync + 'static) {
        *self.image_hook.lock().unwrap() = Some(Box::new(hook));
    }

    fn slot(&self, path: &Path) -> io::Result<Arc<Mutex<Vec<u8>>>> {
        self.devices
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

impl DeviceIo for MemoryIo {
    fn open_read(&self, device: &Device) -> io::Result<Box<dyn Read + Send>> {
        let data = self.slot(&device.path)?.lock().unwrap().clone();
        Ok(Box::new(MemoryReader {
            data: Cursor::new(data),
            fault: *self.fault.lock().unwrap(),
            counter: Arc::clone(&self.bytes_read),
        }))
    }

    fn open_write(&self, device: &Device) -> io::Result<Box<dyn SyncWrite>> {
        Ok(Box::new(MemoryWriter {
            data: self.slot(&device.path)?,
            pos: 0,
            cancel: self.write_cancel.lock().unwrap().clone(),
        }))
    }

    fn create_image(&self, path: &Path) -> io::Result<Box<dyn SyncWrite>> {
        let file = File::create(path)?;
        match self.image_hook.lock().unwrap().as_ref() {
            Some(hook) => Ok(hook(file)),
            None => Ok(Box::new(file)),
        }
    }
}

struct MemoryReader {
    data: Cursor<Vec<u8>>,
    fault: Option<ReadFault>,
    counter: Arc<AtomicU64>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.data.position();
        let mut limit = buf.len();
        match self.fault {
            Some(ReadFault::Error { after, kind }) => {
                if pos >= after {
                    return Err(kind.error());
                }
                limit = limit.min((after - pos) as usize);
            }
            Some(ReadFault::Truncate { after }) => {
                limit = limit.min(after.saturating_sub(pos) as usize);
            }
            None => {}
        }
        let n = self.data.read(&mut buf[..limit])?;
        self.counter.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }
}

/// Writes in place, like a block device: never grows, never truncates.
struct MemoryWriter {
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
    cancel: Option<(u64, CancelToken)>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap();
        if self.pos + buf.len() > data.len() {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "past end of device"));
        }
        data[self.pos..self.pos + buf.len()].copy_from_slice(buf);
        self.pos += buf.len();
        if let Some((after, token)) = &self.cancel {
            if self.pos as u64 >= *after {
                token.cancel();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SyncWrite for MemoryWriter {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An image file on a volume with `left` bytes of free space.
pub struct QuotaWriter {
    pub inner: File,
    pub left: u64,
}

impl Write for QuotaWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.left == 0 {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        let n = buf.len().min(self.left as usize);
        let n = self.inner.write(&buf[..n])?;
        self.left -= n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl SyncWrite for QuotaWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync_all()
    }
}

/// Cancels `token` once `after` bytes have been written.
pub struct CancellingWriter {
    pub inner: File,
    pub written: u64,
    pub after: u64,
    pub token: CancelToken,
}

impl Write for CancellingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        if self.written >= self.after {
            self.token.cancel();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl SyncWrite for CancellingWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync_all()
    }
}

/// A slow image writer that records how far the device reader ran ahead.
pub struct LaggingWriter {
    pub inner: File,
    pub delay: Duration,
    pub written: u64,
    pub read: Arc<AtomicU64>,
    pub max_lead: Arc<AtomicU64>,
}

impl Write for LaggingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        thread::sleep(self.delay);
        let lead = self.read.load(Ordering::SeqCst).saturating_sub(self.written);
        self.max_lead.fetch_max(lead, Ordering::SeqCst);
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl SyncWrite for LaggingWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync_all()
    }
}

/// Drains a run's events, returning its progress samples and its outcome.
pub fn collect(events: &crossbeam_channel::Receiver<Event>) -> (Vec<ProgressSample>, Outcome) {
    let mut samples = Vec::new();
    for event in events {
        match event {
            Event::Progress(sample) => samples.push(sample),
            Event::Finished(outcome) => return (samples, outcome),
        }
    }
    panic!("event stream closed without an outcome");
}
