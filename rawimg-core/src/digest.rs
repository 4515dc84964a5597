//! Streaming integrity digests and their sidecar files.
//!
//! A backup digests the plaintext image bytes (before compression) in the
//! order they are written. On success the lowercase hex digest is stored in a
//! sidecar next to the image, e.g. `disk.img.gz.sha256`. Restores use the same
//! sidecar to verify what they wrote.

use crate::sink::temp_path;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Md5,
    None,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::None => "none",
        }
    }

    pub fn is_enabled(self) -> bool {
        self != DigestAlgorithm::None
    }

    /// Where the sidecar for `image` lives, or `None` when hashing is disabled.
    pub fn sidecar_path(self, image: &Path) -> Option<PathBuf> {
        if !self.is_enabled() {
            return None;
        }
        let mut name = OsString::from(image.as_os_str());
        name.push(".");
        name.push(self.name());
        Some(PathBuf::from(name))
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "md5" => Ok(DigestAlgorithm::Md5),
            "none" | "off" => Ok(DigestAlgorithm::None),
            other => Err(format!("unknown digest algorithm '{other}'")),
        }
    }
}

enum State {
    Sha256(Sha256),
    Md5(Md5),
    Disabled,
}

/// Incrementally hashes the bytes of one run.
pub struct DigestAccumulator {
    algorithm: DigestAlgorithm,
    state: State,
}

impl DigestAccumulator {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Sha256 => State::Sha256(Sha256::new()),
            DigestAlgorithm::Md5 => State::Md5(Md5::new()),
            DigestAlgorithm::None => State::Disabled,
        };
        Self { algorithm, state }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            State::Sha256(h) => h.update(bytes),
            State::Md5(h) => h.update(bytes),
            State::Disabled => {}
        }
    }

    /// Consumes the accumulator and returns the lowercase hex digest.
    pub fn finalize(self) -> Option<String> {
        match self.state {
            State::Sha256(h) => Some(hex::encode(h.finalize())),
            State::Md5(h) => Some(hex::encode(h.finalize())),
            State::Disabled => None,
        }
    }
}

/// Writes `hex` as the sidecar of `image`, returning the sidecar path.
pub fn write_sidecar(image: &Path, algorithm: DigestAlgorithm, hex: &str) -> io::Result<PathBuf> {
    let mut staged = StagedSidecar::stage(image, algorithm, hex)?;
    staged.publish()?;
    Ok(staged.path().to_path_buf())
}

/// A digest written to `<sidecar>.partial`, waiting to be renamed into place.
///
/// Dropping it before [`StagedSidecar::publish`] succeeds removes the staged
/// file, leaving any existing sidecar untouched.
#[derive(Debug)]
pub struct StagedSidecar {
    staged: PathBuf,
    path: PathBuf,
    published: bool,
}

impl StagedSidecar {
    /// Writes and syncs `hex` next to the sidecar path of `image`.
    pub fn stage(image: &Path, algorithm: DigestAlgorithm, hex: &str) -> io::Result<Self> {
        let path = algorithm.sidecar_path(image).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "hashing is disabled")
        })?;
        let staged = Self {
            staged: temp_path(&path),
            path,
            published: false,
        };
        let mut file = fs::File::create(&staged.staged)?;
        file.write_all(hex.to_ascii_lowercase().as_bytes())?;
        file.sync_all()?;
        Ok(staged)
    }

    /// The final sidecar path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renames the staged file over the sidecar path.
    pub fn publish(&mut self) -> io::Result<()> {
        fs::rename(&self.staged, &self.path)?;
        self.published = true;
        Ok(())
    }
}

impl Drop for StagedSidecar {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        match fs::remove_file(&self.staged) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.staged.display(),
                error = %e,
                "failed to remove staged digest"
            ),
        }
    }
}

/// Finds the sidecar of `image`, trying `preferred` first.
///
/// Returns the algorithm and the stored digest. A missing sidecar is not an
/// error.
pub fn read_sidecar(
    image: &Path,
    preferred: DigestAlgorithm,
) -> io::Result<Option<(DigestAlgorithm, String)>> {
    let mut candidates = vec![preferred];
    candidates.extend(
        [DigestAlgorithm::Sha256, DigestAlgorithm::Md5]
            .into_iter()
            .filter(|a| *a != preferred),
    );

    for algorithm in candidates {
        let Some(path) = algorithm.sidecar_path(image) else {
            continue;
        };
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let hex = contents.trim().to_ascii_lowercase();
                if hex.is_empty() {
                    continue;
                }
                return Ok(Some((algorithm, hex)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Removes every sidecar of `image`, ignoring ones that do not exist.
pub fn remove_sidecars(image: &Path) -> io::Result<()> {
    remove_other_sidecars(image, DigestAlgorithm::None)
}

/// Removes the sidecars of `image` not written with `keep`.
pub fn remove_other_sidecars(image: &Path, keep: DigestAlgorithm) -> io::Result<()> {
    for algorithm in [DigestAlgorithm::Sha256, DigestAlgorithm::Md5] {
        if algorithm == keep {
            continue;
        }
        if let Some(path) = algorithm.sidecar_path(image) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
