//! Atomic file replacement.
//!
//! `SafeWriter` writes through a sibling temporary file and renames it onto
//! the target only after an fsync, so a crash never leaves a half-written
//! target behind.  The writer keeps a running SHA-1 of everything written;
//! `finalize` returns the digest and byte count so callers can content-name
//! the committed file or double-check what landed on disk.

use sha1::{Digest, Sha1};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Filesystem-layer failure classes.  `WriteFile` specifically covers the
/// out-of-space family (ENOSPC, EFBIG, EDQUOT, EIO) that callers may want to
/// degrade on rather than abort.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("read-only target: {0}")]
    ReadOnly(String),
    #[error("write failed: {0}")]
    WriteFile(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Map an `io::Error` into the gateway's failure classes.
pub fn classify_io_error(err: io::Error, path: &Path) -> WriteError {
    let detail = format!("{}: {err}", path.display());
    match err.kind() {
        io::ErrorKind::PermissionDenied => WriteError::AccessDenied(detail),
        io::ErrorKind::ReadOnlyFilesystem => WriteError::ReadOnly(detail),
        io::ErrorKind::StorageFull
        | io::ErrorKind::FileTooLarge
        | io::ErrorKind::QuotaExceeded => WriteError::WriteFile(detail),
        _ => WriteError::Io(err),
    }
}

// ---------------------------------------------------------------------------
// SafeWriter
// ---------------------------------------------------------------------------

/// Writes a single file atomically via a temporary sibling.
pub struct SafeWriter {
    tmp: PathBuf,
    file: Option<File>,
    hasher: Sha1,
    bytes: u64,
    committed: bool,
}

impl SafeWriter {
    /// Writer using `tmp` as the in-flight file.
    pub fn new(tmp: impl Into<PathBuf>) -> SafeWriter {
        SafeWriter {
            tmp: tmp.into(),
            file: None,
            hasher: Sha1::new(),
            bytes: 0,
            committed: false,
        }
    }

    /// Writer using `<target>.<suffix>` as the in-flight file.
    pub fn sibling(target: &Path, suffix: &str) -> SafeWriter {
        let mut name = target.as_os_str().to_os_string();
        name.push(".");
        name.push(suffix);
        SafeWriter::new(PathBuf::from(name))
    }

    /// Open the temporary file for writing.  A stale file of the same name
    /// is removed first; with `force` an already-open stream is discarded
    /// and restarted as well.
    pub fn stream(&mut self, force: bool) -> Result<(), WriteError> {
        if self.file.is_some() {
            if !force {
                return Ok(());
            }
            self.file = None;
        }

        match fs::remove_file(&self.tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(classify_io_error(e, &self.tmp)),
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.tmp)
            .map_err(|e| classify_io_error(e, &self.tmp))?;

        self.file = Some(file);
        self.hasher = Sha1::new();
        self.bytes = 0;
        self.committed = false;
        Ok(())
    }

    /// Append bytes to the in-flight file, updating the running digest.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), WriteError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| WriteError::WriteFile("stream not opened".into()))?;
        file.write_all(data)
            .map_err(|e| classify_io_error(e, &self.tmp))?;
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Flush and fsync the in-flight file; returns the lowercase hex SHA-1
    /// of the written content and the byte count.
    pub fn finalize(&mut self) -> Result<(String, u64), WriteError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| WriteError::WriteFile("stream not opened".into()))?;
        file.flush().map_err(|e| classify_io_error(e, &self.tmp))?;
        file.sync_all()
            .map_err(|e| classify_io_error(e, &self.tmp))?;

        let digest = self.hasher.clone().finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Ok((hex, self.bytes))
    }

    /// Rename the in-flight file onto `target`.  After this the temporary
    /// file no longer exists and the target is durable.
    pub fn commit_as(&mut self, target: &Path) -> Result<(), WriteError> {
        if self.file.is_none() {
            return Err(WriteError::WriteFile("stream not opened".into()));
        }
        self.file = None;
        fs::rename(&self.tmp, target).map_err(|e| classify_io_error(e, target))?;
        self.committed = true;
        Ok(())
    }

    /// Abort: close and delete the in-flight file.
    pub fn reset(&mut self) {
        self.file = None;
        let _ = fs::remove_file(&self.tmp);
        self.committed = false;
    }
}

impl Drop for SafeWriter {
    fn drop(&mut self) {
        if !self.committed && self.file.is_some() {
            self.reset();
        }
    }
}
