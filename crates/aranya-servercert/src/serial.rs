//! The signer's persisted serial-number counter.
//!
//! The counter file holds the last serial handed out, as uppercase hex padded
//! to an even number of digits followed by a newline (the format OpenSSL uses
//! for `ca.serial`). A missing file means no serial has been issued yet.
//!
//! Every read-increment-write happens while holding an exclusive advisory
//! lock on a sibling `<counter>.lock` file, so concurrent processes issuing
//! from the same signer never hand out the same serial. The counter file
//! itself is replaced atomically, which is why the lock lives elsewhere.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs4::fs_std::FileExt;
use tracing::debug;

use crate::{error::ServerCertError, persist};

#[cfg(unix)]
const COUNTER_MODE: u32 = 0o640;

/// A serial-number counter persisted at a fixed path.
#[derive(Clone, Debug)]
pub struct SerialCounter {
    path: PathBuf,
}

impl SerialCounter {
    /// Creates a handle to the counter stored at `path`.
    ///
    /// Nothing is read until the counter is used.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the counter file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last serial handed out, or 0 if none has been.
    ///
    /// This does not take the lock and is only meant for diagnostics.
    pub fn read(&self) -> Result<u64, ServerCertError> {
        read_counter(&self.path)
    }

    /// Takes the exclusive lock and reads the current value.
    ///
    /// The lock is held until the returned [`SerialLease`] is dropped.
    pub fn lock(&self) -> Result<SerialLease, ServerCertError> {
        let lock_path = self.lock_path();
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| ServerCertError::invalid_signer(&lock_path, e))?;
        lock.lock_exclusive()
            .map_err(|e| ServerCertError::invalid_signer(&lock_path, e))?;

        let current = read_counter(&self.path)?;
        debug!(path = %self.path.display(), current, "locked serial counter");

        Ok(SerialLease {
            path: self.path.clone(),
            current,
            _lock: lock,
        })
    }

    /// Writes an initial value of 0 unless the counter already exists.
    pub fn initialize(&self) -> Result<(), ServerCertError> {
        let mut lease = self.lock()?;
        if self.path.exists() {
            return Ok(());
        }
        lease.write(0)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }
}

/// Exclusive access to a [`SerialCounter`].
///
/// Reserving a serial does not persist it; [`SerialLease::commit`] does. A
/// lease dropped without committing leaves the counter untouched.
#[derive(Debug)]
pub struct SerialLease {
    path: PathBuf,
    current: u64,
    _lock: File,
}

impl SerialLease {
    /// The last serial handed out.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Returns the next serial without persisting it.
    ///
    /// # Errors
    ///
    /// [`ServerCertError::SerialExhausted`] once the counter reaches `u64::MAX`.
    pub fn reserve(&self) -> Result<u64, ServerCertError> {
        self.current
            .checked_add(1)
            .ok_or_else(|| ServerCertError::serial_exhausted(&self.path))
    }

    /// Persists `serial` as the last serial handed out.
    ///
    /// `serial` must be the value returned by [`SerialLease::reserve`].
    pub fn commit(&mut self, serial: u64) -> Result<(), ServerCertError> {
        if serial <= self.current {
            return Err(ServerCertError::invalid_signer(
                &self.path,
                format!("serial {serial} does not advance counter past {}", self.current),
            ));
        }
        self.write(serial)
    }

    fn write(&mut self, value: u64) -> Result<(), ServerCertError> {
        let text = encode(value);
        let dir = persist::parent_dir(&self.path);
        let write_failed = |e: io::Error| ServerCertError::write_failed(&self.path, e);

        let mut tmp = persist::temp_file_in(dir).map_err(write_failed)?;
        tmp.write_all(text.as_bytes()).map_err(write_failed)?;
        tmp.as_file().sync_all().map_err(write_failed)?;
        #[cfg(unix)]
        persist::set_mode(tmp.path(), COUNTER_MODE).map_err(write_failed)?;
        tmp.persist(&self.path).map_err(|e| write_failed(e.error))?;

        debug!(path = %self.path.display(), value, "advanced serial counter");
        self.current = value;
        Ok(())
    }
}

fn read_counter(path: &Path) -> Result<u64, ServerCertError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ServerCertError::invalid_signer(path, e)),
    };
    decode(&text).map_err(|reason| ServerCertError::invalid_signer(path, reason))
}

fn encode(value: u64) -> String {
    let mut text = format!("{value:X}");
    if text.len() % 2 == 1 {
        text.insert(0, '0');
    }
    text.push('\n');
    text
}

fn decode(text: &str) -> Result<u64, String> {
    let digits = text.trim();
    if digits.is_empty() {
        return Err("serial counter is empty".to_string());
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| format!("serial counter is not a 64-bit hex number: {e}"))
}
