//! PID-file lock guaranteeing one live daemon per lock name.
//!
//! Records live at `{dir}/{name}.pid` and contain the owner's PID. A record
//! whose PID is no longer alive is stale and gets replaced.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Cross-process single-instance lock
pub trait InstanceLock: Send + Sync {
    /// Try to take the lock. `Ok(false)` if a live process holds it.
    fn acquire(&self, name: &str) -> Result<bool>;

    /// Drop the lock record; a missing record is fine
    fn release(&self, name: &str) -> Result<()>;

    /// Release everything this instance acquired
    fn cleanup(&self);
}

/// Whether `pid` refers to an existing process.
///
/// A permission-denied probe still means the process exists.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // 0 and negatives address process groups
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// [`InstanceLock`] backed by PID files in one directory
pub struct PidFileLock {
    dir: PathBuf,
    pid: u32,
    held: Mutex<HashSet<String>>,
}

impl PidFileLock {
    /// Lock owned by the current process
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_pid(dir, std::process::id())
    }

    /// Lock that records `pid` as its owner
    pub fn with_pid(dir: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            dir: dir.into(),
            pid,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Path of the record for `name`.
    ///
    /// Names are limited to ASCII alphanumerics, `-` and `_`.
    pub fn record_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            bail!("Lock name cannot be empty");
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "Invalid lock name: '{}'. Only alphanumeric, '-', and '_' characters are allowed.",
                name
            );
        }
        Ok(self.dir.join(format!("{}.pid", name)))
    }

    /// PID of the live process holding `name`, if any
    pub fn holder(&self, name: &str) -> Result<Option<u32>> {
        let path = self.record_path(name)?;
        Ok(read_pid(&path)?.filter(|pid| is_process_running(*pid)))
    }

    /// Create the record atomically with its content already in place.
    ///
    /// The PID is written to a private temp file which is then hard-linked
    /// to the record path; the link fails if the record exists.
    fn create_record(&self, path: &Path) -> std::io::Result<()> {
        let temp = path.with_extension(format!("pid.{}.tmp", self.pid));
        fs::write(&temp, format!("{}\n", self.pid))?;
        let linked = fs::hard_link(&temp, path);
        let _ = fs::remove_file(&temp);
        linked
    }

    /// Remove the record at `path` only if it still names `stale`.
    ///
    /// The record is moved aside before it is inspected, so a fresh record
    /// written by a concurrent starter is put back instead of deleted.
    /// Returns `false` in that case.
    fn discard_stale(&self, path: &Path, stale: Option<u32>) -> Result<bool> {
        let aside = path.with_extension(format!("pid.{}.stale", self.pid));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to move stale lock file: {:?}", path))
            }
        }

        if read_pid(&aside)? == stale {
            fs::remove_file(&aside)
                .with_context(|| format!("Failed to remove stale lock file: {:?}", aside))?;
            return Ok(true);
        }

        if let Err(err) = fs::hard_link(&aside, path) {
            if err.kind() != ErrorKind::AlreadyExists {
                warn!(error = %err, "Failed to restore instance lock record");
            }
        }
        let _ = fs::remove_file(&aside);
        Ok(false)
    }
}

impl InstanceLock for PidFileLock {
    fn acquire(&self, name: &str) -> Result<bool> {
        let path = self.record_path(name)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create lock directory: {:?}", self.dir))?;

        for attempt in 0..2 {
            match self.create_record(&path) {
                Ok(()) => {
                    self.held.lock().insert(name.to_string());
                    info!(lock = name, pid = self.pid, "Instance lock acquired");
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to create lock file: {:?}", path))
                }
            }

            match read_pid(&path)? {
                Some(pid) if pid == self.pid => {
                    self.held.lock().insert(name.to_string());
                    return Ok(true);
                }
                Some(pid) if is_process_running(pid) => {
                    info!(lock = name, holder = pid, "Instance lock held by a live process");
                    return Ok(false);
                }
                stale => {
                    if attempt > 0 {
                        break;
                    }
                    warn!(lock = name, holder = ?stale, "Removing stale instance lock");
                    if !self.discard_stale(&path, stale)? {
                        info!(lock = name, "Instance lock taken over by another starter");
                        return Ok(false);
                    }
                }
            }
        }

        // Someone else won the race after the stale record was removed
        Ok(false)
    }

    fn release(&self, name: &str) -> Result<()> {
        let path = self.record_path(name)?;
        self.held.lock().remove(name);

        match read_pid(&path)? {
            None if !path.exists() => {
                info!(lock = name, "Instance lock already released");
                Ok(())
            }
            Some(pid) if pid != self.pid => {
                warn!(lock = name, holder = pid, "Instance lock owned by another process; leaving it");
                Ok(())
            }
            _ => match fs::remove_file(&path) {
                Ok(()) => {
                    info!(lock = name, "Instance lock released");
                    Ok(())
                }
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("Failed to remove lock file: {:?}", path))
                }
            },
        }
    }

    fn cleanup(&self) {
        let names: Vec<String> = self.held.lock().drain().collect();
        for name in names {
            if let Err(err) = self.release(&name) {
                warn!(lock = %name, error = %err, "Failed to release instance lock");
            }
        }
    }
}

/// PID recorded at `path`; `None` when missing or unparseable
fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read lock file: {:?}", path)),
    }
}
