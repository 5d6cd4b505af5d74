// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Directory-scoped process lock.
//!
//! The lock is a `.lock` file holding the owner's PID. Acquisition never
//! blocks: a lock held by a live process fails with
//! [`CacheError::Locked`](crate::CacheError::Locked), a lock whose PID is gone
//! is reclaimed.
//!
//! The file is published by hard-linking a fully written staging file, so a
//! reader never sees a lock without its PID. Content that still fails to
//! parse (written by something else) is only reclaimed once it is older than
//! a grace period.

use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use snafu::ResultExt;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{info, warn};

use crate::{
    Result,
    error::{IoSnafu, LockedSnafu},
    segment::file_options,
};

/// Probes whether a process id belongs to a running process.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// [`ProcessProbe`] backed by the OS process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl ProcessProbe for SysinfoProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == std::process::id() {
            return true;
        }
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system.process(pid).is_some()
    }
}

/// An acquired lock on a cache directory. Released explicitly or on drop.
pub struct ProcessLock {
    path:     PathBuf,
    pid:      u32,
    released: bool,
}

impl std::fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLock")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ProcessLock {
    /// Acquires `lock_path` for the current process.
    pub fn acquire(lock_path: &Path, file_mode: u32) -> Result<Self> {
        Self::acquire_with(lock_path, file_mode, std::process::id(), &SysinfoProbe)
    }

    /// Acquires `lock_path` for `pid`, judging existing owners with `probe`.
    pub fn acquire_with(
        lock_path: &Path,
        file_mode: u32,
        pid: u32,
        probe: &dyn ProcessProbe,
    ) -> Result<Self> {
        // One reclaim attempt: if another process wins the race to recreate
        // the file, the second create fails and we report it as locked.
        for attempt in 0..2 {
            match try_create(lock_path, file_mode, pid) {
                Ok(()) => {
                    info!(path = ?lock_path, pid, "Acquired cache lock");
                    return Ok(Self {
                        path: lock_path.to_path_buf(),
                        pid,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).context(IoSnafu { path: lock_path }),
            }

            let Some(owner) = read_owner(lock_path)? else {
                continue;
            };
            let stale = match owner {
                Owner::Pid(owner) => !probe.is_alive(owner),
                Owner::Unknown { age } => age >= UNKNOWN_OWNER_GRACE,
            };
            if !stale || attempt > 0 {
                return LockedSnafu {
                    path: lock_path,
                    pid:  owner.pid(),
                }
                .fail();
            }

            warn!(path = ?lock_path, owner = ?owner, "Reclaiming stale cache lock");
            match fs::remove_file(lock_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(IoSnafu { path: lock_path }),
            }
        }

        LockedSnafu {
            path: lock_path,
            pid:  0u32,
        }
        .fail()
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Removes the lock file if it still names this owner.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match read_owner(&self.path)? {
            Some(Owner::Pid(owner)) if owner == self.pid => {
                fs::remove_file(&self.path).context(IoSnafu { path: &self.path })?;
                info!(path = ?self.path, pid = self.pid, "Released cache lock");
            }
            Some(owner) => {
                warn!(path = ?self.path, pid = self.pid, owner = ?owner, "Cache lock taken over, leaving it");
            }
            None => {}
        }
        Ok(())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = ?e, path = ?self.path, "Failed to release cache lock");
        }
    }
}

/// Unreadable lock content younger than this is not reclaimed.
const UNKNOWN_OWNER_GRACE: Duration = Duration::from_secs(30);

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Owner recorded in a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Pid(u32),
    /// Empty or unparsable content, with the file's age.
    Unknown { age: Duration },
}

impl Owner {
    const fn pid(self) -> u32 {
        match self {
            Self::Pid(pid) => pid,
            Self::Unknown { .. } => 0,
        }
    }
}

/// Publishes the lock with its PID already inside: the PID goes into a
/// private staging file which is then hard-linked to `path`. The link fails
/// with `AlreadyExists` when another owner holds the lock.
fn try_create(path: &Path, file_mode: u32, pid: u32) -> io::Result<()> {
    let staging = staging_path(path, pid);
    let linked =
        write_staging(&staging, file_mode, pid).and_then(|()| fs::hard_link(&staging, path));

    if let Err(e) = fs::remove_file(&staging)
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = ?staging, error = ?e, "Failed to remove lock staging file");
    }
    linked
}

fn staging_path(path: &Path, pid: u32) -> PathBuf {
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{pid}.{seq}.tmp"));
    PathBuf::from(name)
}

fn write_staging(staging: &Path, file_mode: u32, pid: u32) -> io::Result<()> {
    let mut file = file_options(file_mode)
        .write(true)
        .create(true)
        .truncate(true)
        .open(staging)?;
    file.write_all(pid.to_string().as_bytes())?;
    file.sync_all()
}

/// Reads the recorded owner. A missing file is `None`.
fn read_owner(path: &Path) -> Result<Option<Owner>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(IoSnafu { path }),
    };
    if let Ok(pid) = content.trim().parse() {
        return Ok(Some(Owner::Pid(pid)));
    }

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(IoSnafu { path }),
    };
    // A timestamp in the future reads as brand new.
    let age = modified.elapsed().unwrap_or_default();
    Ok(Some(Owner::Unknown { age }))
}

/// Liveness check shared with [`CacheBuilder`](crate::CacheBuilder).
pub type SharedProbe = Arc<dyn ProcessProbe>;
