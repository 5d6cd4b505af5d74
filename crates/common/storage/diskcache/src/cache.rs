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

//! Main cache struct and lifecycle management.
//!
//! The [`DiskCache`] owns one storage directory. It manages:
//! - Recovery of the segment set and read position on open
//! - The process lock for the directory
//! - Clean teardown on [`close`](DiskCache::close)
//!
//! ## Locking
//!
//! Three mutexes, always taken in this order when nested:
//!
//! ```text
//! reader ──► writer ──► segments
//! ```
//!
//! `writer` serializes producers, `reader` serializes consumers, and
//! `segments` (the structural lock) guards the closed-segment backlog that
//! rotation, eviction and segment switches mutate. Put and Get only meet on
//! `segments`, and only briefly.
//!
//! ## Usage
//!
//! ```ignore
//! let cache = CacheBuilder::new("/path/to/cache").batch_size(4 << 20).open()?;
//!
//! cache.put(b"hello")?;
//!
//! match cache.get(|data| forward(data)) {
//!     Ok(()) => {}
//!     Err(e) if e.is_eof() => { /* nothing buffered */ }
//!     Err(e) => return Err(e),
//! }
//!
//! cache.close()?;
//! ```

use std::{
    fs::{self, File},
    io::{BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{info, warn};

use crate::{
    CacheConfig, Result,
    error::{ClosedSnafu, IoSnafu},
    lock::{ProcessLock, SharedProbe, SysinfoProbe},
    position::{Position, PositionFile},
    recovery::recover_active,
    segment::{self, ACTIVE_SEGMENT, LOCK_FILE, POSITION_FILE, SegmentStore},
    stats::{Counters, Stats},
};

/// Write-side state, guarded by the write lock.
#[derive(Debug)]
pub(crate) struct WriteState {
    /// Handle on the active segment. `None` once closed, or after a rotation
    /// that could not reopen it.
    pub file:     Option<File>,
    /// Bytes in the active segment.
    pub len:      u64,
    /// Time of the last successful put. `None` for data left by a previous
    /// process, which counts as idle.
    pub last_put: Option<Instant>,
}

/// A closed segment being consumed.
#[derive(Debug)]
pub(crate) struct ReadSegment {
    pub name:   String,
    pub reader: BufReader<File>,
    /// Offset of the next frame.
    pub offset: u64,
}

impl ReadSegment {
    pub fn new(name: String, file: File, offset: u64) -> Self {
        Self {
            name,
            reader: BufReader::new(file),
            offset,
        }
    }
}

/// Read-side state, guarded by the read lock.
#[derive(Debug, Default)]
pub(crate) struct ReadState {
    pub segment: Option<ReadSegment>,
}

/// A durable FIFO byte-record queue bound to one directory.
///
/// All methods take `&self`; share it across threads behind an `Arc`.
pub struct DiskCache {
    pub(crate) config:   CacheConfig,
    pub(crate) writer:   Mutex<WriteState>,
    pub(crate) reader:   Mutex<ReadState>,
    pub(crate) segments: Mutex<SegmentStore>,
    /// Bytes on disk across the active and closed segments.
    pub(crate) size:     Arc<AtomicU64>,
    pub(crate) counters: Counters,
    /// `None` when position tracking is disabled.
    pub(crate) position: Option<PositionFile>,
    lock:                Mutex<Option<ProcessLock>>,
    closed:              AtomicBool,
}

impl DiskCache {
    /// Opens (or creates) the cache described by `config`.
    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::open_with_probe(config, Arc::new(SysinfoProbe))
    }

    /// Opens the cache, judging stale locks with `probe`.
    pub fn open_with_probe(config: CacheConfig, probe: SharedProbe) -> Result<Self> {
        let config = config.normalized();
        let dir = config.path.clone();

        segment::create_dir(&dir, config.dir_mode)?;

        let lock = if config.no_lock {
            None
        } else {
            Some(ProcessLock::acquire_with(
                &dir.join(LOCK_FILE),
                config.file_mode,
                std::process::id(),
                probe.as_ref(),
            )?)
        };

        let size = Arc::new(AtomicU64::new(0));
        let mut segments = SegmentStore::scan(&dir, config.file_mode, size.clone())?;

        let active_path = dir.join(ACTIVE_SEGMENT);
        let active = recover_active(&active_path)?;
        size.fetch_add(active.len, Ordering::AcqRel);

        let active_len = if active.sealed {
            let name = segments.next_segment_name();
            let target = segments.path_of(&name);
            fs::rename(&active_path, &target).context(IoSnafu { path: &target })?;
            info!(segment = %name, "Completed interrupted rotation");
            segments.push_closed(name);
            0
        } else {
            active.len
        };
        let file = segments.open_for_append(ACTIVE_SEGMENT)?;

        let position = (!config.no_pos).then(|| {
            PositionFile::new(&dir.join(POSITION_FILE), config.file_mode, config.no_sync)
        });
        let read_segment = match &position {
            Some(position) => restore_position(position, &mut segments)?,
            None => None,
        };

        info!(
            path = ?dir,
            size = size.load(Ordering::Acquire),
            active_len,
            closed_segments = segments.len(),
            resume = ?read_segment.as_ref().map(|s| (&s.name, s.offset)),
            "Disk cache opened"
        );

        Ok(Self {
            config,
            writer: Mutex::new(WriteState {
                file:     Some(file),
                len:      active_len,
                last_put: None,
            }),
            reader: Mutex::new(ReadState {
                segment: read_segment,
            }),
            segments: Mutex::new(segments),
            size,
            counters: Counters::default(),
            position,
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
        })
    }

    /// Flushes and closes file handles and releases the process lock.
    ///
    /// Calling it again is a no-op. Later puts and gets fail with
    /// [`CacheError::Closed`](crate::CacheError::Closed).
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut reader = self.reader.lock();
        reader.segment = None;

        let mut writer = self.writer.lock();
        if let Some(file) = writer.file.take()
            && !self.config.no_sync
        {
            file.sync_all().context(IoSnafu {
                path: self.active_path(),
            })?;
        }
        drop(writer);
        drop(reader);

        if let Some(mut lock) = self.lock.lock().take() {
            lock.release()?;
        }

        info!(path = ?self.config.path, "Disk cache closed");
        Ok(())
    }

    /// Bytes currently on disk.
    #[must_use]
    pub fn size(&self) -> u64 { self.size.load(Ordering::Acquire) }

    #[must_use]
    pub fn path(&self) -> &Path { &self.config.path }

    /// The effective (normalized) configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig { &self.config }

    #[must_use]
    pub fn stats(&self) -> Stats {
        let active_segment_size = self.writer.lock().len;
        let closed_segments = self.segments.lock().len();
        let c = &self.counters;

        Stats {
            size: self.size(),
            active_segment_size,
            closed_segments,
            rotate_count: c.rotate_count.load(Ordering::Relaxed),
            dropped_batches: c.dropped_batches.load(Ordering::Relaxed),
            put_count: c.put_count.load(Ordering::Relaxed),
            put_bytes: c.put_bytes.load(Ordering::Relaxed),
            get_count: c.get_count.load(Ordering::Relaxed),
            get_bytes: c.get_bytes.load(Ordering::Relaxed),
            put_latency_avg: c.put_latency_avg(),
            get_latency_avg: c.get_latency_avg(),
            capacity: self.config.capacity,
            batch_size: self.config.batch_size,
            max_data_size: self.config.max_data_size,
            no_sync: self.config.no_sync,
            no_pos: self.config.no_pos,
            no_lock: self.config.no_lock,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return ClosedSnafu.fail();
        }
        Ok(())
    }

    pub(crate) fn active_path(&self) -> PathBuf { self.config.path.join(ACTIVE_SEGMENT) }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = ?e, path = ?self.config.path, "Failed to close disk cache");
        }
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("path", &self.config.path)
            .field("size", &self.size())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Reopens the read cursor from the position record.
///
/// The record is only honored when it names the oldest closed segment and
/// points inside it; anything else restarts consumption at the oldest
/// segment.
fn restore_position(
    position: &PositionFile,
    segments: &mut SegmentStore,
) -> Result<Option<ReadSegment>> {
    let Some(Position { segment, offset }) = position.load()? else {
        return Ok(None);
    };

    if segments.oldest() != Some(segment.as_str()) {
        warn!(
            segment = %segment,
            oldest = ?segments.oldest(),
            "Position names a segment that is not the oldest, starting from the oldest"
        );
        return Ok(None);
    }

    let path = segments.path_of(&segment);
    let mut file = segments.open_for_read(&segment)?;
    let len = file.metadata().context(IoSnafu { path: &path })?.len();
    if offset > len {
        warn!(segment = %segment, offset, len, "Position beyond segment end, ignoring it");
        return Ok(None);
    }

    file.seek(SeekFrom::Start(offset))
        .context(IoSnafu { path: &path })?;
    segments.set_reading(Some(segment.clone()));

    Ok(Some(ReadSegment::new(segment, file, offset)))
}
