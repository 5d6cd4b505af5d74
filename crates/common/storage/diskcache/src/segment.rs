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

//! On-disk segment set.
//!
//! ```text
//! <dir>/
//!   data                        active write segment
//!   data.00000000000000000001   closed segments, oldest first
//!   data.00000000000000000002
//!   .pos                        read position
//!   .lock                       owning PID
//! ```
//!
//! Closed segment names carry a zero-padded sequence so lexicographic order
//! is creation order, which is also read order.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use snafu::ResultExt;
use tracing::debug;

use crate::{
    Result,
    error::{InvalidSegmentNameSnafu, IoSnafu},
};

/// Fixed name of the active write segment.
pub const ACTIVE_SEGMENT: &str = "data";

/// Position record file name.
pub const POSITION_FILE: &str = ".pos";

/// Process lock file name.
pub const LOCK_FILE: &str = ".lock";

const SEGMENT_PREFIX: &str = "data.";

/// Returns the closed segment name for a sequence: `data.NNNNNNNNNNNNNNNNNNNN`.
pub fn segment_name(sequence: u64) -> String { format!("{SEGMENT_PREFIX}{sequence:020}") }

/// Parses a directory entry name.
///
/// Returns `Ok(None)` for names that are not closed segments (the active
/// segment, `.pos`, `.lock`, temp files) and an error for a `data.*` name
/// whose suffix is not a sequence number.
pub fn parse_segment_name(name: &str) -> Result<Option<u64>> {
    let Some(suffix) = name.strip_prefix(SEGMENT_PREFIX) else {
        return Ok(None);
    };

    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return InvalidSegmentNameSnafu { name }.fail();
    }

    suffix
        .parse()
        .map(Some)
        .map_err(|_| InvalidSegmentNameSnafu { name }.build())
}

/// Open options applying the configured permission bits on unix.
pub fn file_options(file_mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(file_mode);
    }
    #[cfg(not(unix))]
    let _ = file_mode;
    options
}

/// Creates `dir` and its parents with the configured permission bits on unix.
pub fn create_dir(dir: &Path, dir_mode: u32) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(dir_mode);
    }
    #[cfg(not(unix))]
    let _ = dir_mode;
    builder.create(dir).context(IoSnafu { path: dir })
}

/// Subtracts from a shared size counter without wrapping below zero.
pub fn sub_size(size: &AtomicU64, bytes: u64) {
    let _ = size.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        Some(cur.saturating_sub(bytes))
    });
}

/// The ordered backlog of closed segments.
///
/// Guarded by the cache's structural lock: rotation, eviction and the
/// reader's segment switches all go through here.
#[derive(Debug)]
pub struct SegmentStore {
    dir:            PathBuf,
    file_mode:      u32,
    /// Closed segment names, oldest first.
    closed:         VecDeque<String>,
    next_sequence:  u64,
    /// Segment currently held open by the reader.
    reading:        Option<String>,
    /// Set when eviction deleted the reader's segment from under it.
    reader_evicted: bool,
    /// Cumulative bytes on disk, shared with the write path.
    size:           Arc<AtomicU64>,
}

impl SegmentStore {
    /// Enumerates closed segments under `dir`, sorted oldest first, and adds
    /// their sizes to `size`.
    pub fn scan(dir: &Path, file_mode: u32, size: Arc<AtomicU64>) -> Result<Self> {
        let mut found = Vec::new();
        let mut max_sequence = 0;
        let mut total = 0;

        for entry in fs::read_dir(dir).context(IoSnafu { path: dir })? {
            let entry = entry.context(IoSnafu { path: dir })?;
            let path = entry.path();
            let metadata = entry.metadata().context(IoSnafu { path: &path })?;
            if !metadata.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(sequence) = parse_segment_name(&name)? {
                max_sequence = max_sequence.max(sequence);
                total += metadata.len();
                found.push(name);
            }
        }

        found.sort();
        size.fetch_add(total, Ordering::AcqRel);

        debug!(dir = ?dir, segments = found.len(), bytes = total, "Scanned closed segments");

        Ok(Self {
            dir: dir.to_path_buf(),
            file_mode,
            closed: found.into(),
            next_sequence: max_sequence + 1,
            reading: None,
            reader_evicted: false,
            size,
        })
    }

    pub fn list_closed_segments(&self) -> Vec<String> { self.closed.iter().cloned().collect() }

    pub fn len(&self) -> usize { self.closed.len() }

    pub fn is_empty(&self) -> bool { self.closed.is_empty() }

    pub fn oldest(&self) -> Option<&str> { self.closed.front().map(String::as_str) }

    pub fn contains(&self, name: &str) -> bool { self.closed.iter().any(|n| n == name) }

    pub fn path_of(&self, name: &str) -> PathBuf { self.dir.join(name) }

    /// Reserves the name for the next rotated segment.
    pub fn next_segment_name(&mut self) -> String {
        let name = segment_name(self.next_sequence);
        self.next_sequence += 1;
        name
    }

    /// Appends a freshly sealed segment to the backlog.
    pub fn push_closed(&mut self, name: String) { self.closed.push_back(name); }

    /// Deletes a closed segment and returns the bytes it freed.
    ///
    /// A file already gone from disk only drops its backlog entry.
    pub fn remove_segment(&mut self, name: &str) -> Result<u64> {
        let path = self.path_of(name);
        let freed = match fs::metadata(&path) {
            Ok(metadata) => {
                fs::remove_file(&path).context(IoSnafu { path: &path })?;
                metadata.len()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e).context(IoSnafu { path }),
        };

        self.closed.retain(|n| n != name);
        if self.reading.as_deref() == Some(name) {
            self.reading = None;
        }
        sub_size(&self.size, freed);

        debug!(segment = name, freed, "Removed segment");
        Ok(freed)
    }

    /// Deletes the oldest closed segment, flagging the reader if it was
    /// consuming it. Returns the removed name and bytes freed.
    pub fn evict_oldest(&mut self) -> Result<Option<(String, u64)>> {
        let Some(name) = self.closed.front().cloned() else {
            return Ok(None);
        };
        if self.reading.as_deref() == Some(name.as_str()) {
            self.reader_evicted = true;
        }
        let freed = self.remove_segment(&name)?;
        Ok(Some((name, freed)))
    }

    /// Records which segment the reader has open.
    pub fn set_reading(&mut self, name: Option<String>) {
        self.reading = name;
        self.reader_evicted = false;
    }

    pub fn reading(&self) -> Option<&str> { self.reading.as_deref() }

    /// Returns and clears the eviction flag.
    pub fn take_reader_evicted(&mut self) -> bool { std::mem::take(&mut self.reader_evicted) }

    pub fn open_for_append(&self, name: &str) -> Result<File> {
        let path = self.path_of(name);
        file_options(self.file_mode)
            .create(true)
            .append(true)
            .open(&path)
            .context(IoSnafu { path })
    }

    pub fn open_for_read(&self, name: &str) -> Result<File> {
        let path = self.path_of(name);
        File::open(&path).context(IoSnafu { path })
    }
}
