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

//! Write path: appending records and rotating the active segment.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    sync::atomic::Ordering,
    time::Instant,
};

use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    DiskCache, Result,
    cache::WriteState,
    error::{ClosedSnafu, IoSnafu, ShortStreamSnafu, TooLargeDataSnafu},
    frame::{self, FRAME_HEADER_SIZE, encode_header, frame_size, sentinel},
    segment::ACTIVE_SEGMENT,
};

impl DiskCache {
    /// Appends one record.
    ///
    /// Frees room by dropping the oldest closed segments when `capacity`
    /// would be exceeded, and rotates the active segment once it reaches
    /// `batch_size`.
    pub fn put(&self, data: &[u8]) -> Result<()> {
        let start = Instant::now();
        self.ensure_open()?;
        self.check_data_size(data.len() as u64)?;

        let mut writer = self.writer.lock();
        let frame_len = frame_size(data.len());
        self.make_room(frame_len)?;

        let frame = frame::encode(data);
        self.write_frame(&mut writer, frame_len, |file| file.write_all(&frame))?;

        self.counters.record_put(data.len() as u64, start.elapsed());
        self.rotate_if_full(&mut writer);
        Ok(())
    }

    /// Appends one record of exactly `len` bytes streamed from `reader`.
    ///
    /// If the reader ends early the partial frame is removed and
    /// [`CacheError::ShortStream`](crate::CacheError::ShortStream) returned.
    pub fn put_reader<R: Read>(&self, reader: R, len: u64) -> Result<()> {
        let start = Instant::now();
        self.ensure_open()?;
        self.check_data_size(len)?;

        let mut writer = self.writer.lock();
        let frame_len = FRAME_HEADER_SIZE as u64 + len;
        self.make_room(frame_len)?;

        let mut copied = 0;
        #[allow(clippy::cast_possible_truncation)]
        let header = encode_header(len as u32);
        self.write_frame(&mut writer, frame_len, |file| {
            file.write_all(&header)?;
            copied = io::copy(&mut reader.take(len), file)?;
            if copied < len {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            Ok(())
        })
        .map_err(|e| {
            if copied < len {
                ShortStreamSnafu {
                    expected: len,
                    actual:   copied,
                }
                .build()
            } else {
                e
            }
        })?;

        self.counters.record_put(len, start.elapsed());
        self.rotate_if_full(&mut writer);
        Ok(())
    }

    /// Appends each item in order, stopping at the first failure. Returns the
    /// number written. Items are independent records; there is no batch
    /// atomicity.
    pub fn put_batch<I, T>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut written = 0;
        for item in items {
            self.put(item.as_ref())?;
            written += 1;
        }
        Ok(written)
    }

    /// Seals the active segment and starts a new one. No-op when the active
    /// segment is empty.
    pub fn rotate(&self) -> Result<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        self.rotate_locked(&mut writer)
    }

    fn check_data_size(&self, size: u64) -> Result<()> {
        let max = self.config.max_data_size;
        ensure!(size <= max, TooLargeDataSnafu { size, max });
        Ok(())
    }

    /// Rotates after a write once the active segment is full. The record is
    /// already durable, so a failure is logged and retried by the next put
    /// rather than reported.
    fn rotate_if_full(&self, writer: &mut WriteState) {
        if writer.len < self.config.batch_size {
            return;
        }
        if let Err(e) = self.rotate_locked(writer) {
            warn!(
                error = ?e,
                len = writer.len,
                batch_size = self.config.batch_size,
                "Rotation after put failed, retrying on next put"
            );
        }
    }

    /// Reopens the active segment when a failed rotation left no handle.
    fn ensure_active(&self, writer: &mut WriteState) -> Result<()> {
        self.ensure_open()?;
        if writer.file.is_some() {
            return Ok(());
        }

        let path = self.active_path();
        let file = self.segments.lock().open_for_append(ACTIVE_SEGMENT)?;
        let len = file.metadata().context(IoSnafu { path: &path })?.len();
        info!(path = ?path, len, "Reopened active segment");

        self.size.fetch_add(len, Ordering::AcqRel);
        writer.file = Some(file);
        writer.len = len;
        Ok(())
    }

    /// Runs `write` against the active segment, then syncs. On failure the
    /// segment is truncated back to its previous length so no partial frame
    /// survives.
    fn write_frame<F>(&self, writer: &mut WriteState, frame_len: u64, write: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        self.ensure_active(writer)?;
        let path = self.active_path();
        let file = writer.file.as_mut().context(ClosedSnafu)?;

        let mut result = write(file);
        if result.is_ok() && !self.config.no_sync {
            result = file.sync_data();
        }

        if let Err(e) = result {
            if let Err(truncate_err) = file.set_len(writer.len) {
                warn!(
                    path = ?path,
                    len = writer.len,
                    error = ?truncate_err,
                    "Failed to roll back partial frame"
                );
            }
            return Err(e).context(IoSnafu { path });
        }

        writer.len += frame_len;
        writer.last_put = Some(Instant::now());
        self.size.fetch_add(frame_len, Ordering::AcqRel);
        Ok(())
    }

    /// Seals the active segment with the sentinel, moves it into the closed
    /// backlog under a fresh name and opens an empty active segment.
    ///
    /// Caller holds the write lock; this takes the structural lock.
    pub(crate) fn rotate_locked(&self, writer: &mut WriteState) -> Result<()> {
        if writer.len == 0 {
            return Ok(());
        }

        self.ensure_active(writer)?;
        let active_path = self.active_path();
        let file = writer.file.as_mut().context(ClosedSnafu)?;

        let mut sealed = file.write_all(&sentinel());
        if sealed.is_ok() && !self.config.no_sync {
            sealed = file.sync_all();
        }
        if let Err(e) = sealed {
            if let Err(truncate_err) = file.set_len(writer.len) {
                warn!(
                    path = ?active_path,
                    len = writer.len,
                    error = ?truncate_err,
                    "Failed to roll back partial end marker"
                );
            }
            return Err(e).context(IoSnafu { path: &active_path });
        }
        self.size
            .fetch_add(FRAME_HEADER_SIZE as u64, Ordering::AcqRel);

        let mut segments = self.segments.lock();
        let name = segments.next_segment_name();
        let target = segments.path_of(&name);

        if let Err(e) = fs::rename(&active_path, &target) {
            // Still the active segment: strip the sentinel so appends stay
            // readable.
            if let Err(truncate_err) = file.set_len(writer.len) {
                warn!(path = ?active_path, error = ?truncate_err, "Failed to unseal active segment");
            }
            crate::segment::sub_size(&self.size, FRAME_HEADER_SIZE as u64);
            return Err(e).context(IoSnafu { path: target });
        }

        // The handle now belongs to a sealed segment and must not see another
        // append, even if opening the new active segment fails below.
        writer.file = None;
        let sealed_len = writer.len + FRAME_HEADER_SIZE as u64;
        writer.len = 0;
        writer.last_put = None;
        segments.push_closed(name.clone());
        let closed_segments = segments.len();
        self.counters.record_rotate();
        info!(segment = %name, size = sealed_len, closed_segments, "Rotated active segment");

        writer.file = Some(segments.open_for_append(ACTIVE_SEGMENT)?);
        Ok(())
    }

    /// Rotates a non-empty active segment that has not seen a put within the
    /// wakeup interval, so a quiet producer does not strand data from the
    /// reader.
    pub(crate) fn wakeup(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let idle = writer
            .last_put
            .is_none_or(|t| t.elapsed() >= self.config.wakeup);
        if writer.len > 0 && idle {
            debug!(len = writer.len, "Rotating idle active segment");
            self.rotate_locked(&mut writer)?;
        }
        Ok(())
    }
}
