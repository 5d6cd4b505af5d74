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

//! Read path: consuming records from the closed segments in FIFO order.

use std::{
    convert::Infallible,
    io::{Seek, SeekFrom},
    time::Instant,
};

use bytes::Bytes;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, warn};

use crate::{
    BoxedError, DiskCache, Result,
    cache::{ReadSegment, ReadState},
    error::{EofSnafu, HandlerSnafu, IoSnafu, TruncatedFrameSnafu},
    frame::{self, DecodeError, Frame, frame_size},
    position::Position,
};

impl DiskCache {
    /// Hands the oldest record to `handler`.
    ///
    /// Delivery is at-most-once: the read position advances past the record
    /// before the handler's result is looked at, so a failing handler loses
    /// the record and gets
    /// [`CacheError::Handler`](crate::CacheError::Handler) back.
    ///
    /// Returns [`CacheError::Eof`](crate::CacheError::Eof) when nothing is
    /// readable. The handler runs under the read lock and must not call back
    /// into `get` or `pop`.
    pub fn get<F, E>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Bytes) -> std::result::Result<(), E>,
        E: Into<BoxedError>,
    {
        let start = Instant::now();
        self.ensure_open()?;
        self.wakeup()?;

        let mut state = self.reader.lock();
        let data = self.next_record(&mut state)?;
        let len = data.len() as u64;

        let handled = handler(data)
            .map_err(Into::<BoxedError>::into)
            .context(HandlerSnafu);
        let saved = self.save_position(&state);
        self.counters.record_get(len, start.elapsed());

        handled?;
        saved
    }

    /// Removes and returns the oldest record.
    pub fn pop(&self) -> Result<Bytes> {
        let mut out = None;
        self.get(|data| {
            out = Some(data);
            Ok::<(), Infallible>(())
        })?;
        out.context(EofSnafu)
    }

    fn next_record(&self, state: &mut ReadState) -> Result<Bytes> {
        loop {
            if state.segment.is_some() && self.segments.lock().take_reader_evicted() {
                if let Some(segment) = state.segment.take() {
                    warn!(segment = %segment.name, offset = segment.offset, "Segment evicted while being read");
                }
                self.reset_position()?;
            }

            if state.segment.is_none() {
                state.segment = Some(self.open_oldest()?);
            }
            let Some(segment) = state.segment.as_mut() else {
                continue;
            };

            let offset = segment.offset;
            match frame::decode(&mut segment.reader) {
                Ok(Frame::Record(data)) => {
                    segment.offset += frame_size(data.len());
                    return Ok(data);
                }
                Ok(Frame::EndOfSegment) => self.finish_segment(state)?,
                Ok(Frame::EndOfFile) => {
                    warn!(segment = %segment.name, offset, "Closed segment has no end marker");
                    self.finish_segment(state)?;
                }
                Err(DecodeError::Truncated { expected, actual }) => {
                    let path = self.config.path.join(&segment.name);
                    segment
                        .reader
                        .seek(SeekFrom::Start(offset))
                        .context(IoSnafu { path })?;
                    return TruncatedFrameSnafu {
                        segment: segment.name.clone(),
                        offset,
                        expected,
                        actual,
                    }
                    .fail();
                }
                Err(DecodeError::Io(e)) => {
                    let path = self.config.path.join(&segment.name);
                    return Err(e).context(IoSnafu { path });
                }
            }
        }
    }

    fn open_oldest(&self) -> Result<ReadSegment> {
        let mut segments = self.segments.lock();
        let name = segments.oldest().map(str::to_owned).context(EofSnafu)?;
        let file = segments.open_for_read(&name)?;
        segments.set_reading(Some(name.clone()));

        debug!(segment = %name, "Opened segment for reading");
        Ok(ReadSegment::new(name, file, 0))
    }

    /// Deletes the fully consumed segment and resets the position.
    fn finish_segment(&self, state: &mut ReadState) -> Result<()> {
        let Some(segment) = state.segment.take() else {
            return Ok(());
        };
        drop(segment.reader);

        let mut segments = self.segments.lock();
        let freed = segments.remove_segment(&segment.name)?;
        segments.set_reading(None);
        let remaining = segments.len();
        drop(segments);

        self.reset_position()?;
        info!(segment = %segment.name, freed, remaining, "Segment consumed");
        Ok(())
    }

    fn save_position(&self, state: &ReadState) -> Result<()> {
        let (Some(position), Some(segment)) = (&self.position, &state.segment) else {
            return Ok(());
        };
        position.store(&Position {
            segment: segment.name.clone(),
            offset:  segment.offset,
        })
    }

    fn reset_position(&self) -> Result<()> {
        match &self.position {
            Some(position) => position.reset(),
            None => Ok(()),
        }
    }
}
