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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Boxed error returned by a [`get`](crate::DiskCache::get) handler.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Disk cache operation errors.
#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error on {}", path.display()))]
    Io {
        path:   PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Payload exceeds the configured max data size.
    #[snafu(display("Data too large: {size} bytes exceeds max data size {max}"))]
    TooLargeData { size: u64, max: u64 },

    /// Nothing to consume right now.
    #[snafu(display("No data available"))]
    Eof,

    /// Header or payload cut short inside a segment.
    #[snafu(display(
        "Truncated frame in segment {segment} at offset {offset}: expected {expected} bytes, got \
         {actual}"
    ))]
    TruncatedFrame {
        segment:  String,
        offset:   u64,
        expected: u64,
        actual:   u64,
    },

    /// A `data.*` file whose suffix is not a segment sequence.
    #[snafu(display("Invalid segment file name: {name}"))]
    InvalidSegmentName { name: String },

    /// Directory is owned by another live process.
    #[snafu(display("Cache directory locked by process {pid}: {}", path.display()))]
    Locked { path: PathBuf, pid: u32 },

    /// A streamed put delivered fewer bytes than announced.
    #[snafu(display("Short stream: expected {expected} bytes, got {actual}"))]
    ShortStream { expected: u64, actual: u64 },

    /// The consumer handler rejected a record. The record is not re-delivered.
    #[snafu(display("Handler failed"))]
    Handler { source: BoxedError },

    /// Operation on a closed cache.
    #[snafu(display("Cache is closed"))]
    Closed,
}

/// Coarse classification of a [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Queue is empty; poll again later.
    Empty,
    TooLarge,
    /// Segment data or names are damaged; needs intervention.
    Corrupted,
    Locked,
    Handler,
    Closed,
    Io,
}

impl CacheError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Eof => ErrorKind::Empty,
            Self::TooLargeData { .. } => ErrorKind::TooLarge,
            Self::TruncatedFrame { .. } | Self::InvalidSegmentName { .. } => ErrorKind::Corrupted,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Closed => ErrorKind::Closed,
            Self::Io { .. } | Self::ShortStream { .. } => ErrorKind::Io,
        }
    }

    #[must_use]
    pub const fn is_eof(&self) -> bool { matches!(self, Self::Eof) }
}

/// Result type for disk cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
