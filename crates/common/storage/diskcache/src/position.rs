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

#![allow(clippy::cast_possible_truncation)]

//! Persisted read position.
//!
//! ## Binary Format
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────┬─────────────┐
//! │ offset: u64  │ name_len: u32│ name: [u8]      │ crc32: u32  │
//! └──────────────┴──────────────┴─────────────────┴─────────────┘
//! ```
//!
//! All integers little-endian; the CRC covers every byte before it. The
//! record is written to a temp file and renamed into place so a crash leaves
//! either the old or the new record.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{Result, error::IoSnafu, segment::file_options};

const POSITION_FIXED_SIZE: usize = 8 + 4 + 4;

/// Resume point of the consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    /// Closed segment being read. Empty when no segment is active.
    pub segment: String,
    /// Byte offset of the next frame within `segment`.
    pub offset:  u64,
}

impl Position {
    pub fn is_reset(&self) -> bool { self.segment.is_empty() }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(POSITION_FIXED_SIZE + self.segment.len());
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.segment.len() as u32);
        buf.put_slice(self.segment.as_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.put_u32_le(hasher.finalize());
        buf.to_vec()
    }

    /// Decodes a record, returning `None` if it is malformed.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < POSITION_FIXED_SIZE {
            return None;
        }

        let (body, crc) = data.split_at(data.len() - 4);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != u32::from_le_bytes(crc.try_into().ok()?) {
            return None;
        }

        let mut body = body;
        let offset = body.get_u64_le();
        let name_len = body.get_u32_le() as usize;
        if body.remaining() != name_len {
            return None;
        }
        let segment = String::from_utf8(body.to_vec()).ok()?;

        Some(Self { segment, offset })
    }
}

/// Reads and writes the `.pos` file.
#[derive(Debug)]
pub struct PositionFile {
    path:      PathBuf,
    tmp_path:  PathBuf,
    file_mode: u32,
    no_sync:   bool,
}

impl PositionFile {
    pub fn new(path: &Path, file_mode: u32, no_sync: bool) -> Self {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        Self {
            path: path.to_path_buf(),
            tmp_path: PathBuf::from(tmp),
            file_mode,
            no_sync,
        }
    }

    /// Loads the record. A missing file is `None`; a damaged one is logged
    /// and also treated as `None`.
    pub fn load(&self) -> Result<Option<Position>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(IoSnafu { path: &self.path }),
        };

        match Position::decode(&data) {
            Some(pos) if pos.is_reset() => Ok(None),
            Some(pos) => Ok(Some(pos)),
            None => {
                warn!(path = ?self.path, len = data.len(), "Ignoring damaged position record");
                Ok(None)
            }
        }
    }

    pub fn store(&self, pos: &Position) -> Result<()> {
        let data = pos.encode();

        let mut file = file_options(self.file_mode)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)
            .context(IoSnafu {
                path: &self.tmp_path,
            })?;
        file.write_all(&data).context(IoSnafu {
            path: &self.tmp_path,
        })?;
        if !self.no_sync {
            file.sync_all().context(IoSnafu {
                path: &self.tmp_path,
            })?;
        }
        drop(file);

        fs::rename(&self.tmp_path, &self.path).context(IoSnafu { path: &self.path })?;
        Ok(())
    }

    /// Overwrites the record with "no active segment".
    pub fn reset(&self) -> Result<()> {
        debug!(path = ?self.path, "Resetting read position");
        self.store(&Position::default())
    }
}
