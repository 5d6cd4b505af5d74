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

//! Startup recovery of the active write segment.
//!
//! The active segment is the only file a crash can leave half written. It is
//! scanned frame by frame from the start:
//! 1. A torn tail (partial header or payload) is truncated away
//! 2. A sentinel means the process died between sealing and renaming, so the
//!    file is reported as sealed and the caller finishes the rotation

use std::{
    fs::{File, OpenOptions},
    io::BufReader,
    path::Path,
};

use snafu::ResultExt;
use tracing::{info, warn};

use crate::{
    Result,
    error::IoSnafu,
    frame::{self, DecodeError, FRAME_HEADER_SIZE, Frame, frame_size},
};

/// State of the active segment found on disk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ActiveSegment {
    /// Length of the valid prefix, after any truncation.
    pub len:     u64,
    /// Complete records in the valid prefix.
    pub records: u64,
    /// The segment ends in a sentinel.
    pub sealed:  bool,
}

/// Scans and repairs the active segment at `path`. A missing file is an
/// empty segment.
pub fn recover_active(path: &Path) -> Result<ActiveSegment> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ActiveSegment::default());
        }
        Err(e) => return Err(e).context(IoSnafu { path }),
    };
    let file_len = file.metadata().context(IoSnafu { path })?.len();

    let mut reader = BufReader::new(file);
    let mut state = ActiveSegment::default();

    loop {
        match frame::decode(&mut reader) {
            Ok(Frame::Record(payload)) => {
                state.len += frame_size(payload.len());
                state.records += 1;
            }
            Ok(Frame::EndOfSegment) => {
                state.len += FRAME_HEADER_SIZE as u64;
                state.sealed = true;
                break;
            }
            Ok(Frame::EndOfFile) => break,
            Err(DecodeError::Truncated { expected, actual }) => {
                warn!(
                    path = ?path,
                    position = state.len,
                    expected,
                    actual,
                    "Torn frame found at end of active segment"
                );
                break;
            }
            Err(DecodeError::Io(e)) => return Err(e).context(IoSnafu { path }),
        }
    }
    drop(reader);

    if state.len < file_len {
        warn!(
            path = ?path,
            valid = state.len,
            file_len,
            "Truncating active segment to last complete frame"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .context(IoSnafu { path })?;
        file.set_len(state.len).context(IoSnafu { path })?;
        file.sync_all().context(IoSnafu { path })?;
    }

    info!(
        path = ?path,
        len = state.len,
        records = state.records,
        sealed = state.sealed,
        "Active segment recovered"
    );

    Ok(state)
}
