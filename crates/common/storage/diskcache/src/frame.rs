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

//! Record framing.
//!
//! Every record in a segment is stored as:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┐
//! │  Length (4B)    │   Payload (variable) │
//! │  little-endian  │   raw bytes          │
//! └─────────────────┴──────────────────────┘
//! ```
//!
//! A length of [`EOF_SENTINEL`] carries no payload and marks the end of a
//! segment: nothing will ever be appended after it.

use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Reserved length value meaning "end of segment".
pub const EOF_SENTINEL: u32 = 0xDEAD_BEEF;

/// On-disk size of a record with the given payload length.
#[inline]
pub const fn frame_size(payload_len: usize) -> u64 { (FRAME_HEADER_SIZE + payload_len) as u64 }

/// Encodes a length header.
#[inline]
pub const fn encode_header(len: u32) -> [u8; FRAME_HEADER_SIZE] { len.to_le_bytes() }

/// The end-of-segment marker as it appears on disk.
#[inline]
pub const fn sentinel() -> [u8; FRAME_HEADER_SIZE] { encode_header(EOF_SENTINEL) }

/// Encodes a payload into a single contiguous frame.
///
/// Callers bound `payload` by `max_data_size`, which always sits below
/// [`EOF_SENTINEL`].
#[allow(clippy::cast_possible_truncation)]
pub fn encode(payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() < EOF_SENTINEL as usize);
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Result of decoding one frame from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Record(Bytes),
    /// The sentinel was read.
    EndOfSegment,
    /// The stream ended cleanly on a frame boundary.
    EndOfFile,
}

/// Framing failure while decoding.
#[derive(Debug)]
pub enum DecodeError {
    /// Fewer bytes than the header or the declared payload length.
    Truncated { expected: u64, actual: u64 },
    Io(io::Error),
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> Self { Self::Io(err) }
}

/// Decodes the next frame from `reader`.
pub fn decode<R: Read>(reader: &mut R) -> Result<Frame, DecodeError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let n = read_full(reader, &mut header)?;
    if n == 0 {
        return Ok(Frame::EndOfFile);
    }
    if n < FRAME_HEADER_SIZE {
        return Err(DecodeError::Truncated {
            expected: FRAME_HEADER_SIZE as u64,
            actual:   n as u64,
        });
    }

    let len = u32::from_le_bytes(header);
    if len == EOF_SENTINEL {
        return Ok(Frame::EndOfSegment);
    }

    // A damaged header may declare a huge length; grow with the data instead
    // of allocating up front.
    let mut payload = Vec::new();
    let n = reader.take(u64::from(len)).read_to_end(&mut payload)?;
    if n < len as usize {
        return Err(DecodeError::Truncated {
            expected: u64::from(len),
            actual:   n as u64,
        });
    }

    Ok(Frame::Record(Bytes::from(payload)))
}

/// Reads until `buf` is full or the reader is exhausted, returning the count.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
