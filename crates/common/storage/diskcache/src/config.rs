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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::frame::EOF_SENTINEL;

/// Default per-segment target size: 20 MiB.
pub const DEFAULT_BATCH_SIZE: u64 = 20 * 1024 * 1024;

/// Configuration consumed by [`DiskCache::open`](crate::DiskCache::open).
///
/// Loading it from files or environment variables is left to the host; the
/// serde derives exist so any loader can produce one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct CacheConfig {
    /// Storage directory, created on open if absent.
    #[default(_code = "PathBuf::from(\"./diskcache\")")]
    pub path: PathBuf,

    /// Target size of one segment. A segment is rotated once it reaches this.
    #[default(DEFAULT_BATCH_SIZE)]
    pub batch_size: u64,

    /// Largest accepted payload. `0` means `batch_size / 2`.
    pub max_data_size: u64,

    /// Soft ceiling on total bytes on disk. `0` means unlimited.
    pub capacity: u64,

    /// Skip fsync after each write.
    pub no_sync: bool,

    #[default(0o750)]
    pub dir_mode: u32,

    #[default(0o640)]
    pub file_mode: u32,

    /// Idle time after which a partially filled active segment is rotated by
    /// the reader.
    #[serde(with = "humantime_serde")]
    #[default(Duration::from_secs(3))]
    pub wakeup: Duration,

    /// Disable the persisted read position.
    pub no_pos: bool,

    /// Disable the cross-process directory lock.
    pub no_lock: bool,
}

impl CacheConfig {
    /// Returns the config with sizes clamped to workable values.
    ///
    /// `max_data_size` never exceeds `batch_size / 2` and always stays below
    /// the end-of-segment sentinel so no payload length can collide with it.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }

        let half = (self.batch_size / 2).max(1);
        if self.max_data_size == 0 || self.max_data_size > half {
            self.max_data_size = half;
        }
        self.max_data_size = self.max_data_size.min(u64::from(EOF_SENTINEL) - 1);

        self
    }
}
