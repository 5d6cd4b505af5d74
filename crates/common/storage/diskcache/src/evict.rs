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

use std::sync::atomic::Ordering;

use tracing::warn;

use crate::{DiskCache, Result};

impl DiskCache {
    /// Drops the oldest closed segments until `incoming` more bytes fit under
    /// `capacity`.
    ///
    /// The active segment is never evicted, so `capacity` is a soft ceiling:
    /// with no closed segments left the write goes ahead anyway. Caller holds
    /// the write lock.
    pub(crate) fn make_room(&self, incoming: u64) -> Result<()> {
        let capacity = self.config.capacity;
        if capacity == 0 {
            return Ok(());
        }

        let mut segments = self.segments.lock();
        loop {
            let size = self.size.load(Ordering::Acquire);
            if size.saturating_add(incoming) <= capacity {
                return Ok(());
            }

            let Some((segment, freed)) = segments.evict_oldest()? else {
                warn!(size, incoming, capacity, "Over capacity with nothing left to evict");
                return Ok(());
            };
            self.counters.record_drop();
            warn!(
                segment = %segment,
                freed,
                size = self.size.load(Ordering::Acquire),
                capacity,
                "Evicted oldest segment to stay within capacity"
            );
        }
    }
}
