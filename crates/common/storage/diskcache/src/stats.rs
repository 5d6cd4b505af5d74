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

//! Per-instance counters and the read-only snapshot built from them.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

/// Live counters owned by one cache instance.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub put_count:       AtomicU64,
    pub put_bytes:       AtomicU64,
    pub put_nanos:       AtomicU64,
    pub get_count:       AtomicU64,
    pub get_bytes:       AtomicU64,
    pub get_nanos:       AtomicU64,
    pub rotate_count:    AtomicU64,
    pub dropped_batches: AtomicU64,
}

#[allow(clippy::cast_possible_truncation)]
fn nanos(elapsed: Duration) -> u64 { elapsed.as_nanos().min(u128::from(u64::MAX)) as u64 }

fn average(total_nanos: u64, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(total_nanos / count)
    }
}

impl Counters {
    pub fn record_put(&self, bytes: u64, elapsed: Duration) {
        self.put_count.fetch_add(1, Ordering::Relaxed);
        self.put_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.put_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_get(&self, bytes: u64, elapsed: Duration) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.get_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_rotate(&self) { self.rotate_count.fetch_add(1, Ordering::Relaxed); }

    pub fn record_drop(&self) { self.dropped_batches.fetch_add(1, Ordering::Relaxed); }

    pub fn put_latency_avg(&self) -> Duration {
        average(
            self.put_nanos.load(Ordering::Relaxed),
            self.put_count.load(Ordering::Relaxed),
        )
    }

    pub fn get_latency_avg(&self) -> Duration {
        average(
            self.get_nanos.load(Ordering::Relaxed),
            self.get_count.load(Ordering::Relaxed),
        )
    }
}

/// Point-in-time view of a cache, produced by
/// [`DiskCache::stats`](crate::DiskCache::stats).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Bytes on disk across all segments.
    pub size:                u64,
    pub active_segment_size: u64,
    pub closed_segments:     usize,
    pub rotate_count:        u64,
    /// Closed segments deleted to honor `capacity`.
    pub dropped_batches:     u64,
    pub put_count:           u64,
    pub put_bytes:           u64,
    pub get_count:           u64,
    pub get_bytes:           u64,
    #[serde(with = "humantime_serde")]
    pub put_latency_avg:     Duration,
    #[serde(with = "humantime_serde")]
    pub get_latency_avg:     Duration,
    pub capacity:            u64,
    pub batch_size:          u64,
    pub max_data_size:       u64,
    pub no_sync:             bool,
    pub no_pos:              bool,
    pub no_lock:             bool,
}
