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

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{CacheConfig, DiskCache, ProcessProbe, Result, SharedProbe, SysinfoProbe};

pub struct CacheBuilder {
    config: CacheConfig,
    probe:  Option<SharedProbe>,
}

impl CacheBuilder {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config: CacheConfig {
                path: path.into(),
                ..Default::default()
            },
            probe:  None,
        }
    }

    /// Starts from an existing config, e.g. one loaded from a file.
    #[must_use]
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            probe: None,
        }
    }

    #[must_use]
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    #[must_use]
    pub fn max_data_size(mut self, size: u64) -> Self {
        self.config.max_data_size = size;
        self
    }

    /// Soft ceiling on bytes on disk. `0` means unlimited.
    #[must_use]
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    #[must_use]
    pub fn no_sync(mut self, no_sync: bool) -> Self {
        self.config.no_sync = no_sync;
        self
    }

    #[must_use]
    pub fn dir_mode(mut self, mode: u32) -> Self {
        self.config.dir_mode = mode;
        self
    }

    #[must_use]
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.config.file_mode = mode;
        self
    }

    #[must_use]
    pub fn wakeup(mut self, wakeup: Duration) -> Self {
        self.config.wakeup = wakeup;
        self
    }

    #[must_use]
    pub fn no_pos(mut self, no_pos: bool) -> Self {
        self.config.no_pos = no_pos;
        self
    }

    #[must_use]
    pub fn no_lock(mut self, no_lock: bool) -> Self {
        self.config.no_lock = no_lock;
        self
    }

    /// Replaces the check used to decide whether a lock owner is still alive.
    #[must_use]
    pub fn process_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn open(self) -> Result<DiskCache> {
        let probe = self.probe.unwrap_or_else(|| Arc::new(SysinfoProbe));
        DiskCache::open_with_probe(self.config, probe)
    }
}
