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

//! Durable, disk-backed FIFO queue of opaque byte records.
//!
//! Producers append records with [`DiskCache::put`]; a consumer drains them
//! in order with [`DiskCache::get`] or [`DiskCache::pop`]. Records land in
//! length-prefixed segment files under one directory, survive restarts, and
//! are bounded by an optional capacity that drops the oldest segments first.

pub mod builder;
mod cache;
pub mod config;
pub mod error;
mod evict;
pub mod frame;
mod get;
pub mod lock;
pub mod position;
mod put;
pub mod recovery;
pub mod segment;
pub mod stats;

pub use builder::CacheBuilder;
pub use cache::DiskCache;
pub use config::{CacheConfig, DEFAULT_BATCH_SIZE};
pub use error::{BoxedError, CacheError, ErrorKind, Result};
pub use lock::{ProcessProbe, SharedProbe, SysinfoProbe};
pub use stats::Stats;
