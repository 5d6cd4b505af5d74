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

use std::{
    collections::HashSet,
    fs, io,
    sync::Arc,
    time::Duration,
};

use diskcache::{
    CacheBuilder, CacheConfig, CacheError, DiskCache, ErrorKind, ProcessProbe,
    position::{Position, PositionFile},
    segment::{ACTIVE_SEGMENT, LOCK_FILE, POSITION_FILE, segment_name},
};
use tempfile::TempDir;
use test_case::test_case;

const IDLE: Duration = Duration::ZERO;
const NEVER_IDLE: Duration = Duration::from_secs(3600);

fn drain(cache: &DiskCache) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match cache.pop() {
            Ok(data) => out.push(data.to_vec()),
            Err(e) if e.is_eof() => return out,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

fn closed_segment_files(dir: &std::path::Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("data."))
        .count()
}

struct FixedProbe(bool);

impl ProcessProbe for FixedProbe {
    fn is_alive(&self, _pid: u32) -> bool { self.0 }
}

#[test]
fn test_cache_fifo_order() {
    let temp_dir = TempDir::new().unwrap();

    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(1024)
        .wakeup(IDLE)
        .open()
        .unwrap();

    for i in 0..200 {
        cache.put(format!("message-{i:04}").as_bytes()).unwrap();
    }

    let records = drain(&cache);
    assert_eq!(records.len(), 200);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(std::str::from_utf8(record).unwrap(), format!("message-{i:04}"));
    }

    cache.close().unwrap();
}

#[test_case(0 ; "empty")]
#[test_case(1 ; "single byte")]
#[test_case(512 ; "max data size")]
fn test_cache_round_trip(len: usize) {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(1024)
        .wakeup(IDLE)
        .open()
        .unwrap();

    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    cache.put(&payload).unwrap();

    assert_eq!(cache.pop().unwrap().to_vec(), payload);
    assert!(cache.pop().unwrap_err().is_eof());
}

#[test]
fn test_cache_rejects_oversized_record() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(1024)
        .wakeup(IDLE)
        .open()
        .unwrap();

    cache.put(b"kept").unwrap();
    let size = cache.size();

    let err = cache.put(&[0u8; 513]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooLarge);
    assert_eq!(cache.size(), size);

    assert_eq!(drain(&cache), vec![b"kept".to_vec()]);
}

#[test]
fn test_cache_rotation_count() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(1000)
        .wakeup(NEVER_IDLE)
        .open()
        .unwrap();

    // 100-byte payloads make 104-byte frames; every tenth put crosses 1000.
    for _ in 0..50 {
        cache.put(&[0x5a; 100]).unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.rotate_count, 5);
    assert_eq!(stats.closed_segments, 5);
    assert_eq!(closed_segment_files(temp_dir.path()), 5);

    for seq in 1..=5 {
        let len = fs::metadata(temp_dir.path().join(segment_name(seq)))
            .unwrap()
            .len();
        assert!(len <= 1000 + 104 + 4);
    }
}

#[test]
fn test_cache_capacity_eviction() {
    let temp_dir = TempDir::new().unwrap();
    let capacity = 4096;
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(512)
        .capacity(capacity)
        .wakeup(NEVER_IDLE)
        .open()
        .unwrap();

    for i in 0..500u32 {
        cache.put(&i.to_le_bytes().repeat(16)).unwrap();
        assert!(cache.size() <= capacity + 68 + 4);
    }

    let stats = cache.stats();
    assert!(stats.dropped_batches > 0);

    let records = drain(&cache);
    assert!(!records.is_empty());
    let first = u32::from_le_bytes(records[0][..4].try_into().unwrap());
    assert!(first > 0);
    for pair in records.windows(2) {
        let a = u32::from_le_bytes(pair[0][..4].try_into().unwrap());
        let b = u32::from_le_bytes(pair[1][..4].try_into().unwrap());
        assert_eq!(b, a + 1);
    }
}

#[test]
fn test_cache_evicts_segment_being_read() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(64)
        .capacity(150)
        .wakeup(NEVER_IDLE)
        .open()
        .unwrap();
    let record = |i: u8| vec![i; 28];

    // Two 32-byte frames per sealed segment.
    for i in 0..4 {
        cache.put(&record(i)).unwrap();
    }
    assert_eq!(cache.pop().unwrap().to_vec(), record(0));

    // The reader is midway through segment 1 when it is evicted.
    cache.put(&record(4)).unwrap();
    assert!(!temp_dir.path().join(segment_name(1)).exists());
    assert_eq!(cache.stats().dropped_batches, 1);
    cache.put(&record(5)).unwrap();

    assert_eq!(cache.pop().unwrap().to_vec(), record(2));
    let position = PositionFile::new(&temp_dir.path().join(POSITION_FILE), 0o640, false)
        .load()
        .unwrap();
    assert_eq!(
        position,
        Some(Position {
            segment: segment_name(2),
            offset:  32,
        })
    );

    assert_eq!(drain(&cache), vec![record(3), record(4), record(5)]);
    assert_eq!(cache.stats().dropped_batches, 1);
}

#[test]
fn test_cache_resume_after_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().to_path_buf();

    {
        let cache = CacheBuilder::new(&path)
            .batch_size(256)
            .wakeup(IDLE)
            .open()
            .unwrap();

        for i in 0..40 {
            cache.put(format!("msg-{i}").as_bytes()).unwrap();
        }
        for i in 0..17 {
            assert_eq!(cache.pop().unwrap().as_ref(), format!("msg-{i}").as_bytes());
        }
        cache.close().unwrap();
    }

    {
        let cache = CacheBuilder::new(&path)
            .batch_size(256)
            .wakeup(IDLE)
            .open()
            .unwrap();

        let records = drain(&cache);
        assert_eq!(records.len(), 23);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record, format!("msg-{}", i + 17).as_bytes());
        }
        cache.close().unwrap();
    }
}

#[test]
fn test_cache_recovers_unsynced_active_segment() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().to_path_buf();

    {
        let cache = CacheBuilder::new(&path)
            .wakeup(NEVER_IDLE)
            .no_sync(true)
            .open()
            .unwrap();
        cache.put(b"survives").unwrap();
        cache.close().unwrap();
    }

    // Torn tail left by a crash mid-write.
    let active = path.join(ACTIVE_SEGMENT);
    let mut data = fs::read(&active).unwrap();
    data.extend_from_slice(&[0x20, 0, 0]);
    fs::write(&active, data).unwrap();

    let cache = CacheBuilder::new(&path).wakeup(NEVER_IDLE).open().unwrap();
    assert_eq!(cache.stats().active_segment_size, 12);

    // Data from a previous run counts as idle.
    assert_eq!(drain(&cache), vec![b"survives".to_vec()]);
}

#[test]
fn test_cache_lock_exclusivity() {
    let temp_dir = TempDir::new().unwrap();

    let first = CacheBuilder::new(temp_dir.path()).open().unwrap();
    let err = CacheBuilder::new(temp_dir.path()).open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Locked);
    assert!(matches!(err, CacheError::Locked { pid, .. } if pid == std::process::id()));

    first.close().unwrap();
    let second = CacheBuilder::new(temp_dir.path()).open().unwrap();
    second.close().unwrap();
}

#[test]
fn test_cache_reclaims_stale_lock() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(LOCK_FILE), "4242").unwrap();

    let err = CacheBuilder::new(temp_dir.path())
        .process_probe(Arc::new(FixedProbe(true)))
        .open()
        .unwrap_err();
    assert!(matches!(err, CacheError::Locked { pid: 4242, .. }));

    let cache = CacheBuilder::new(temp_dir.path())
        .process_probe(Arc::new(FixedProbe(false)))
        .open()
        .unwrap();
    assert_eq!(
        fs::read_to_string(temp_dir.path().join(LOCK_FILE)).unwrap(),
        std::process::id().to_string()
    );
    cache.close().unwrap();
}

#[test]
fn test_cache_concrete_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(2048)
        .wakeup(NEVER_IDLE)
        .open()
        .unwrap();
    let before = closed_segment_files(temp_dir.path());

    let records: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 1024]).collect();
    for record in &records {
        cache.put(record).unwrap();
    }

    // Rotation runs after a write once the active segment reaches
    // batch_size: one 1028-byte frame stays below 2048, the second crosses
    // it, so every pair of records seals one segment.
    let stats = cache.stats();
    assert_eq!(stats.rotate_count, 2);
    assert_eq!(stats.closed_segments, 2);
    for seq in 1..=2 {
        let len = fs::metadata(temp_dir.path().join(segment_name(seq)))
            .unwrap()
            .len();
        assert_eq!(len, 2 * 1028 + 4);
    }

    for record in &records {
        assert_eq!(&cache.pop().unwrap().to_vec(), record);
    }
    assert_eq!(cache.pop().unwrap_err().kind(), ErrorKind::Empty);
    assert_eq!(closed_segment_files(temp_dir.path()), before);
    assert_eq!(cache.size(), 0);
}

#[test]
fn test_cache_handler_error_is_not_redelivered() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .wakeup(IDLE)
        .open()
        .unwrap();

    cache.put_batch([b"a".as_slice(), b"b", b"c"]).unwrap();

    let mut seen = Vec::new();
    let err = cache
        .get(|data| {
            seen.push(data);
            Err(io::Error::other("sink rejected"))
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert_eq!(seen[0].as_ref(), b"a");

    assert_eq!(drain(&cache), vec![b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_cache_concurrent_producers() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(4096)
        .no_sync(true)
        .wakeup(IDLE)
        .open()
        .unwrap();

    std::thread::scope(|s| {
        for producer in 0..4 {
            let cache = &cache;
            s.spawn(move || {
                for i in 0..250 {
                    cache.put(format!("{producer}-{i}").as_bytes()).unwrap();
                }
            });
        }
    });

    let records = drain(&cache);
    assert_eq!(records.len(), 1000);

    let unique: HashSet<_> = records.iter().collect();
    assert_eq!(unique.len(), 1000);

    // Per-producer order survives interleaving.
    for producer in 0..4 {
        let prefix = format!("{producer}-");
        let seq: Vec<u32> = records
            .iter()
            .filter_map(|r| std::str::from_utf8(r).ok()?.strip_prefix(&prefix)?.parse().ok())
            .collect();
        assert_eq!(seq, (0..250).collect::<Vec<_>>());
    }
}

#[test]
fn test_cache_concurrent_producer_and_consumer() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .batch_size(1024)
        .no_sync(true)
        .wakeup(IDLE)
        .open()
        .unwrap();

    let received = std::thread::scope(|s| {
        let producer = s.spawn(|| {
            for i in 0..500u32 {
                cache.put(&i.to_le_bytes()).unwrap();
            }
        });

        let mut received = Vec::new();
        while received.len() < 500 {
            match cache.pop() {
                Ok(data) => received.push(u32::from_le_bytes(data[..].try_into().unwrap())),
                Err(e) if e.is_eof() => std::thread::yield_now(),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        producer.join().unwrap();
        received
    });

    assert_eq!(received, (0..500).collect::<Vec<_>>());
}

#[test]
fn test_cache_truncated_segment_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(segment_name(1)), [9u8, 0, 0, 0, b'x']).unwrap();

    let cache = CacheBuilder::new(temp_dir.path()).open().unwrap();
    let err = cache.pop().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
    assert!(!err.is_eof());
}

#[test]
fn test_cache_invalid_segment_name() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("data.bogus"), b"").unwrap();

    let err = CacheBuilder::new(temp_dir.path()).open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
}

#[test]
fn test_cache_put_reader_short_stream() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheBuilder::new(temp_dir.path())
        .wakeup(IDLE)
        .open()
        .unwrap();

    let err = cache
        .put_reader(io::Cursor::new(vec![1u8; 10]), 64)
        .unwrap_err();
    assert!(matches!(err, CacheError::ShortStream {
        expected: 64,
        actual:   10,
    }));
    assert_eq!(cache.size(), 0);
    assert!(cache.pop().unwrap_err().is_eof());
}

#[test]
fn test_cache_without_position_restarts_segment() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().to_path_buf();

    {
        let cache = CacheBuilder::new(&path)
            .no_pos(true)
            .wakeup(IDLE)
            .open()
            .unwrap();
        cache.put_batch(["one", "two", "three"]).unwrap();
        assert_eq!(cache.pop().unwrap().as_ref(), b"one");
        cache.close().unwrap();
    }
    assert!(!path.join(".pos").exists());

    let cache = CacheBuilder::new(&path).no_pos(true).open().unwrap();
    assert_eq!(
        drain(&cache),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn test_cache_config_from_json() {
    let temp_dir = TempDir::new().unwrap();
    let json = format!(
        r#"{{"path": {:?}, "batch_size": 4096, "capacity": 65536, "wakeup": "250ms", "no_sync": true}}"#,
        temp_dir.path()
    );
    let config: CacheConfig = serde_json::from_str(&json).unwrap();

    let cache = DiskCache::open(config).unwrap();
    cache.put(b"json").unwrap();

    let stats = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(stats["batch_size"], 4096);
    assert_eq!(stats["max_data_size"], 2048);
    assert_eq!(stats["capacity"], 65536);
    assert_eq!(stats["put_count"], 1);
    assert_eq!(stats["no_sync"], true);
    assert!(stats["put_latency_avg"].is_string());
}
