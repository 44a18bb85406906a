//! Tests for OffloadStore
//!
//! These tests verify:
//! - Opening (backing file creation, backend validation)
//! - Sync and async round trips, single and vectorized
//! - Unknown keys and layout mismatches
//! - Region reuse when a key is rewritten
//! - Rewrites while a read of the old version is outstanding
//! - Barriers with many concurrent async writes
//! - Close and drop behavior

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use nvme_offload::io::{BufferHandle, Direction};
use nvme_offload::{get_backends, probe_backend, BackendKind, Config, OffloadError, OffloadStore};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn usable_backends() -> Vec<BackendKind> {
    get_backends()
        .into_iter()
        .filter(|kind| probe_backend(kind.name()))
        .collect()
}

fn open_store(dir: &TempDir, backend: BackendKind, queue_depth: usize) -> OffloadStore {
    let config = Config::builder()
        .data_dir(dir.path())
        .backend(backend)
        .queue_depth(queue_depth)
        .build();
    OffloadStore::open(config).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed).wrapping_mul(7)).collect()
}

fn backing_files(dir: &TempDir) -> Vec<String> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_creates_directory_and_file() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("nested").join("offload");
        let config = Config::builder().data_dir(&data_dir).backend(kind).build();

        let store = OffloadStore::open(config).unwrap();
        assert!(data_dir.is_dir());
        assert!(store.path().exists());
        assert!(store
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("offload-"));
        assert_eq!(store.backend(), kind);
    }
}

#[test]
fn test_two_stores_use_distinct_files() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let a = open_store(&temp_dir, kind, 4);
        let b = open_store(&temp_dir, kind, 4);
        assert_ne!(a.path(), b.path());
        assert_eq!(backing_files(&temp_dir).len(), 2);
    }
}

#[test]
fn test_close_removes_backing_file() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);
        store.sync_write("k", &[1, 2, 3]).unwrap();
        let path = store.path().to_path_buf();

        store.close().unwrap();
        assert!(!path.exists());
    }
}

#[test]
fn test_drop_removes_backing_file() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = open_store(&temp_dir, kind, 4);
            store.sync_write("k", &[1, 2, 3]).unwrap();
        }
        assert!(backing_files(&temp_dir).is_empty());
    }
}

#[test]
fn test_keep_backing_file_with_explicit_path() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.bin");
        let config = Config::builder()
            .backing_file(&path)
            .remove_on_close(false)
            .backend(kind)
            .build();

        let store = OffloadStore::open(config).unwrap();
        store.sync_write("k", &pattern(100, 1)).unwrap();
        store.close().unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, pattern(100, 1));
    }
}

#[test]
fn test_uncompiled_backend_is_configuration_error() {
    // Every compiled-in backend either opens or reports why it cannot
    for kind in BackendKind::ALL {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::builder().data_dir(temp_dir.path()).backend(kind).build();
        match OffloadStore::open(config) {
            Ok(_) => assert!(probe_backend(kind.name())),
            Err(e) => {
                assert!(e.is_configuration(), "unexpected error {}", e);
                assert!(backing_files(&temp_dir).is_empty());
            }
        }
    }
}

#[test]
fn test_zero_queue_depth_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().data_dir(temp_dir.path()).queue_depth(0).build();
    let err = OffloadStore::open(config).err().unwrap();
    assert!(err.is_configuration());
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_sync_round_trip() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let data = pattern(10_000, 3);
        store.sync_write("weights", &data).unwrap();

        let mut out = vec![0u8; 10_000];
        store.sync_read("weights", &mut out).unwrap();
        assert_eq!(out, data, "backend {}", kind);
        assert!(store.contains("weights"));
        assert_eq!(store.key_count(), 1);
    }
}

#[test]
fn test_sync_vectored_round_trip() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let x = pattern(16, 1);
        let y = pattern(32, 2);
        store.sync_writev("xy", &[&x[..], &y[..]]).unwrap();

        let mut x_out = vec![0u8; 16];
        let mut y_out = vec![0u8; 32];
        store.sync_readv("xy", &mut [&mut x_out[..], &mut y_out[..]]).unwrap();
        assert_eq!(x_out, x);
        assert_eq!(y_out, y);
    }
}

#[test]
fn test_async_round_trip_with_callbacks() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let data = pattern(4096, 8);
        let written = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&written);
        unsafe {
            store
                .async_write(
                    "a",
                    BufferHandle::from(&data[..]),
                    Some(Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        }
        store.sync_write_events().unwrap();
        assert_eq!(written.load(Ordering::SeqCst), 1);
        assert_eq!(store.outstanding(Some(Direction::Write)), 0);

        let mut out = vec![0u8; 4096];
        unsafe { store.async_read("a", BufferHandle::from(&mut out[..]), None).unwrap() };
        store.sync_read_events().unwrap();
        assert_eq!(out, data, "backend {}", kind);
    }
}

#[test]
fn test_async_vectored_round_trip() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 2);

        let parts = [pattern(100, 1), pattern(200, 2), pattern(300, 3)];
        let handles = parts.iter().map(|p| BufferHandle::from(&p[..])).collect();
        unsafe { store.async_writev("group", handles, None).unwrap() };
        store.synchronize().unwrap();

        let mut outs = vec![vec![0u8; 100], vec![0u8; 200], vec![0u8; 300]];
        let handles = outs.iter_mut().map(|o| BufferHandle::from(&mut o[..])).collect();
        unsafe { store.async_readv("group", handles, None).unwrap() };
        store.synchronize().unwrap();
        assert_eq!(outs, parts.to_vec());
    }
}

#[test]
fn test_poll_drains_completions() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let data = pattern(512, 1);
        unsafe { store.async_write("p", BufferHandle::from(&data[..]), None).unwrap() };
        while store.outstanding(None) > 0 {
            store.poll().unwrap();
        }
        assert_eq!(store.poll().unwrap(), 0);
    }
}

// =============================================================================
// Key Error Tests
// =============================================================================

#[test]
fn test_read_unknown_key_fails() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let mut out = vec![0u8; 8];
        let err = store.sync_read("missing", &mut out).unwrap_err();
        assert!(matches!(err, OffloadError::KeyNotFound(ref k) if k == "missing"));

        let err = unsafe { store.async_read("missing", BufferHandle::from(&mut out[..]), None) }.unwrap_err();
        assert!(matches!(err, OffloadError::KeyNotFound(_)));
        assert_eq!(store.outstanding(None), 0);
    }
}

#[test]
fn test_read_with_wrong_layout_fails() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let x = pattern(16, 1);
        let y = pattern(32, 2);
        store.sync_writev("xy", &[&x[..], &y[..]]).unwrap();

        // Swapped order
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 16];
        let err = store.sync_readv("xy", &mut [&mut a[..], &mut b[..]]).unwrap_err();
        assert!(matches!(err, OffloadError::LayoutMismatch { .. }));

        // Subset
        let mut only_x = vec![0u8; 16];
        let err = store.sync_read("xy", &mut only_x).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::LayoutMismatch { ref expected, ref actual, .. } if expected == &vec![16, 32] && actual == &vec![16]
        ));
    }
}

#[test]
fn test_empty_write_is_rejected() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let err = store.sync_write("empty", &[]).unwrap_err();
        assert!(matches!(err, OffloadError::InvalidSize(_)));
        assert!(!store.contains("empty"));
    }
}

// =============================================================================
// Space Reuse Tests
// =============================================================================

#[test]
fn test_rewrite_returns_latest_version() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        store.sync_write("k", &pattern(64, 1)).unwrap();
        store.sync_write("k", &pattern(64, 2)).unwrap();

        let mut out = vec![0u8; 64];
        store.sync_read("k", &mut out).unwrap();
        assert_eq!(out, pattern(64, 2));
    }
}

#[test]
fn test_rewrite_churn_does_not_grow_file() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        for i in 0..50u8 {
            store.sync_write("k", &pattern(1024, i)).unwrap();
        }
        // Two generations at most: the committed one and the one being written
        assert!(store.space_end() <= 2048, "space end {}", store.space_end());

        let mut out = vec![0u8; 1024];
        store.sync_read("k", &mut out).unwrap();
        assert_eq!(out, pattern(1024, 49));
    }
}

#[test]
fn test_rewrite_with_smaller_size_reuses_region() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        store.sync_write("big", &pattern(4096, 1)).unwrap();
        store.sync_write("big", &pattern(8, 2)).unwrap();
        assert_eq!(store.free_bytes(), 4096);

        store.sync_write("other", &pattern(1000, 3)).unwrap();
        assert_eq!(store.space_end(), 4096 + 8);
    }
}

#[test]
fn test_rewrite_over_limit_keeps_previous_version() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::builder()
            .data_dir(temp_dir.path())
            .backend(kind)
            .file_size_limit(100)
            .build();
        let store = OffloadStore::open(config).unwrap();

        store.sync_write("k", &pattern(60, 1)).unwrap();
        let err = store.sync_write("k", &pattern(60, 2)).unwrap_err();
        assert!(matches!(err, OffloadError::SpaceExhausted { .. }));

        let mut out = vec![0u8; 60];
        store.sync_read("k", &mut out).unwrap();
        assert_eq!(out, pattern(60, 1));
    }
}

#[test]
fn test_rewrite_during_outstanding_read() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 4);

        let first = pattern(4096, 1);
        store.sync_write("k", &first).unwrap();

        let mut out = vec![0u8; 4096];
        unsafe {
            store
                .async_read("k", BufferHandle::from(&mut out[..]), None)
                .unwrap();
        }

        // The rewrite commits while the read of the old Region may still run
        store.sync_write("k", &pattern(4096, 2)).unwrap();
        store.sync_write("other", &pattern(4096, 3)).unwrap();
        store.synchronize().unwrap();

        assert_eq!(out, first, "backend {}", kind);

        // Once everything has drained the old Region is back on the free list
        // or reused by "other", never both
        let free = store.free_bytes();
        let end = store.space_end();
        assert_eq!(end - free, 2 * 4096, "backend {}", kind);

        let mut latest = vec![0u8; 4096];
        store.sync_read("k", &mut latest).unwrap();
        assert_eq!(latest, pattern(4096, 2));
        store.sync_read("other", &mut latest).unwrap();
        assert_eq!(latest, pattern(4096, 3));
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_many_async_writes_then_synchronize() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir, kind, 8);

        let buffers: Vec<Vec<u8>> = (0..64).map(|i| pattern(2048, i)).collect();
        for (i, buf) in buffers.iter().enumerate() {
            unsafe { store.async_write(&format!("b{}", i), BufferHandle::from(&buf[..]), None).unwrap() };
        }
        store.synchronize().unwrap();
        assert_eq!(store.outstanding(None), 0);

        for (i, buf) in buffers.iter().enumerate() {
            let mut out = vec![0u8; 2048];
            store.sync_read(&format!("b{}", i), &mut out).unwrap();
            assert_eq!(&out, buf, "backend {} key b{}", kind, i);
        }
    }
}

#[test]
fn test_store_shared_across_threads() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&temp_dir, kind, 8));

        let workers: Vec<_> = (0..4u8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..20u8 {
                        let key = format!("t{}-{}", t, i);
                        let data = pattern(333, t * 20 + i);
                        store.sync_write(&key, &data).unwrap();

                        let mut out = vec![0u8; 333];
                        store.sync_read(&key, &mut out).unwrap();
                        assert_eq!(out, data);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(store.key_count(), 80);
        store.synchronize().unwrap();
    }
}
