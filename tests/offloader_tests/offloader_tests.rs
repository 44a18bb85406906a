//! Tests for DiskOffloader and PrefetchPipeline
//!
//! These tests verify:
//! - Storage is released after write-back and restored by reads
//! - Vectorized groups are keyed by their ordered membership
//! - Many concurrent async writes followed by one barrier
//! - Prefetch pipelines produce the same results as a synchronous loop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nvme_offload::pipeline::PrefetchPipeline;
use nvme_offload::{get_backends, probe_backend, BackendKind, Config, DiskOffloader, OffloadBuffer, OffloadError};
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

fn offloader(dir: &TempDir, backend: BackendKind, queue_depth: usize) -> DiskOffloader {
    let config = Config::builder()
        .data_dir(dir.path())
        .backend(backend)
        .queue_depth(queue_depth)
        .build();
    DiskOffloader::new(config).unwrap()
}

fn random_like(len: usize, seed: u32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(2654435761) ^ seed) as f32 / u32::MAX as f32)
        .collect()
}

/// Element-wise update standing in for an optimizer step
fn update(values: &mut [f32], scale: f32) {
    for v in values.iter_mut() {
        *v = *v * 0.9 + scale;
    }
}

fn update_buffer(buffer: &OffloadBuffer, scale: f32) {
    buffer
        .with_bytes_mut(|bytes| {
            for chunk in bytes.chunks_exact_mut(4) {
                let mut v = [f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])];
                update(&mut v, scale);
                chunk.copy_from_slice(&v[0].to_le_bytes());
            }
        })
        .unwrap();
}

// =============================================================================
// Buffer State Tests
// =============================================================================

#[test]
fn test_sync_write_releases_storage() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::from_f32(&random_like(4, 1));
        let x_copy = x.to_vec().unwrap();

        let err = offloader.sync_read(&x).unwrap_err();
        assert!(matches!(err, OffloadError::KeyNotFound(_)));

        offloader.sync_write(&x).unwrap();
        assert_eq!(x.storage_size(), 0);
        assert_eq!(x.nbytes(), 16);

        offloader.sync_read(&x).unwrap();
        assert_eq!(x.to_vec().unwrap(), x_copy, "backend {}", kind);
    }
}

#[test]
fn test_async_write_releases_storage_on_completion() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::from_f32(&random_like(64, 2));
        let x_copy = x.to_vec().unwrap();

        assert!(offloader.async_read(&x, None).is_err());

        offloader.async_write(&x, None).unwrap();
        offloader.sync_write_events().unwrap();
        assert!(x.is_released());

        offloader.sync_read(&x).unwrap();
        offloader.sync_read_events().unwrap();
        assert_eq!(x.to_vec().unwrap(), x_copy);
    }
}

#[test]
fn test_write_of_released_buffer_fails() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::zeroed(32);
        offloader.sync_write(&x).unwrap();

        assert!(matches!(offloader.sync_write(&x), Err(OffloadError::EmptyStorage)));
        assert!(matches!(offloader.async_write(&x, None), Err(OffloadError::EmptyStorage)));
    }
}

#[test]
fn test_depth_one_aio_all_ones() {
    if !probe_backend("aio") {
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let offloader = offloader(&temp_dir, BackendKind::Aio, 1);

    let x = OffloadBuffer::from_f32(&[1.0; 4]);
    let released_in_callback = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&released_in_callback);
    let watched = x.clone();

    offloader
        .async_write(
            &x,
            Some(Box::new(move || {
                if watched.is_released() {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            })),
        )
        .unwrap();
    offloader.synchronize().unwrap();

    assert_eq!(released_in_callback.load(Ordering::SeqCst), 1);
    assert_eq!(x.storage_size(), 0);

    offloader.sync_read(&x).unwrap();
    assert_eq!(x.to_f32().unwrap(), vec![1.0; 4]);
}

// =============================================================================
// Pinning Tests
// =============================================================================

#[test]
fn test_outstanding_read_pins_storage() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::from_vec(vec![0x5Au8; 1 << 20]);
        offloader.sync_write(&x).unwrap();

        offloader.async_read(&x, None).unwrap();
        assert!(x.is_pinned());

        assert!(matches!(x.release_storage(), Err(OffloadError::BufferBusy { .. })));
        assert!(matches!(x.materialize(), Err(OffloadError::BufferBusy { .. })));
        assert!(matches!(x.with_bytes(|_| ()), Err(OffloadError::BufferBusy { .. })));
        assert!(matches!(x.with_bytes_mut(|_| ()), Err(OffloadError::BufferBusy { .. })));
        assert!(matches!(offloader.async_read(&x, None), Err(OffloadError::BufferBusy { .. })));
        assert!(!x.is_released(), "backend {}", kind);

        offloader.synchronize().unwrap();
        assert!(!x.is_pinned());
        assert_eq!(x.to_vec().unwrap(), vec![0x5Au8; 1 << 20]);
        x.release_storage().unwrap();
        assert!(x.is_released());
    }
}

#[test]
fn test_outstanding_write_allows_reads_only() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::from_vec(vec![7u8; 4096]);
        offloader.async_write(&x, None).unwrap();

        assert_eq!(x.with_bytes(|bytes| bytes[0]).unwrap(), 7);
        assert!(matches!(x.with_bytes_mut(|_| ()), Err(OffloadError::BufferBusy { .. })));
        assert!(matches!(x.release_storage(), Err(OffloadError::BufferBusy { .. })));
        assert!(matches!(offloader.sync_read(&x), Err(OffloadError::BufferBusy { .. })));

        offloader.sync_write_events().unwrap();
        assert!(!x.is_pinned());
        assert!(x.is_released(), "backend {}", kind);
    }
}

#[test]
fn test_failed_read_unpins_storage() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::zeroed(64);
        assert!(matches!(offloader.async_read(&x, None), Err(OffloadError::KeyNotFound(_))));
        assert!(!x.is_pinned());
        x.release_storage().unwrap();
    }
}

// =============================================================================
// Vectorized Tests
// =============================================================================

#[test]
fn test_sync_vectored_group_order_matters() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::from_f32(&random_like(4, 3));
        let y = OffloadBuffer::from_f32(&random_like(8, 4));
        let (x_copy, y_copy) = (x.to_vec().unwrap(), y.to_vec().unwrap());

        assert!(offloader.sync_readv(&[x.clone(), y.clone()]).is_err());

        offloader.sync_writev(&[x.clone(), y.clone()]).unwrap();
        assert!(x.is_released() && y.is_released());

        assert!(matches!(
            offloader.sync_readv(&[x.clone()]),
            Err(OffloadError::KeyNotFound(_))
        ));
        assert!(matches!(
            offloader.sync_readv(&[y.clone(), x.clone()]),
            Err(OffloadError::KeyNotFound(_))
        ));

        offloader.sync_readv(&[x.clone(), y.clone()]).unwrap();
        assert_eq!(x.to_vec().unwrap(), x_copy);
        assert_eq!(y.to_vec().unwrap(), y_copy);
    }
}

#[test]
fn test_async_vectored_round_trip() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let x = OffloadBuffer::from_f32(&random_like(4, 5));
        let y = OffloadBuffer::from_f32(&random_like(8, 6));
        let (x_copy, y_copy) = (x.to_vec().unwrap(), y.to_vec().unwrap());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        offloader
            .async_writev(
                &[x.clone(), y.clone()],
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        offloader.sync_write_events().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(x.is_released() && y.is_released());

        assert!(offloader.async_readv(&[y.clone(), x.clone()], None).is_err());

        offloader.async_readv(&[x.clone(), y.clone()], None).unwrap();
        offloader.sync_read_events().unwrap();
        assert_eq!(x.to_vec().unwrap(), x_copy);
        assert_eq!(y.to_vec().unwrap(), y_copy);
    }
}

#[test]
fn test_many_async_writes_then_synchronize() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let buffers: Vec<OffloadBuffer> = (0..32).map(|i| OffloadBuffer::from_f32(&random_like(256, i))).collect();
        let copies: Vec<Vec<u8>> = buffers.iter().map(|b| b.to_vec().unwrap()).collect();

        for buffer in &buffers {
            offloader.async_write(buffer, None).unwrap();
        }
        offloader.synchronize().unwrap();
        assert!(buffers.iter().all(OffloadBuffer::is_released));

        for (buffer, expected) in buffers.iter().zip(&copies) {
            offloader.sync_read(buffer).unwrap();
            assert_eq!(&buffer.to_vec().unwrap(), expected, "backend {}", kind);
        }
    }
}

// =============================================================================
// Pipeline Tests
// =============================================================================

fn reference_results(inputs: &[Vec<f32>], epochs: usize) -> Vec<Vec<f32>> {
    let mut values = inputs.to_vec();
    for epoch in 0..epochs {
        for v in values.iter_mut() {
            update(v, epoch as f32 + 1.0);
        }
    }
    values
}

#[test]
fn test_prefetch_depth_two_matches_reference() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let inputs: Vec<Vec<f32>> = (0..7).map(|i| random_like(33, 100 + i)).collect();
        let buffers: Vec<OffloadBuffer> = inputs.iter().map(|v| OffloadBuffer::from_f32(v)).collect();

        let pipeline = PrefetchPipeline::new(&offloader, 2);
        pipeline.offload_all(&buffers).unwrap();

        for epoch in 0..3 {
            let scale = epoch as f32 + 1.0;
            pipeline
                .run(&buffers, |_, buffer| {
                    update_buffer(buffer, scale);
                    Ok(())
                })
                .unwrap();
            assert!(buffers.iter().all(OffloadBuffer::is_released));
        }

        let expected = reference_results(&inputs, 3);
        for (buffer, expected) in buffers.iter().zip(&expected) {
            offloader.sync_read(buffer).unwrap();
            assert_eq!(&buffer.to_f32().unwrap(), expected, "backend {}", kind);
        }
    }
}

#[test]
fn test_prefetch_depth_zero_and_large_depth() {
    for kind in usable_backends() {
        for depth in [0usize, 1, 10] {
            let temp_dir = TempDir::new().unwrap();
            let offloader = offloader(&temp_dir, kind, 2);

            let inputs: Vec<Vec<f32>> = (0..4).map(|i| random_like(16, i)).collect();
            let buffers: Vec<OffloadBuffer> = inputs.iter().map(|v| OffloadBuffer::from_f32(v)).collect();

            let pipeline = PrefetchPipeline::new(&offloader, depth);
            pipeline.offload_all(&buffers).unwrap();
            pipeline
                .run(&buffers, |_, buffer| {
                    update_buffer(buffer, 1.0);
                    Ok(())
                })
                .unwrap();

            let expected = reference_results(&inputs, 1);
            for (buffer, expected) in buffers.iter().zip(&expected) {
                offloader.sync_read(buffer).unwrap();
                assert_eq!(&buffer.to_f32().unwrap(), expected, "depth {}", depth);
            }
        }
    }
}

#[test]
fn test_prefetch_grouped_items() {
    for kind in usable_backends() {
        let temp_dir = TempDir::new().unwrap();
        let offloader = offloader(&temp_dir, kind, 4);

        let inputs: Vec<Vec<f32>> = (0..10).map(|i| random_like(12, 7 * i)).collect();
        let groups: Vec<Vec<OffloadBuffer>> = inputs
            .chunks(2)
            .map(|pair| pair.iter().map(|v| OffloadBuffer::from_f32(v)).collect())
            .collect();

        let pipeline = PrefetchPipeline::new(&offloader, 2);
        pipeline.offload_all(&groups).unwrap();

        let mut visited = Vec::new();
        pipeline
            .run(&groups, |i, group| {
                visited.push(i);
                for buffer in group {
                    update_buffer(buffer, 1.0);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(visited, vec![0, 1, 2, 3, 4]);

        let expected = reference_results(&inputs, 1);
        for (group, expected) in groups.iter().zip(expected.chunks(2)) {
            offloader.sync_readv(group).unwrap();
            for (buffer, expected) in group.iter().zip(expected) {
                assert_eq!(&buffer.to_f32().unwrap(), expected);
            }
        }
    }
}
