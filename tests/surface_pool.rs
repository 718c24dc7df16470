mod common;

use std::sync::Arc;

use bunker_transcode::backoff::InstantBackoff;
use bunker_transcode::error::PipelineError;
use bunker_transcode::hw::BufferRequirement;
use bunker_transcode::soft::SoftAllocator;
use bunker_transcode::surface::SurfacePool;

fn pool(frames: u16, external: bool) -> (SurfacePool, Arc<SoftAllocator>) {
    let allocator = Arc::new(SoftAllocator::new());
    let mut pool = SurfacePool::new();
    pool.allocate(
        &BufferRequirement::new(common::small_info(), frames),
        external,
        allocator.clone(),
    )
    .unwrap();
    (pool, allocator)
}

#[test]
fn claimed_surfaces_are_not_handed_out_twice() {
    let (pool, _allocator) = pool(2, false);
    let a = pool.try_free_surface().unwrap();
    let b = pool.try_free_surface().unwrap();
    assert!(!a.same_surface(&b));
    assert!(pool.try_free_surface().is_none());
    assert_eq!(pool.free_count(), 0);

    drop(a);
    assert_eq!(pool.free_count(), 1);
    assert!(pool.try_free_surface().is_some());
}

#[test]
fn exhausted_pool_backs_off_for_the_whole_budget() {
    let (pool, _allocator) = pool(1, false);
    let _held = pool.try_free_surface().unwrap();
    let backoff = InstantBackoff::new();
    assert!(pool.get_free_surface(7, &backoff).is_none());
    assert_eq!(backoff.pauses(), 7);
}

#[test]
fn empty_pool_returns_immediately() {
    let pool = SurfacePool::new();
    let backoff = InstantBackoff::new();
    assert!(pool.get_free_surface(100, &backoff).is_none());
    assert_eq!(backoff.pauses(), 0);
}

#[test]
fn hardware_lock_keeps_surface_busy() {
    let (pool, _allocator) = pool(1, false);
    let handle = pool.try_free_surface().unwrap();
    handle.hardware_lock();
    let id = handle.id();
    drop(handle);

    assert!(pool.try_free_surface().is_none());
    let found = pool.find_by_identity(id).unwrap();
    assert_eq!(found.app_refs(), 1);
    found.hardware_unlock();
    drop(found);
    assert!(pool.try_free_surface().is_some());
}

#[test]
fn clear_refuses_while_a_handle_is_alive() {
    let (mut pool, allocator) = pool(3, false);
    let handle = pool.try_free_surface().unwrap();
    let clone = handle.clone();
    drop(handle);

    let err = pool.clear().unwrap_err();
    assert!(matches!(err, PipelineError::PoolBusy { .. }));
    assert_eq!(pool.len(), 3);

    drop(clone);
    pool.clear().unwrap();
    assert!(pool.is_empty());
    assert_eq!(allocator.live_frames(), 0);
}

#[test]
fn external_allocation_leaves_frames_unmapped() {
    let (external, _allocator) = pool(2, true);
    let handle = external.try_free_surface().unwrap();
    let data = handle.data().unwrap();
    assert!(data.mem_id.is_some());
    assert!(data.buffer.is_empty());
    drop(data);

    let (mapped, _allocator) = pool(1, false);
    let handle = mapped.try_free_surface().unwrap();
    let data = handle.data().unwrap();
    assert!(data.mem_id.is_none());
    assert_eq!(data.buffer.len(), common::small_info().frame_size());
}

#[test]
fn dropping_the_pool_frees_its_allocation() {
    let (pool, allocator) = pool(4, false);
    assert_eq!(allocator.live_frames(), 4);
    drop(pool);
    assert_eq!(allocator.live_frames(), 0);
}
