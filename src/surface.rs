//! Hardware frame buffers and the per-stage pool that owns them.
//!
//! A [`Surface`] is busy while either of two counters is non-zero:
//!
//! - the hardware lock count, raised and lowered by the hardware backend
//!   while it keeps the buffer (e.g. as a reference frame), and only polled
//!   by the pipeline;
//! - the application reference count, raised by every live
//!   [`SurfaceHandle`].
//!
//! The [`SurfacePool`] is the only owner of surface storage. Handles lend a
//! surface out and never transfer ownership.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::{PipelineError, Result};
use crate::hw::{AllocResponse, BufferRequirement, FrameAllocator, FrameInfo, MemId};

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a surface, stable for the lifetime of its storage. Hardware
/// callbacks report decoded output by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    fn next() -> Self {
        Self(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Mutable per-frame state of a surface.
#[derive(Debug, Default)]
pub struct FrameData {
    pub info: FrameInfo,
    /// Backing allocation that has to be locked before host access. `None`
    /// when the memory is permanently mapped.
    pub mem_id: Option<MemId>,
    /// Host-visible pixels; empty while the memory is not mapped.
    pub buffer: Vec<u8>,
    pub pitch: u32,
    pub timestamp: i64,
    pub data_flag: u16,
}

pub struct Surface {
    id: SurfaceId,
    data: Mutex<FrameData>,
    hw_locks: AtomicU32,
    app_refs: AtomicU32,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("hw_locks", &self.hw_locks())
            .field("app_refs", &self.app_refs())
            .finish_non_exhaustive()
    }
}

impl Surface {
    fn new(data: FrameData) -> Self {
        Self {
            id: SurfaceId::next(),
            data: Mutex::new(data),
            hw_locks: AtomicU32::new(0),
            app_refs: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn data(&self) -> Result<MutexGuard<'_, FrameData>> {
        self.data
            .lock()
            .map_err(|_| PipelineError::Poisoned("surface data"))
    }

    pub fn info(&self) -> Result<FrameInfo> {
        Ok(self.data()?.info)
    }

    pub fn timestamp(&self) -> Result<i64> {
        Ok(self.data()?.timestamp)
    }

    pub fn set_timestamp(&self, timestamp: i64) -> Result<()> {
        self.data()?.timestamp = timestamp;
        Ok(())
    }

    pub fn hw_locks(&self) -> u32 {
        self.hw_locks.load(Ordering::Acquire)
    }

    pub fn app_refs(&self) -> u32 {
        self.app_refs.load(Ordering::Acquire)
    }

    /// Reusable only when neither the hardware nor the application holds it.
    pub fn is_free(&self) -> bool {
        self.hw_locks() == 0 && self.app_refs() == 0
    }

    /// Hardware backends call this while they keep the buffer.
    pub fn hardware_lock(&self) {
        self.hw_locks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn hardware_unlock(&self) {
        let _ = self
            .hw_locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Claim the surface for a new handle if it is free. The reference is
    /// taken first so two scanners cannot both win the same surface.
    fn try_claim(self: &Arc<Self>) -> Option<SurfaceHandle> {
        if self
            .app_refs
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        if self.hw_locks() != 0 {
            self.app_refs.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(SurfaceHandle {
            surface: Arc::clone(self),
        })
    }
}

/// Counted reference to one pooled surface. Cloning raises the application
/// count and dropping lowers it; "no surface" is `Option::None`.
pub struct SurfaceHandle {
    surface: Arc<Surface>,
}

impl SurfaceHandle {
    fn acquire(surface: &Arc<Surface>) -> Self {
        surface.app_refs.fetch_add(1, Ordering::AcqRel);
        Self {
            surface: Arc::clone(surface),
        }
    }

    pub fn same_surface(&self, other: &SurfaceHandle) -> bool {
        Arc::ptr_eq(&self.surface, &other.surface)
    }
}

impl Clone for SurfaceHandle {
    fn clone(&self) -> Self {
        Self::acquire(&self.surface)
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        self.surface.app_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Deref for SurfaceHandle {
    type Target = Surface;

    fn deref(&self) -> &Surface {
        &self.surface
    }
}

impl fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SurfaceHandle").field(&self.surface.id).finish()
    }
}

struct Allocation {
    allocator: Arc<dyn FrameAllocator>,
    response: AllocResponse,
}

/// Fixed-size set of surfaces owned by one stage. The size only changes
/// through [`SurfacePool::allocate`] and [`SurfacePool::clear`].
#[derive(Default)]
pub struct SurfacePool {
    surfaces: Vec<Arc<Surface>>,
    allocation: Option<Allocation>,
}

impl fmt::Debug for SurfacePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfacePool")
            .field("surfaces", &self.surfaces.len())
            .field("allocated", &self.allocation.is_some())
            .finish()
    }
}

impl SurfacePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn is_all_free(&self) -> bool {
        self.surfaces.iter().all(|s| s.is_free())
    }

    pub fn free_count(&self) -> usize {
        self.surfaces.iter().filter(|s| s.is_free()).count()
    }

    /// Release every surface and the backing allocation. Fails while any
    /// surface is still referenced.
    pub fn clear(&mut self) -> Result<()> {
        if !self.is_all_free() {
            return Err(PipelineError::PoolBusy {
                detail: format!(
                    "{} of {} surfaces still referenced",
                    self.len() - self.free_count(),
                    self.len()
                ),
            });
        }
        if let Some(allocation) = self.allocation.take() {
            allocation
                .allocator
                .free(&allocation.response)
                .map_err(PipelineError::AllocationFailed)?;
        }
        self.surfaces.clear();
        Ok(())
    }

    /// Replace the pool with `response.mids.len()` surfaces described by
    /// `request`.
    ///
    /// With `external_alloc` the surfaces keep their memory id and have to be
    /// locked around every host access; otherwise each buffer is locked once
    /// here and stays mapped until the pool is cleared.
    pub fn allocate(
        &mut self,
        request: &BufferRequirement,
        external_alloc: bool,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<()> {
        self.clear()?;
        let response = allocator
            .alloc(request)
            .map_err(PipelineError::AllocationFailed)?;
        debug!(
            requested = request.suggested_frames,
            allocated = response.mids.len(),
            "allocated work surfaces"
        );
        self.allocation = Some(Allocation {
            allocator: Arc::clone(&allocator),
            response: response.clone(),
        });

        let mut surfaces = Vec::with_capacity(response.mids.len());
        for (idx, mid) in response.mids.iter().enumerate() {
            let mut data = FrameData {
                info: request.info,
                ..FrameData::default()
            };
            if external_alloc {
                data.mem_id = Some(*mid);
            } else {
                allocator.lock(*mid, &mut data).map_err(|status| {
                    warn!(frame = idx, ?status, "failed to lock frame");
                    PipelineError::AllocationFailed(status)
                })?;
            }
            surfaces.push(Arc::new(Surface::new(data)));
        }
        self.surfaces = surfaces;
        Ok(())
    }

    /// One pass over the pool.
    pub fn try_free_surface(&self) -> Option<SurfaceHandle> {
        self.surfaces.iter().find_map(|s| s.try_claim())
    }

    /// Scan for a free surface, backing off between scans, for at most
    /// `wait_iterations` passes. `None` after the budget means exhaustion; an
    /// empty pool returns `None` immediately.
    pub fn get_free_surface(
        &self,
        wait_iterations: u32,
        backoff: &dyn Backoff,
    ) -> Option<SurfaceHandle> {
        if self.surfaces.is_empty() {
            return None;
        }
        for i in 0..wait_iterations.max(1) {
            if let Some(handle) = self.try_free_surface() {
                return Some(handle);
            }
            backoff.pause(i);
        }
        None
    }

    /// Resolve a surface reported back by the hardware into a new handle.
    pub fn find_by_identity(&self, id: SurfaceId) -> Option<SurfaceHandle> {
        self.surfaces
            .iter()
            .find(|s| s.id == id)
            .map(SurfaceHandle::acquire)
    }
}

impl Drop for SurfacePool {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take()
            && let Err(status) = allocation.allocator.free(&allocation.response)
        {
            warn!(?status, "failed to free surface pool allocation");
        }
    }
}
