//! What stages hand to each other: a surface or a bitstream, plus the token
//! that has to be waited on before the payload may be read.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::hw::{FrameAllocator, SyncSession, SyncToken, TIMESTAMP_UNKNOWN};
use crate::io::Writer;
use crate::surface::{FrameData, SurfaceHandle};

/// Growable compressed-data buffer. Valid bytes live in
/// `data[offset..offset + length]`; the rest is spare capacity the hardware
/// may write into.
#[derive(Debug, Clone)]
pub struct Bitstream {
    data: Vec<u8>,
    offset: usize,
    length: usize,
    pts: i64,
    dts: i64,
    keyframe: bool,
}

impl Default for Bitstream {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl Bitstream {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            offset: 0,
            length: 0,
            pts: TIMESTAMP_UNKNOWN,
            dts: TIMESTAMP_UNKNOWN,
            keyframe: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn set_pts(&mut self, pts: i64) {
        self.pts = pts;
    }

    pub fn dts(&self) -> i64 {
        self.dts
    }

    pub fn set_dts(&mut self, dts: i64) {
        self.dts = dts;
    }

    pub fn keyframe(&self) -> bool {
        self.keyframe
    }

    pub fn set_keyframe(&mut self, keyframe: bool) {
        self.keyframe = keyframe;
    }

    /// Drop all valid bytes; capacity is kept.
    pub fn clear(&mut self) {
        self.offset = 0;
        self.length = 0;
    }

    /// Mark `n` leading bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.length);
        self.offset += n;
        self.length -= n;
        if self.length == 0 {
            self.offset = 0;
        }
    }

    /// Append bytes after the valid region, compacting and growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        if self.offset + self.length + bytes.len() > self.data.len() {
            self.data.copy_within(self.offset..self.offset + self.length, 0);
            self.offset = 0;
            let needed = self.length + bytes.len();
            if needed > self.data.len() {
                self.data.resize(needed, 0);
            }
        }
        let start = self.offset + self.length;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.length += bytes.len();
    }

    /// Replace the contents with `bytes` without growing. Returns `false` if
    /// the capacity is too small, leaving the buffer untouched.
    pub fn fill(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.data.len() {
            return false;
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.offset = 0;
        self.length = bytes.len();
        true
    }

    /// Grow the capacity to `new_capacity`, keeping the valid bytes.
    pub fn extend(&mut self, new_capacity: usize) {
        if new_capacity > self.data.len() {
            self.data.resize(new_capacity, 0);
        }
    }
}

/// Small freelist of output bitstreams. A buffer is reusable once the pool
/// holds the only reference to it, i.e. every output that carried it has
/// been written and dropped.
#[derive(Debug, Default)]
pub struct BitstreamPool {
    entries: Vec<Arc<Bitstream>>,
}

impl BitstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn idle(&self) -> usize {
        self.entries
            .iter()
            .filter(|b| Arc::strong_count(b) == 1)
            .count()
    }

    /// Take an idle buffer out of the freelist, or build one with `init`.
    pub fn acquire_with<F>(&mut self, init: F) -> Result<Bitstream>
    where
        F: FnOnce() -> Result<Bitstream>,
    {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|b| Arc::strong_count(b) == 1)
        {
            let entry = self.entries.swap_remove(idx);
            match Arc::try_unwrap(entry) {
                Ok(mut bitstream) => {
                    bitstream.clear();
                    return Ok(bitstream);
                }
                Err(entry) => self.entries.push(entry),
            }
        }
        init()
    }

    /// Publish a filled buffer: the returned reference goes into an output,
    /// the pool keeps one to recycle later.
    pub fn share(&mut self, bitstream: Bitstream) -> Arc<Bitstream> {
        let shared = Arc::new(bitstream);
        self.entries.push(Arc::clone(&shared));
        shared
    }

    /// Return a buffer that never left the stage.
    pub fn give_back(&mut self, bitstream: Bitstream) {
        self.entries.push(Arc::new(bitstream));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Surface,
    Bitstream,
}

pub enum Payload {
    Surface(SurfaceHandle),
    Bitstream(Arc<Bitstream>),
}

/// Token plus the session able to resolve it.
#[derive(Clone)]
pub struct PendingSync {
    session: Arc<dyn SyncSession>,
    token: SyncToken,
}

impl PendingSync {
    pub fn new(session: Arc<dyn SyncSession>, token: SyncToken) -> Self {
        Self { session, token }
    }

    pub fn token(&self) -> SyncToken {
        self.token
    }
}

impl fmt::Debug for PendingSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PendingSync").field(&self.token).finish()
    }
}

pub struct TaskOutput {
    payload: Payload,
    sync: Option<PendingSync>,
}

impl fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("TaskOutput");
        match &self.payload {
            Payload::Surface(handle) => dbg.field("surface", handle),
            Payload::Bitstream(bs) => dbg.field("bitstream_len", &bs.len()),
        };
        dbg.field("sync", &self.sync).finish()
    }
}

impl TaskOutput {
    pub fn surface(handle: SurfaceHandle, sync: Option<PendingSync>) -> Self {
        Self {
            payload: Payload::Surface(handle),
            sync,
        }
    }

    pub fn bitstream(bitstream: Arc<Bitstream>, sync: Option<PendingSync>) -> Self {
        Self {
            payload: Payload::Bitstream(bitstream),
            sync,
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self.payload {
            Payload::Surface(_) => PayloadKind::Surface,
            Payload::Bitstream(_) => PayloadKind::Bitstream,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn as_surface(&self) -> Option<&SurfaceHandle> {
        match &self.payload {
            Payload::Surface(handle) => Some(handle),
            Payload::Bitstream(_) => None,
        }
    }

    pub fn as_bitstream(&self) -> Option<&Arc<Bitstream>> {
        match &self.payload {
            Payload::Bitstream(bs) => Some(bs),
            Payload::Surface(_) => None,
        }
    }

    /// Split a surface output into its handle and pending token.
    pub fn into_surface(self) -> std::result::Result<(SurfaceHandle, Option<PendingSync>), Self> {
        match self.payload {
            Payload::Surface(handle) => Ok((handle, self.sync)),
            payload => Err(Self {
                payload,
                sync: self.sync,
            }),
        }
    }

    pub fn sync_token(&self) -> Option<SyncToken> {
        self.sync.as_ref().map(PendingSync::token)
    }

    pub fn is_pending(&self) -> bool {
        self.sync.is_some()
    }

    /// Block until the payload is valid. The token is cleared after the first
    /// call, so waiting again (or waiting without a token) succeeds at once.
    pub fn wait_sync(&mut self, timeout: Duration) -> Result<()> {
        let Some(pending) = self.sync.take() else {
            return Ok(());
        };
        if let Err(status) = pending.session.sync_operation(pending.token, timeout) {
            self.sync = Some(pending);
            return Err(PipelineError::SyncFailed(status));
        }
        Ok(())
    }

    /// Hand the payload to `writer`, checking that it accepts this kind.
    /// Surfaces backed by a lockable allocation are mapped for the duration
    /// of the write only.
    pub fn write(
        &self,
        writer: &mut dyn Writer,
        allocator: Option<&dyn FrameAllocator>,
    ) -> Result<()> {
        let Some(expected) = writer.output_kind() else {
            return Err(PipelineError::WriterNotInitialized);
        };
        if expected != self.kind() {
            return Err(PipelineError::UnsupportedOutput {
                expected,
                actual: self.kind(),
            });
        }
        match &self.payload {
            Payload::Bitstream(bs) => writer.write_bitstream(bs),
            Payload::Surface(handle) => {
                let mut data = handle.data()?;
                with_mapped(&mut data, allocator, |frame| writer.write_surface(frame))
            }
        }
    }
}

/// Run `f` with the frame's memory mapped. When the frame carries a memory
/// id it is locked before and unlocked after `f`, on success and on failure
/// alike; the first error wins.
pub fn with_mapped<T, F>(
    data: &mut FrameData,
    allocator: Option<&dyn FrameAllocator>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut FrameData) -> Result<T>,
{
    let Some(mid) = data.mem_id else {
        return f(data);
    };
    let allocator = allocator.ok_or_else(|| {
        PipelineError::InvalidConfig("frame needs locking but no allocator was supplied".into())
    })?;
    allocator
        .lock(mid, data)
        .map_err(PipelineError::AllocationFailed)?;
    let result = f(data);
    let unlocked = allocator
        .unlock(mid, data)
        .map_err(PipelineError::AllocationFailed);
    match (result, unlocked) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_compacts_consumed_prefix() {
        let mut bs = Bitstream::with_capacity(4);
        bs.append(&[1, 2, 3]);
        bs.consume(2);
        bs.append(&[4, 5, 6]);
        assert_eq!(bs.data(), &[3, 4, 5, 6]);
        assert_eq!(bs.capacity(), 4);
    }

    #[test]
    fn fill_refuses_oversized_payload() {
        let mut bs = Bitstream::with_capacity(2);
        assert!(!bs.fill(&[1, 2, 3]));
        assert!(bs.is_empty());
        bs.extend(3);
        assert!(bs.fill(&[1, 2, 3]));
        assert_eq!(bs.len(), 3);
    }

    #[test]
    fn pool_recycles_only_unreferenced_buffers() {
        let mut pool = BitstreamPool::new();
        let shared = pool.share(Bitstream::with_capacity(16));
        let mut built = 0;
        let fresh = pool
            .acquire_with(|| {
                built += 1;
                Ok(Bitstream::with_capacity(8))
            })
            .unwrap();
        assert_eq!(built, 1);
        assert_eq!(fresh.capacity(), 8);

        drop(shared);
        let reused = pool
            .acquire_with(|| unreachable!("idle buffer should be reused"))
            .unwrap();
        assert_eq!(reused.capacity(), 16);
        assert!(pool.is_empty());
    }
}
