mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bunker_transcode::backoff::InstantBackoff;
use bunker_transcode::error::PipelineError;
use bunker_transcode::hw::{BufferRequirement, FrameAllocator, HwStatus, SyncSession, SyncToken};
use bunker_transcode::output::{PendingSync, TaskOutput};
use bunker_transcode::scheduler::StageKind;
use bunker_transcode::soft::{SoftAllocator, SoftSession};
use bunker_transcode::stages::{RetryPolicy, TaskCore};

fn core_with_pool(depth: usize, frames: u16) -> TaskCore {
    let mut core = TaskCore::new(
        StageKind::Vpp,
        depth,
        RetryPolicy::default(),
        Arc::new(InstantBackoff::new()),
    );
    let allocator: Arc<dyn FrameAllocator> = Arc::new(SoftAllocator::new());
    core.allocate_pool(
        &BufferRequirement::new(common::small_info(), frames),
        false,
        allocator,
    )
    .unwrap();
    core
}

fn push_numbered(core: &mut TaskCore, session: &Arc<SoftSession>, count: i64) {
    for n in 0..count {
        let surface = core.work_surface().unwrap();
        surface.set_timestamp(n).unwrap();
        let token = session.issue();
        let sync = PendingSync::new(session.clone() as Arc<dyn SyncSession>, token);
        core.push_output(TaskOutput::surface(surface, Some(sync)));
    }
}

fn timestamps(outputs: &[TaskOutput]) -> Vec<i64> {
    outputs
        .iter()
        .map(|o| o.as_surface().unwrap().timestamp().unwrap())
        .collect()
}

#[test]
fn drain_keeps_queue_at_depth_oldest_first() {
    let session = Arc::new(SoftSession::new());
    let mut core = core_with_pool(2, 4);
    push_numbered(&mut core, &session, 3);

    let drained = core.drain_outputs(false).unwrap();
    assert_eq!(timestamps(&drained), vec![0]);
    assert_eq!(core.queued(), 2);
    assert_eq!(core.out_frames(), 1);
    assert!(drained[0].is_pending());

    assert!(core.drain_outputs(false).unwrap().is_empty());

    core.set_queue_depth(0);
    let rest = core.drain_outputs(false).unwrap();
    assert_eq!(timestamps(&rest), vec![1, 2]);
    assert_eq!(core.out_frames(), 3);
}

#[test]
fn drain_with_sync_waits_on_every_token() {
    let session = Arc::new(SoftSession::new());
    let mut core = core_with_pool(0, 2);
    push_numbered(&mut core, &session, 2);

    let drained = core.drain_outputs(true).unwrap();
    assert_eq!(drained.len(), 2);
    assert!(drained.iter().all(|o| !o.is_pending()));
    assert_eq!(session.wait_count(), 2);
}

/// Fails the `fail_at`-th wait (zero based), once.
#[derive(Debug)]
struct FlakySession {
    calls: AtomicU64,
    fail_at: u64,
}

impl SyncSession for FlakySession {
    fn sync_operation(&self, _token: SyncToken, _timeout: Duration) -> Result<(), HwStatus> {
        if self.calls.fetch_add(1, Ordering::Relaxed) == self.fail_at {
            return Err(HwStatus::DeviceFailed);
        }
        Ok(())
    }
}

#[test]
fn failed_wait_puts_every_popped_output_back() {
    let tokens = Arc::new(SoftSession::new());
    let flaky: Arc<dyn SyncSession> = Arc::new(FlakySession {
        calls: AtomicU64::new(0),
        fail_at: 1,
    });
    let mut core = core_with_pool(0, 3);
    for n in 0..3 {
        let surface = core.work_surface().unwrap();
        surface.set_timestamp(n).unwrap();
        let sync = PendingSync::new(flaky.clone(), tokens.issue());
        core.push_output(TaskOutput::surface(surface, Some(sync)));
    }

    let err = core.drain_outputs(true).unwrap_err();
    assert!(matches!(err, PipelineError::SyncFailed(HwStatus::DeviceFailed)));
    assert_eq!(core.queued(), 3);
    assert_eq!(core.out_frames(), 0);

    let drained = core.drain_outputs(true).unwrap();
    assert_eq!(timestamps(&drained), vec![0, 1, 2]);
    assert!(drained.iter().all(|o| !o.is_pending()));
    assert_eq!(core.out_frames(), 3);
}

#[test]
fn pool_cannot_be_cleared_with_queued_outputs() {
    let session = Arc::new(SoftSession::new());
    let mut core = core_with_pool(1, 2);
    push_numbered(&mut core, &session, 1);

    let err = core.clear_pool().unwrap_err();
    assert!(matches!(err, PipelineError::PoolBusy { .. }));

    core.set_queue_depth(0);
    drop(core.drain_outputs(false).unwrap());
    core.clear_pool().unwrap();
    assert!(core.pool().is_empty());
}

#[test]
fn exhausted_work_pool_reports_the_stage() {
    let core = core_with_pool(0, 1);
    let _held = core.work_surface().unwrap();
    let err = core.work_surface().unwrap_err();
    assert!(matches!(err, PipelineError::NoFreeSurface { stage: "MFXVPP" }));
}
