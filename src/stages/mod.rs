//! Pipeline stages.
//!
//! Every stage implements [`PipelineTask`] on top of a [`TaskCore`] that
//! carries what all stages share: the kind, the bounded FIFO of outputs, the
//! optional work-surface pool and the frame counters.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::backoff::Backoff;
use crate::error::{PipelineError, Result, SendStatus};
use crate::hw::{
    BufferRequirement, DeviceContext, FrameAllocator, HwDecoder, HwEncoder, HwStatus,
    HwVideoProcessor, Submit,
};
use crate::io::{PacketStreamSink, SharedReader};
use crate::output::TaskOutput;
use crate::pipeline::{StageParameters, StageRegistry};
use crate::scheduler::StageKind;
use crate::surface::{SurfaceHandle, SurfacePool};
use crate::timestamp::{AvSyncMode, Rational, TimecodeSink, TimestampTracker};

pub mod audio;
pub mod check_pts;
pub mod compute;
pub mod decode;
pub mod encode;
pub mod input;
pub mod trim;
pub mod vpp;

pub use audio::{AudioRoute, AudioTask};
pub use check_pts::CheckPtsTask;
pub use compute::{ComputeTask, FrameFilter};
pub use decode::DecodeTask;
pub use encode::EncodeTask;
pub use input::InputTask;
pub use trim::{TrimRange, TrimTask};
pub use vpp::VppTask;

/// Bounds of every wait loop in the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Passes over a pool before a stage gives up on finding a free surface.
    pub surface_wait_iterations: u32,
    pub decode_hang_ceiling: u64,
    pub vpp_hang_ceiling: u64,
    pub encode_hang_ceiling: u64,
    pub sync_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            surface_wait_iterations: 20_000,
            decode_hang_ceiling: 1024 * 1024 * 30,
            vpp_hang_ceiling: 1024 * 1024 * 30,
            encode_hang_ceiling: 65536 * 1024 * 30,
            sync_timeout_ms: 20_000,
        }
    }
}

impl RetryPolicy {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// State shared by every stage.
pub struct TaskCore {
    kind: StageKind,
    outputs: VecDeque<TaskOutput>,
    pool: SurfacePool,
    allocator: Option<Arc<dyn FrameAllocator>>,
    in_frames: u64,
    out_frames: u64,
    queue_depth: usize,
    retry: RetryPolicy,
    backoff: Arc<dyn Backoff>,
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("kind", &self.kind)
            .field("queued", &self.outputs.len())
            .field("pool", &self.pool)
            .field("in_frames", &self.in_frames)
            .field("out_frames", &self.out_frames)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

impl TaskCore {
    pub fn new(kind: StageKind, queue_depth: usize, retry: RetryPolicy, backoff: Arc<dyn Backoff>) -> Self {
        Self {
            kind,
            outputs: VecDeque::new(),
            pool: SurfacePool::new(),
            allocator: None,
            in_frames: 0,
            out_frames: 0,
            queue_depth,
            retry,
            backoff,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn backoff(&self) -> &dyn Backoff {
        self.backoff.as_ref()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn set_queue_depth(&mut self, depth: usize) {
        self.queue_depth = depth;
    }

    pub fn queued(&self) -> usize {
        self.outputs.len()
    }

    pub fn in_frames(&self) -> u64 {
        self.in_frames
    }

    /// Count one consumed input and return the index it had.
    pub fn count_input(&mut self) -> u64 {
        let index = self.in_frames;
        self.in_frames += 1;
        index
    }

    pub fn out_frames(&self) -> u64 {
        self.out_frames
    }

    pub fn push_output(&mut self, output: TaskOutput) {
        self.outputs.push_back(output);
    }

    pub fn pool(&self) -> &SurfacePool {
        &self.pool
    }

    pub fn allocator(&self) -> Option<&dyn FrameAllocator> {
        self.allocator.as_deref()
    }

    /// (Re)build the work-surface pool. Fails while outputs are still queued
    /// or any surface of the old pool is referenced.
    pub fn allocate_pool(
        &mut self,
        request: &BufferRequirement,
        external_alloc: bool,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<()> {
        self.clear_pool()?;
        self.pool
            .allocate(request, external_alloc, Arc::clone(&allocator))
            .inspect_err(|err| error!(stage = self.kind.name(), %err, "failed to allocate work surfaces"))?;
        self.allocator = Some(allocator);
        Ok(())
    }

    pub fn clear_pool(&mut self) -> Result<()> {
        if !self.outputs.is_empty() {
            return Err(PipelineError::PoolBusy {
                detail: format!("{} outputs still queued", self.outputs.len()),
            });
        }
        self.pool.clear()?;
        self.allocator = None;
        Ok(())
    }

    /// A free surface from the own pool, waiting up to the configured budget.
    pub fn work_surface(&self) -> Result<SurfaceHandle> {
        self.pool
            .get_free_surface(self.retry.surface_wait_iterations, self.backoff.as_ref())
            .ok_or_else(|| {
                error!(stage = self.kind.name(), "failed to get work surface");
                PipelineError::NoFreeSurface {
                    stage: self.kind.name(),
                }
            })
    }

    /// Pop outputs, oldest first, until the queue is back at its depth.
    ///
    /// A failed wait leaves the queue as it was, so the caller may still
    /// flush or retry.
    pub fn drain_outputs(&mut self, sync: bool) -> Result<Vec<TaskOutput>> {
        let excess = self.outputs.len().saturating_sub(self.queue_depth);
        let mut drained = Vec::with_capacity(excess);
        for _ in 0..excess {
            let Some(mut output) = self.outputs.pop_front() else {
                break;
            };
            if sync {
                if let Err(err) = output.wait_sync(self.retry.sync_timeout()) {
                    self.outputs.push_front(output);
                    self.out_frames -= drained.len() as u64;
                    for done in drained.into_iter().rev() {
                        self.outputs.push_front(done);
                    }
                    return Err(err);
                }
            }
            self.out_frames += 1;
            drained.push(output);
        }
        Ok(drained)
    }
}

/// One stage of the pipeline.
pub trait PipelineTask: Send {
    fn core(&self) -> &TaskCore;
    fn core_mut(&mut self) -> &mut TaskCore;

    fn kind(&self) -> StageKind {
        self.core().kind()
    }

    /// Stages that neither allocate nor touch pixel data.
    fn is_pass_through(&self) -> bool {
        false
    }

    /// Pool the stage needs upstream of it. `None` means no dedicated pool.
    fn required_input(&mut self) -> Result<Option<BufferRequirement>> {
        Ok(None)
    }

    /// Pool the stage produces into. `None` means no dedicated pool.
    fn required_output(&mut self) -> Result<Option<BufferRequirement>> {
        Ok(None)
    }

    /// Consume one input, or flush with `None`.
    fn send_frame(&mut self, input: Option<TaskOutput>) -> Result<SendStatus>;

    fn drain_outputs(&mut self, sync: bool) -> Result<Vec<TaskOutput>> {
        self.core_mut().drain_outputs(sync)
    }

    fn requires_sync(&self, next: StageKind) -> bool {
        self.kind().requires_sync(next)
    }
}

/// Run `submit` until it yields something other than "warning without a
/// token", pausing between attempts. Running past `ceiling` attempts is a
/// device hang.
pub(crate) fn submit_with_retry<T>(
    stage: &'static str,
    ceiling: u64,
    backoff: &dyn Backoff,
    mut submit: impl FnMut() -> Submit<T>,
) -> Result<Submit<T>> {
    let mut attempt: u64 = 0;
    loop {
        let result = submit();
        if !(result.status.is_warning() && result.token.is_none()) {
            return Ok(result);
        }
        if attempt >= ceiling {
            error!(stage, attempts = attempt + 1, "device kept on busy, assuming hang");
            return Err(PipelineError::DeviceHang { stage });
        }
        if result.status == HwStatus::DeviceBusy {
            backoff.pause(u32::try_from(attempt).unwrap_or(u32::MAX));
        }
        attempt += 1;
    }
}

pub(crate) fn device_error(stage: &'static str, status: HwStatus) -> PipelineError {
    error!(stage, ?status, "hardware call failed");
    PipelineError::Device { stage, status }
}

/// Creates the hardware objects the decode, vpp and encode stages drive.
pub trait DeviceBackend: Send + Sync {
    fn decoder(&self, params: &StageParameters) -> anyhow::Result<Box<dyn HwDecoder>>;
    fn video_processor(&self, params: &StageParameters) -> anyhow::Result<Box<dyn HwVideoProcessor>>;
    fn encoder(&self, params: &StageParameters) -> anyhow::Result<Box<dyn HwEncoder>>;
}

/// Everything stage constructors may need besides their own parameters.
pub struct StageContext {
    pub device: DeviceContext,
    pub backend: Arc<dyn DeviceBackend>,
    pub reader: SharedReader,
    pub tracker: Arc<TimestampTracker>,
    pub retry: RetryPolicy,
    pub backoff: Arc<dyn Backoff>,
    pub source_timebase: Rational,
    pub frame_rate: Rational,
    timecode: Mutex<Option<Box<dyn TimecodeSink>>>,
}

impl StageContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: DeviceContext,
        backend: Arc<dyn DeviceBackend>,
        reader: SharedReader,
        tracker: Arc<TimestampTracker>,
        retry: RetryPolicy,
        backoff: Arc<dyn Backoff>,
        source_timebase: Rational,
        frame_rate: Rational,
    ) -> Self {
        Self {
            device,
            backend,
            reader,
            tracker,
            retry,
            backoff,
            source_timebase,
            frame_rate,
            timecode: Mutex::new(None),
        }
    }

    pub fn with_timecode(self, sink: Box<dyn TimecodeSink>) -> Self {
        Self {
            timecode: Mutex::new(Some(sink)),
            ..self
        }
    }

    /// The timecode sink goes to the first encoder that asks for it.
    pub fn take_timecode(&self) -> Option<Box<dyn TimecodeSink>> {
        self.timecode.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Internal timebase of the timestamp stage: a quarter of the nominal
    /// frame duration per tick.
    pub fn output_timebase(&self) -> Rational {
        Rational::new(self.frame_rate.den, self.frame_rate.num.saturating_mul(4))
    }

    fn core(&self, kind: StageKind, params: &mut StageParameters) -> anyhow::Result<TaskCore> {
        let depth = take_u32(params, "queue_depth")?.unwrap_or(0);
        Ok(TaskCore::new(
            kind,
            depth as usize,
            self.retry,
            Arc::clone(&self.backoff),
        ))
    }
}

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("input", |mut params, ctx| {
        let core = ctx.core(StageKind::Input, &mut params)?;
        Ok(Box::new(InputTask::new(core, Arc::clone(&ctx.reader))))
    });
    registry.register("decode", |mut params, ctx| {
        let core = ctx.core(StageKind::Decode, &mut params)?;
        let decoder = ctx.backend.decoder(&params).context("creating decoder")?;
        Ok(Box::new(DecodeTask::new(
            core,
            decoder,
            Arc::clone(&ctx.reader),
            Arc::clone(&ctx.device.session),
        )))
    });
    registry.register("vpp", |mut params, ctx| {
        let core = ctx.core(StageKind::Vpp, &mut params)?;
        let vpp = ctx
            .backend
            .video_processor(&params)
            .context("creating video processor")?;
        Ok(Box::new(VppTask::new(core, vpp, Arc::clone(&ctx.device.session))))
    });
    registry.register("check_pts", |mut params, ctx| {
        let core = ctx.core(StageKind::CheckPts, &mut params)?;
        let avsync = match take_string(&mut params, "avsync") {
            Some(mode) => serde_json::from_value::<AvSyncMode>(Value::String(mode.clone()))
                .with_context(|| format!("unknown avsync mode '{mode}'"))?,
            None => AvSyncMode::default(),
        };
        let output_timebase = ctx.output_timebase();
        let duration = crate::timestamp::rescale(1, ctx.frame_rate.inv(), output_timebase);
        Ok(Box::new(CheckPtsTask::new(
            core,
            ctx.source_timebase,
            output_timebase,
            duration,
            avsync,
            Arc::clone(&ctx.tracker),
        )))
    });
    registry.register("trim", |mut params, ctx| {
        let core = ctx.core(StageKind::Trim, &mut params)?;
        let ranges = match params.remove("ranges") {
            Some(value) => serde_json::from_value::<Vec<TrimRange>>(value)
                .context("trim 'ranges' must be a list of {start, end} objects")?,
            None => Vec::new(),
        };
        Ok(Box::new(TrimTask::new(core, ranges)))
    });
    registry.register("audio", |mut params, ctx| {
        let core = ctx.core(StageKind::Audio, &mut params)?;
        let mut task = AudioTask::new(core, Arc::clone(&ctx.reader));
        if let Some(Value::Object(tracks)) = params.remove("tracks") {
            for (track, path) in tracks {
                let track: u32 = track
                    .parse()
                    .with_context(|| format!("audio track id '{track}' is not a number"))?;
                let path = path
                    .as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("audio track {track} needs an output path"))?;
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("creating audio output {}", path.display()))?;
                task.route(track, AudioRoute::Muxer(Box::new(PacketStreamSink::new(file))));
            }
        }
        Ok(Box::new(task))
    });
    registry.register("compute", |mut params, ctx| {
        let core = ctx.core(StageKind::Compute, &mut params)?;
        Ok(Box::new(ComputeTask::new(core)))
    });
    registry.register("encode", |mut params, ctx| {
        let core = ctx.core(StageKind::Encode, &mut params)?;
        let encoder = ctx.backend.encoder(&params).context("creating encoder")?;
        let mut task = EncodeTask::new(
            core,
            encoder,
            Arc::clone(&ctx.tracker),
            Arc::clone(&ctx.device.session),
        );
        if let Some(sink) = ctx.take_timecode() {
            debug!("encoder writes timecodes");
            task = task.with_timecode(sink, Rational::hw());
        }
        Ok(Box::new(task))
    });
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|v| match v {
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

pub(crate) fn take_u32(params: &mut StageParameters, key: &str) -> anyhow::Result<Option<u32>> {
    match params.remove(key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer")),
        Some(Value::String(s)) => s
            .parse::<u32>()
            .map(Some)
            .with_context(|| format!("'{key}' must be a non-negative integer")),
        Some(other) => Err(anyhow!("'{key}' must be a non-negative integer, got {other}")),
    }
}
