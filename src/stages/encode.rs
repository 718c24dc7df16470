use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::error::{PipelineError, Result, SendStatus};
use crate::hw::{BufferRequirement, HwEncoder, HwStatus, SyncSession, TIMESTAMP_UNKNOWN};
use crate::output::{Bitstream, BitstreamPool, PendingSync, TaskOutput};
use crate::stages::{PipelineTask, TaskCore, device_error, submit_with_retry};
use crate::timestamp::{Rational, TimecodeSink, TimestampTracker};

pub struct EncodeTask {
    core: TaskCore,
    encoder: Box<dyn HwEncoder>,
    tracker: Arc<TimestampTracker>,
    session: Arc<dyn SyncSession>,
    bitstreams: BitstreamPool,
    timecode: Option<(Box<dyn TimecodeSink>, Rational)>,
}

impl EncodeTask {
    pub fn new(
        core: TaskCore,
        encoder: Box<dyn HwEncoder>,
        tracker: Arc<TimestampTracker>,
        session: Arc<dyn SyncSession>,
    ) -> Self {
        Self {
            core,
            encoder,
            tracker,
            session,
            bitstreams: BitstreamPool::new(),
            timecode: None,
        }
    }

    /// Record the final timestamp of every frame, expressed in `timebase`.
    pub fn with_timecode(mut self, sink: Box<dyn TimecodeSink>, timebase: Rational) -> Self {
        self.timecode = Some((sink, timebase));
        self
    }

    pub fn bitstream_pool(&self) -> &BitstreamPool {
        &self.bitstreams
    }

    fn acquire_bitstream(&mut self) -> Result<Bitstream> {
        let encoder = &self.encoder;
        self.bitstreams.acquire_with(|| {
            let params = encoder.video_param().map_err(|status| {
                error!(?status, "failed to get required output buffer size from encoder");
                PipelineError::BitstreamAlloc(format!("encoder reported {status:?}"))
            })?;
            debug!(bytes = params.buffer_bytes(), "allocating output bitstream");
            Ok(Bitstream::with_capacity(params.buffer_bytes()))
        })
    }
}

impl PipelineTask for EncodeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn required_input(&mut self) -> Result<Option<BufferRequirement>> {
        let stage = self.core.kind().name();
        let request = self.encoder.query_io_surf().map_err(|status| {
            error!(stage, ?status, "failed to get required buffer size");
            PipelineError::Device { stage, status }
        })?;
        debug!(stage, suggested = request.suggested_frames, "required buffer");
        Ok(Some(request))
    }

    fn send_frame(&mut self, input: Option<TaskOutput>) -> Result<SendStatus> {
        let stage = self.core.kind().name();
        let input = match input {
            Some(output) => match output.into_surface() {
                Ok((surface, _)) => Some(surface),
                Err(_) => {
                    error!(stage, "invalid frame type");
                    return Err(PipelineError::InvalidFrameType { stage });
                }
            },
            None => None,
        };

        let mut bitstream = self.acquire_bitstream()?;
        if let Some(surface) = &input {
            self.core.count_input();
            bitstream.set_pts(TIMESTAMP_UNKNOWN);
            bitstream.set_dts(TIMESTAMP_UNKNOWN);
            // Frames added by the video processor arrive without a timestamp.
            let raw = surface.timestamp()?;
            let timestamp = self.tracker.check(raw)?;
            trace!(raw, timestamp, "encode timestamp");
            surface.set_timestamp(timestamp)?;
            if let Some((sink, timebase)) = self.timecode.as_mut() {
                sink.write(timestamp, *timebase)?;
            }
        }

        let ceiling = self.core.retry().encode_hang_ceiling;
        let result = loop {
            let encoder = &mut self.encoder;
            let target = &mut bitstream;
            let result = submit_with_retry(stage, ceiling, self.core.backoff(), || {
                encoder.encode_frame_async(input.as_deref(), target)
            })?;
            if result.status == HwStatus::NotEnoughBuffer && result.token.is_none() {
                let grown = (bitstream.capacity() * 3 / 2).max(bitstream.capacity() + 1);
                debug!(from = bitstream.capacity(), to = grown, "growing output bitstream");
                bitstream.extend(grown);
                continue;
            }
            break result;
        };

        match result.token {
            Some(token) => {
                let shared = self.bitstreams.share(bitstream);
                let sync = PendingSync::new(Arc::clone(&self.session), token);
                self.core.push_output(TaskOutput::bitstream(shared, Some(sync)));
            }
            None => self.bitstreams.give_back(bitstream),
        }

        match result.status {
            HwStatus::MoreData => Ok(SendStatus::NeedMoreInput),
            HwStatus::MoreSurface => Ok(SendStatus::MoreSurface),
            HwStatus::MoreBitstream => Ok(SendStatus::Done),
            status if status.is_error() && result.token.is_none() => Err(device_error(stage, status)),
            _ => Ok(SendStatus::Done),
        }
    }
}
