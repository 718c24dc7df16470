use std::sync::Arc;

use tracing::{error, trace};

use crate::error::{PipelineError, Result, SendStatus};
use crate::hw::FRAMEDATA_ORIGINAL_TIMESTAMP;
use crate::output::TaskOutput;
use crate::stages::{PipelineTask, TaskCore};
use crate::timestamp::{AvSyncMode, Rational, TimestampTracker, rescale};

/// Rewrites frame timestamps into the hardware timebase so that the output
/// starts at zero and, under CFR, advances by exactly one frame duration per
/// frame.
///
/// All bookkeeping is in `output_timebase`. Only the timestamp written back
/// to the surface is converted to the hardware timebase.
pub struct CheckPtsTask {
    core: TaskCore,
    source_timebase: Rational,
    output_timebase: Rational,
    frame_duration: i64,
    avsync: AvSyncMode,
    tracker: Arc<TimestampTracker>,
    first: Option<i64>,
    estimated: i64,
    previous: Option<i64>,
}

impl CheckPtsTask {
    pub fn new(
        core: TaskCore,
        source_timebase: Rational,
        output_timebase: Rational,
        frame_duration: i64,
        avsync: AvSyncMode,
        tracker: Arc<TimestampTracker>,
    ) -> Self {
        Self {
            core,
            source_timebase,
            output_timebase,
            frame_duration,
            avsync,
            tracker,
            first: None,
            estimated: 0,
            previous: None,
        }
    }

    /// Last emitted timestamp, in the output timebase.
    pub fn previous(&self) -> Option<i64> {
        self.previous
    }

    fn follows_source(&self) -> bool {
        self.source_timebase.num > 0 && self.source_timebase.is_valid() && self.avsync.uses_source_timestamps()
    }
}

impl PipelineTask for CheckPtsTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn is_pass_through(&self) -> bool {
        true
    }

    fn send_frame(&mut self, input: Option<TaskOutput>) -> Result<SendStatus> {
        let Some(input) = input else {
            return Ok(SendStatus::NeedMoreInput);
        };
        let stage = self.core.kind().name();
        let (surface, sync) = input.into_surface().map_err(|_| {
            error!(stage, "invalid frame type");
            PipelineError::InvalidFrameType { stage }
        })?;

        let mut pts = self.estimated;
        if self.follows_source() {
            pts = rescale(surface.timestamp()?, self.source_timebase, self.output_timebase);
        }
        trace!(
            frame = self.core.in_frames(),
            estimated = self.estimated,
            pts,
            duration = self.frame_duration,
            "check_pts"
        );
        let first = *self.first.get_or_insert(pts);
        let pts = pts - first;

        self.core.count_input();
        self.estimated += self.frame_duration;
        self.previous = Some(pts);

        let hw = Rational::hw();
        let timestamp = rescale(pts, self.output_timebase, hw);
        {
            let mut data = surface.data()?;
            data.timestamp = timestamp;
            data.data_flag |= FRAMEDATA_ORIGINAL_TIMESTAMP;
        }
        self.tracker
            .add(timestamp, rescale(self.frame_duration, self.output_timebase, hw))?;
        self.core.push_output(TaskOutput::surface(surface, sync));
        Ok(SendStatus::Done)
    }
}
