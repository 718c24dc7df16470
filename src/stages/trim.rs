use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::error::{PipelineError, Result, SendStatus};
use crate::output::TaskOutput;
use crate::stages::{PipelineTask, TaskCore};

/// Inclusive range of frame indices. An open end keeps everything from
/// `start` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start: u64,
    #[serde(default)]
    pub end: Option<u64>,
}

impl TrimRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, frame: u64) -> bool {
        frame >= self.start && self.end.is_none_or(|end| frame <= end)
    }
}

/// True when `frame` is kept. No ranges keeps every frame.
pub fn frame_inside_range(frame: u64, ranges: &[TrimRange]) -> bool {
    ranges.is_empty() || ranges.iter().any(|r| r.contains(frame))
}

pub struct TrimTask {
    core: TaskCore,
    ranges: Vec<TrimRange>,
}

impl TrimTask {
    pub fn new(core: TaskCore, ranges: Vec<TrimRange>) -> Self {
        Self { core, ranges }
    }

    pub fn ranges(&self) -> &[TrimRange] {
        &self.ranges
    }
}

impl PipelineTask for TrimTask {
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
        let frame = self.core.count_input();
        if !frame_inside_range(frame, &self.ranges) {
            trace!(frame, "trimmed");
            return Ok(SendStatus::Done);
        }
        if input.as_surface().is_none() {
            let stage = self.core.kind().name();
            error!(stage, "invalid frame type");
            return Err(PipelineError::InvalidFrameType { stage });
        }
        self.core.push_output(input);
        Ok(SendStatus::Done)
    }
}
