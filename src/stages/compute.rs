use std::sync::Arc;

use tracing::error;

use crate::error::{PipelineError, Result, SendStatus};
use crate::hw::{BufferRequirement, FrameAllocator, FrameInfo};
use crate::output::{TaskOutput, with_mapped};
use crate::stages::{PipelineTask, TaskCore};
use crate::surface::FrameData;

/// Software transform of one frame into another.
pub trait FrameFilter: Send {
    fn apply(&mut self, input: &FrameData, output: &mut FrameData) -> Result<()>;
}

struct Installed {
    filter: Box<dyn FrameFilter>,
    output_info: FrameInfo,
    allocator: Arc<dyn FrameAllocator>,
}

/// Slot for GPU-compute filters. Without a filter, frames pass through.
pub struct ComputeTask {
    core: TaskCore,
    installed: Option<Installed>,
}

impl ComputeTask {
    pub fn new(core: TaskCore) -> Self {
        Self {
            core,
            installed: None,
        }
    }

    /// Run `filter` into surfaces of `output_info`. `allocator` maps input
    /// surfaces that are not permanently mapped.
    pub fn with_filter(
        mut self,
        filter: Box<dyn FrameFilter>,
        output_info: FrameInfo,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Self {
        self.installed = Some(Installed {
            filter,
            output_info,
            allocator,
        });
        self
    }
}

impl PipelineTask for ComputeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn is_pass_through(&self) -> bool {
        self.installed.is_none()
    }

    fn required_output(&mut self) -> Result<Option<BufferRequirement>> {
        Ok(self
            .installed
            .as_ref()
            .map(|installed| BufferRequirement::new(installed.output_info, 1)))
    }

    fn send_frame(&mut self, input: Option<TaskOutput>) -> Result<SendStatus> {
        let Some(input) = input else {
            return Ok(SendStatus::NeedMoreInput);
        };
        let stage = self.core.kind().name();
        let Some(source) = input.as_surface() else {
            error!(stage, "invalid frame type");
            return Err(PipelineError::InvalidFrameType { stage });
        };
        self.core.count_input();
        let Some(installed) = self.installed.as_mut() else {
            self.core.push_output(input);
            return Ok(SendStatus::Done);
        };

        let target = self.core.work_surface()?;
        {
            let mut src = source.data()?;
            let mut dst = target.data()?;
            let timestamp = src.timestamp;
            let flags = src.data_flag;
            let out_allocator = self.core.allocator();
            with_mapped(&mut src, Some(installed.allocator.as_ref()), |src| {
                with_mapped(&mut dst, out_allocator, |dst| {
                    installed.filter.apply(src, dst)?;
                    dst.timestamp = timestamp;
                    dst.data_flag = flags;
                    Ok(())
                })
            })?;
        }
        self.core.push_output(TaskOutput::surface(target, None));
        Ok(SendStatus::Done)
    }
}
