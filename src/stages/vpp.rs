use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{PipelineError, Result, SendStatus};
use crate::hw::{BufferRequirement, HwStatus, HwVideoProcessor, SyncSession};
use crate::output::{PendingSync, TaskOutput};
use crate::stages::{PipelineTask, TaskCore, device_error, submit_with_retry};

/// Hardware video processing. One input may yield several outputs, e.g.
/// when deinterlacing doubles the frame rate.
pub struct VppTask {
    core: TaskCore,
    vpp: Box<dyn HwVideoProcessor>,
    session: Arc<dyn SyncSession>,
    requests: Option<[BufferRequirement; 2]>,
}

impl VppTask {
    pub fn new(core: TaskCore, vpp: Box<dyn HwVideoProcessor>, session: Arc<dyn SyncSession>) -> Self {
        Self {
            core,
            vpp,
            session,
            requests: None,
        }
    }

    /// Input and output requirements; the processor is asked once.
    fn query(&mut self) -> Result<[BufferRequirement; 2]> {
        if let Some(requests) = self.requests {
            return Ok(requests);
        }
        let stage = self.core.kind().name();
        let requests = self.vpp.query_io_surf().map_err(|status| {
            error!(stage, ?status, "failed to get required buffer size");
            PipelineError::Device { stage, status }
        })?;
        debug!(
            stage,
            input = requests[0].suggested_frames,
            output = requests[1].suggested_frames,
            "required buffer"
        );
        self.requests = Some(requests);
        Ok(requests)
    }
}

impl PipelineTask for VppTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn required_input(&mut self) -> Result<Option<BufferRequirement>> {
        Ok(Some(self.query()?[0]))
    }

    fn required_output(&mut self) -> Result<Option<BufferRequirement>> {
        Ok(Some(self.query()?[1]))
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
        if let Some(surface) = &input {
            self.core.count_input();
            surface.data()?.info.copy_crop_from(self.vpp.input_info());
        }

        loop {
            let out = self.core.work_surface()?;
            let vpp = &mut self.vpp;
            let result = submit_with_retry(stage, self.core.retry().vpp_hang_ceiling, self.core.backoff(), || {
                vpp.run_frame_async(input.as_deref(), &out)
            })?;

            let more_output = match result.status {
                HwStatus::MoreData if input.is_some() => false,
                HwStatus::MoreSurface => true,
                HwStatus::MoreData => return Ok(SendStatus::NeedMoreInput),
                status if status.is_error() => return Err(device_error(stage, status)),
                _ => false,
            };
            if let Some(token) = result.token {
                let sync = PendingSync::new(Arc::clone(&self.session), token);
                self.core.push_output(TaskOutput::surface(out, Some(sync)));
            }
            if !more_output {
                return Ok(SendStatus::Done);
            }
        }
    }
}
