use tracing::error;

use crate::error::{Result, SendStatus};
use crate::hw::BufferRequirement;
use crate::io::{ReadStatus, SharedReader, lock_reader};
use crate::output::{TaskOutput, with_mapped};
use crate::stages::{PipelineTask, TaskCore};

/// Loads raw frames from the reader into its own surfaces.
pub struct InputTask {
    core: TaskCore,
    reader: SharedReader,
}

impl InputTask {
    pub fn new(core: TaskCore, reader: SharedReader) -> Self {
        Self { core, reader }
    }
}

impl PipelineTask for InputTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    /// The reader's frame geometry, one frame suggested. Negotiation adds
    /// the queue depths on top.
    fn required_output(&mut self) -> Result<Option<BufferRequirement>> {
        let info = lock_reader(&self.reader)?.frame_info();
        Ok(info.map(|info| BufferRequirement::new(info, 1)))
    }

    fn send_frame(&mut self, _input: Option<TaskOutput>) -> Result<SendStatus> {
        let surface = self.core.work_surface()?;
        let status = {
            let mut data = surface.data()?;
            let mut reader = lock_reader(&self.reader)?;
            with_mapped(&mut data, self.core.allocator(), |frame| {
                reader.load_next_frame(Some(frame))
            })
            .inspect_err(|err| error!(%err, "error in reader"))?
        };
        match status {
            ReadStatus::Ok => {
                self.core.count_input();
                self.core.push_output(TaskOutput::surface(surface, None));
                Ok(SendStatus::Done)
            }
            ReadStatus::NeedMoreInput | ReadStatus::EndOfStream => Ok(SendStatus::EndOfStream),
        }
    }
}
