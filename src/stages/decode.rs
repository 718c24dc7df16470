use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{PipelineError, Result, SendStatus};
use crate::hw::{
    BufferRequirement, Codec, FRAMEDATA_ORIGINAL_TIMESTAMP, HwDecoder, HwStatus, NO_PTS,
    PixelFormat, SyncSession, TIMESTAMP_UNKNOWN,
};
use crate::io::{ReadStatus, SharedReader, lock_reader};
use crate::output::{Bitstream, PendingSync, TaskOutput};
use crate::stages::{PipelineTask, TaskCore, device_error, submit_with_retry};

/// Bytes left unread by the decoder below this are only worth a debug line.
const DISCARD_WARN_BYTES: usize = 10;

pub struct DecodeTask {
    core: TaskCore,
    decoder: Box<dyn HwDecoder>,
    reader: SharedReader,
    session: Arc<dyn SyncSession>,
    get_next: bool,
    pending: Bitstream,
}

impl DecodeTask {
    pub fn new(
        core: TaskCore,
        decoder: Box<dyn HwDecoder>,
        reader: SharedReader,
        session: Arc<dyn SyncSession>,
    ) -> Self {
        Self {
            core,
            decoder,
            reader,
            session,
            get_next: true,
            pending: Bitstream::default(),
        }
    }

    /// Bytes buffered for the decoder but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Pull the next compressed unit. Returns `false` once the reader is at
    /// end of stream.
    fn refill(&mut self) -> Result<bool> {
        let mut reader = lock_reader(&self.reader)?;
        reader
            .load_next_frame(None)
            .inspect_err(|err| error!(%err, "error in reader"))?;
        match reader
            .next_compressed_unit(&mut self.pending)
            .inspect_err(|err| error!(%err, "error on getting video bitstream"))?
        {
            ReadStatus::EndOfStream => Ok(false),
            ReadStatus::Ok | ReadStatus::NeedMoreInput => Ok(true),
        }
    }
}

impl PipelineTask for DecodeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn required_output(&mut self) -> Result<Option<BufferRequirement>> {
        let request = self.decoder.query_io_surf().map_err(|status| {
            error!(stage = self.core.kind().name(), ?status, "failed to get required buffer size");
            PipelineError::Device {
                stage: self.core.kind().name(),
                status,
            }
        })?;
        debug!(
            stage = self.core.kind().name(),
            suggested = request.suggested_frames,
            memory = ?request.memory,
            "required buffer"
        );
        Ok(Some(request))
    }

    fn send_frame(&mut self, _input: Option<TaskOutput>) -> Result<SendStatus> {
        let stage = self.core.kind().name();
        if self.get_next && self.pending.len() <= 1 && !self.refill()? {
            self.get_next = false;
            return Ok(SendStatus::EndOfStream);
        }
        self.get_next |= !self.pending.is_empty();

        let work = self.core.work_surface()?;
        let params = *self.decoder.params();
        {
            let mut data = work.data()?;
            if params.frame_info.format == PixelFormat::Unknown {
                data.info.copy_crop_from(&params.frame_info);
            }
            if matches!(params.codec, Codec::Vp8 | Codec::Vp9)
                && (data.info.bit_depth_luma == 0 || data.info.bit_depth_chroma == 0)
            {
                data.info.bit_depth_luma = params.frame_info.bit_depth_luma;
                data.info.bit_depth_chroma = params.frame_info.bit_depth_chroma;
            }
            data.timestamp = TIMESTAMP_UNKNOWN;
            data.data_flag |= FRAMEDATA_ORIGINAL_TIMESTAMP;
        }
        let feed = self.get_next;
        if feed {
            if self.pending.pts() == NO_PTS {
                self.pending.set_pts(TIMESTAMP_UNKNOWN);
            }
            self.pending.set_dts(TIMESTAMP_UNKNOWN);
        }
        self.core.count_input();

        let mut len_before = 0;
        let decoder = &mut self.decoder;
        let pending = &mut self.pending;
        let result = submit_with_retry(stage, self.core.retry().decode_hang_ceiling, self.core.backoff(), || {
            len_before = if feed { pending.len() } else { 0 };
            let bitstream = if feed { Some(&mut *pending) } else { None };
            decoder.decode_frame_async(bitstream, &work)
        })?;

        if let (Some(id), Some(token)) = (result.output, result.token) {
            let surface = self
                .core
                .pool()
                .find_by_identity(id)
                .ok_or(PipelineError::UnknownSurface { stage })?;
            let sync = PendingSync::new(Arc::clone(&self.session), token);
            self.core.push_output(TaskOutput::surface(surface, Some(sync)));
            return Ok(match result.status {
                HwStatus::MoreSurface => SendStatus::MoreSurface,
                _ => SendStatus::Done,
            });
        }

        match result.status {
            HwStatus::MoreData => {
                // The decoder may refuse a unit without reading any of it;
                // drop the bytes so the next call makes progress.
                if feed && len_before > 0 && self.pending.len() == len_before {
                    if len_before >= DISCARD_WARN_BYTES {
                        warn!(bytes = len_before, "removing bytes from input bitstream not read by decoder");
                    } else {
                        debug!(bytes = len_before, "removing bytes from input bitstream not read by decoder");
                    }
                    self.pending.clear();
                }
                Ok(SendStatus::NeedMoreInput)
            }
            HwStatus::MoreSurface => Ok(SendStatus::MoreSurface),
            status if status.is_error() => Err(device_error(stage, status)),
            _ => Ok(SendStatus::Done),
        }
    }
}
