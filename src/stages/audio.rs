use std::collections::HashMap;

use tracing::{error, trace};

use crate::error::{PipelineError, Result, SendStatus};
use crate::io::{PacketSink, SharedReader, lock_reader};
use crate::output::TaskOutput;
use crate::stages::{PipelineTask, TaskCore};

/// Where packets of one track go.
pub enum AudioRoute {
    /// Straight into an output container.
    Muxer(Box<dyn PacketSink>),
    /// Into a filter that consumes the track.
    Filter(Box<dyn PacketSink>),
}

impl AudioRoute {
    fn sink(&mut self) -> &mut dyn PacketSink {
        match self {
            Self::Muxer(sink) | Self::Filter(sink) => sink.as_mut(),
        }
    }
}

/// Forwards video frames untouched and, alongside every frame, moves the
/// interleaved packets of the other tracks to their sinks.
pub struct AudioTask {
    core: TaskCore,
    reader: SharedReader,
    extra_readers: Vec<SharedReader>,
    routes: HashMap<u32, AudioRoute>,
    packets: u64,
}

impl AudioTask {
    pub fn new(core: TaskCore, reader: SharedReader) -> Self {
        Self {
            core,
            reader,
            extra_readers: Vec::new(),
            routes: HashMap::new(),
            packets: 0,
        }
    }

    /// Merge packets of a separate audio source.
    pub fn add_reader(&mut self, reader: SharedReader) {
        self.extra_readers.push(reader);
    }

    pub fn route(&mut self, track: u32, route: AudioRoute) {
        self.routes.insert(track, route);
    }

    /// Packets delivered so far.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    fn extract(&mut self) -> Result<()> {
        if self.routes.is_empty() {
            return Ok(());
        }
        let mut packets = {
            let mut reader = lock_reader(&self.reader)?;
            let limit = self.core.in_frames() + reader.dropped_frames();
            reader.stream_packets(limit)?
        };
        for extra in &self.extra_readers {
            let mut reader = lock_reader(extra)?;
            let limit = self.core.in_frames() + reader.dropped_frames();
            packets.extend(reader.stream_packets(limit)?);
        }
        for packet in &packets {
            let Some(route) = self.routes.get_mut(&packet.track_id) else {
                error!(track = packet.track_id, "failed to find writer for track");
                return Err(PipelineError::TrackNotRouted {
                    track: packet.track_id,
                });
            };
            trace!(track = packet.track_id, bytes = packet.data.len(), "routing packet");
            route.sink().write_packet(packet)?;
            self.packets += 1;
        }
        Ok(())
    }
}

impl PipelineTask for AudioTask {
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
        if input.as_surface().is_none() {
            let stage = self.core.kind().name();
            error!(stage, "invalid frame type");
            return Err(PipelineError::InvalidFrameType { stage });
        }
        self.core.count_input();
        self.extract()?;
        self.core.push_output(input);
        Ok(SendStatus::Done)
    }
}
