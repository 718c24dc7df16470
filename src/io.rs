//! Reader and writer boundaries of the pipeline, plus the raw-file
//! implementations the CLI runs with.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::hw::FrameInfo;
use crate::output::{Bitstream, PayloadKind};
use crate::surface::FrameData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    NeedMoreInput,
    EndOfStream,
}

/// One demuxed non-video packet, routed by track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub track_id: u32,
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
}

pub trait Reader: Send {
    /// Load the next raw frame into `frame`. With `None` the reader only
    /// advances its demuxer.
    fn load_next_frame(&mut self, frame: Option<&mut FrameData>) -> Result<ReadStatus>;

    /// Append the next compressed unit to `bitstream`.
    fn next_compressed_unit(&mut self, bitstream: &mut Bitstream) -> Result<ReadStatus>;

    /// Packets of other tracks belonging to the first `frame_count` video
    /// frames that have not been handed out yet.
    fn stream_packets(&mut self, frame_count: u64) -> Result<Vec<Packet>> {
        let _ = frame_count;
        Ok(Vec::new())
    }

    /// Frames the source dropped before they reached the pipeline.
    fn dropped_frames(&self) -> u64 {
        0
    }

    /// Geometry of the frames `load_next_frame` produces, if known.
    fn frame_info(&self) -> Option<FrameInfo> {
        None
    }
}

pub type SharedReader = Arc<Mutex<dyn Reader>>;

pub fn lock_reader(reader: &SharedReader) -> Result<std::sync::MutexGuard<'_, dyn Reader + 'static>> {
    reader.lock().map_err(|_| PipelineError::Poisoned("reader"))
}

pub trait Writer: Send {
    /// `None` when the writer has no output configured.
    fn output_kind(&self) -> Option<PayloadKind>;
    fn write_surface(&mut self, frame: &FrameData) -> Result<()>;
    fn write_bitstream(&mut self, bitstream: &Bitstream) -> Result<()>;
}

pub trait PacketSink: Send {
    fn write_packet(&mut self, packet: &Packet) -> Result<()>;
}

/// Fixed-size raw frames read back to back from a byte stream. Each frame is
/// also offered as one compressed unit, which is what the software decoder
/// expects for `Codec::Raw`.
pub struct RawFrameReader<R: Read + Send> {
    source: R,
    info: FrameInfo,
    next_index: i64,
    finished: bool,
}

impl<R: Read + Send> RawFrameReader<R> {
    pub fn new(source: R, info: FrameInfo) -> Self {
        Self {
            source,
            info,
            next_index: 0,
            finished: false,
        }
    }

    pub fn frames_read(&self) -> i64 {
        self.next_index
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        let size = self.info.frame_size();
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(PipelineError::Reader(err.to_string())),
            }
        }
        if filled < size || size == 0 {
            if filled > 0 {
                warn!(
                    bytes = filled,
                    expected = size,
                    "dropping truncated trailing frame"
                );
            }
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(buf))
    }
}

impl<R: Read + Send> Reader for RawFrameReader<R> {
    fn load_next_frame(&mut self, frame: Option<&mut FrameData>) -> Result<ReadStatus> {
        let Some(frame) = frame else {
            return Ok(ReadStatus::Ok);
        };
        match self.read_frame()? {
            Some(pixels) => {
                frame.buffer = pixels;
                frame.timestamp = self.next_index;
                self.next_index += 1;
                Ok(ReadStatus::Ok)
            }
            None => Ok(ReadStatus::EndOfStream),
        }
    }

    fn next_compressed_unit(&mut self, bitstream: &mut Bitstream) -> Result<ReadStatus> {
        match self.read_frame()? {
            Some(unit) => {
                bitstream.append(&unit);
                bitstream.set_pts(self.next_index);
                self.next_index += 1;
                Ok(ReadStatus::Ok)
            }
            None => Ok(ReadStatus::EndOfStream),
        }
    }

    fn frame_info(&self) -> Option<FrameInfo> {
        Some(self.info)
    }
}

/// Writes payload bytes of one kind to a byte sink.
pub struct StreamWriter<W: Write + Send> {
    out: W,
    kind: PayloadKind,
    frames: u64,
    bytes: u64,
}

impl<W: Write + Send> StreamWriter<W> {
    pub fn new(out: W, kind: PayloadKind) -> Self {
        Self {
            out,
            kind,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .map_err(|err| PipelineError::Writer(err.to_string()))?;
        self.frames += 1;
        self.bytes += bytes.len() as u64;
        Ok(())
    }
}

impl<W: Write + Send> Writer for StreamWriter<W> {
    fn output_kind(&self) -> Option<PayloadKind> {
        Some(self.kind)
    }

    fn write_surface(&mut self, frame: &FrameData) -> Result<()> {
        let size = frame.info.frame_size().min(frame.buffer.len());
        self.emit(&frame.buffer[..size])
    }

    fn write_bitstream(&mut self, bitstream: &Bitstream) -> Result<()> {
        self.emit(bitstream.data())
    }
}

/// Appends packet payloads of one track to a byte sink.
pub struct PacketStreamSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> PacketStreamSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> PacketSink for PacketStreamSink<W> {
    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.out
            .write_all(&packet.data)
            .map_err(|err| PipelineError::Writer(err.to_string()))
    }
}
