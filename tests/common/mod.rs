#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use bunker_transcode::backoff::InstantBackoff;
use bunker_transcode::error::Result;
use bunker_transcode::hw::{FrameInfo, PixelFormat};
use bunker_transcode::io::{
    Packet, RawFrameReader, ReadStatus, Reader, SharedReader, Writer,
};
use bunker_transcode::output::{Bitstream, PayloadKind};
use bunker_transcode::pipeline::{StageParameters, StageSpec};
use bunker_transcode::soft::SoftDevice;
use bunker_transcode::stages::{RetryPolicy, StageContext};
use bunker_transcode::surface::FrameData;
use bunker_transcode::timestamp::{Rational, TimecodeSink, TimestampTracker};
use serde_json::Value;

pub const FPS: Rational = Rational::new(30, 1);

pub fn small_info() -> FrameInfo {
    FrameInfo::new(PixelFormat::Nv12, 8, 4)
}

/// `count` raw frames, frame `i` filled with byte `i`.
pub fn raw_frames(info: FrameInfo, count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|i| std::iter::repeat_n(i as u8, info.frame_size()))
        .collect()
}

pub fn raw_reader(info: FrameInfo, count: usize) -> SharedReader {
    Arc::new(Mutex::new(RawFrameReader::new(
        Cursor::new(raw_frames(info, count)),
        info,
    )))
}

pub fn spec(name: &str, params: &[(&str, Value)]) -> StageSpec {
    let mut map = StageParameters::default();
    for (key, value) in params {
        map.insert((*key).to_string(), value.clone());
    }
    StageSpec {
        stage: name.to_string(),
        params: Some(map),
    }
}

pub fn specs(names: &[&str]) -> Vec<StageSpec> {
    names.iter().map(|name| spec(name, &[])).collect()
}

pub fn context(device: &SoftDevice, reader: SharedReader, retry: RetryPolicy) -> StageContext {
    StageContext::new(
        device.context(),
        Arc::new(device.clone()),
        reader,
        Arc::new(TimestampTracker::new()),
        retry,
        Arc::new(InstantBackoff::new()),
        FPS.inv(),
        FPS,
    )
}

/// Frames with explicit timestamps plus interleaved packets of other tracks.
pub struct ScriptedReader {
    info: FrameInfo,
    frames: VecDeque<i64>,
    frames_read: u64,
    /// `(video frame index, packet)`; handed out once the frame count passes
    /// the index.
    packets: VecDeque<(u64, Packet)>,
    dropped: u64,
}

impl ScriptedReader {
    pub fn new(info: FrameInfo, timestamps: &[i64]) -> Self {
        Self {
            info,
            frames: timestamps.iter().copied().collect(),
            frames_read: 0,
            packets: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn with_packet(mut self, frame: u64, track_id: u32, data: &[u8]) -> Self {
        self.packets.push_back((
            frame,
            Packet {
                track_id,
                data: data.to_vec(),
                pts: frame as i64,
                dts: frame as i64,
                duration: 1,
            },
        ));
        self
    }

    pub fn with_dropped(mut self, dropped: u64) -> Self {
        self.dropped = dropped;
        self
    }

    pub fn shared(self) -> SharedReader {
        Arc::new(Mutex::new(self))
    }
}

impl Reader for ScriptedReader {
    fn load_next_frame(&mut self, frame: Option<&mut FrameData>) -> Result<ReadStatus> {
        let Some(frame) = frame else {
            return Ok(ReadStatus::Ok);
        };
        match self.frames.pop_front() {
            Some(timestamp) => {
                frame.buffer = vec![self.frames_read as u8; self.info.frame_size()];
                frame.timestamp = timestamp;
                self.frames_read += 1;
                Ok(ReadStatus::Ok)
            }
            None => Ok(ReadStatus::EndOfStream),
        }
    }

    fn next_compressed_unit(&mut self, bitstream: &mut Bitstream) -> Result<ReadStatus> {
        match self.frames.pop_front() {
            Some(timestamp) => {
                bitstream.append(&vec![self.frames_read as u8; self.info.frame_size()]);
                bitstream.set_pts(timestamp);
                self.frames_read += 1;
                Ok(ReadStatus::Ok)
            }
            None => Ok(ReadStatus::EndOfStream),
        }
    }

    fn stream_packets(&mut self, frame_count: u64) -> Result<Vec<Packet>> {
        let mut ready = Vec::new();
        while let Some((frame, _)) = self.packets.front() {
            if *frame >= frame_count {
                break;
            }
            if let Some((_, packet)) = self.packets.pop_front() {
                ready.push(packet);
            }
        }
        Ok(ready)
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    fn frame_info(&self) -> Option<FrameInfo> {
        Some(self.info)
    }
}

/// Keeps everything written, in order.
pub struct CollectingWriter {
    kind: Option<PayloadKind>,
    pub frames: Vec<(i64, Vec<u8>)>,
}

impl CollectingWriter {
    pub fn new(kind: PayloadKind) -> Self {
        Self {
            kind: Some(kind),
            frames: Vec::new(),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            kind: None,
            frames: Vec::new(),
        }
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.frames.iter().map(|(ts, _)| *ts).collect()
    }

    /// First byte of every frame, i.e. the source frame it came from.
    pub fn markers(&self) -> Vec<u8> {
        self.frames
            .iter()
            .map(|(_, data)| data.first().copied().unwrap_or(u8::MAX))
            .collect()
    }
}

impl Writer for CollectingWriter {
    fn output_kind(&self) -> Option<PayloadKind> {
        self.kind
    }

    fn write_surface(&mut self, frame: &FrameData) -> Result<()> {
        let size = frame.info.frame_size().min(frame.buffer.len());
        self.frames.push((frame.timestamp, frame.buffer[..size].to_vec()));
        Ok(())
    }

    fn write_bitstream(&mut self, bitstream: &Bitstream) -> Result<()> {
        self.frames.push((bitstream.pts(), bitstream.data().to_vec()));
        Ok(())
    }
}

/// Timecode sink that keeps the raw values.
#[derive(Clone, Default)]
pub struct SharedTimecodes(pub Arc<Mutex<Vec<i64>>>);

impl TimecodeSink for SharedTimecodes {
    fn write(&mut self, timestamp: i64, _timebase: Rational) -> Result<()> {
        if let Ok(mut values) = self.0.lock() {
            values.push(timestamp);
        }
        Ok(())
    }
}

/// Packet sink that keeps every packet.
#[derive(Clone, Default)]
pub struct SharedPackets(pub Arc<Mutex<Vec<Packet>>>);

impl bunker_transcode::io::PacketSink for SharedPackets {
    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if let Ok(mut packets) = self.0.lock() {
            packets.push(packet.clone());
        }
        Ok(())
    }
}
