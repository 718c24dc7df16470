//! Software device: system-memory implementations of every hardware trait,
//! so a whole pipeline runs without a GPU.
//!
//! Submissions complete synchronously; tokens are still handed out and the
//! session counts every wait so callers can check where synchronization
//! happened.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::Value;

use crate::hw::{
    AllocResponse, BufferRequirement, Codec, DecodeParams, DeviceContext, EncodeBufferParams,
    FrameAllocator, FrameInfo, HwDecoder, HwEncoder, HwStatus, HwVideoProcessor, MemId, Submit,
    SyncSession, SyncToken, TIMESTAMP_UNKNOWN,
};
use crate::output::{Bitstream, with_mapped};
use crate::pipeline::StageParameters;
use crate::stages::DeviceBackend;
use crate::surface::{FrameData, Surface, SurfaceId};

#[derive(Debug, Default)]
struct Slot {
    pixels: Vec<u8>,
    locked: bool,
}

#[derive(Debug, Default)]
pub struct SoftAllocator {
    next: AtomicU64,
    slots: Mutex<HashMap<MemId, Slot>>,
}

impl SoftAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames currently allocated.
    pub fn live_frames(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl FrameAllocator for SoftAllocator {
    fn alloc(&self, request: &BufferRequirement) -> Result<AllocResponse, HwStatus> {
        if request.info.frame_size() == 0 {
            return Err(HwStatus::InvalidParam);
        }
        let mut slots = self.slots.lock().map_err(|_| HwStatus::DeviceFailed)?;
        let mids = (0..request.suggested_frames)
            .map(|_| {
                let mid = MemId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
                slots.insert(
                    mid,
                    Slot {
                        pixels: vec![0; request.info.frame_size()],
                        locked: false,
                    },
                );
                mid
            })
            .collect();
        Ok(AllocResponse { mids })
    }

    fn free(&self, response: &AllocResponse) -> Result<(), HwStatus> {
        let mut slots = self.slots.lock().map_err(|_| HwStatus::DeviceFailed)?;
        for mid in &response.mids {
            slots.remove(mid).ok_or(HwStatus::InvalidParam)?;
        }
        Ok(())
    }

    fn lock(&self, mid: MemId, data: &mut FrameData) -> Result<(), HwStatus> {
        let mut slots = self.slots.lock().map_err(|_| HwStatus::DeviceFailed)?;
        let slot = slots.get_mut(&mid).ok_or(HwStatus::InvalidParam)?;
        if slot.locked {
            return Err(HwStatus::Unsupported);
        }
        slot.locked = true;
        data.buffer = std::mem::take(&mut slot.pixels);
        data.pitch = data.info.width;
        Ok(())
    }

    fn unlock(&self, mid: MemId, data: &mut FrameData) -> Result<(), HwStatus> {
        let mut slots = self.slots.lock().map_err(|_| HwStatus::DeviceFailed)?;
        let slot = slots.get_mut(&mid).ok_or(HwStatus::InvalidParam)?;
        if !slot.locked {
            return Err(HwStatus::Unsupported);
        }
        slot.locked = false;
        slot.pixels = std::mem::take(&mut data.buffer);
        Ok(())
    }
}

/// Tokens kept by [`SoftSession::recent_waits`].
pub const RECENT_WAITS: usize = 32;

/// Hands out tokens and counts the ones waited on.
#[derive(Debug, Default)]
pub struct SoftSession {
    next: AtomicU64,
    waited: AtomicU64,
    recent: Mutex<VecDeque<SyncToken>>,
}

impl SoftSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> SyncToken {
        let raw = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        SyncToken::new(raw).unwrap_or(SyncToken::FIRST)
    }

    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    pub fn wait_count(&self) -> u64 {
        self.waited.load(Ordering::Relaxed)
    }

    /// The last [`RECENT_WAITS`] tokens waited on, oldest first.
    pub fn recent_waits(&self) -> Vec<SyncToken> {
        self.recent
            .lock()
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl SyncSession for SoftSession {
    fn sync_operation(&self, token: SyncToken, _timeout: Duration) -> Result<(), HwStatus> {
        let mut recent = self.recent.lock().map_err(|_| HwStatus::DeviceFailed)?;
        if recent.len() == RECENT_WAITS {
            recent.pop_front();
        }
        recent.push_back(token);
        self.waited.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn read_frame(surface: &Surface, allocator: &SoftAllocator) -> Result<(Vec<u8>, i64), HwStatus> {
    let mut data = surface.data().map_err(|_| HwStatus::DeviceFailed)?;
    let timestamp = data.timestamp;
    let pixels = with_mapped(&mut data, Some(allocator as &dyn FrameAllocator), |frame| {
        Ok(frame.buffer.clone())
    })
    .map_err(|_| HwStatus::DeviceFailed)?;
    Ok((pixels, timestamp))
}

fn write_frame(surface: &Surface, allocator: &SoftAllocator, pixels: &[u8], timestamp: i64) -> Result<(), HwStatus> {
    let mut data = surface.data().map_err(|_| HwStatus::DeviceFailed)?;
    data.timestamp = timestamp;
    let size = data.info.frame_size();
    with_mapped(&mut data, Some(allocator as &dyn FrameAllocator), |frame| {
        frame.buffer.resize(size, 0);
        let n = size.min(pixels.len());
        frame.buffer[..n].copy_from_slice(&pixels[..n]);
        Ok(())
    })
    .map_err(|_| HwStatus::DeviceFailed)
}

/// One compressed unit is one raw frame.
pub struct SoftDecoder {
    params: DecodeParams,
    surfaces: u16,
    allocator: Arc<SoftAllocator>,
    session: Arc<SoftSession>,
}

impl SoftDecoder {
    pub fn new(params: DecodeParams, allocator: Arc<SoftAllocator>, session: Arc<SoftSession>) -> Self {
        Self {
            params,
            surfaces: 1,
            allocator,
            session,
        }
    }

    pub fn with_surfaces(mut self, surfaces: u16) -> Self {
        self.surfaces = surfaces;
        self
    }
}

impl HwDecoder for SoftDecoder {
    fn params(&self) -> &DecodeParams {
        &self.params
    }

    fn query_io_surf(&mut self) -> Result<BufferRequirement, HwStatus> {
        Ok(BufferRequirement::new(self.params.frame_info, self.surfaces))
    }

    fn decode_frame_async(&mut self, bitstream: Option<&mut Bitstream>, work: &Surface) -> Submit<SurfaceId> {
        let Some(bitstream) = bitstream else {
            return Submit::status(HwStatus::MoreData);
        };
        let size = self.params.frame_info.frame_size();
        if size == 0 || bitstream.len() < size {
            return Submit::status(HwStatus::MoreData);
        }
        if let Err(status) = write_frame(work, &self.allocator, &bitstream.data()[..size], bitstream.pts()) {
            return Submit::status(status);
        }
        bitstream.consume(size);
        Submit::ready(work.id(), self.session.issue())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VppMode {
    Copy,
    /// Two output frames per input; the second carries no timestamp.
    Bob,
}

pub struct SoftVpp {
    input: FrameInfo,
    output: FrameInfo,
    mode: VppMode,
    second_field: bool,
    allocator: Arc<SoftAllocator>,
    session: Arc<SoftSession>,
}

impl SoftVpp {
    pub fn new(
        input: FrameInfo,
        output: FrameInfo,
        mode: VppMode,
        allocator: Arc<SoftAllocator>,
        session: Arc<SoftSession>,
    ) -> Self {
        Self {
            input,
            output,
            mode,
            second_field: false,
            allocator,
            session,
        }
    }
}

impl HwVideoProcessor for SoftVpp {
    fn input_info(&self) -> &FrameInfo {
        &self.input
    }

    fn query_io_surf(&mut self) -> Result<[BufferRequirement; 2], HwStatus> {
        Ok([
            BufferRequirement::new(self.input, 1),
            BufferRequirement::new(self.output, 1),
        ])
    }

    fn run_frame_async(&mut self, input: Option<&Surface>, output: &Surface) -> Submit<()> {
        let Some(input) = input else {
            return Submit::status(HwStatus::MoreData);
        };
        let (pixels, timestamp) = match read_frame(input, &self.allocator) {
            Ok(frame) => frame,
            Err(status) => return Submit::status(status),
        };
        let (status, timestamp) = match (self.mode, self.second_field) {
            (VppMode::Copy, _) => (HwStatus::Ok, timestamp),
            (VppMode::Bob, false) => (HwStatus::MoreSurface, timestamp),
            (VppMode::Bob, true) => (HwStatus::Ok, TIMESTAMP_UNKNOWN),
        };
        if let Err(status) = write_frame(output, &self.allocator, &pixels, timestamp) {
            return Submit::status(status);
        }
        self.second_field = status == HwStatus::MoreSurface;
        Submit {
            status,
            output: Some(()),
            token: Some(self.session.issue()),
        }
    }
}

/// Copies frame bytes into the bitstream.
pub struct SoftEncoder {
    info: FrameInfo,
    buffer_size_kb: u32,
    frames: u64,
    allocator: Arc<SoftAllocator>,
    session: Arc<SoftSession>,
}

impl SoftEncoder {
    pub fn new(info: FrameInfo, buffer_size_kb: u32, allocator: Arc<SoftAllocator>, session: Arc<SoftSession>) -> Self {
        Self {
            info,
            buffer_size_kb,
            frames: 0,
            allocator,
            session,
        }
    }
}

impl HwEncoder for SoftEncoder {
    fn query_io_surf(&mut self) -> Result<BufferRequirement, HwStatus> {
        Ok(BufferRequirement::new(self.info, 1))
    }

    fn video_param(&self) -> Result<EncodeBufferParams, HwStatus> {
        Ok(EncodeBufferParams {
            buffer_size_kb: self.buffer_size_kb,
            brc_multiplier: 1,
        })
    }

    fn encode_frame_async(&mut self, input: Option<&Surface>, bitstream: &mut Bitstream) -> Submit<()> {
        let Some(input) = input else {
            return Submit::status(HwStatus::MoreData);
        };
        let (pixels, timestamp) = match read_frame(input, &self.allocator) {
            Ok(frame) => frame,
            Err(status) => return Submit::status(status),
        };
        if !bitstream.fill(&pixels) {
            return Submit::status(HwStatus::NotEnoughBuffer);
        }
        bitstream.set_pts(timestamp);
        bitstream.set_dts(timestamp);
        bitstream.set_keyframe(self.frames == 0);
        self.frames += 1;
        Submit::ready((), self.session.issue())
    }
}

/// Allocator, session and hardware factory sharing one software device.
#[derive(Debug, Clone)]
pub struct SoftDevice {
    pub allocator: Arc<SoftAllocator>,
    pub session: Arc<SoftSession>,
    frame_info: FrameInfo,
    codec: Codec,
}

impl SoftDevice {
    pub fn new(frame_info: FrameInfo, codec: Codec) -> Self {
        Self {
            allocator: Arc::new(SoftAllocator::new()),
            session: Arc::new(SoftSession::new()),
            frame_info,
            codec,
        }
    }

    pub fn context(&self) -> DeviceContext {
        DeviceContext {
            allocator: self.allocator.clone(),
            session: self.session.clone(),
        }
    }
}

fn param_u32(params: &StageParameters, key: &str) -> anyhow::Result<Option<u32>> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .with_context(|| format!("'{key}' must be a non-negative integer")),
        Some(other) => bail!("'{key}' must be a non-negative integer, got {other}"),
    }
}

impl DeviceBackend for SoftDevice {
    fn decoder(&self, params: &StageParameters) -> anyhow::Result<Box<dyn HwDecoder>> {
        if self.codec != Codec::Raw {
            bail!("software decoder only handles raw input, not {:?}", self.codec);
        }
        let surfaces = param_u32(params, "surfaces")?.unwrap_or(1);
        let decoder = SoftDecoder::new(
            DecodeParams {
                codec: self.codec,
                frame_info: self.frame_info,
            },
            self.allocator.clone(),
            self.session.clone(),
        )
        .with_surfaces(u16::try_from(surfaces).context("'surfaces' is too large")?);
        Ok(Box::new(decoder))
    }

    fn video_processor(&self, params: &StageParameters) -> anyhow::Result<Box<dyn HwVideoProcessor>> {
        let mode = match params.get("mode").and_then(Value::as_str) {
            None | Some("copy") => VppMode::Copy,
            Some("bob") => VppMode::Bob,
            Some(other) => bail!("unknown vpp mode '{other}', expected 'copy' or 'bob'"),
        };
        let width = param_u32(params, "width")?.unwrap_or(self.frame_info.width);
        let height = param_u32(params, "height")?.unwrap_or(self.frame_info.height);
        let output = FrameInfo::new(self.frame_info.format, width, height);
        Ok(Box::new(SoftVpp::new(
            self.frame_info,
            output,
            mode,
            self.allocator.clone(),
            self.session.clone(),
        )))
    }

    fn encoder(&self, params: &StageParameters) -> anyhow::Result<Box<dyn HwEncoder>> {
        let default_kb = u32::try_from(self.frame_info.frame_size().div_ceil(1000)).unwrap_or(u32::MAX);
        let buffer_size_kb = param_u32(params, "buffer_size_kb")?.unwrap_or(default_kb);
        Ok(Box::new(SoftEncoder::new(
            self.frame_info,
            buffer_size_kb,
            self.allocator.clone(),
            self.session.clone(),
        )))
    }
}
