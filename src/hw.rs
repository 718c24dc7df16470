//! Boundary with the hardware acceleration session.
//!
//! The pipeline core never decodes, encodes or scales anything itself. It
//! talks to the hardware through the traits in this module:
//!
//! - [`FrameAllocator`] hands out frame memory sized from a
//!   [`BufferRequirement`] and maps it in and out of host-visible memory.
//! - [`SyncSession`] blocks on a [`SyncToken`] returned by an asynchronous
//!   submission.
//! - [`HwDecoder`], [`HwVideoProcessor`] and [`HwEncoder`] are the three
//!   asynchronous submit entry points. Each returns a [`Submit`] carrying a
//!   status, an optional output and an optional token, and none of them
//!   blocks on completion.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::output::Bitstream;
use crate::surface::{FrameData, Surface, SurfaceId};

/// Timestamp value meaning "let the hardware work it out".
pub const TIMESTAMP_UNKNOWN: i64 = -1;
/// Timestamp value used by demuxers for packets without a pts.
pub const NO_PTS: i64 = i64::MIN;
/// Clock rate of timestamps stored on surfaces handed to the hardware.
pub const HW_TIMEBASE: i32 = 90_000;
/// Frame data flag: the timestamp on the surface is authoritative.
pub const FRAMEDATA_ORIGINAL_TIMESTAMP: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Unknown,
    Nv12,
    P010,
    Yv12,
    Yuy2,
    Rgb4,
}

impl PixelFormat {
    /// Bytes needed for one tightly packed frame.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Unknown => 0,
            Self::Nv12 | Self::Yv12 => pixels * 3 / 2,
            Self::P010 => pixels * 3,
            Self::Yuy2 => pixels * 2,
            Self::Rgb4 => pixels * 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Raw,
    H264,
    Hevc,
    Mpeg2,
    Vc1,
    Vp8,
    Vp9,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CropRect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

/// Pixel-format and geometry descriptor of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FrameInfo {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub crop: CropRect,
    pub bit_depth_luma: u16,
    pub bit_depth_chroma: u16,
}

impl FrameInfo {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let depth = if format == PixelFormat::P010 { 10 } else { 8 };
        Self {
            format,
            width,
            height,
            crop: CropRect {
                x: 0,
                y: 0,
                w: u16::try_from(width).unwrap_or(u16::MAX),
                h: u16::try_from(height).unwrap_or(u16::MAX),
            },
            bit_depth_luma: depth,
            bit_depth_chroma: depth,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Copy only the crop window of `src`, leaving geometry and format alone.
    pub fn copy_crop_from(&mut self, src: &FrameInfo) {
        self.crop = src.crop;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    #[default]
    System,
    Video,
}

/// What an operation needs from its frame pool. Opaque to the core apart from
/// the count and the frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferRequirement {
    pub info: FrameInfo,
    pub min_frames: u16,
    pub suggested_frames: u16,
    pub memory: MemoryKind,
}

impl BufferRequirement {
    pub fn new(info: FrameInfo, suggested_frames: u16) -> Self {
        Self {
            info,
            min_frames: suggested_frames,
            suggested_frames,
            memory: MemoryKind::System,
        }
    }
}

/// Handle of one backing allocation inside the hardware allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemId(pub u64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocResponse {
    pub mids: Vec<MemId>,
}

/// Opaque handle of a pending asynchronous hardware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncToken(NonZeroU64);

impl SyncToken {
    pub const FIRST: SyncToken = SyncToken(NonZeroU64::MIN);

    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

/// Status reported by hardware calls.
///
/// `DeviceBusy` and `Warning` are the positive (warning) statuses; everything
/// from `MoreData` down is an error status, although `MoreData`,
/// `MoreSurface`, `MoreBitstream` and `NotEnoughBuffer` are part of normal
/// operation and handled by the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwStatus {
    Ok,
    DeviceBusy,
    Warning(i32),
    MoreData,
    MoreSurface,
    MoreBitstream,
    NotEnoughBuffer,
    NotInitialized,
    InvalidParam,
    Unsupported,
    DeviceFailed,
    Failed(i32),
}

impl HwStatus {
    pub fn is_warning(self) -> bool {
        matches!(self, Self::DeviceBusy | Self::Warning(_))
    }

    pub fn is_error(self) -> bool {
        !matches!(self, Self::Ok) && !self.is_warning()
    }
}

/// Result of one asynchronous submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit<T> {
    pub status: HwStatus,
    pub output: Option<T>,
    pub token: Option<SyncToken>,
}

impl<T> Submit<T> {
    pub fn ready(output: T, token: SyncToken) -> Self {
        Self {
            status: HwStatus::Ok,
            output: Some(output),
            token: Some(token),
        }
    }

    pub fn status(status: HwStatus) -> Self {
        Self {
            status,
            output: None,
            token: None,
        }
    }

    /// Busy with nothing submitted: the caller has to retry.
    pub fn busy() -> Self {
        Self::status(HwStatus::DeviceBusy)
    }
}

/// Frame memory provider of the hardware session.
pub trait FrameAllocator: Send + Sync + fmt::Debug {
    fn alloc(&self, request: &BufferRequirement) -> Result<AllocResponse, HwStatus>;
    fn free(&self, response: &AllocResponse) -> Result<(), HwStatus>;
    /// Map `mid` into `data` so the host can read or write the pixels.
    fn lock(&self, mid: MemId, data: &mut FrameData) -> Result<(), HwStatus>;
    fn unlock(&self, mid: MemId, data: &mut FrameData) -> Result<(), HwStatus>;
}

/// Blocking completion wait for asynchronous submissions.
pub trait SyncSession: Send + Sync + fmt::Debug {
    fn sync_operation(&self, token: SyncToken, timeout: Duration) -> Result<(), HwStatus>;
}

/// The two session-wide services every stage may need.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub allocator: Arc<dyn FrameAllocator>,
    pub session: Arc<dyn SyncSession>,
}

/// Decoder parameters the decode stage needs to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeParams {
    pub codec: Codec,
    pub frame_info: FrameInfo,
}

pub trait HwDecoder: Send {
    fn params(&self) -> &DecodeParams;
    fn query_io_surf(&mut self) -> Result<BufferRequirement, HwStatus>;
    /// Submit `bitstream` (or `None` to drain) using `work` as the target.
    ///
    /// The output is the identity of the surface holding the decoded frame,
    /// which may differ from `work`. The decoder advances the bitstream's
    /// offset by the number of bytes it consumed.
    fn decode_frame_async(
        &mut self,
        bitstream: Option<&mut Bitstream>,
        work: &Surface,
    ) -> Submit<SurfaceId>;
}

pub trait HwVideoProcessor: Send {
    /// Frame descriptor of the processor's input side.
    fn input_info(&self) -> &FrameInfo;
    /// Requirements for the input (`[0]`) and output (`[1]`) pools, obtained
    /// from one combined query.
    fn query_io_surf(&mut self) -> Result<[BufferRequirement; 2], HwStatus>;
    fn run_frame_async(&mut self, input: Option<&Surface>, output: &Surface) -> Submit<()>;
}

/// Encoder-reported output buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeBufferParams {
    pub buffer_size_kb: u32,
    pub brc_multiplier: u16,
}

impl EncodeBufferParams {
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_size_kb as usize * 1000 * usize::from(self.brc_multiplier.max(1))
    }
}

pub trait HwEncoder: Send {
    fn query_io_surf(&mut self) -> Result<BufferRequirement, HwStatus>;
    fn video_param(&self) -> Result<EncodeBufferParams, HwStatus>;
    fn encode_frame_async(&mut self, input: Option<&Surface>, bitstream: &mut Bitstream)
    -> Submit<()>;
}
