//! Error taxonomy for the pipeline core.
//!
//! Stage methods never unwind across stage boundaries: every failure comes
//! back as a [`PipelineError`], while the non-failure outcomes of feeding a
//! stage ("need more input", "end of stream", ...) are reported through
//! [`SendStatus`]. Transient conditions (device busy, output buffer too
//! small) are absorbed inside the stages and never appear in either type.

use crate::hw::HwStatus;
use crate::output::PayloadKind;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Non-fatal result of [`crate::stages::PipelineTask::send_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The frame was consumed; zero or more outputs were queued.
    Done,
    /// The stage buffered the input (or is fully drained when flushing).
    NeedMoreInput,
    /// The stage has further output pending for the same input.
    MoreSurface,
    /// Upstream ran out of frames. This is graceful termination.
    EndOfStream,
}

impl SendStatus {
    /// True for the statuses that let the driver keep feeding the pipeline.
    pub fn is_continue(self) -> bool {
        matches!(self, Self::Done | Self::NeedMoreInput | Self::MoreSurface)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // ── Device ───────────────────────────────────────────────────────
    #[error("{stage}: device kept on busy past the retry ceiling, assuming device hang")]
    DeviceHang { stage: &'static str },

    #[error("{stage}: hardware call failed with {status:?}")]
    Device { stage: &'static str, status: HwStatus },

    #[error("waiting on synchronization point failed with {0:?}")]
    SyncFailed(HwStatus),

    // ── Resources ────────────────────────────────────────────────────
    #[error("{stage}: no free surface after the wait budget")]
    NoFreeSurface { stage: &'static str },

    #[error("surface pool is still in use ({detail})")]
    PoolBusy { detail: String },

    #[error("frame allocation failed with {0:?}")]
    AllocationFailed(HwStatus),

    #[error("failed to allocate output bitstream: {0}")]
    BitstreamAlloc(String),

    // ── Protocol / usage ─────────────────────────────────────────────
    #[error("{stage}: invalid frame type")]
    InvalidFrameType { stage: &'static str },

    #[error("writer expects {expected:?} output but got {actual:?}")]
    UnsupportedOutput {
        expected: PayloadKind,
        actual: PayloadKind,
    },

    #[error("writer has no output configured")]
    WriterNotInitialized,

    #[error("failed to find writer for track {track}")]
    TrackNotRouted { track: u32 },

    #[error("{stage}: hardware returned a surface outside the stage pool")]
    UnknownSurface { stage: &'static str },

    #[error("shared state lock poisoned: {0}")]
    Poisoned(&'static str),

    // ── I/O ──────────────────────────────────────────────────────────
    #[error("error in reader: {0}")]
    Reader(String),

    #[error("error in writer: {0}")]
    Writer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Configuration ────────────────────────────────────────────────
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Stable integer code for structured logs and metrics.
    ///
    /// - 1xx: device
    /// - 2xx: resources
    /// - 3xx: protocol/usage
    /// - 4xx: I/O
    /// - 5xx: configuration
    pub fn error_code(&self) -> u32 {
        match self {
            Self::DeviceHang { .. } => 100,
            Self::Device { .. } => 101,
            Self::SyncFailed(_) => 102,
            Self::NoFreeSurface { .. } => 200,
            Self::PoolBusy { .. } => 201,
            Self::AllocationFailed(_) => 202,
            Self::BitstreamAlloc(_) => 203,
            Self::InvalidFrameType { .. } => 300,
            Self::UnsupportedOutput { .. } => 301,
            Self::WriterNotInitialized => 302,
            Self::TrackNotRouted { .. } => 303,
            Self::Poisoned(_) => 304,
            Self::UnknownSurface { .. } => 305,
            Self::Reader(_) => 400,
            Self::Writer(_) => 401,
            Self::Io(_) => 402,
            Self::InvalidConfig(_) => 500,
        }
    }

    /// Fatal device failures must abort the whole pipeline and are never
    /// retried by the driver.
    pub fn is_device_fatal(&self) -> bool {
        matches!(self, Self::DeviceHang { .. } | Self::Device { .. })
    }
}
