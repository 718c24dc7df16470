use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hw::{Codec, FrameInfo, PixelFormat};
use crate::pipeline::StageSpec;
use crate::stages::RetryPolicy;
use crate::timestamp::Rational;

/// One transcode run as described in YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Recipe {
    pub version: u32,
    pub input: InputSpec,
    pub pipeline: Vec<StageSpec>,
    pub output: OutputSpec,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Keep pool memory unmapped and lock it around each host access.
    #[serde(default)]
    pub external_alloc: bool,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Relative paths in the recipe resolve against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.input.path);
        resolve(&mut self.output.path);
        if let Some(timecode) = self.output.timecode.as_mut() {
            resolve(timecode);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_format")]
    pub format: PixelFormat,
    #[serde(default)]
    pub codec: Codec,
    /// Frames per second as `[num, den]`.
    #[serde(default = "default_fps")]
    pub fps: Rational,
    /// Timebase of source timestamps; the inverse frame rate when absent.
    #[serde(default)]
    pub timebase: Option<Rational>,
}

impl InputSpec {
    pub fn frame_info(&self) -> FrameInfo {
        FrameInfo::new(self.format, self.width, self.height)
    }

    pub fn source_timebase(&self) -> Rational {
        self.timebase.unwrap_or_else(|| self.fps.inv())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSpec {
    pub path: PathBuf,
    /// Optional v2 timecode file written by the encoder.
    #[serde(default)]
    pub timecode: Option<PathBuf>,
}

fn default_format() -> PixelFormat {
    PixelFormat::Nv12
}

fn default_fps() -> Rational {
    Rational::new(30, 1)
}
