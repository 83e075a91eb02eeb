//! GPU abstraction for the layer pipeline.
//!
//! - `GpuBackend` is the seam between the pipeline and a device. Handles are
//!   opaque; the pipeline never sees a `wgpu` object.
//! - `software` rasterises every pass on the CPU with the math in
//!   [`crate::color`] and records an operation trace.
//! - `context`, `pipeline`, `uniforms` and `state` make up the `wgpu` backend:
//!   device/surface wiring, render pipelines per pass, the uniform block, and
//!   the texture table that ties them together.

mod context;
mod pipeline;
pub mod software;
mod state;
mod uniforms;

use std::fmt;

use image::RgbaImage;
use scheduler::ErrorCode;

use crate::types::{BlendMode, Quality, Rect, StylizeParams, ToneParams, Transform};

pub use software::{SoftwareBackend, TraceLog, TraceOp};
pub use state::WgpuBackend;

/// Opaque identifier for a backend texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(u64);

impl TextureHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Software,
    Wgpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    pub max_texture_dimension: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("GPU initialisation failed: {0}")]
    Init(String),
    #[error("{width}x{height} exceeds the maximum texture dimension {max}")]
    Dimension { width: u32, height: u32, max: u32 },
    #[error("allocation failed: {0}")]
    Resource(String),
    #[error("{0} is not a live texture")]
    UnknownTexture(TextureHandle),
    #[error("draw would sample {0} while rendering into it")]
    Hazard(TextureHandle),
    #[error("no presentation surface has been configured")]
    NoSurface,
    #[error("GPU operation failed: {0}")]
    Operation(String),
}

impl GpuError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GpuError::Init(_) => ErrorCode::Init,
            GpuError::Dimension { .. } => ErrorCode::Dimension,
            GpuError::Resource(_) => ErrorCode::Resource,
            GpuError::UnknownTexture(_)
            | GpuError::Hazard(_)
            | GpuError::NoSurface
            | GpuError::Operation(_) => ErrorCode::Render,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurAxis {
    Horizontal,
    Vertical,
}

/// Geometry for the placement pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub bounds: Rect,
    pub transform: Transform,
}

/// Shader program and its parameters for one fullscreen draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Program {
    /// inputs: `[source]`
    Place(Placement),
    /// inputs: `[source]`
    Blur {
        axis: BlurAxis,
        radius: f32,
        step: u32,
    },
    /// inputs: `[source]`
    Stylize { params: StylizeParams, seed: u32 },
    /// inputs: `[source]`
    Tone(ToneParams),
    /// inputs: `[base, top]` or `[base, top, mask]` when `masked`.
    Blend {
        mode: BlendMode,
        opacity: f32,
        masked: bool,
    },
}

impl Program {
    pub fn name(&self) -> &'static str {
        match self {
            Program::Place(_) => "place",
            Program::Blur { .. } => "blur",
            Program::Stylize { .. } => "stylize",
            Program::Tone(_) => "tone",
            Program::Blend { .. } => "blend",
        }
    }

    pub fn input_count(&self) -> usize {
        match self {
            Program::Blend { masked: true, .. } => 3,
            Program::Blend { masked: false, .. } => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub program: Program,
    pub inputs: &'a [TextureHandle],
    pub target: TextureHandle,
}

impl DrawCall<'_> {
    /// Rejects draws that sample their own destination or miss inputs.
    pub fn validate(&self) -> Result<(), GpuError> {
        if self.inputs.contains(&self.target) {
            return Err(GpuError::Hazard(self.target));
        }
        if self.inputs.len() != self.program.input_count() {
            return Err(GpuError::Operation(format!(
                "{} pass expects {} inputs, got {}",
                self.program.name(),
                self.program.input_count(),
                self.inputs.len()
            )));
        }
        Ok(())
    }
}

/// Identifies the frame handed to the presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStamp {
    pub generation: u64,
    pub quality: Quality,
}

/// Device operations the pipeline relies on. One instance is owned by the
/// worker thread; nothing else touches its handles.
pub trait GpuBackend: Send {
    fn kind(&self) -> BackendKind;

    fn limits(&self) -> BackendLimits;

    /// Whether the blend program implements `mode` natively.
    fn supports_blend(&self, mode: BlendMode) -> bool;

    /// Allocates a transparent render target.
    fn create_target(&mut self, width: u32, height: u32) -> Result<TextureHandle, GpuError>;

    fn upload(&mut self, pixels: &RgbaImage) -> Result<TextureHandle, GpuError>;

    fn destroy(&mut self, handle: TextureHandle);

    fn dimensions(&self, handle: TextureHandle) -> Option<(u32, u32)>;

    fn clear(&mut self, target: TextureHandle) -> Result<(), GpuError>;

    /// Resource-to-resource copy between equally sized textures.
    fn copy(&mut self, source: TextureHandle, target: TextureHandle) -> Result<(), GpuError>;

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError>;

    fn read_back(&mut self, handle: TextureHandle) -> Result<RgbaImage, GpuError>;

    /// Blits `source` to the surface, or clears it to transparent when `None`.
    fn present(&mut self, source: Option<TextureHandle>, stamp: FrameStamp)
        -> Result<(), GpuError>;

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError>;

    fn live_textures(&self) -> usize;
}

pub(crate) fn check_dimensions(
    width: u32,
    height: u32,
    limits: BackendLimits,
) -> Result<(), GpuError> {
    let max = limits.max_texture_dimension;
    if width == 0 || height == 0 || width > max || height > max {
        return Err(GpuError::Dimension { width, height, max });
    }
    Ok(())
}
