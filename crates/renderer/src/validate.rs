use renderconfig::RenderConfig;

use crate::gpu::BackendLimits;
use crate::types::{StylizeParams, ToneParams, Transform};

/// Clamps caller-supplied numbers before they reach a shader.
///
/// Every numeric filter parameter passes through here first. Implementations
/// must be pure: the same input always yields the same output.
pub trait ParamValidator: Send + Sync {
    fn blur_radius(&self, radius: f32, limits: &BackendLimits) -> f32;

    /// Rejects dimensions the device cannot allocate.
    fn dimensions(&self, width: u32, height: u32, limits: &BackendLimits) -> Result<(), String>;

    fn opacity(&self, percent: f32) -> f32;

    fn transform(&self, transform: Transform) -> Transform;

    fn stylize(&self, params: StylizeParams) -> StylizeParams;

    fn tone(&self, params: ToneParams) -> ToneParams;
}

/// Default validator bounded by the device limits and the render config.
#[derive(Debug, Clone)]
pub struct LimitsValidator {
    max_blur_radius: f32,
}

impl LimitsValidator {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            max_blur_radius: config.max_blur_radius,
        }
    }
}

impl Default for LimitsValidator {
    fn default() -> Self {
        Self::new(&RenderConfig::default())
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

impl ParamValidator for LimitsValidator {
    fn blur_radius(&self, radius: f32, limits: &BackendLimits) -> f32 {
        let device_cap = (limits.max_texture_dimension / 2) as f32;
        finite_or(radius, 0.0).clamp(0.0, self.max_blur_radius.min(device_cap))
    }

    fn dimensions(&self, width: u32, height: u32, limits: &BackendLimits) -> Result<(), String> {
        let max = limits.max_texture_dimension;
        if width == 0 || height == 0 {
            return Err(format!("{width}x{height} has no area"));
        }
        if width > max || height > max {
            return Err(format!(
                "{width}x{height} exceeds the maximum texture dimension {max}"
            ));
        }
        Ok(())
    }

    fn opacity(&self, percent: f32) -> f32 {
        finite_or(percent, 100.0).clamp(0.0, 100.0)
    }

    fn transform(&self, transform: Transform) -> Transform {
        Transform {
            scale: finite_or(transform.scale, 1.0).clamp(0.01, 100.0),
            rotation_deg: finite_or(transform.rotation_deg, 0.0) % 360.0,
            ..transform
        }
    }

    fn stylize(&self, params: StylizeParams) -> StylizeParams {
        StylizeParams {
            vintage: finite_or(params.vintage, 0.0).clamp(0.0, 1.0),
            sepia: finite_or(params.sepia, 0.0).clamp(0.0, 1.0),
            grayscale: finite_or(params.grayscale, 0.0).clamp(0.0, 1.0),
            invert: finite_or(params.invert, 0.0).clamp(0.0, 1.0),
            vibrance: finite_or(params.vibrance, 0.0).clamp(-1.0, 1.0),
            noise: finite_or(params.noise, 0.0).clamp(0.0, 1.0),
        }
    }

    fn tone(&self, params: ToneParams) -> ToneParams {
        ToneParams {
            brightness: finite_or(params.brightness, 0.0).clamp(-1.0, 1.0),
            contrast: finite_or(params.contrast, 0.0).clamp(-1.0, 1.0),
            saturation: finite_or(params.saturation, 0.0).clamp(-1.0, 1.0),
            hue: finite_or(params.hue, 0.0).clamp(-180.0, 180.0),
            exposure: finite_or(params.exposure, 0.0).clamp(-5.0, 5.0),
            gamma: finite_or(params.gamma, 1.0).clamp(0.1, 5.0),
        }
    }
}
