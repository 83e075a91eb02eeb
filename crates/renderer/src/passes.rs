//! Per-layer pass chain: placement, blur, stylize, tone.
//!
//! Each pass samples the previous pass's target and draws into a freshly
//! checked-out one. The previous target goes back to the pool only after the
//! draw that consumed it, so no pass ever reads and writes the same texture.
//! Opacity is not applied here; compositing applies it exactly once.

use image::{GrayImage, Rgba, RgbaImage};

use crate::gpu::{BlurAxis, DrawCall, GpuBackend, GpuError, Placement, Program, TextureHandle};
use crate::pool::{PooledTarget, ResourcePool};
use crate::types::{CanvasParams, Filter, FilterParams, LayerParams, Quality, Rect};
use crate::validate::ParamValidator;

/// Draft renders sample every other blur tap.
const DRAFT_BLUR_STEP: u32 = 2;

pub(crate) struct PassEnv<'a> {
    pub backend: &'a mut dyn GpuBackend,
    pub pool: &'a mut ResourcePool,
    pub validator: &'a dyn ParamValidator,
}

impl PassEnv<'_> {
    /// Draws `program` from `current` into a new target and retires `current`.
    fn advance(
        &mut self,
        current: PooledTarget,
        program: Program,
    ) -> Result<PooledTarget, GpuError> {
        let next = match self.pool.checkout(self.backend, current.width, current.height) {
            Ok(next) => next,
            Err(err) => {
                self.pool.give_back(self.backend, current);
                return Err(err);
            }
        };
        let drawn = self.backend.draw(&DrawCall {
            program,
            inputs: &[current.handle],
            target: next.handle,
        });
        self.pool.give_back(self.backend, current);
        match drawn {
            Ok(()) => {
                tracing::trace!(pass = program.name(), target = %next.handle, "pass complete");
                Ok(next)
            }
            Err(err) => {
                self.pool.give_back(self.backend, next);
                Err(err)
            }
        }
    }

    fn place(
        &mut self,
        source: TextureHandle,
        placement: Placement,
        canvas: CanvasParams,
    ) -> Result<PooledTarget, GpuError> {
        let target = self.pool.checkout(self.backend, canvas.width, canvas.height)?;
        let drawn = self.backend.draw(&DrawCall {
            program: Program::Place(placement),
            inputs: &[source],
            target: target.handle,
        });
        match drawn {
            Ok(()) => Ok(target),
            Err(err) => {
                self.pool.give_back(self.backend, target);
                Err(err)
            }
        }
    }

    /// Copies `source` into a pool target so the chain can own and retire it.
    fn duplicate(&mut self, source: TextureHandle) -> Result<PooledTarget, GpuError> {
        let (width, height) = self
            .backend
            .dimensions(source)
            .ok_or(GpuError::UnknownTexture(source))?;
        let scratch = self.pool.checkout(self.backend, width, height)?;
        if let Err(err) = self.backend.copy(source, scratch.handle) {
            self.pool.give_back(self.backend, scratch);
            return Err(err);
        }
        Ok(scratch)
    }

    fn blur(
        &mut self,
        mut current: PooledTarget,
        radius: f32,
        quality: Quality,
    ) -> Result<PooledTarget, GpuError> {
        let radius = self.validator.blur_radius(radius, &self.backend.limits());
        if radius <= 0.0 {
            return Ok(current);
        }
        let step = match quality {
            Quality::Draft => DRAFT_BLUR_STEP,
            Quality::Full => 1,
        };
        for axis in [BlurAxis::Horizontal, BlurAxis::Vertical] {
            current = self.advance(current, Program::Blur { axis, radius, step })?;
        }
        Ok(current)
    }

    fn stylize_and_tone(
        &mut self,
        mut current: PooledTarget,
        filters: &FilterParams,
        quality: Quality,
        seed: u32,
    ) -> Result<PooledTarget, GpuError> {
        let mut stylize = self.validator.stylize(filters.stylize);
        if quality == Quality::Draft {
            stylize.noise = 0.0;
        }
        if !stylize.is_identity() {
            current = self.advance(
                current,
                Program::Stylize {
                    params: stylize,
                    seed,
                },
            )?;
        }
        let tone = self.validator.tone(filters.tone);
        self.advance(current, Program::Tone(tone))
    }

    /// Runs the full chain for an image layer whose pixels are resident as `source`.
    pub fn render_image_layer(
        &mut self,
        source: TextureHandle,
        layer: &LayerParams,
        canvas: CanvasParams,
        quality: Quality,
    ) -> Result<PooledTarget, GpuError> {
        let placement = self.placement_for(source, layer)?;
        let placed = self.place(source, placement, canvas)?;
        let blurred = self.blur(placed, layer.filters.blur, quality)?;
        self.stylize_and_tone(blurred, &layer.filters, quality, seed_for(layer))
    }

    /// Synthesizes an adjustment layer's top from a copy of the current base.
    pub fn render_adjustment_layer(
        &mut self,
        base: TextureHandle,
        layer: &LayerParams,
        quality: Quality,
    ) -> Result<PooledTarget, GpuError> {
        let scratch = self.duplicate(base)?;
        self.stylize_and_tone(scratch, &layer.filters, quality, seed_for(layer))
    }

    /// Places a layer mask with the geometry of the layer's pixels.
    pub fn render_mask(
        &mut self,
        mask_source: TextureHandle,
        layer: &LayerParams,
        layer_source: Option<TextureHandle>,
        canvas: CanvasParams,
    ) -> Result<PooledTarget, GpuError> {
        let geometry_source = layer_source.unwrap_or(mask_source);
        let placement = self.placement_for(geometry_source, layer)?;
        self.place(mask_source, placement, canvas)
    }

    /// Runs one standalone filter over `source` at full quality.
    pub fn apply_filter(
        &mut self,
        source: TextureHandle,
        filter: &Filter,
    ) -> Result<PooledTarget, GpuError> {
        let scratch = self.duplicate(source)?;
        match filter {
            Filter::Blur { radius } => self.blur(scratch, *radius, Quality::Full),
            Filter::Stylize(params) => {
                let params = self.validator.stylize(*params);
                self.advance(scratch, Program::Stylize { params, seed: 0 })
            }
            Filter::Tone(tone) => {
                let tone = self.validator.tone(*tone);
                self.advance(scratch, Program::Tone(tone))
            }
        }
    }

    fn placement_for(
        &self,
        source: TextureHandle,
        layer: &LayerParams,
    ) -> Result<Placement, GpuError> {
        let bounds = match layer.bounds {
            Some(bounds) => bounds,
            None => {
                let (width, height) = self
                    .backend
                    .dimensions(source)
                    .ok_or(GpuError::UnknownTexture(source))?;
                Rect::new(0.0, 0.0, width as f32, height as f32)
            }
        };
        Ok(Placement {
            bounds,
            transform: self.validator.transform(layer.transform),
        })
    }
}

fn seed_for(layer: &LayerParams) -> u32 {
    (layer.id.0 ^ (layer.id.0 >> 32)) as u32
}

/// Expands a luminance mask to RGBA for upload. Coverage is `r * a`.
pub(crate) fn mask_to_rgba(mask: &GrayImage) -> RgbaImage {
    RgbaImage::from_fn(mask.width(), mask.height(), |x, y| {
        let l = mask.get_pixel(x, y).0[0];
        Rgba([l, l, l, 255])
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use renderconfig::ResourcePoolConfig;

    use super::*;
    use crate::gpu::{SoftwareBackend, TraceOp};
    use crate::types::{LayerId, StylizeParams};
    use crate::validate::LimitsValidator;

    fn programs(ops: &[TraceOp]) -> Vec<&'static str> {
        ops.iter()
            .filter_map(|op| match op {
                TraceOp::Draw { program, .. } => Some(*program),
                _ => None,
            })
            .collect()
    }

    fn layer(filters: FilterParams) -> LayerParams {
        LayerParams::image(
            LayerId(1),
            "v1",
            Arc::new(RgbaImage::from_pixel(4, 4, Rgba([200, 100, 50, 255]))),
        )
        .with_filters(filters)
    }

    fn run(filters: FilterParams, quality: Quality) -> (Vec<TraceOp>, SoftwareBackend, ResourcePool) {
        let mut backend = SoftwareBackend::new(4, 4, None).unwrap();
        let trace = backend.trace_log();
        let mut pool = ResourcePool::new(&ResourcePoolConfig { max_resident: 8 });
        let validator = LimitsValidator::default();
        let layer = layer(filters);
        let pixels = match &layer.content {
            crate::types::LayerContent::Image { pixels, .. } => pixels.clone(),
            crate::types::LayerContent::Adjustment => unreachable!(),
        };
        let source = backend.upload(&pixels).unwrap();
        let out = {
            let mut env = PassEnv {
                backend: &mut backend,
                pool: &mut pool,
                validator: &validator,
            };
            env.render_image_layer(source, &layer, CanvasParams::new(4, 4), quality)
                .unwrap()
        };
        pool.give_back(&mut backend, out);
        (trace.snapshot(), backend, pool)
    }

    #[test]
    fn default_filters_run_placement_and_tone_only() {
        let (ops, _, pool) = run(FilterParams::default(), Quality::Full);
        assert_eq!(programs(&ops), vec!["place", "tone"]);
        assert_eq!(pool.checked_out_count(), 0);
    }

    #[test]
    fn every_enabled_pass_runs_in_order() {
        let filters = FilterParams {
            blur: 2.0,
            stylize: StylizeParams {
                sepia: 0.5,
                ..StylizeParams::default()
            },
            ..FilterParams::default()
        };
        let (ops, _, _) = run(filters, Quality::Full);
        assert_eq!(
            programs(&ops),
            vec!["place", "blur", "blur", "stylize", "tone"]
        );
    }

    #[test]
    fn no_pass_reads_its_own_target() {
        let filters = FilterParams {
            blur: 1.0,
            stylize: StylizeParams {
                invert: 1.0,
                ..StylizeParams::default()
            },
            ..FilterParams::default()
        };
        let (ops, _, _) = run(filters, Quality::Full);
        for op in ops {
            if let TraceOp::Draw { inputs, target, .. } = op {
                assert!(!inputs.contains(&target));
            }
        }
    }

    #[test]
    fn draft_quality_skips_noise_only_stylize() {
        let filters = FilterParams {
            stylize: StylizeParams {
                noise: 0.4,
                ..StylizeParams::default()
            },
            ..FilterParams::default()
        };
        let (draft, _, _) = run(filters, Quality::Draft);
        assert_eq!(programs(&draft), vec!["place", "tone"]);
        let (full, _, _) = run(filters, Quality::Full);
        assert_eq!(programs(&full), vec!["place", "stylize", "tone"]);
    }

    #[test]
    fn mask_expands_luminance_into_coverage() {
        let mask = GrayImage::from_pixel(1, 1, image::Luma([128]));
        assert_eq!(mask_to_rgba(&mask).get_pixel(0, 0).0, [128, 128, 128, 255]);
    }
}
