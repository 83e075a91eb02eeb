//! Bottom-to-top layer compositing over the ping-pong pair.
//!
//! Each layer runs its pass chain into a pooled target, then a blend draw
//! folds it into the pair: `read` holds the composite so far, the blend
//! samples `read` and the layer and writes `write`, and the pair swaps. The
//! blend program is the only place opacity and masks apply.

use crate::context::PipelineContext;
use crate::gpu::{DrawCall, GpuBackend, GpuError, Program, TextureHandle};
use crate::passes::{mask_to_rgba, PassEnv};
use crate::pool::PooledTarget;
use crate::types::{BlendMode, CanvasParams, LayerContent, LayerId, LayerParams, Quality};

/// Hooks the worker uses to report progress and detect superseded frames.
pub trait LayerObserver {
    /// Called after each drawable layer has been folded in.
    fn progress(&mut self, done: usize, total: usize);

    /// Checked between layers and before presenting.
    fn should_abandon(&mut self) -> bool;
}

/// Observer that never abandons and ignores progress.
#[derive(Debug, Default)]
pub struct Unobserved;

impl LayerObserver for Unobserved {
    fn progress(&mut self, _done: usize, _total: usize) {}

    fn should_abandon(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompositeReport {
    pub layers_drawn: usize,
    /// Layers whose blend mode was replaced with `Normal`.
    pub fallbacks: Vec<(LayerId, BlendMode)>,
    /// Final composite, or `None` when nothing was drawn.
    pub result: Option<TextureHandle>,
}

#[derive(Debug)]
pub enum Composite {
    Done(CompositeReport),
    Abandoned,
}

impl PipelineContext {
    /// Composites `layers` (UI order, top-most first) without presenting.
    pub fn composite(
        &mut self,
        layers: &[LayerParams],
        canvas: CanvasParams,
        generation: u64,
        quality: Quality,
        observer: &mut dyn LayerObserver,
    ) -> Result<Composite, GpuError> {
        let validator = self.validator.clone();
        let drawable: Vec<&LayerParams> = layers
            .iter()
            .rev()
            .filter(|layer| layer.visible && validator.opacity(layer.opacity) > 0.0)
            .collect();
        let total = drawable.len();
        let mut report = CompositeReport::default();
        if total == 0 {
            return Ok(Composite::Done(report));
        }
        self.ensure_ping_pong(canvas)?;

        let mut has_base = false;
        for (index, layer) in drawable.into_iter().enumerate() {
            if layer.is_adjustment() && !has_base {
                tracing::debug!(layer = %layer.id, "adjustment layer has nothing beneath it");
            } else {
                let mode = self.resolve_blend_mode(layer, &mut report);
                self.fold_layer(layer, mode, has_base, canvas, generation, quality)?;
                has_base = true;
                report.layers_drawn += 1;
            }
            observer.progress(index + 1, total);
            if observer.should_abandon() {
                tracing::debug!(generation, done = index + 1, total, "abandoning superseded frame");
                return Ok(Composite::Abandoned);
            }
        }

        report.result = match (&self.ping_pong, has_base) {
            (Some(pair), true) => Some(pair.read()),
            _ => None,
        };
        Ok(Composite::Done(report))
    }

    fn resolve_blend_mode(&self, layer: &LayerParams, report: &mut CompositeReport) -> BlendMode {
        let mode = layer.blend_mode;
        if self.backend.supports_blend(mode) {
            return mode;
        }
        tracing::warn!(layer = %layer.id, %mode, "blend mode unsupported; using normal");
        report.fallbacks.push((layer.id, mode));
        BlendMode::Normal
    }

    fn fold_layer(
        &mut self,
        layer: &LayerParams,
        mode: BlendMode,
        has_base: bool,
        canvas: CanvasParams,
        generation: u64,
        quality: Quality,
    ) -> Result<(), GpuError> {
        let (read, write) = match &self.ping_pong {
            Some(pair) => (pair.read(), pair.write()),
            None => return Err(GpuError::Operation("compositing targets missing".into())),
        };

        let source = match &layer.content {
            LayerContent::Image { signature, pixels } => Some(self.sources.acquire(
                self.backend.as_mut(),
                layer.id,
                signature,
                generation,
                |backend| backend.upload(pixels),
            )?),
            LayerContent::Adjustment => None,
        };
        let mask_source = match &layer.mask {
            Some(mask) => Some(self.masks.acquire(
                self.backend.as_mut(),
                layer.id,
                &mask.signature,
                generation,
                |backend| backend.upload(&mask_to_rgba(&mask.pixels)),
            )?),
            None => None,
        };

        let mut env = PassEnv {
            backend: self.backend.as_mut(),
            pool: &mut self.pool,
            validator: self.validator.as_ref(),
        };
        let top = match source {
            Some(source) => env.render_image_layer(source, layer, canvas, quality)?,
            None => env.render_adjustment_layer(read, layer, quality)?,
        };
        let mask = match mask_source {
            Some(mask_source) => match env.render_mask(mask_source, layer, source, canvas) {
                Ok(mask) => Some(mask),
                Err(err) => {
                    env.pool.give_back(env.backend, top);
                    return Err(err);
                }
            },
            None => None,
        };

        let opacity = env.validator.opacity(layer.opacity) / 100.0;
        let blended = blend_into(
            env.backend,
            (read, write),
            &top,
            mask.as_ref(),
            mode,
            opacity,
            has_base,
        );
        env.pool.give_back(env.backend, top);
        if let Some(mask) = mask {
            env.pool.give_back(env.backend, mask);
        }
        blended?;

        if let Some(pair) = self.ping_pong.as_mut() {
            pair.swap();
        }
        Ok(())
    }
}

fn blend_into(
    backend: &mut dyn GpuBackend,
    (read, write): (TextureHandle, TextureHandle),
    top: &PooledTarget,
    mask: Option<&PooledTarget>,
    mode: BlendMode,
    opacity: f32,
    has_base: bool,
) -> Result<(), GpuError> {
    if !has_base {
        // Any mode over a transparent base reduces to the source itself.
        if opacity >= 1.0 && mask.is_none() {
            return backend.copy(top.handle, write);
        }
        backend.clear(read)?;
    }
    let mut inputs = vec![read, top.handle];
    if let Some(mask) = mask {
        inputs.push(mask.handle);
    }
    backend.draw(&DrawCall {
        program: Program::Blend {
            mode,
            opacity,
            masked: mask.is_some(),
        },
        inputs: &inputs,
        target: write,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::{GrayImage, Luma, Rgba, RgbaImage};
    use renderconfig::PipelineConfig;

    use super::*;
    use crate::gpu::{SoftwareBackend, TraceLog, TraceOp};
    use crate::types::{FilterParams, LayerMask, StylizeParams, ToneParams};
    use crate::validate::LimitsValidator;

    const CANVAS: CanvasParams = CanvasParams {
        width: 4,
        height: 4,
    };

    fn context_with(backend: SoftwareBackend) -> (PipelineContext, TraceLog) {
        let trace = backend.trace_log();
        let context = PipelineContext::new(
            Box::new(backend),
            &PipelineConfig::default(),
            Arc::new(LimitsValidator::default()),
        );
        (context, trace)
    }

    fn context() -> (PipelineContext, TraceLog) {
        context_with(SoftwareBackend::new(4, 4, None).unwrap())
    }

    fn solid(id: u64, color: [u8; 4]) -> LayerParams {
        LayerParams::image(
            LayerId(id),
            format!("solid-{id}"),
            Arc::new(RgbaImage::from_pixel(4, 4, Rgba(color))),
        )
    }

    fn composite(context: &mut PipelineContext, layers: &[LayerParams]) -> CompositeReport {
        match context
            .composite(layers, CANVAS, 1, Quality::Full, &mut Unobserved)
            .unwrap()
        {
            Composite::Done(report) => report,
            Composite::Abandoned => panic!("frame abandoned"),
        }
    }

    fn pixel(context: &mut PipelineContext, report: &CompositeReport) -> [u8; 4] {
        let handle = report.result.expect("composite result");
        context.backend.read_back(handle).unwrap().get_pixel(1, 1).0
    }

    fn close(actual: [u8; 4], expected: [u8; 4]) -> bool {
        actual
            .iter()
            .zip(expected)
            .all(|(a, e)| (i16::from(*a) - i16::from(e)).abs() <= 1)
    }

    #[test]
    fn half_opaque_blue_over_red_mixes_evenly() {
        let (mut context, _) = context();
        let layers = [
            solid(2, [0, 0, 255, 255]).with_opacity(50.0),
            solid(1, [255, 0, 0, 255]),
        ];
        let report = composite(&mut context, &layers);
        assert_eq!(report.layers_drawn, 2);
        assert!(close(pixel(&mut context, &report), [128, 0, 128, 255]));
    }

    #[test]
    fn empty_stack_has_no_result() {
        let (mut context, trace) = context();
        let report = composite(&mut context, &[]);
        assert_eq!(report.result, None);
        assert!(trace.draws().is_empty());

        let hidden = [
            solid(1, [255, 0, 0, 255]).hidden(),
            solid(2, [0, 0, 0, 255]).with_opacity(0.0),
        ];
        assert_eq!(composite(&mut context, &hidden).result, None);
    }

    #[test]
    fn opaque_bottom_layer_is_copied_not_blended() {
        let (mut context, trace) = context();
        composite(&mut context, &[solid(1, [10, 20, 30, 255])]);
        let ops = trace.snapshot();
        assert!(ops.iter().any(|op| matches!(op, TraceOp::Copy { .. })));
        assert!(!ops
            .iter()
            .any(|op| matches!(op, TraceOp::Draw { program: "blend", .. })));
    }

    #[test]
    fn no_draw_samples_its_own_target() {
        let (mut context, trace) = context();
        let mask = LayerMask {
            signature: "m1".into(),
            pixels: Arc::new(GrayImage::from_pixel(4, 4, Luma([128]))),
        };
        let layers = [
            LayerParams::adjustment(
                LayerId(4),
                ToneParams {
                    brightness: 0.2,
                    ..ToneParams::default()
                },
            ),
            solid(3, [0, 255, 0, 255])
                .with_blend_mode(BlendMode::Screen)
                .with_mask(mask),
            solid(2, [0, 0, 255, 255]).with_filters(FilterParams {
                blur: 2.0,
                stylize: StylizeParams {
                    sepia: 1.0,
                    ..StylizeParams::default()
                },
                ..FilterParams::default()
            }),
            solid(1, [255, 0, 0, 255]).with_opacity(80.0),
        ];
        let report = composite(&mut context, &layers);
        assert_eq!(report.layers_drawn, 4);

        for op in trace.snapshot() {
            match op {
                TraceOp::Draw { inputs, target, .. } => assert!(!inputs.contains(&target)),
                TraceOp::Copy { source, target } => assert_ne!(source, target),
                _ => {}
            }
        }
        assert_eq!(context.pool.checked_out_count(), 0);
    }

    #[test]
    fn adjustment_without_base_is_skipped() {
        let (mut context, trace) = context();
        let layers = [
            solid(1, [255, 0, 0, 255]),
            LayerParams::adjustment(LayerId(2), ToneParams::default()),
        ];
        let report = composite(&mut context, &layers);
        assert_eq!(report.layers_drawn, 1);
        let tone_passes = trace
            .draws()
            .into_iter()
            .filter(|op| matches!(op, TraceOp::Draw { program: "tone", .. }))
            .count();
        assert_eq!(tone_passes, 1);
    }

    #[test]
    fn adjustment_layer_filters_the_composite_beneath() {
        let (mut context, _) = context();
        let layers = [
            LayerParams::adjustment(
                LayerId(2),
                ToneParams {
                    brightness: -1.0,
                    ..ToneParams::default()
                },
            ),
            solid(1, [200, 200, 200, 255]),
        ];
        let report = composite(&mut context, &layers);
        let [r, g, b, a] = pixel(&mut context, &report);
        assert!(r < 200 && g < 200 && b < 200);
        assert_eq!(a, 255);
    }

    #[test]
    fn unsupported_blend_mode_falls_back_to_normal() {
        let backend = SoftwareBackend::new(4, 4, None)
            .unwrap()
            .with_blend_modes(&[]);
        let (mut context, _) = context_with(backend);
        let layers = [
            solid(2, [0, 0, 255, 255]).with_blend_mode(BlendMode::Multiply),
            solid(1, [255, 0, 0, 255]),
        ];
        let report = composite(&mut context, &layers);
        assert_eq!(report.fallbacks, vec![(LayerId(2), BlendMode::Multiply)]);
        assert!(close(pixel(&mut context, &report), [0, 0, 255, 255]));
    }

    #[test]
    fn sources_upload_once_across_frames() {
        let (mut context, _) = context();
        let layers = [solid(2, [0, 0, 255, 128]), solid(1, [255, 0, 0, 255])];
        composite(&mut context, &layers);
        composite(&mut context, &layers);
        let stats = context.source_stats();
        assert_eq!(stats.uploads, 2);
        assert_eq!(stats.hits, 2);
    }

    struct AbandonAfter(usize);

    impl LayerObserver for AbandonAfter {
        fn progress(&mut self, _done: usize, _total: usize) {
            self.0 = self.0.saturating_sub(1);
        }

        fn should_abandon(&mut self) -> bool {
            self.0 == 0
        }
    }

    #[test]
    fn observer_can_abandon_between_layers() {
        let (mut context, trace) = context();
        let layers = [
            solid(3, [0, 255, 0, 255]),
            solid(2, [0, 0, 255, 255]),
            solid(1, [255, 0, 0, 255]),
        ];
        let outcome = context
            .composite(&layers, CANVAS, 1, Quality::Full, &mut AbandonAfter(1))
            .unwrap();
        assert!(matches!(outcome, Composite::Abandoned));
        let uploads = trace
            .snapshot()
            .into_iter()
            .filter(|op| matches!(op, TraceOp::Upload { .. }))
            .count();
        assert_eq!(uploads, 1);
    }
}
