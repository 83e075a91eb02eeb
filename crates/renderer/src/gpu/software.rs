//! CPU rasteriser implementing [`GpuBackend`].
//!
//! Textures are `Rgba32FImage`s in straight alpha. Every operation is appended
//! to a shared [`TraceLog`] so callers can inspect the exact draw sequence a
//! frame produced.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use image::{ImageBuffer, Rgba, Rgba32FImage, RgbaImage};

use super::{
    check_dimensions, BackendKind, BackendLimits, BlurAxis, DrawCall, FrameStamp, GpuBackend,
    GpuError, Placement, Program, TextureHandle,
};
use crate::color::{self, Rgba as Px, TRANSPARENT};
use crate::protocol::{FrameSink, PresentedFrame};
use crate::types::BlendMode;

const DEFAULT_MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, PartialEq)]
pub enum TraceOp {
    Create {
        handle: TextureHandle,
        width: u32,
        height: u32,
    },
    Upload {
        handle: TextureHandle,
    },
    Destroy {
        handle: TextureHandle,
    },
    Clear {
        target: TextureHandle,
    },
    Copy {
        source: TextureHandle,
        target: TextureHandle,
    },
    Draw {
        program: &'static str,
        inputs: Vec<TextureHandle>,
        target: TextureHandle,
    },
    Present {
        source: Option<TextureHandle>,
        generation: u64,
    },
}

/// Shared, append-only record of backend operations.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    ops: Arc<Mutex<Vec<TraceOp>>>,
}

impl TraceLog {
    fn lock(&self) -> MutexGuard<'_, Vec<TraceOp>> {
        self.ops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, op: TraceOp) {
        self.lock().push(op);
    }

    pub fn snapshot(&self) -> Vec<TraceOp> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn draws(&self) -> Vec<TraceOp> {
        self.lock()
            .iter()
            .filter(|op| matches!(op, TraceOp::Draw { .. }))
            .cloned()
            .collect()
    }
}

pub struct SoftwareBackend {
    textures: HashMap<u64, Rgba32FImage>,
    next_handle: u64,
    limits: BackendLimits,
    blend_modes: HashSet<BlendMode>,
    surface: (u32, u32),
    sink: Option<FrameSink>,
    trace: TraceLog,
    texture_budget: Option<usize>,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32, sink: Option<FrameSink>) -> Result<Self, GpuError> {
        let limits = BackendLimits {
            max_texture_dimension: DEFAULT_MAX_DIMENSION,
        };
        check_dimensions(width, height, limits)?;
        Ok(Self {
            textures: HashMap::new(),
            next_handle: 1,
            limits,
            blend_modes: BlendMode::ALL.into_iter().collect(),
            surface: (width, height),
            sink,
            trace: TraceLog::default(),
            texture_budget: None,
        })
    }

    pub fn with_max_dimension(mut self, max_texture_dimension: u32) -> Self {
        self.limits.max_texture_dimension = max_texture_dimension;
        self
    }

    /// Restricts the natively supported blend modes; others fall back.
    pub fn with_blend_modes(mut self, modes: &[BlendMode]) -> Self {
        self.blend_modes = modes.iter().copied().collect();
        self.blend_modes.insert(BlendMode::Normal);
        self
    }

    /// Fails allocations with a resource error once `budget` textures are live.
    pub fn with_texture_budget(mut self, budget: usize) -> Self {
        self.texture_budget = Some(budget);
        self
    }

    pub fn trace_log(&self) -> TraceLog {
        self.trace.clone()
    }

    fn allocate(&mut self, image: Rgba32FImage) -> Result<TextureHandle, GpuError> {
        if let Some(budget) = self.texture_budget {
            if self.textures.len() >= budget {
                return Err(GpuError::Resource(format!(
                    "texture budget of {budget} exhausted"
                )));
            }
        }
        let handle = TextureHandle::new(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(handle.raw(), image);
        Ok(handle)
    }

    fn texture(&self, handle: TextureHandle) -> Result<&Rgba32FImage, GpuError> {
        self.textures
            .get(&handle.raw())
            .ok_or(GpuError::UnknownTexture(handle))
    }

    fn target_size(&self, handle: TextureHandle) -> Result<(u32, u32), GpuError> {
        self.texture(handle).map(|texture| texture.dimensions())
    }

    fn require_same_size(
        &self,
        program: &Program,
        input: TextureHandle,
        target: (u32, u32),
    ) -> Result<(), GpuError> {
        let size = self.target_size(input)?;
        if size != target {
            return Err(GpuError::Operation(format!(
                "{} pass input {input} is {}x{}, target is {}x{}",
                program.name(),
                size.0,
                size.1,
                target.0,
                target.1
            )));
        }
        Ok(())
    }

    fn rasterise(&self, call: &DrawCall<'_>) -> Result<Rgba32FImage, GpuError> {
        let (width, height) = self.target_size(call.target)?;
        let source = self.texture(call.inputs[0])?;
        let output = match call.program {
            Program::Place(placement) => place(source, &placement, width, height),
            Program::Blur { axis, radius, step } => {
                self.require_same_size(&call.program, call.inputs[0], (width, height))?;
                blur(source, axis, radius, step)
            }
            Program::Stylize { params, seed } => {
                self.require_same_size(&call.program, call.inputs[0], (width, height))?;
                map_pixels(source, |x, y, px| {
                    color::apply_stylize(px, &params, seed, x, y)
                })
            }
            Program::Tone(tone) => {
                self.require_same_size(&call.program, call.inputs[0], (width, height))?;
                map_pixels(source, |_, _, px| color::apply_tone(px, &tone))
            }
            Program::Blend {
                mode,
                opacity,
                masked,
            } => {
                for input in call.inputs {
                    self.require_same_size(&call.program, *input, (width, height))?;
                }
                let top = self.texture(call.inputs[1])?;
                let mask = if masked {
                    Some(self.texture(call.inputs[2])?)
                } else {
                    None
                };
                ImageBuffer::from_fn(width, height, |x, y| {
                    let coverage = match mask {
                        Some(mask) => {
                            let m = mask.get_pixel(x, y).0;
                            opacity * m[0] * m[3]
                        }
                        None => opacity,
                    };
                    Rgba(color::composite(
                        source.get_pixel(x, y).0,
                        top.get_pixel(x, y).0,
                        mode,
                        coverage,
                    ))
                })
            }
        };
        Ok(output)
    }
}

impl GpuBackend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn supports_blend(&self, mode: BlendMode) -> bool {
        self.blend_modes.contains(&mode)
    }

    fn create_target(&mut self, width: u32, height: u32) -> Result<TextureHandle, GpuError> {
        check_dimensions(width, height, self.limits)?;
        let handle = self.allocate(Rgba32FImage::new(width, height))?;
        self.trace.push(TraceOp::Create {
            handle,
            width,
            height,
        });
        Ok(handle)
    }

    fn upload(&mut self, pixels: &RgbaImage) -> Result<TextureHandle, GpuError> {
        check_dimensions(pixels.width(), pixels.height(), self.limits)?;
        let converted = ImageBuffer::from_fn(pixels.width(), pixels.height(), |x, y| {
            let [r, g, b, a] = pixels.get_pixel(x, y).0;
            Rgba([
                f32::from(r) / 255.0,
                f32::from(g) / 255.0,
                f32::from(b) / 255.0,
                f32::from(a) / 255.0,
            ])
        });
        let handle = self.allocate(converted)?;
        self.trace.push(TraceOp::Upload { handle });
        Ok(handle)
    }

    fn destroy(&mut self, handle: TextureHandle) {
        if self.textures.remove(&handle.raw()).is_some() {
            self.trace.push(TraceOp::Destroy { handle });
        }
    }

    fn dimensions(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.textures
            .get(&handle.raw())
            .map(|texture| texture.dimensions())
    }

    fn clear(&mut self, target: TextureHandle) -> Result<(), GpuError> {
        let texture = self
            .textures
            .get_mut(&target.raw())
            .ok_or(GpuError::UnknownTexture(target))?;
        texture.pixels_mut().for_each(|px| *px = Rgba(TRANSPARENT));
        self.trace.push(TraceOp::Clear { target });
        Ok(())
    }

    fn copy(&mut self, source: TextureHandle, target: TextureHandle) -> Result<(), GpuError> {
        if source == target {
            return Err(GpuError::Hazard(target));
        }
        let target_size = self.target_size(target)?;
        let source_size = self.target_size(source)?;
        if source_size != target_size {
            return Err(GpuError::Operation(format!(
                "copy from {source} ({}x{}) into {target} ({}x{})",
                source_size.0, source_size.1, target_size.0, target_size.1
            )));
        }
        let pixels = self.texture(source)?.clone();
        self.textures.insert(target.raw(), pixels);
        self.trace.push(TraceOp::Copy { source, target });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        call.validate()?;
        let output = self.rasterise(call)?;
        self.textures.insert(call.target.raw(), output);
        self.trace.push(TraceOp::Draw {
            program: call.program.name(),
            inputs: call.inputs.to_vec(),
            target: call.target,
        });
        Ok(())
    }

    fn read_back(&mut self, handle: TextureHandle) -> Result<RgbaImage, GpuError> {
        Ok(to_rgba8(self.texture(handle)?))
    }

    fn present(
        &mut self,
        source: Option<TextureHandle>,
        stamp: FrameStamp,
    ) -> Result<(), GpuError> {
        let sink = self.sink.as_ref().ok_or(GpuError::NoSurface)?;
        let (width, height) = self.surface;
        let image = match source {
            Some(handle) => {
                let texture = self.textures
                    .get(&handle.raw())
                    .ok_or(GpuError::UnknownTexture(handle))?;
                let scaled = if texture.dimensions() == (width, height) {
                    texture.clone()
                } else {
                    let (src_w, src_h) = texture.dimensions();
                    ImageBuffer::from_fn(width, height, |x, y| {
                        let sx = (u64::from(x) * u64::from(src_w) / u64::from(width)) as u32;
                        let sy = (u64::from(y) * u64::from(src_h) / u64::from(height)) as u32;
                        *texture.get_pixel(sx.min(src_w - 1), sy.min(src_h - 1))
                    })
                };
                to_rgba8(&scaled)
            }
            None => RgbaImage::new(width, height),
        };
        if !sink.deliver(PresentedFrame {
            generation: stamp.generation,
            quality: stamp.quality,
            image,
        }) {
            tracing::debug!("frame sink disconnected; frame dropped");
        }
        self.trace.push(TraceOp::Present {
            source,
            generation: stamp.generation,
        });
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        check_dimensions(width, height, self.limits)?;
        self.surface = (width, height);
        Ok(())
    }

    fn live_textures(&self) -> usize {
        self.textures.len()
    }
}

fn to_rgba8(texture: &Rgba32FImage) -> RgbaImage {
    ImageBuffer::from_fn(texture.width(), texture.height(), |x, y| {
        let px = texture.get_pixel(x, y).0;
        Rgba(px.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8))
    })
}

fn map_pixels(source: &Rgba32FImage, mut f: impl FnMut(u32, u32, Px) -> Px) -> Rgba32FImage {
    ImageBuffer::from_fn(source.width(), source.height(), |x, y| {
        Rgba(f(x, y, source.get_pixel(x, y).0))
    })
}

fn place(source: &Rgba32FImage, placement: &Placement, width: u32, height: u32) -> Rgba32FImage {
    let bounds = placement.bounds;
    let transform = placement.transform;
    let (sin, cos) = transform.rotation_deg.to_radians().sin_cos();
    let scale = transform.scale;
    let center = (bounds.x + bounds.width * 0.5, bounds.y + bounds.height * 0.5);
    let (src_w, src_h) = source.dimensions();

    ImageBuffer::from_fn(width, height, |x, y| {
        let ox = x as f32 + 0.5 - center.0;
        let oy = y as f32 + 0.5 - center.1;
        let mut dx = (ox * cos + oy * sin) / scale;
        let mut dy = (-ox * sin + oy * cos) / scale;
        if transform.flip_h {
            dx = -dx;
        }
        if transform.flip_v {
            dy = -dy;
        }
        let u = (dx + bounds.width * 0.5) / bounds.width;
        let v = (dy + bounds.height * 0.5) / bounds.height;
        if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
            return Rgba(TRANSPARENT);
        }
        let sx = ((u * src_w as f32).floor() as u32).min(src_w - 1);
        let sy = ((v * src_h as f32).floor() as u32).min(src_h - 1);
        *source.get_pixel(sx, sy)
    })
}

fn blur(source: &Rgba32FImage, axis: BlurAxis, radius: f32, step: u32) -> Rgba32FImage {
    let taps = color::gaussian_taps(radius, step);
    let (width, height) = source.dimensions();
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;

    ImageBuffer::from_fn(width, height, |x, y| {
        let mut accum = [0.0f32; 4];
        for &(offset, weight) in &taps {
            let (sx, sy) = match axis {
                BlurAxis::Horizontal => ((x as i64 + offset as i64).clamp(0, max_x), y as i64),
                BlurAxis::Vertical => (x as i64, (y as i64 + offset as i64).clamp(0, max_y)),
            };
            let px = source.get_pixel(sx as u32, sy as u32).0;
            accum[0] += px[0] * px[3] * weight;
            accum[1] += px[1] * px[3] * weight;
            accum[2] += px[2] * px[3] * weight;
            accum[3] += px[3] * weight;
        }
        if accum[3] <= 0.0 {
            return Rgba(TRANSPARENT);
        }
        Rgba([
            accum[0] / accum[3],
            accum[1] / accum[3],
            accum[2] / accum[3],
            accum[3],
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quality, Rect, Transform};

    fn solid(width: u32, height: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(px))
    }

    #[test]
    fn draw_into_own_input_is_rejected() {
        let mut backend = SoftwareBackend::new(4, 4, None).unwrap();
        let target = backend.create_target(4, 4).unwrap();
        let err = backend
            .draw(&DrawCall {
                program: Program::Tone(Default::default()),
                inputs: &[target],
                target,
            })
            .unwrap_err();
        assert!(matches!(err, GpuError::Hazard(_)));
        assert!(backend.trace_log().draws().is_empty());
    }

    #[test]
    fn placement_honours_bounds_and_flip() {
        let mut backend = SoftwareBackend::new(4, 2, None).unwrap();
        let mut image = solid(2, 1, [255, 0, 0, 255]);
        image.put_pixel(1, 0, Rgba([0, 0, 255, 255]));
        let source = backend.upload(&image).unwrap();
        let target = backend.create_target(4, 2).unwrap();
        backend
            .draw(&DrawCall {
                program: Program::Place(Placement {
                    bounds: Rect::new(2.0, 0.0, 2.0, 1.0),
                    transform: Transform {
                        flip_h: true,
                        ..Transform::default()
                    },
                }),
                inputs: &[source],
                target,
            })
            .unwrap();
        let out = backend.read_back(target).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
        assert_eq!(out.get_pixel(2, 0).0, [0, 0, 255, 255]);
        assert_eq!(out.get_pixel(3, 0).0, [255, 0, 0, 255]);
        assert_eq!(out.get_pixel(2, 1).0, [0, 0, 0, 0]);
    }

    #[test]
    fn blur_of_uniform_image_is_unchanged() {
        let mut backend = SoftwareBackend::new(8, 8, None).unwrap();
        let source = backend.upload(&solid(8, 8, [40, 80, 120, 255])).unwrap();
        let target = backend.create_target(8, 8).unwrap();
        backend
            .draw(&DrawCall {
                program: Program::Blur {
                    axis: BlurAxis::Horizontal,
                    radius: 3.0,
                    step: 1,
                },
                inputs: &[source],
                target,
            })
            .unwrap();
        let out = backend.read_back(target).unwrap();
        assert!(out.pixels().all(|px| px.0 == [40, 80, 120, 255]));
    }

    #[test]
    fn present_delivers_frame_to_sink() {
        let (sink, frames) = FrameSink::channel();
        let mut backend = SoftwareBackend::new(2, 2, Some(sink)).unwrap();
        let source = backend.upload(&solid(2, 2, [9, 9, 9, 255])).unwrap();
        backend
            .present(
                Some(source),
                FrameStamp {
                    generation: 7,
                    quality: Quality::Full,
                },
            )
            .unwrap();
        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.generation, 7);
        assert_eq!(frame.image.get_pixel(1, 1).0, [9, 9, 9, 255]);
    }

    #[test]
    fn texture_budget_surfaces_resource_errors() {
        let mut backend = SoftwareBackend::new(2, 2, None)
            .unwrap()
            .with_texture_budget(1);
        backend.create_target(2, 2).unwrap();
        let err = backend.create_target(2, 2).unwrap_err();
        assert!(matches!(err, GpuError::Resource(_)));
    }
}
