use bytemuck::{Pod, Zeroable};

use super::{BlurAxis, Program};

const FLAG_FLIP_H: u32 = 1;
const FLAG_FLIP_V: u32 = 2;
const FLAG_MASKED: u32 = 4;

/// Uniform block shared by every pass in `passes.wgsl`.
///
/// `selector` carries integer switches (blend mode or blur axis, flags, tap
/// step, noise seed); `p0..p3` carry the float parameters of the active pass.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct PassUniforms {
    pub selector: [u32; 4],
    pub p0: [f32; 4],
    pub p1: [f32; 4],
    pub p2: [f32; 4],
    pub p3: [f32; 4],
}

unsafe impl Zeroable for PassUniforms {}
unsafe impl Pod for PassUniforms {}

impl PassUniforms {
    pub fn for_program(program: &Program) -> Self {
        let mut uniforms = Self::default();
        match program {
            Program::Place(placement) => {
                let bounds = placement.bounds;
                let transform = placement.transform;
                let (sin, cos) = transform.rotation_deg.to_radians().sin_cos();
                uniforms.p0 = [bounds.x, bounds.y, bounds.width, bounds.height];
                uniforms.p1 = [transform.scale, cos, sin, 0.0];
                if transform.flip_h {
                    uniforms.selector[1] |= FLAG_FLIP_H;
                }
                if transform.flip_v {
                    uniforms.selector[1] |= FLAG_FLIP_V;
                }
            }
            Program::Blur { axis, radius, step } => {
                uniforms.selector[0] = match axis {
                    BlurAxis::Horizontal => 0,
                    BlurAxis::Vertical => 1,
                };
                uniforms.selector[2] = (*step).max(1);
                uniforms.p0 = [*radius, (radius * 0.5).max(0.5), 0.0, 0.0];
            }
            Program::Stylize { params, seed } => {
                uniforms.selector[3] = *seed;
                uniforms.p0 = [params.vintage, params.sepia, params.grayscale, params.invert];
                uniforms.p1 = [params.vibrance, params.noise, 0.0, 0.0];
            }
            Program::Tone(tone) => {
                uniforms.p0 = [
                    tone.brightness,
                    tone.contrast,
                    tone.saturation,
                    tone.hue.to_radians(),
                ];
                uniforms.p1 = [tone.exposure, tone.gamma, 0.0, 0.0];
            }
            Program::Blend {
                mode,
                opacity,
                masked,
            } => {
                uniforms.selector[0] = mode.selector();
                if *masked {
                    uniforms.selector[1] |= FLAG_MASKED;
                }
                uniforms.p0 = [opacity.clamp(0.0, 1.0), 0.0, 0.0, 0.0];
            }
        }
        uniforms
    }

    /// Nearest-neighbour blit from a `source` sized texture to the surface.
    pub fn for_present(source: (u32, u32), surface: (u32, u32)) -> Self {
        Self {
            p0: [
                source.0 as f32,
                source.1 as f32,
                surface.0.max(1) as f32,
                surface.1.max(1) as f32,
            ],
            ..Self::default()
        }
    }
}
