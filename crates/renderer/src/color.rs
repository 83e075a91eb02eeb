//! Per-pixel colour math shared by the software backend.
//!
//! Pixels are straight-alpha `[r, g, b, a]` in `0..=1`. The WGSL in
//! `shaders/passes.wgsl` implements the same formulas; keep them in step.

use crate::types::{BlendMode, StylizeParams, ToneParams};

pub type Rgba = [f32; 4];

pub const TRANSPARENT: Rgba = [0.0; 4];

const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

pub fn luminance(px: Rgba) -> f32 {
    px[0] * LUMA[0] + px[1] * LUMA[1] + px[2] * LUMA[2]
}

/// Separable blend function `B(cb, cs)` from W3C Compositing and Blending Level 1.
pub fn blend_channel(mode: BlendMode, cb: f32, cs: f32) -> f32 {
    match mode {
        BlendMode::Normal => cs,
        BlendMode::Multiply => cb * cs,
        BlendMode::Screen => screen(cb, cs),
        BlendMode::Overlay => hard_light(cs, cb),
        BlendMode::Darken => cb.min(cs),
        BlendMode::Lighten => cb.max(cs),
        BlendMode::ColorDodge => {
            if cb <= 0.0 {
                0.0
            } else if cs >= 1.0 {
                1.0
            } else {
                (cb / (1.0 - cs)).min(1.0)
            }
        }
        BlendMode::ColorBurn => {
            if cb >= 1.0 {
                1.0
            } else if cs <= 0.0 {
                0.0
            } else {
                1.0 - ((1.0 - cb) / cs).min(1.0)
            }
        }
        BlendMode::HardLight => hard_light(cb, cs),
        BlendMode::SoftLight => {
            if cs <= 0.5 {
                cb - (1.0 - 2.0 * cs) * cb * (1.0 - cb)
            } else {
                let d = if cb <= 0.25 {
                    ((16.0 * cb - 12.0) * cb + 4.0) * cb
                } else {
                    cb.sqrt()
                };
                cb + (2.0 * cs - 1.0) * (d - cb)
            }
        }
        BlendMode::Difference => (cb - cs).abs(),
        BlendMode::Exclusion => cb + cs - 2.0 * cb * cs,
    }
}

fn screen(cb: f32, cs: f32) -> f32 {
    cb + cs - cb * cs
}

fn hard_light(cb: f32, cs: f32) -> f32 {
    if cs <= 0.5 {
        cb * 2.0 * cs
    } else {
        screen(cb, 2.0 * cs - 1.0)
    }
}

/// Source-over composite of `top` onto `base` with the mode's mixing function.
/// `coverage` folds layer opacity and mask into the source alpha.
pub fn composite(base: Rgba, top: Rgba, mode: BlendMode, coverage: f32) -> Rgba {
    let alpha_s = (top[3] * coverage).clamp(0.0, 1.0);
    let alpha_b = base[3];
    let alpha_o = alpha_s + alpha_b * (1.0 - alpha_s);
    if alpha_o <= 0.0 {
        return TRANSPARENT;
    }
    let mut out = [0.0, 0.0, 0.0, alpha_o];
    for channel in 0..3 {
        let cs = top[channel];
        let cb = base[channel];
        let mixed = blend_channel(mode, cb, cs);
        let co = alpha_s * (1.0 - alpha_b) * cs
            + alpha_s * alpha_b * mixed
            + (1.0 - alpha_s) * alpha_b * cb;
        out[channel] = co / alpha_o;
    }
    out
}

pub fn apply_tone(px: Rgba, tone: &ToneParams) -> Rgba {
    let gain = tone.exposure.exp2();
    let mut rgb = [px[0], px[1], px[2]];
    for value in &mut rgb {
        *value = *value * gain + tone.brightness;
        *value = (*value - 0.5) * (1.0 + tone.contrast) + 0.5;
    }
    let luma = rgb[0] * LUMA[0] + rgb[1] * LUMA[1] + rgb[2] * LUMA[2];
    for value in &mut rgb {
        *value = luma + (*value - luma) * (1.0 + tone.saturation);
    }
    if tone.hue != 0.0 {
        rgb = rotate_hue(rgb, tone.hue.to_radians());
    }
    let inverse_gamma = 1.0 / tone.gamma.max(0.01);
    for value in &mut rgb {
        *value = value.clamp(0.0, 1.0).powf(inverse_gamma);
    }
    [rgb[0], rgb[1], rgb[2], px[3]]
}

/// Hue rotation about the luminance axis (W3C `hue-rotate` matrix).
fn rotate_hue(rgb: [f32; 3], radians: f32) -> [f32; 3] {
    let (s, c) = radians.sin_cos();
    let m = [
        [
            0.213 + c * 0.787 - s * 0.213,
            0.715 - c * 0.715 - s * 0.715,
            0.072 - c * 0.072 + s * 0.928,
        ],
        [
            0.213 - c * 0.213 + s * 0.143,
            0.715 + c * 0.285 + s * 0.140,
            0.072 - c * 0.072 - s * 0.283,
        ],
        [
            0.213 - c * 0.213 - s * 0.787,
            0.715 - c * 0.715 + s * 0.715,
            0.072 + c * 0.928 + s * 0.072,
        ],
    ];
    [
        m[0][0] * rgb[0] + m[0][1] * rgb[1] + m[0][2] * rgb[2],
        m[1][0] * rgb[0] + m[1][1] * rgb[1] + m[1][2] * rgb[2],
        m[2][0] * rgb[0] + m[2][1] * rgb[1] + m[2][2] * rgb[2],
    ]
}

pub fn apply_stylize(px: Rgba, params: &StylizeParams, seed: u32, x: u32, y: u32) -> Rgba {
    let mut rgb = [px[0], px[1], px[2]];

    if params.grayscale > 0.0 {
        let luma = rgb[0] * LUMA[0] + rgb[1] * LUMA[1] + rgb[2] * LUMA[2];
        rgb = mix3(rgb, [luma; 3], params.grayscale);
    }
    if params.sepia > 0.0 {
        let sepia = [
            (rgb[0] * 0.393 + rgb[1] * 0.769 + rgb[2] * 0.189).min(1.0),
            (rgb[0] * 0.349 + rgb[1] * 0.686 + rgb[2] * 0.168).min(1.0),
            (rgb[0] * 0.272 + rgb[1] * 0.534 + rgb[2] * 0.131).min(1.0),
        ];
        rgb = mix3(rgb, sepia, params.sepia);
    }
    if params.vintage > 0.0 {
        let faded = [
            rgb[0] * 1.07 + 0.04,
            rgb[1] * 0.95 + 0.03,
            rgb[2] * 0.80,
        ];
        rgb = mix3(rgb, faded, params.vintage);
    }
    if params.vibrance != 0.0 {
        let max = rgb[0].max(rgb[1]).max(rgb[2]);
        let min = rgb[0].min(rgb[1]).min(rgb[2]);
        let luma = rgb[0] * LUMA[0] + rgb[1] * LUMA[1] + rgb[2] * LUMA[2];
        let boost = 1.0 + params.vibrance * (1.0 - (max - min));
        for value in &mut rgb {
            *value = luma + (*value - luma) * boost;
        }
    }
    if params.invert > 0.0 {
        rgb = mix3(rgb, [1.0 - rgb[0], 1.0 - rgb[1], 1.0 - rgb[2]], params.invert);
    }
    if params.noise > 0.0 {
        let grain = noise(x, y, seed) * params.noise;
        for value in &mut rgb {
            *value += grain;
        }
    }

    [
        rgb[0].clamp(0.0, 1.0),
        rgb[1].clamp(0.0, 1.0),
        rgb[2].clamp(0.0, 1.0),
        px[3],
    ]
}

fn mix3(a: [f32; 3], b: [f32; 3], t: f32) -> [f32; 3] {
    let t = t.clamp(0.0, 1.0);
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

/// Deterministic per-pixel grain in `-0.5..=0.5`.
pub fn noise(x: u32, y: u32, seed: u32) -> f32 {
    let mut h = x
        .wrapping_mul(374_761_393)
        .wrapping_add(y.wrapping_mul(668_265_263))
        .wrapping_add(seed.wrapping_mul(2_246_822_519));
    h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
    h ^= h >> 16;
    (h & 0xffff) as f32 / 65535.0 - 0.5
}

/// Gaussian taps for one blur axis as `(offset, weight)`, weights summing to one.
/// `step > 1` skips intermediate taps for draft renders.
pub fn gaussian_taps(radius: f32, step: u32) -> Vec<(i32, f32)> {
    let half_width = radius.ceil().max(0.0) as i32;
    let step = step.max(1) as i32;
    let sigma = (radius * 0.5).max(0.5);
    let reach = half_width / step;
    let mut taps: Vec<(i32, f32)> = (-reach..=reach)
        .map(|k| {
            let offset = (k * step) as f32;
            (k * step, (-(offset * offset) / (2.0 * sigma * sigma)).exp())
        })
        .collect();
    let total: f32 = taps.iter().map(|(_, weight)| weight).sum();
    for (_, weight) in &mut taps {
        *weight /= total;
    }
    taps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Rgba, expected: Rgba) {
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-5, "expected {expected:?}, got {actual:?}");
        }
    }

    #[test]
    fn half_blue_over_red_is_purple() {
        let out = composite([1.0, 0.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0], BlendMode::Normal, 0.5);
        assert_close(out, [0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn anything_over_transparent_keeps_source() {
        for mode in BlendMode::ALL {
            let out = composite(TRANSPARENT, [0.2, 0.4, 0.6, 0.8], mode, 1.0);
            assert_close(out, [0.2, 0.4, 0.6, 0.8]);
        }
    }

    #[test]
    fn multiply_and_screen_match_reference_values() {
        assert!((blend_channel(BlendMode::Multiply, 0.5, 0.5) - 0.25).abs() < 1e-6);
        assert!((blend_channel(BlendMode::Screen, 0.5, 0.5) - 0.75).abs() < 1e-6);
        assert!((blend_channel(BlendMode::Difference, 0.2, 0.7) - 0.5).abs() < 1e-6);
        assert_eq!(blend_channel(BlendMode::ColorDodge, 0.0, 1.0), 0.0);
        assert_eq!(blend_channel(BlendMode::ColorBurn, 1.0, 0.0), 1.0);
    }

    #[test]
    fn default_tone_is_identity() {
        let px = [0.3, 0.6, 0.9, 0.7];
        assert_close(apply_tone(px, &ToneParams::default()), px);
    }

    #[test]
    fn full_grayscale_equalizes_channels() {
        let params = StylizeParams {
            grayscale: 1.0,
            ..StylizeParams::default()
        };
        let out = apply_stylize([0.9, 0.1, 0.4, 1.0], &params, 0, 0, 0);
        assert!((out[0] - out[1]).abs() < 1e-6);
        assert!((out[1] - out[2]).abs() < 1e-6);
    }

    #[test]
    fn noise_is_deterministic_and_bounded() {
        for (x, y) in [(0, 0), (17, 3), (4000, 4000)] {
            let value = noise(x, y, 9);
            assert_eq!(value, noise(x, y, 9));
            assert!((-0.5..=0.5).contains(&value));
        }
    }

    #[test]
    fn draft_taps_are_halved_and_normalized() {
        let full = gaussian_taps(8.0, 1);
        let draft = gaussian_taps(8.0, 2);
        assert_eq!(full.len(), 17);
        assert_eq!(draft.len(), 9);
        let sum: f32 = draft.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(draft.iter().any(|(offset, _)| *offset == 0));
    }
}
