use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use image::{GrayImage, RgbaImage};

/// Stable identity of a layer in the caller's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Closed set of separable blend modes understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
}

impl BlendMode {
    pub const ALL: [BlendMode; 12] = [
        BlendMode::Normal,
        BlendMode::Multiply,
        BlendMode::Screen,
        BlendMode::Overlay,
        BlendMode::Darken,
        BlendMode::Lighten,
        BlendMode::ColorDodge,
        BlendMode::ColorBurn,
        BlendMode::HardLight,
        BlendMode::SoftLight,
        BlendMode::Difference,
        BlendMode::Exclusion,
    ];

    /// Resolves a CSS-style mode name. Unknown names map to `Normal`.
    pub fn from_name(name: &str) -> Self {
        let normalized = name.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "multiply" => BlendMode::Multiply,
            "screen" => BlendMode::Screen,
            "overlay" => BlendMode::Overlay,
            "darken" => BlendMode::Darken,
            "lighten" => BlendMode::Lighten,
            "color-dodge" => BlendMode::ColorDodge,
            "color-burn" => BlendMode::ColorBurn,
            "hard-light" => BlendMode::HardLight,
            "soft-light" => BlendMode::SoftLight,
            "difference" => BlendMode::Difference,
            "exclusion" => BlendMode::Exclusion,
            "normal" | "source-over" => BlendMode::Normal,
            other => {
                tracing::debug!(mode = other, "unknown blend mode; using normal");
                BlendMode::Normal
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BlendMode::Normal => "normal",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::ColorDodge => "color-dodge",
            BlendMode::ColorBurn => "color-burn",
            BlendMode::HardLight => "hard-light",
            BlendMode::SoftLight => "soft-light",
            BlendMode::Difference => "difference",
            BlendMode::Exclusion => "exclusion",
        }
    }

    /// Discrete selector passed to the blend shader. Must match `passes.wgsl`.
    pub fn selector(self) -> u32 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Overlay => 3,
            BlendMode::Darken => 4,
            BlendMode::Lighten => 5,
            BlendMode::ColorDodge => 6,
            BlendMode::ColorBurn => 7,
            BlendMode::HardLight => 8,
            BlendMode::SoftLight => 9,
            BlendMode::Difference => 10,
            BlendMode::Exclusion => 11,
        }
    }
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Axis-aligned rectangle in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub scale: f32,
    pub rotation_deg: f32,
    pub flip_h: bool,
    pub flip_v: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            rotation_deg: 0.0,
            flip_h: false,
            flip_v: false,
        }
    }
}

/// Stylistic effects. Every field at zero means "no effect".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StylizeParams {
    pub vintage: f32,
    pub sepia: f32,
    pub grayscale: f32,
    pub invert: f32,
    /// Signed, `-1..=1`.
    pub vibrance: f32,
    pub noise: f32,
}

impl StylizeParams {
    pub fn is_identity(&self) -> bool {
        *self == StylizeParams::default()
    }
}

/// Tonal adjustments. Defaults are the identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneParams {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    /// Degrees.
    pub hue: f32,
    /// Photographic stops.
    pub exposure: f32,
    pub gamma: f32,
}

impl Default for ToneParams {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.0,
            hue: 0.0,
            exposure: 0.0,
            gamma: 1.0,
        }
    }
}

impl ToneParams {
    pub fn is_identity(&self) -> bool {
        *self == ToneParams::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FilterParams {
    /// Blur radius in pixels; zero skips both blur passes.
    pub blur: f32,
    pub stylize: StylizeParams,
    pub tone: ToneParams,
}

/// A single filter applied outside the layer stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Filter {
    Blur { radius: f32 },
    Stylize(StylizeParams),
    Tone(ToneParams),
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Blur { .. } => "blur",
            Filter::Stylize(_) => "stylize",
            Filter::Tone(_) => "tone",
        }
    }
}

#[derive(Debug, Clone)]
pub enum LayerContent {
    /// Pixel content; `signature` changes whenever the pixels do.
    Image {
        signature: String,
        pixels: Arc<RgbaImage>,
    },
    /// No pixels of its own; filters the composite beneath it.
    Adjustment,
}

/// Luminance mask placed with the same transform as its layer.
#[derive(Debug, Clone)]
pub struct LayerMask {
    pub signature: String,
    pub pixels: Arc<GrayImage>,
}

#[derive(Debug, Clone)]
pub struct LayerParams {
    pub id: LayerId,
    pub visible: bool,
    /// Percent, `0..=100`.
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub transform: Transform,
    /// Placement inside the canvas; defaults to the image at the origin.
    pub bounds: Option<Rect>,
    pub filters: FilterParams,
    pub content: LayerContent,
    pub mask: Option<LayerMask>,
}

impl LayerParams {
    pub fn image(id: LayerId, signature: impl Into<String>, pixels: Arc<RgbaImage>) -> Self {
        Self {
            id,
            visible: true,
            opacity: 100.0,
            blend_mode: BlendMode::Normal,
            transform: Transform::default(),
            bounds: None,
            filters: FilterParams::default(),
            content: LayerContent::Image {
                signature: signature.into(),
                pixels,
            },
            mask: None,
        }
    }

    pub fn adjustment(id: LayerId, tone: ToneParams) -> Self {
        Self {
            id,
            visible: true,
            opacity: 100.0,
            blend_mode: BlendMode::Normal,
            transform: Transform::default(),
            bounds: None,
            filters: FilterParams {
                tone,
                ..FilterParams::default()
            },
            content: LayerContent::Adjustment,
            mask: None,
        }
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    pub fn with_filters(mut self, filters: FilterParams) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_mask(mut self, mask: LayerMask) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn is_adjustment(&self) -> bool {
        matches!(self.content, LayerContent::Adjustment)
    }

    /// Feeds everything that affects the rendered output into `state`.
    /// Pixel buffers are represented by their signatures.
    pub fn fingerprint<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.visible.hash(state);
        self.opacity.to_bits().hash(state);
        self.blend_mode.hash(state);
        let t = &self.transform;
        for value in [t.scale, t.rotation_deg] {
            value.to_bits().hash(state);
        }
        (t.flip_h, t.flip_v).hash(state);
        if let Some(bounds) = self.bounds {
            for value in [bounds.x, bounds.y, bounds.width, bounds.height] {
                value.to_bits().hash(state);
            }
        }
        let f = &self.filters;
        let s = &f.stylize;
        let tone = &f.tone;
        for value in [
            f.blur,
            s.vintage,
            s.sepia,
            s.grayscale,
            s.invert,
            s.vibrance,
            s.noise,
            tone.brightness,
            tone.contrast,
            tone.saturation,
            tone.hue,
            tone.exposure,
            tone.gamma,
        ] {
            value.to_bits().hash(state);
        }
        match &self.content {
            LayerContent::Image { signature, .. } => signature.hash(state),
            LayerContent::Adjustment => "adjustment".hash(state),
        }
        if let Some(mask) = &self.mask {
            mask.signature.hash(state);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanvasParams {
    pub width: u32,
    pub height: u32,
}

impl CanvasParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Pass fidelity. Drafts trade blur taps and grain for latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Draft,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_names_resolve_case_insensitively() {
        assert_eq!(BlendMode::from_name("Multiply"), BlendMode::Multiply);
        assert_eq!(BlendMode::from_name("color_dodge"), BlendMode::ColorDodge);
        assert_eq!(BlendMode::from_name("SOFT-LIGHT"), BlendMode::SoftLight);
    }

    #[test]
    fn unknown_blend_names_fall_back_to_normal() {
        assert_eq!(BlendMode::from_name("luminosity"), BlendMode::Normal);
        assert_eq!(BlendMode::from_name(""), BlendMode::Normal);
    }

    #[test]
    fn selectors_are_unique() {
        let mut selectors: Vec<_> = BlendMode::ALL.iter().map(|mode| mode.selector()).collect();
        selectors.sort_unstable();
        selectors.dedup();
        assert_eq!(selectors.len(), BlendMode::ALL.len());
    }

    #[test]
    fn default_filters_are_identity() {
        let filters = FilterParams::default();
        assert!(filters.stylize.is_identity());
        assert!(filters.tone.is_identity());
        assert_eq!(filters.blur, 0.0);
    }
}
