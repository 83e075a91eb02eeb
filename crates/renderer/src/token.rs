use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::types::{CanvasParams, LayerParams};

/// Identifies one logical document state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderToken {
    /// Digest of the render inputs; equal inputs give equal signatures.
    pub signature: String,
    /// Strictly increasing per issuer.
    pub generation: u64,
}

/// Mints render tokens on the scheduler side.
#[derive(Debug, Default)]
pub struct TokenIssuer {
    last_generation: u64,
}

impl TokenIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, layers: &[LayerParams], canvas: CanvasParams) -> RenderToken {
        self.last_generation += 1;
        RenderToken {
            signature: signature(layers, canvas),
            generation: self.last_generation,
        }
    }

    pub fn last_generation(&self) -> u64 {
        self.last_generation
    }
}

pub fn signature(layers: &[LayerParams], canvas: CanvasParams) -> String {
    let mut hasher = DefaultHasher::new();
    canvas.hash(&mut hasher);
    layers.len().hash(&mut hasher);
    for layer in layers {
        layer.fingerprint(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Highest generation the worker has observed.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenerationTracker {
    latest: Option<u64>,
}

impl GenerationTracker {
    /// Records `generation`; returns true when it is the newest seen so far.
    pub fn observe(&mut self, generation: u64) -> bool {
        match self.latest {
            Some(latest) if generation < latest => false,
            _ => {
                self.latest = Some(generation);
                true
            }
        }
    }

    /// Marks `generation` and everything before it as superseded.
    pub fn retire(&mut self, generation: u64) {
        self.observe(generation.saturating_add(1));
    }

    pub fn is_stale(&self, generation: u64) -> bool {
        self.latest.is_some_and(|latest| generation < latest)
    }

    pub fn latest(&self) -> Option<u64> {
        self.latest
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::RgbaImage;

    use super::*;
    use crate::types::LayerId;

    fn layer(signature: &str) -> LayerParams {
        LayerParams::image(LayerId(1), signature, Arc::new(RgbaImage::new(1, 1)))
    }

    #[test]
    fn generations_increase_and_signatures_follow_inputs() {
        let mut issuer = TokenIssuer::new();
        let canvas = CanvasParams::new(4, 4);
        let a = issuer.issue(&[layer("a")], canvas);
        let b = issuer.issue(&[layer("a")], canvas);
        let c = issuer.issue(&[layer("b")], canvas);
        assert!(a.generation < b.generation && b.generation < c.generation);
        assert_eq!(a.signature, b.signature);
        assert_ne!(b.signature, c.signature);
    }

    #[test]
    fn opacity_changes_alter_signature() {
        let canvas = CanvasParams::new(4, 4);
        let base = signature(&[layer("a")], canvas);
        let faded = signature(&[layer("a").with_opacity(50.0)], canvas);
        assert_ne!(base, faded);
    }

    #[test]
    fn tracker_flags_older_generations() {
        let mut tracker = GenerationTracker::default();
        assert!(!tracker.is_stale(1));
        assert!(tracker.observe(3));
        assert!(!tracker.observe(2));
        assert!(tracker.is_stale(2));
        assert!(!tracker.is_stale(3));
        assert_eq!(tracker.latest(), Some(3));
    }

    #[test]
    fn retired_generation_becomes_stale() {
        let mut tracker = GenerationTracker::default();
        tracker.observe(4);
        tracker.retire(4);
        assert!(tracker.is_stale(4));
        assert!(!tracker.is_stale(5));

        tracker.retire(2);
        assert!(!tracker.is_stale(5));
    }
}
