//! Interpolable per-source state: placement groups, blending and image
//! processing parameters
//!
//! `SourceCore` is the slice of a source that snapshots capture and the
//! interpolator blends; everything in it must lerp sensibly.

use serde::{Deserialize, Serialize};

use crate::frame::{BlendMode, Placement};

/// The views a source can be manipulated in; each has its own placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum View {
    Mixing,
    Geometry,
    Layer,
    Texture,
}

pub const ALL_VIEWS: [View; 4] = [View::Mixing, View::Geometry, View::Layer, View::Texture];

/// Color inversion modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InvertMode {
    #[default]
    None,
    Color,
    Luminance,
}

/// Image processing parameters, applied between the texture and the frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProcessing {
    pub enabled: bool,
    /// additive, `[-1, 1]`
    pub brightness: f32,
    /// around mid-gray, `[-1, 1]`
    pub contrast: f32,
    /// `[-1, 1]`, -1 is grayscale
    pub saturation: f32,
    /// hue shift, turns, `[0, 1]`
    pub hue: f32,
    /// luminance threshold, `[0, 1]`, zero disables
    pub threshold: f32,
    /// exponent, `(0, 10]`
    pub gamma: f32,
    /// per-channel gamma tint, RGBA
    pub gamma_color: [f32; 4],
    pub invert: InvertMode,
    /// number of levels per channel, zero disables
    pub posterize: u32,
}

impl Default for ImageProcessing {
    fn default() -> Self {
        ImageProcessing {
            enabled: false,
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.0,
            hue: 0.0,
            threshold: 0.0,
            gamma: 1.0,
            gamma_color: [1.0, 1.0, 1.0, 1.0],
            invert: InvertMode::None,
            posterize: 0,
        }
    }
}

impl ImageProcessing {
    pub fn lerp(a: &ImageProcessing, b: &ImageProcessing, p: f32) -> ImageProcessing {
        let l = |x: f32, y: f32| x + (y - x) * p;
        ImageProcessing {
            enabled: if p < 0.5 { a.enabled } else { b.enabled },
            brightness: l(a.brightness, b.brightness),
            contrast: l(a.contrast, b.contrast),
            saturation: l(a.saturation, b.saturation),
            hue: l(a.hue, b.hue),
            threshold: l(a.threshold, b.threshold),
            gamma: l(a.gamma, b.gamma),
            gamma_color: [
                l(a.gamma_color[0], b.gamma_color[0]),
                l(a.gamma_color[1], b.gamma_color[1]),
                l(a.gamma_color[2], b.gamma_color[2]),
                l(a.gamma_color[3], b.gamma_color[3]),
            ],
            invert: if p < 0.5 { a.invert } else { b.invert },
            posterize: if p < 0.5 { a.posterize } else { b.posterize },
        }
    }
}

/// Placements of a source in every view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlacementGroup {
    pub mixing: Placement,
    pub geometry: Placement,
    pub layer: Placement,
    pub texture: Placement,
}

impl PlacementGroup {
    pub fn get(&self, view: View) -> &Placement {
        match view {
            View::Mixing => &self.mixing,
            View::Geometry => &self.geometry,
            View::Layer => &self.layer,
            View::Texture => &self.texture,
        }
    }

    pub fn get_mut(&mut self, view: View) -> &mut Placement {
        match view {
            View::Mixing => &mut self.mixing,
            View::Geometry => &mut self.geometry,
            View::Layer => &mut self.layer,
            View::Texture => &mut self.texture,
        }
    }

    pub fn lerp(a: &PlacementGroup, b: &PlacementGroup, p: f32) -> PlacementGroup {
        PlacementGroup {
            mixing: Placement::lerp(&a.mixing, &b.mixing, p),
            geometry: Placement::lerp(&a.geometry, &b.geometry, p),
            layer: Placement::lerp(&a.layer, &b.layer, p),
            texture: Placement::lerp(&a.texture, &b.texture, p),
        }
    }
}

/// The mutable, interpolable state of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCore {
    /// `[-1, 1]`, negative means inactive in the mix
    pub alpha: f32,
    /// `[0, 12]`, composition order key
    pub depth: f32,
    pub blending: BlendMode,
    pub placements: PlacementGroup,
    pub image_processing: ImageProcessing,
}

impl Default for SourceCore {
    fn default() -> Self {
        SourceCore {
            alpha: 1.0,
            depth: 0.0,
            blending: BlendMode::Normal,
            placements: PlacementGroup::default(),
            image_processing: ImageProcessing::default(),
        }
    }
}

impl SourceCore {
    pub fn lerp(a: &SourceCore, b: &SourceCore, p: f32) -> SourceCore {
        let l = |x: f32, y: f32| x + (y - x) * p;
        SourceCore {
            alpha: l(a.alpha, b.alpha),
            depth: l(a.depth, b.depth),
            blending: if p < 0.5 { a.blending } else { b.blending },
            placements: PlacementGroup::lerp(&a.placements, &b.placements, p),
            image_processing: ImageProcessing::lerp(&a.image_processing, &b.image_processing, p),
        }
    }
}
