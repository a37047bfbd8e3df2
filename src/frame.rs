//! CPU render targets
//!
//! The scene graph and shaders live outside the core, so a [`FrameBuffer`]
//! here is an RGBA8 pixel buffer exposing the same surface the GPU path
//! would: clear, blended draws, pixel readback and thumbnail extraction.

use serde::{Deserialize, Serialize};

/// Height of thumbnails embedded in sessions and history entries
pub const THUMBNAIL_HEIGHT: u32 = 64;

/// An RGBA8 image, row-major, tightly packed
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Image {
            width,
            height,
            pixels: vec![0u8; (width * height * 4) as usize],
        }
    }

    /// Uniformly filled image
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..(width * height) {
            pixels.extend_from_slice(&rgba);
        }
        Image {
            width,
            height,
            pixels,
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = ((y * self.width + x) * 4) as usize;
        self.pixels[i..i + 4].copy_from_slice(&rgba);
    }

    /// Box-downsampled copy with the given height, preserving aspect ratio
    pub fn downsample(&self, target_height: u32) -> Image {
        if self.height == 0 || self.width == 0 || target_height == 0 {
            return Image::new(1, 1);
        }
        let th = target_height.min(self.height);
        let tw = ((self.width as u64 * th as u64) / self.height as u64).max(1) as u32;
        let mut out = Image::new(tw, th);
        for y in 0..th {
            for x in 0..tw {
                let sx0 = x as u64 * self.width as u64 / tw as u64;
                let sx1 = ((x + 1) as u64 * self.width as u64 / tw as u64).max(sx0 + 1);
                let sy0 = y as u64 * self.height as u64 / th as u64;
                let sy1 = ((y + 1) as u64 * self.height as u64 / th as u64).max(sy0 + 1);
                let mut acc = [0u64; 4];
                let mut n = 0u64;
                for sy in sy0..sy1 {
                    for sx in sx0..sx1 {
                        let p = self.pixel(sx as u32, sy as u32);
                        for c in 0..4 {
                            acc[c] += p[c] as u64;
                        }
                        n += 1;
                    }
                }
                out.set_pixel(x, y, [(acc[0] / n) as u8, (acc[1] / n) as u8, (acc[2] / n) as u8, (acc[3] / n) as u8]);
            }
        }
        out
    }
}

/// Blending applied when a source frame is composited into the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Additive,
    Multiply,
    Screen,
    Subtract,
}

impl BlendMode {
    #[inline]
    fn mix(self, dst: f32, src: f32, a: f32) -> f32 {
        match self {
            BlendMode::Normal => src * a + dst * (1.0 - a),
            BlendMode::Additive => dst + src * a,
            BlendMode::Multiply => dst * (1.0 - a) + dst * src * a,
            BlendMode::Screen => {
                let screen = 1.0 - (1.0 - dst) * (1.0 - src);
                dst * (1.0 - a) + screen * a
            }
            BlendMode::Subtract => dst - src * a,
        }
    }
}

/// Placement of a source frame inside the output, in normalized scene
/// coordinates: x spans `[-aspect, aspect]`, y spans `[-1, 1]`, origin at the
/// center. Identity shows the frame centered at full height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub translation: (f32, f32),
    pub rotation: f32,
    pub scale: (f32, f32),
}

impl Default for Placement {
    fn default() -> Self {
        Placement {
            translation: (0.0, 0.0),
            rotation: 0.0,
            scale: (1.0, 1.0),
        }
    }
}

impl Placement {
    /// Linear interpolation between two placements
    pub fn lerp(a: &Placement, b: &Placement, p: f32) -> Placement {
        let l = |x: f32, y: f32| x + (y - x) * p;
        Placement {
            translation: (l(a.translation.0, b.translation.0), l(a.translation.1, b.translation.1)),
            rotation: l(a.rotation, b.rotation),
            scale: (l(a.scale.0, b.scale.0), l(a.scale.1, b.scale.1)),
        }
    }
}

/// A render target plus its pixel storage
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    image: Image,
    use_alpha: bool,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32, use_alpha: bool) -> Self {
        FrameBuffer {
            image: Image::new(width.max(1), height.max(1)),
            use_alpha,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn use_alpha(&self) -> bool {
        self.use_alpha
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.image.aspect_ratio()
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Image {
        &mut self.image
    }

    /// Byte size of one frame of this buffer as delivered to grabbers
    pub fn data_size(&self) -> usize {
        (self.image.width * self.image.height * if self.use_alpha { 4 } else { 3 }) as usize
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width != self.image.width || height != self.image.height {
            self.image = Image::new(width.max(1), height.max(1));
        }
    }

    pub fn clear(&mut self, rgba: [u8; 4]) {
        for chunk in self.image.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&rgba);
        }
    }

    /// Copies pixels out in the grabber layout (RGB or RGBA, per `use_alpha`).
    pub fn read_pixels(&self, out: &mut Vec<u8>) {
        out.clear();
        if self.use_alpha {
            out.extend_from_slice(&self.image.pixels);
        } else {
            out.reserve(self.data_size());
            for chunk in self.image.pixels.chunks_exact(4) {
                out.extend_from_slice(&chunk[..3]);
            }
        }
    }

    /// Draws `src` into this buffer with the given placement, opacity and
    /// blending. Pixels outside the source sample nothing.
    pub fn blend(&mut self, src: &Image, placement: &Placement, alpha: f32, mode: BlendMode) {
        if alpha <= 0.0 || src.width == 0 || src.height == 0 {
            return;
        }
        let alpha = alpha.min(1.0);
        let out_w = self.image.width;
        let out_h = self.image.height;
        let out_aspect = self.image.aspect_ratio();
        let src_aspect = src.aspect_ratio();
        let (sin_r, cos_r) = placement.rotation.sin_cos();
        let sx = if placement.scale.0.abs() < 1e-6 { 1e-6 } else { placement.scale.0 };
        let sy = if placement.scale.1.abs() < 1e-6 { 1e-6 } else { placement.scale.1 };

        for py in 0..out_h {
            let ny = ((py as f32 + 0.5) / out_h as f32) * 2.0 - 1.0;
            for px in 0..out_w {
                let nx = (((px as f32 + 0.5) / out_w as f32) * 2.0 - 1.0) * out_aspect;
                // inverse placement: translate, rotate back, unscale
                let tx = nx - placement.translation.0;
                let ty = ny - placement.translation.1;
                let rx = (tx * cos_r + ty * sin_r) / sx;
                let ry = (-tx * sin_r + ty * cos_r) / sy;
                let u = (rx / src_aspect + 1.0) * 0.5;
                let v = (ry + 1.0) * 0.5;
                if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
                    continue;
                }
                let sxp = ((u * src.width as f32) as u32).min(src.width - 1);
                let syp = ((v * src.height as f32) as u32).min(src.height - 1);
                let s = src.pixel(sxp, syp);
                let a = alpha * (s[3] as f32 / 255.0);
                if a <= 0.0 {
                    continue;
                }
                let d = self.image.pixel(px, py);
                let mut out = [0u8; 4];
                for c in 0..3 {
                    let blended = mode.mix(d[c] as f32 / 255.0, s[c] as f32 / 255.0, a);
                    out[c] = (blended.clamp(0.0, 1.0) * 255.0).round() as u8;
                }
                out[3] = d[3].max((a * 255.0).round() as u8);
                self.image.set_pixel(px, py, out);
            }
        }
    }

    /// Thumbnail of the current content
    pub fn thumbnail(&self) -> Image {
        self.image.downsample(THUMBNAIL_HEIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleared_buffer_is_uniform() {
        let mut fb = FrameBuffer::new(8, 8, true);
        fb.clear([10, 20, 30, 255]);
        assert_eq!(fb.image().pixel(0, 0), [10, 20, 30, 255]);
        assert_eq!(fb.image().pixel(7, 7), [10, 20, 30, 255]);
    }

    #[test]
    fn read_pixels_drops_alpha_when_disabled() {
        let mut fb = FrameBuffer::new(2, 2, false);
        fb.clear([1, 2, 3, 255]);
        let mut out = Vec::new();
        fb.read_pixels(&mut out);
        assert_eq!(out.len(), 2 * 2 * 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn normal_blend_covers_destination() {
        let mut fb = FrameBuffer::new(16, 16, true);
        fb.clear([0, 0, 0, 255]);
        let src = Image::filled(16, 16, [255, 255, 255, 255]);
        fb.blend(&src, &Placement::default(), 1.0, BlendMode::Normal);
        // center pixel is inside the source placement
        assert_eq!(fb.image().pixel(8, 8), [255, 255, 255, 255]);
    }

    #[test]
    fn half_alpha_blend_is_halfway() {
        let mut fb = FrameBuffer::new(8, 8, true);
        fb.clear([0, 0, 0, 255]);
        let src = Image::filled(8, 8, [255, 255, 255, 255]);
        fb.blend(&src, &Placement::default(), 0.5, BlendMode::Normal);
        let p = fb.image().pixel(4, 4);
        assert!((p[0] as i32 - 128).abs() <= 1, "got {:?}", p);
    }

    #[test]
    fn translation_moves_content_out_of_frame() {
        let mut fb = FrameBuffer::new(8, 8, true);
        fb.clear([0, 0, 0, 255]);
        let src = Image::filled(8, 8, [255, 0, 0, 255]);
        let placement = Placement {
            translation: (10.0, 0.0),
            ..Default::default()
        };
        fb.blend(&src, &placement, 1.0, BlendMode::Normal);
        assert_eq!(fb.image().pixel(4, 4), [0, 0, 0, 255]);
    }

    #[test]
    fn downsample_preserves_uniform_color() {
        let img = Image::filled(128, 72, [40, 80, 120, 255]);
        let thumb = img.downsample(THUMBNAIL_HEIGHT);
        assert_eq!(thumb.height, THUMBNAIL_HEIGHT);
        assert_eq!(thumb.pixel(0, 0), [40, 80, 120, 255]);
    }
}
