//! CPU implementation of the per-source image processing chain
//!
//! Order matches the shader chain of the render path: gamma, brightness and
//! contrast, saturation and hue, threshold, posterize, invert.

use crate::frame::Image;
use crate::source::core::{ImageProcessing, InvertMode};

#[inline]
fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }
    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    let h = if max == r {
        ((g - b) / d + if g < b { 6.0 } else { 0.0 }) / 6.0
    } else if max == g {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };
    (h, s, l)
}

#[inline]
fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

#[inline]
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

#[inline]
fn luminance(r: f32, g: f32, b: f32) -> f32 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

/// Applies the processing chain to one RGBA pixel, channels in `[0,1]`
fn process_pixel(p: &ImageProcessing, mut r: f32, mut g: f32, mut b: f32, a: f32) -> (f32, f32, f32, f32) {
    // gamma with per-channel tint
    if (p.gamma - 1.0).abs() > 1e-6 || p.gamma_color != [1.0, 1.0, 1.0, 1.0] {
        let exponent = 1.0 / p.gamma.max(0.01);
        r = (r * p.gamma_color[0]).max(0.0).powf(exponent);
        g = (g * p.gamma_color[1]).max(0.0).powf(exponent);
        b = (b * p.gamma_color[2]).max(0.0).powf(exponent);
    }

    // brightness and contrast
    let factor = 1.0 + p.contrast;
    r = (r - 0.5) * factor + 0.5 + p.brightness;
    g = (g - 0.5) * factor + 0.5 + p.brightness;
    b = (b - 0.5) * factor + 0.5 + p.brightness;

    // saturation and hue
    if p.saturation.abs() > 1e-6 || p.hue.abs() > 1e-6 {
        let (h, s, l) = rgb_to_hsl(r.clamp(0.0, 1.0), g.clamp(0.0, 1.0), b.clamp(0.0, 1.0));
        let s = (s * (1.0 + p.saturation)).clamp(0.0, 1.0);
        let h = (h + p.hue).rem_euclid(1.0);
        let (nr, ng, nb) = hsl_to_rgb(h, s, l);
        r = nr;
        g = ng;
        b = nb;
    }

    // threshold on luminance
    if p.threshold > 0.0 {
        let v = if luminance(r, g, b) > p.threshold { 1.0 } else { 0.0 };
        r = v;
        g = v;
        b = v;
    }

    // posterize
    if p.posterize > 1 {
        let levels = p.posterize as f32;
        r = (r * levels).floor() / (levels - 1.0);
        g = (g * levels).floor() / (levels - 1.0);
        b = (b * levels).floor() / (levels - 1.0);
    }

    match p.invert {
        InvertMode::None => {}
        InvertMode::Color => {
            r = 1.0 - r;
            g = 1.0 - g;
            b = 1.0 - b;
        }
        InvertMode::Luminance => {
            let (h, s, l) = rgb_to_hsl(r.clamp(0.0, 1.0), g.clamp(0.0, 1.0), b.clamp(0.0, 1.0));
            let (nr, ng, nb) = hsl_to_rgb(h, s, 1.0 - l);
            r = nr;
            g = ng;
            b = nb;
        }
    }

    (r.clamp(0.0, 1.0), g.clamp(0.0, 1.0), b.clamp(0.0, 1.0), a)
}

/// Applies the chain to a whole image
pub fn apply(image: &Image, p: &ImageProcessing) -> Image {
    let mut out = image.clone();
    for chunk in out.pixels.chunks_exact_mut(4) {
        let (r, g, b, a) = process_pixel(
            p,
            chunk[0] as f32 / 255.0,
            chunk[1] as f32 / 255.0,
            chunk[2] as f32 / 255.0,
            chunk[3] as f32 / 255.0,
        );
        chunk[0] = (r * 255.0).round() as u8;
        chunk[1] = (g * 255.0).round() as u8;
        chunk[2] = (b * 255.0).round() as u8;
        chunk[3] = (a * 255.0).round() as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray() -> Image {
        Image::filled(4, 4, [128, 128, 128, 255])
    }

    #[test]
    fn default_chain_is_identity() {
        let img = gray();
        let out = apply(&img, &ImageProcessing::default());
        assert_eq!(out.pixel(0, 0), [128, 128, 128, 255]);
    }

    #[test]
    fn brightness_shifts_up() {
        let mut p = ImageProcessing::default();
        p.brightness = 0.5;
        let out = apply(&gray(), &p);
        assert!(out.pixel(0, 0)[0] > 200);
    }

    #[test]
    fn double_invert_is_identity() {
        let mut p = ImageProcessing::default();
        p.invert = InvertMode::Color;
        let img = Image::filled(2, 2, [10, 200, 70, 255]);
        let once = apply(&img, &p);
        let twice = apply(&once, &p);
        assert_eq!(twice.pixel(0, 0), img.pixel(0, 0));
    }

    #[test]
    fn threshold_binarizes() {
        let mut p = ImageProcessing::default();
        p.threshold = 0.6;
        let dark = apply(&Image::filled(1, 1, [50, 50, 50, 255]), &p);
        let bright = apply(&Image::filled(1, 1, [220, 220, 220, 255]), &p);
        assert_eq!(dark.pixel(0, 0)[0], 0);
        assert_eq!(bright.pixel(0, 0)[0], 255);
    }

    #[test]
    fn desaturation_makes_gray() {
        let mut p = ImageProcessing::default();
        p.saturation = -1.0;
        let out = apply(&Image::filled(1, 1, [255, 0, 0, 255]), &p);
        let [r, g, b, _] = out.pixel(0, 0);
        assert!(r.abs_diff(g) <= 2 && g.abs_diff(b) <= 2, "got {:?}", (r, g, b));
    }

    #[test]
    fn alpha_is_preserved() {
        let mut p = ImageProcessing::default();
        p.brightness = -0.3;
        p.invert = InvertMode::Color;
        let out = apply(&Image::filled(1, 1, [90, 90, 90, 77]), &p);
        assert_eq!(out.pixel(0, 0)[3], 77);
    }
}
