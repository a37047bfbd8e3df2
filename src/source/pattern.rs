//! Procedural pattern generation
//!
//! Patterns are generated on the CPU so they stay available without any
//! capture or decode pipeline. Ids are stable across sessions.

use serde::{Deserialize, Serialize};

use crate::frame::Image;

/// Procedural pattern kinds, addressed by a stable id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternType {
    Black,
    White,
    Checker,
    ColorBars,
    Grid,
    GradientHorizontal,
    GradientVertical,
    Circle,
    Snow,
}

impl PatternType {
    pub fn from_id(id: u32) -> PatternType {
        match id {
            1 => PatternType::White,
            2 => PatternType::Checker,
            3 => PatternType::ColorBars,
            4 => PatternType::Grid,
            5 => PatternType::GradientHorizontal,
            6 => PatternType::GradientVertical,
            7 => PatternType::Circle,
            8 => PatternType::Snow,
            _ => PatternType::Black,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            PatternType::Black => 0,
            PatternType::White => 1,
            PatternType::Checker => 2,
            PatternType::ColorBars => 3,
            PatternType::Grid => 4,
            PatternType::GradientHorizontal => 5,
            PatternType::GradientVertical => 6,
            PatternType::Circle => 7,
            PatternType::Snow => 8,
        }
    }

    /// True for patterns whose content changes over time
    pub fn animated(self) -> bool {
        matches!(self, PatternType::Snow)
    }
}

/// A pattern generator with its animation phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    kind: PatternType,
    phase: f64,
}

impl Pattern {
    pub fn from_id(id: u32) -> Self {
        Pattern {
            kind: PatternType::from_id(id),
            phase: 0.0,
        }
    }

    pub fn kind(&self) -> PatternType {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.kind.id()
    }

    pub fn advance(&mut self, dt: f64) {
        if self.kind.animated() {
            self.phase += dt;
        }
    }

    pub fn generate(&self, width: u32, height: u32) -> Image {
        let width = width.max(1);
        let height = height.max(1);
        match self.kind {
            PatternType::Black => Image::filled(width, height, [0, 0, 0, 255]),
            PatternType::White => Image::filled(width, height, [255, 255, 255, 255]),
            PatternType::Checker => {
                let mut img = Image::new(width, height);
                let cell = (width / 8).max(1);
                for y in 0..height {
                    for x in 0..width {
                        let v = if ((x / cell) + (y / cell)) % 2 == 0 { 230 } else { 25 };
                        img.set_pixel(x, y, [v, v, v, 255]);
                    }
                }
                img
            }
            PatternType::ColorBars => {
                // SMPTE-like vertical bars
                const BARS: [[u8; 3]; 7] = [
                    [192, 192, 192],
                    [192, 192, 0],
                    [0, 192, 192],
                    [0, 192, 0],
                    [192, 0, 192],
                    [192, 0, 0],
                    [0, 0, 192],
                ];
                let mut img = Image::new(width, height);
                for y in 0..height {
                    for x in 0..width {
                        let bar = BARS[(x as usize * BARS.len() / width as usize).min(BARS.len() - 1)];
                        img.set_pixel(x, y, [bar[0], bar[1], bar[2], 255]);
                    }
                }
                img
            }
            PatternType::Grid => {
                let mut img = Image::filled(width, height, [10, 10, 10, 255]);
                let cell = (width / 10).max(2);
                for y in 0..height {
                    for x in 0..width {
                        if x % cell == 0 || y % cell == 0 {
                            img.set_pixel(x, y, [200, 200, 200, 255]);
                        }
                    }
                }
                img
            }
            PatternType::GradientHorizontal => {
                let mut img = Image::new(width, height);
                for y in 0..height {
                    for x in 0..width {
                        let v = (x * 255 / width.max(1)) as u8;
                        img.set_pixel(x, y, [v, v, v, 255]);
                    }
                }
                img
            }
            PatternType::GradientVertical => {
                let mut img = Image::new(width, height);
                for y in 0..height {
                    let v = (y * 255 / height.max(1)) as u8;
                    for x in 0..width {
                        img.set_pixel(x, y, [v, v, v, 255]);
                    }
                }
                img
            }
            PatternType::Circle => {
                let mut img = Image::filled(width, height, [0, 0, 0, 255]);
                let cx = width as f32 / 2.0;
                let cy = height as f32 / 2.0;
                let radius = cx.min(cy) * 0.8;
                for y in 0..height {
                    for x in 0..width {
                        let dx = x as f32 + 0.5 - cx;
                        let dy = y as f32 + 0.5 - cy;
                        if (dx * dx + dy * dy).sqrt() <= radius {
                            img.set_pixel(x, y, [255, 255, 255, 255]);
                        }
                    }
                }
                img
            }
            PatternType::Snow => {
                // deterministic noise seeded by the animation phase
                let mut img = Image::new(width, height);
                let mut state = (self.phase * 1000.0) as u64 ^ 0x9E37_79B9_7F4A_7C15;
                for y in 0..height {
                    for x in 0..width {
                        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                        let v = (state >> 33) as u8;
                        img.set_pixel(x, y, [v, v, v, 255]);
                    }
                }
                img
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        for id in 0..=8 {
            assert_eq!(PatternType::from_id(id).id(), id);
        }
        assert_eq!(PatternType::from_id(999), PatternType::Black);
    }

    #[test]
    fn static_patterns_are_stable() {
        let p = Pattern::from_id(2);
        assert_eq!(p.generate(32, 32), p.generate(32, 32));
    }

    #[test]
    fn snow_changes_with_phase() {
        let mut p = Pattern::from_id(8);
        let a = p.generate(16, 16);
        p.advance(0.5);
        let b = p.generate(16, 16);
        assert_ne!(a, b);
    }

    #[test]
    fn generated_size_matches_request() {
        let p = Pattern::from_id(3);
        let img = p.generate(320, 240);
        assert_eq!((img.width, img.height), (320, 240));
    }
}
