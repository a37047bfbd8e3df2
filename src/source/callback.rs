//! Parameterized actions applied to sources by inputs and the OSC surface
//!
//! Each callback is a small state object: `apply` is called every tick with
//! the elapsed time and returns whether the callback still runs. A
//! non-bidirectional callback applies once (or animates once to its target);
//! a bidirectional callback reverts its effect when the input is released.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::frame::Placement;
use crate::metronome::Metronome;
use crate::source::core::{InvertMode, View};
use crate::source::Source;

/// Outcome of one `apply` round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    Continue,
    Done,
}

/// The action performed by a callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallbackKind {
    /// Animate alpha toward a value
    SetAlpha { value: f32 },
    /// Continuous alpha change while held
    Loom { speed: f32 },
    SetDepth { value: f32 },
    /// Animate the placement in a view toward a target transform
    SetGeometry { view: View, placement: Placement },
    /// Continuous translation while held
    Grab { dx: f32, dy: f32 },
    /// Continuous scaling while held
    Resize { dsx: f32, dsy: f32 },
    /// Continuous rotation while held, radians per second
    Turn { velocity: f32 },
    Play { on: bool },
    PlaySpeed { factor: f64 },
    /// Repeated fast-forward jumps while held
    PlayFastForward { step_ms: u64 },
    Seek { target_ns: u64 },
    /// Jump to the timeline flag at an index
    Flag { index: usize },
    SetBrightness { value: f32 },
    SetContrast { value: f32 },
    SetSaturation { value: f32 },
    SetHue { value: f32 },
    SetThreshold { value: f32 },
    SetGamma { value: f32 },
    SetInvert { mode: InvertMode },
}

/// Value captured before the first application, for reverting
#[derive(Debug, Clone)]
enum Initial {
    Scalar(f32),
    Speed(f64),
    Placement(Placement),
    Invert(InvertMode),
    Playing(bool),
    Position(u64),
    None,
}

/// A live callback instance with its own ephemeral progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCallback {
    kind: CallbackKind,
    bidirectional: bool,
    duration_ms: f64,
    #[serde(skip)]
    cursor: f64,
    #[serde(skip)]
    released: bool,
    #[serde(skip, default = "default_initial")]
    initial: Initial,
    #[serde(skip)]
    applied_once: bool,
}

fn default_initial() -> Initial {
    Initial::None
}

impl SourceCallback {
    pub fn new(kind: CallbackKind) -> Self {
        SourceCallback {
            kind,
            bidirectional: false,
            duration_ms: 0.0,
            cursor: 0.0,
            released: false,
            initial: Initial::None,
            applied_once: false,
        }
    }

    pub fn bidirectional(mut self, on: bool) -> Self {
        self.bidirectional = on;
        self
    }

    pub fn duration_ms(mut self, ms: f64) -> Self {
        self.duration_ms = ms.max(0.0);
        self
    }

    pub fn kind(&self) -> &CallbackKind {
        &self.kind
    }

    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    /// Signals key-up: a bidirectional callback starts reverting, the others
    /// finish.
    pub fn release(&mut self) {
        self.released = true;
    }

    /// Fresh instance with the same parameters and no progress
    pub fn restarted(&self) -> SourceCallback {
        SourceCallback::new(self.kind.clone())
            .bidirectional(self.bidirectional)
            .duration_ms(self.duration_ms)
    }

    fn capture_initial(&mut self, source: &Source) {
        if !matches!(self.initial, Initial::None) {
            return;
        }
        self.initial = match &self.kind {
            CallbackKind::SetAlpha { .. } | CallbackKind::Loom { .. } => Initial::Scalar(source.alpha()),
            CallbackKind::SetDepth { .. } => Initial::Scalar(source.depth()),
            CallbackKind::SetGeometry { view, .. } => Initial::Placement(*source.placement(*view)),
            CallbackKind::Grab { .. } | CallbackKind::Resize { .. } | CallbackKind::Turn { .. } => {
                Initial::Placement(*source.placement(View::Geometry))
            }
            CallbackKind::Play { .. } => Initial::Playing(source.playing()),
            CallbackKind::PlaySpeed { .. } => Initial::Speed(
                source.media_player().map(|p| p.play_speed()).unwrap_or(1.0),
            ),
            CallbackKind::PlayFastForward { .. } => Initial::None,
            CallbackKind::Seek { .. } | CallbackKind::Flag { .. } => Initial::Position(
                source.media_player().map(|p| p.position()).unwrap_or(0),
            ),
            CallbackKind::SetBrightness { .. } => Initial::Scalar(source.core().image_processing.brightness),
            CallbackKind::SetContrast { .. } => Initial::Scalar(source.core().image_processing.contrast),
            CallbackKind::SetSaturation { .. } => Initial::Scalar(source.core().image_processing.saturation),
            CallbackKind::SetHue { .. } => Initial::Scalar(source.core().image_processing.hue),
            CallbackKind::SetThreshold { .. } => Initial::Scalar(source.core().image_processing.threshold),
            CallbackKind::SetGamma { .. } => Initial::Scalar(source.core().image_processing.gamma),
            CallbackKind::SetInvert { .. } => Initial::Invert(source.core().image_processing.invert),
        };
        if matches!(self.initial, Initial::None)
            && !matches!(self.kind, CallbackKind::PlayFastForward { .. })
        {
            // unreachable by construction, but keep a sentinel distinct from
            // "not yet captured"
            self.initial = Initial::Scalar(0.0);
        }
    }

    /// Applies one round; `dt_ms` is the elapsed time since the last round.
    pub fn apply(&mut self, source: &mut Source, metronome: &Metronome, dt_ms: f64) -> CallbackState {
        self.capture_initial(source);

        match self.kind.clone() {
            // ---- animated set-value callbacks -----------------------------
            CallbackKind::SetAlpha { value } => self.animate_scalar(dt_ms, value, |s, v| s.set_alpha(v), source),
            CallbackKind::SetDepth { value } => self.animate_scalar(dt_ms, value, |s, v| s.set_depth(v), source),
            CallbackKind::SetBrightness { value } => {
                self.animate_scalar(dt_ms, value, |s, v| s.core_mut().image_processing.brightness = v.clamp(-1.0, 1.0), source)
            }
            CallbackKind::SetContrast { value } => {
                self.animate_scalar(dt_ms, value, |s, v| s.core_mut().image_processing.contrast = v.clamp(-1.0, 1.0), source)
            }
            CallbackKind::SetSaturation { value } => {
                self.animate_scalar(dt_ms, value, |s, v| s.core_mut().image_processing.saturation = v.clamp(-1.0, 1.0), source)
            }
            CallbackKind::SetHue { value } => {
                self.animate_scalar(dt_ms, value, |s, v| s.core_mut().image_processing.hue = v.rem_euclid(1.0), source)
            }
            CallbackKind::SetThreshold { value } => {
                self.animate_scalar(dt_ms, value, |s, v| s.core_mut().image_processing.threshold = v.clamp(0.0, 1.0), source)
            }
            CallbackKind::SetGamma { value } => {
                self.animate_scalar(dt_ms, value, |s, v| s.core_mut().image_processing.gamma = v.clamp(0.01, 10.0), source)
            }
            CallbackKind::PlaySpeed { factor } => {
                let initial = match self.initial {
                    Initial::Speed(v) => v,
                    _ => 1.0,
                };
                let p = self.advance_cursor(dt_ms);
                if let Some(player) = source.media_player_mut() {
                    player.set_play_speed(initial + (factor - initial) * p as f64);
                }
                self.settle()
            }

            // ---- continuous while-held callbacks --------------------------
            CallbackKind::Loom { speed } => {
                if self.released {
                    return self.revert_continuous(source);
                }
                let a = source.alpha() + speed * (dt_ms / 1000.0) as f32;
                source.set_alpha(a);
                CallbackState::Continue
            }
            CallbackKind::Grab { dx, dy } => {
                if self.released {
                    return self.revert_continuous(source);
                }
                let dt = (dt_ms / 1000.0) as f32;
                let placement = source.placement_mut(View::Geometry);
                placement.translation.0 += dx * dt;
                placement.translation.1 += dy * dt;
                CallbackState::Continue
            }
            CallbackKind::Resize { dsx, dsy } => {
                if self.released {
                    return self.revert_continuous(source);
                }
                let dt = (dt_ms / 1000.0) as f32;
                let placement = source.placement_mut(View::Geometry);
                placement.scale.0 += dsx * dt;
                placement.scale.1 += dsy * dt;
                CallbackState::Continue
            }
            CallbackKind::Turn { velocity } => {
                if self.released {
                    return self.revert_continuous(source);
                }
                let dt = (dt_ms / 1000.0) as f32;
                source.placement_mut(View::Geometry).rotation += velocity * dt;
                CallbackState::Continue
            }
            CallbackKind::PlayFastForward { step_ms } => {
                if self.released {
                    return CallbackState::Done;
                }
                if let Some(player) = source.media_player_mut() {
                    player.set_jump_step_ms(step_ms);
                    player.jump();
                }
                CallbackState::Continue
            }

            // ---- one-shot callbacks ---------------------------------------
            CallbackKind::Play { on } => {
                if !self.applied_once {
                    source.play(on, metronome);
                    self.applied_once = true;
                }
                if self.bidirectional {
                    if self.released {
                        if let Initial::Playing(was) = self.initial {
                            source.play(was, metronome);
                        }
                        return CallbackState::Done;
                    }
                    CallbackState::Continue
                } else {
                    CallbackState::Done
                }
            }
            CallbackKind::SetGeometry { view, placement } => {
                let initial = match self.initial {
                    Initial::Placement(p) => p,
                    _ => Placement::default(),
                };
                let p = self.advance_cursor(dt_ms);
                *source.placement_mut(view) = Placement::lerp(&initial, &placement, p);
                self.settle()
            }
            CallbackKind::Seek { target_ns } => {
                if !self.applied_once {
                    self.applied_once = true;
                    match source.media_player_mut() {
                        Some(player) => {
                            player.go_to(target_ns, metronome);
                        }
                        None => {
                            // non-seekable media: flagged at runtime, no-op
                            warn!(source = %source.name(), "Seek on non-seekable source ignored");
                            return CallbackState::Done;
                        }
                    }
                }
                if self.bidirectional {
                    if self.released {
                        if let (Initial::Position(was), Some(player)) = (self.initial.clone(), source.media_player_mut()) {
                            player.go_to(was, metronome);
                        }
                        return CallbackState::Done;
                    }
                    CallbackState::Continue
                } else {
                    CallbackState::Done
                }
            }
            CallbackKind::Flag { index } => {
                if !self.applied_once {
                    self.applied_once = true;
                    if let Some(player) = source.media_player_mut() {
                        player.jump_to_flag(index, metronome);
                    }
                }
                CallbackState::Done
            }
            CallbackKind::SetInvert { mode } => {
                if !self.applied_once {
                    source.core_mut().image_processing.invert = mode;
                    self.applied_once = true;
                }
                if self.bidirectional {
                    if self.released {
                        if let Initial::Invert(was) = self.initial {
                            source.core_mut().image_processing.invert = was;
                        }
                        return CallbackState::Done;
                    }
                    CallbackState::Continue
                } else {
                    CallbackState::Done
                }
            }
        }
    }

    /// Moves the animation cursor, forward normally and backward after a
    /// bidirectional release. Returns the interpolation fraction.
    fn advance_cursor(&mut self, dt_ms: f64) -> f32 {
        let step = if self.duration_ms <= 0.0 {
            1.0
        } else {
            dt_ms / self.duration_ms
        };
        if self.bidirectional && self.released {
            self.cursor -= step;
        } else {
            self.cursor += step;
        }
        self.cursor = self.cursor.clamp(0.0, 1.0);
        self.cursor as f32
    }

    /// Verdict after a cursor move
    fn settle(&self) -> CallbackState {
        if self.bidirectional {
            if self.released && self.cursor <= 0.0 {
                CallbackState::Done
            } else {
                CallbackState::Continue
            }
        } else if self.cursor >= 1.0 {
            CallbackState::Done
        } else {
            CallbackState::Continue
        }
    }

    fn animate_scalar(
        &mut self,
        dt_ms: f64,
        target: f32,
        set: impl Fn(&mut Source, f32),
        source: &mut Source,
    ) -> CallbackState {
        let initial = match self.initial {
            Initial::Scalar(v) => v,
            _ => target,
        };
        let p = self.advance_cursor(dt_ms);
        set(source, initial + (target - initial) * p);
        self.settle()
    }

    fn revert_continuous(&mut self, source: &mut Source) -> CallbackState {
        if self.bidirectional {
            match self.initial.clone() {
                Initial::Placement(p) => *source.placement_mut(View::Geometry) = p,
                Initial::Scalar(v) => {
                    if matches!(self.kind, CallbackKind::Loom { .. }) {
                        source.set_alpha(v);
                    }
                }
                _ => {}
            }
        }
        CallbackState::Done
    }
}

/// Convenience helpers used by the OSC surface and tests
impl SourceCallback {
    pub fn set_alpha(value: f32) -> Self {
        SourceCallback::new(CallbackKind::SetAlpha { value })
    }

    pub fn set_depth(value: f32) -> Self {
        SourceCallback::new(CallbackKind::SetDepth { value })
    }

    pub fn play(on: bool) -> Self {
        SourceCallback::new(CallbackKind::Play { on })
    }

    pub fn seek(target_ns: u64) -> Self {
        SourceCallback::new(CallbackKind::Seek { target_ns })
    }

    pub fn grab(dx: f32, dy: f32) -> Self {
        SourceCallback::new(CallbackKind::Grab { dx, dy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_source() -> Source {
        Source::new_pattern("s", 0, (8, 8))
    }

    #[test]
    fn instant_set_alpha_is_done_after_one_round() {
        let m = Metronome::default();
        let mut s = pattern_source();
        let mut cb = SourceCallback::set_alpha(0.25);
        assert_eq!(cb.apply(&mut s, &m, 16.0), CallbackState::Done);
        assert!((s.alpha() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn animated_set_alpha_progresses_over_duration() {
        let m = Metronome::default();
        let mut s = pattern_source();
        s.set_alpha(1.0);
        let mut cb = SourceCallback::set_alpha(0.0).duration_ms(100.0);
        assert_eq!(cb.apply(&mut s, &m, 50.0), CallbackState::Continue);
        assert!((s.alpha() - 0.5).abs() < 1e-3, "alpha {}", s.alpha());
        assert_eq!(cb.apply(&mut s, &m, 50.0), CallbackState::Done);
        assert!(s.alpha().abs() < 1e-6);
    }

    #[test]
    fn bidirectional_set_alpha_reverts_on_release() {
        let m = Metronome::default();
        let mut s = pattern_source();
        s.set_alpha(0.8);
        let mut cb = SourceCallback::set_alpha(0.0).bidirectional(true).duration_ms(100.0);
        cb.apply(&mut s, &m, 100.0);
        assert!(s.alpha().abs() < 1e-6);
        cb.release();
        assert_eq!(cb.apply(&mut s, &m, 100.0), CallbackState::Done);
        assert!((s.alpha() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn grab_then_inverse_restores_position() {
        let m = Metronome::default();
        let mut s = pattern_source();
        let mut forward = SourceCallback::grab(1.0, 0.5);
        forward.apply(&mut s, &m, 1000.0);
        forward.release();
        forward.apply(&mut s, &m, 0.0);
        let mut inverse = SourceCallback::grab(-1.0, -0.5);
        inverse.apply(&mut s, &m, 1000.0);
        inverse.release();
        inverse.apply(&mut s, &m, 0.0);
        let p = s.placement(View::Geometry);
        assert!(p.translation.0.abs() < 1e-4 && p.translation.1.abs() < 1e-4);
    }

    #[test]
    fn bidirectional_grab_reverts_on_release() {
        let m = Metronome::default();
        let mut s = pattern_source();
        let mut cb = SourceCallback::grab(2.0, 0.0).bidirectional(true);
        cb.apply(&mut s, &m, 500.0);
        assert!(s.placement(View::Geometry).translation.0 > 0.9);
        cb.release();
        assert_eq!(cb.apply(&mut s, &m, 16.0), CallbackState::Done);
        assert_eq!(s.placement(View::Geometry).translation.0, 0.0);
    }

    #[test]
    fn seek_on_non_seekable_is_noop() {
        let m = Metronome::default();
        let mut s = pattern_source();
        let mut cb = SourceCallback::seek(1_000);
        assert_eq!(cb.apply(&mut s, &m, 16.0), CallbackState::Done);
    }

    #[test]
    fn turn_accumulates_rotation() {
        let m = Metronome::default();
        let mut s = pattern_source();
        let mut cb = SourceCallback::new(CallbackKind::Turn { velocity: 1.0 });
        cb.apply(&mut s, &m, 500.0);
        cb.apply(&mut s, &m, 500.0);
        assert!((s.placement(View::Geometry).rotation - 1.0).abs() < 1e-4);
    }
}
