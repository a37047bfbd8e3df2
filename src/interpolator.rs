//! Continuous blending between the live session and a snapshot
//!
//! Built from a snapshot, the interpolator records a start/target pair of
//! [`SourceCore`] for every source present in both the session and the
//! snapshot. `apply(p)` lerps each matched source; sources missing on either
//! side are left untouched.

use tracing::debug;

use crate::session::{Session, SessionState};
use crate::source::core::SourceCore;

/// Start and target state of one interpolated source
struct SourceInterpolator {
    id: u64,
    from: SourceCore,
    to: SourceCore,
}

/// Blends the live session toward a target state by a scalar in `[0, 1]`
pub struct Interpolator {
    subjects: Vec<SourceInterpolator>,
    cursor: f32,
}

impl Interpolator {
    /// Captures the current state of every source matched by id in `target`.
    pub fn new(session: &Session, target: &SessionState) -> Self {
        let subjects = target
            .sources
            .iter()
            .filter_map(|target_source| {
                session.find_by_id(target_source.id).map(|live| SourceInterpolator {
                    id: target_source.id,
                    from: live.core().clone(),
                    to: target_source.core.clone(),
                })
            })
            .collect::<Vec<_>>();
        debug!(matched = subjects.len(), "Interpolator built");
        Interpolator {
            subjects,
            cursor: 0.0,
        }
    }

    /// Number of sources this interpolator drives
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Current interpolation cursor
    pub fn current(&self) -> f32 {
        self.cursor
    }

    /// Applies `lerp(start, target, percent)` to every matched source.
    pub fn apply(&mut self, session: &mut Session, percent: f32) {
        self.cursor = percent.clamp(0.0, 1.0);
        for subject in &self.subjects {
            if let Some(source) = session.find_by_id_mut(subject.id) {
                source.set_core(SourceCore::lerp(&subject.from, &subject.to, self.cursor));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::document::capture_state;
    use crate::source::Source;

    fn session_and_state() -> (Session, SessionState, u64) {
        let mut session = Session::new(64, 64);
        let id = session.add_source(Source::new_pattern("x", 1, (16, 16)));
        {
            let s = session.find_by_id_mut(id).unwrap();
            s.set_alpha(1.0);
            s.set_depth(5.0);
        }
        let state = capture_state(&session);
        (session, state, id)
    }

    #[test]
    fn zero_percent_is_identity() {
        let (mut session, state, id) = session_and_state();
        {
            let s = session.find_by_id_mut(id).unwrap();
            s.set_alpha(0.0);
            s.set_depth(1.0);
        }
        let mut interp = Interpolator::new(&session, &state);
        interp.apply(&mut session, 0.0);
        let s = session.find_by_id(id).unwrap();
        assert_eq!(s.alpha(), 0.0);
        assert_eq!(s.depth(), 1.0);
    }

    #[test]
    fn half_percent_blends_midway() {
        let (mut session, state, id) = session_and_state();
        {
            let s = session.find_by_id_mut(id).unwrap();
            s.set_alpha(0.0);
            s.set_depth(1.0);
        }
        let mut interp = Interpolator::new(&session, &state);
        interp.apply(&mut session, 0.5);
        let s = session.find_by_id(id).unwrap();
        assert!((s.alpha() - 0.5).abs() < 1e-6);
        assert!((s.depth() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn full_percent_matches_target() {
        let (mut session, state, id) = session_and_state();
        {
            let s = session.find_by_id_mut(id).unwrap();
            s.set_alpha(0.0);
            s.set_depth(1.0);
        }
        let mut interp = Interpolator::new(&session, &state);
        interp.apply(&mut session, 1.0);
        let s = session.find_by_id(id).unwrap();
        assert!((s.alpha() - 1.0).abs() < 1e-6);
        assert!((s.depth() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn unmatched_sources_are_untouched() {
        let (mut session, state, _) = session_and_state();
        let extra = session.add_source(Source::new_pattern("extra", 0, (8, 8)));
        session.find_by_id_mut(extra).unwrap().set_alpha(0.7);
        let mut interp = Interpolator::new(&session, &state);
        interp.apply(&mut session, 1.0);
        assert!((session.find_by_id(extra).unwrap().alpha() - 0.7).abs() < 1e-6);
    }
}
