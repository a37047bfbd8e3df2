//! Per-clip timeline: playable sections, gaps, fading envelope and flags
//!
//! All times are in nanoseconds. A timeline covers `[begin, end]`; the
//! ordered, disjoint sections are playable, everything else inside the
//! interval is a gap that playback skips over.

use serde::{Deserialize, Serialize};

use crate::defines::MAX_TIMELINE_ARRAY;

/// Curve shapes for fade-in / fade-out envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FadingCurve {
    #[default]
    Linear,
    Progressive,
    Abrupt,
}

impl FadingCurve {
    /// Evaluates the curve at `x in [0,1]`, rising from 0 to 1
    fn value(self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        match self {
            FadingCurve::Linear => x,
            FadingCurve::Progressive => x * x,
            FadingCurve::Abrupt => 1.0 - (1.0 - x) * (1.0 - x),
        }
    }
}

/// A closed time interval in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub begin: u64,
    pub end: u64,
}

impl TimeInterval {
    pub fn new(begin: u64, end: u64) -> Self {
        TimeInterval { begin, end }
    }

    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// True for `begin <= t < end`; the end bound belongs to the next
    /// interval so that adjacent intervals tile without overlap.
    pub fn includes(&self, t: u64) -> bool {
        t >= self.begin && t < self.end
    }
}

/// A named time point used for jump navigation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineFlag {
    pub time: u64,
    pub label: String,
}

/// Gaps, fading envelope, flags and cut primitives for one clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    timing: TimeInterval,
    step: u64,
    sections: Vec<TimeInterval>,
    fading: Vec<f32>,
    flags: Vec<TimelineFlag>,
}

impl Default for Timeline {
    fn default() -> Self {
        Timeline::new(0, 0, 0)
    }
}

impl Timeline {
    /// Timeline covering `[begin, end]` with a single full section
    pub fn new(begin: u64, end: u64, step: u64) -> Self {
        let timing = TimeInterval::new(begin, end);
        Timeline {
            timing,
            step,
            sections: vec![timing],
            fading: vec![1.0; MAX_TIMELINE_ARRAY],
            flags: Vec::new(),
        }
    }

    pub fn begin(&self) -> u64 {
        self.timing.begin
    }

    pub fn end(&self) -> u64 {
        self.timing.end
    }

    pub fn duration(&self) -> u64 {
        self.timing.duration()
    }

    /// Nominal inter-frame duration
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    /// Start of the first playable section, `>= begin`
    pub fn first(&self) -> u64 {
        self.sections.first().map(|s| s.begin).unwrap_or(self.timing.begin)
    }

    /// End of the last playable section, `<= end`
    pub fn last(&self) -> u64 {
        self.sections.last().map(|s| s.end).unwrap_or(self.timing.end)
    }

    pub fn sections(&self) -> &[TimeInterval] {
        &self.sections
    }

    /// Total playable duration
    pub fn sections_duration(&self) -> u64 {
        self.sections.iter().map(TimeInterval::duration).sum()
    }

    /// The gaps complementing the sections inside `[begin, end]`
    pub fn gaps(&self) -> Vec<TimeInterval> {
        let mut gaps = Vec::new();
        let mut cursor = self.timing.begin;
        for s in &self.sections {
            if s.begin > cursor {
                gaps.push(TimeInterval::new(cursor, s.begin));
            }
            cursor = s.end;
        }
        if cursor < self.timing.end {
            gaps.push(TimeInterval::new(cursor, self.timing.end));
        }
        gaps
    }

    fn clamp(&self, t: u64) -> u64 {
        t.clamp(self.timing.begin, self.timing.end)
    }

    /// True if `t` falls inside a playable section. The timeline interval is
    /// closed: its own end belongs to the last section when that section
    /// reaches the end.
    pub fn section_at(&self, t: u64) -> bool {
        let t = self.clamp(t);
        if t == self.timing.end {
            return self.last() == self.timing.end;
        }
        self.sections.iter().any(|s| s.includes(t))
    }

    /// True if `t` falls inside a gap; exact complement of
    /// [`section_at`](Timeline::section_at) over `[begin, end]`.
    pub fn gap_at(&self, t: u64) -> bool {
        !self.section_at(self.clamp(t))
    }

    /// The section containing `t`, if any
    pub fn section_containing(&self, t: u64) -> Option<TimeInterval> {
        let t = self.clamp(t);
        self.sections.iter().copied().find(|s| s.includes(t))
    }

    /// First section starting at or after `t`
    pub fn next_section_after(&self, t: u64) -> Option<TimeInterval> {
        self.sections.iter().copied().find(|s| s.begin >= t)
    }

    /// Last section ending at or before `t`
    pub fn previous_section_before(&self, t: u64) -> Option<TimeInterval> {
        self.sections.iter().rev().copied().find(|s| s.end <= t)
    }

    /// Cuts the section containing `t`, keeping one side and turning the
    /// other into a gap. Cutting on an existing boundary changes nothing, so
    /// a repeated cut at the same time is a no-op. With `dry_run` the
    /// timeline is left untouched and only the verdict is returned.
    pub fn cut(&mut self, t: u64, keep_left: bool, dry_run: bool) -> bool {
        let t = self.clamp(t);
        let index = match self.sections.iter().position(|s| s.begin < t && t < s.end) {
            Some(i) => i,
            // on a boundary or in a gap: nothing to cut
            None => return false,
        };
        if dry_run {
            return true;
        }
        let section = self.sections[index];
        if keep_left {
            self.sections[index] = TimeInterval::new(section.begin, t);
        } else {
            self.sections[index] = TimeInterval::new(t, section.end);
        }
        true
    }

    /// Merges the sections neighbouring the gap containing `t`.
    pub fn remove_gap_at(&mut self, t: u64) -> bool {
        let t = self.clamp(t);
        if !self.gap_at(t) {
            return false;
        }
        // locate neighbours around t
        let after = self.sections.iter().position(|s| s.begin > t);
        match after {
            Some(0) => {
                // leading gap: extend the first section back to begin
                self.sections[0].begin = self.timing.begin;
            }
            Some(i) => {
                // inner gap: merge section i-1 and i
                let merged = TimeInterval::new(self.sections[i - 1].begin, self.sections[i].end);
                self.sections[i - 1] = merged;
                self.sections.remove(i);
            }
            None => {
                // trailing gap: extend the last section to end
                if let Some(last) = self.sections.last_mut() {
                    last.end = self.timing.end;
                } else {
                    self.sections.push(self.timing);
                }
            }
        }
        true
    }

    /// Restores a single full section
    pub fn clear_gaps(&mut self) {
        self.sections = vec![self.timing];
    }

    // ---- fading envelope --------------------------------------------------

    pub fn fading(&self) -> &[f32] {
        &self.fading
    }

    /// Index in the fading array for time `t`, by linear scaling
    pub fn fading_index_at(&self, t: u64) -> usize {
        let d = self.timing.duration();
        if d == 0 {
            return 0;
        }
        let t = self.clamp(t).saturating_sub(self.timing.begin);
        (((t as u128) * (MAX_TIMELINE_ARRAY as u128 - 1) / d as u128) as usize)
            .min(MAX_TIMELINE_ARRAY - 1)
    }

    /// Envelope opacity at time `t`
    pub fn fading_at(&self, t: u64) -> f32 {
        self.fading[self.fading_index_at(t)]
    }

    fn samples_for(&self, duration: u64) -> usize {
        let d = self.timing.duration();
        if d == 0 {
            return 0;
        }
        (((duration.min(d) as u128) * MAX_TIMELINE_ARRAY as u128 / d as u128) as usize)
            .min(MAX_TIMELINE_ARRAY)
    }

    /// Overwrites the leading end of the envelope with a rising curve
    pub fn fade_in(&mut self, duration: u64, curve: FadingCurve) {
        let n = self.samples_for(duration);
        for i in 0..n {
            self.fading[i] = curve.value(i as f32 / n as f32);
        }
    }

    /// Overwrites the trailing end of the envelope with a falling curve
    pub fn fade_out(&mut self, duration: u64, curve: FadingCurve) {
        let n = self.samples_for(duration);
        let len = self.fading.len();
        for i in 0..n {
            self.fading[len - 1 - i] = curve.value(i as f32 / n as f32);
        }
    }

    /// Fade-in and fade-out of the same duration and curve
    pub fn auto_fading(&mut self, duration: u64, curve: FadingCurve) {
        self.fade_in(duration, curve);
        self.fade_out(duration, curve);
    }

    /// Resets the envelope to fully opaque
    pub fn clear_fading(&mut self) {
        self.fading.iter_mut().for_each(|v| *v = 1.0);
    }

    /// Box-smooths the envelope, `passes` times
    pub fn smooth_fading(&mut self, passes: usize) {
        let len = self.fading.len();
        for _ in 0..passes {
            let prev = self.fading.clone();
            for i in 0..len {
                let a = prev[i.saturating_sub(1)];
                let b = prev[i];
                let c = prev[(i + 1).min(len - 1)];
                self.fading[i] = (a + b + c) / 3.0;
            }
        }
    }

    // ---- playback mapping -------------------------------------------------

    /// Maps an elapsed playable duration (clock time since playback start,
    /// already scaled by play speed) to an absolute time inside
    /// `[begin, end]`, skipping gaps. Elapsed time beyond the playable
    /// content lands on the end of the last section.
    pub fn sections_time_at(&self, elapsed: u64) -> u64 {
        let mut remaining = elapsed;
        for s in &self.sections {
            let d = s.duration();
            if remaining < d {
                return s.begin + remaining;
            }
            remaining -= d;
        }
        self.last()
    }

    /// Inverse of [`sections_time_at`]: the playable duration elapsed when
    /// the playhead sits at absolute time `t`. Times inside a gap count as
    /// the start of the next section.
    pub fn elapsed_at(&self, t: u64) -> u64 {
        let t = self.clamp(t);
        let mut elapsed = 0u64;
        for s in &self.sections {
            if t < s.begin {
                break;
            }
            if s.includes(t) {
                return elapsed + (t - s.begin);
            }
            elapsed += s.duration();
        }
        elapsed
    }

    // ---- flags ------------------------------------------------------------

    pub fn flags(&self) -> &[TimelineFlag] {
        &self.flags
    }

    /// Inserts a flag, keeping flags ordered by time. Duplicate times are
    /// replaced.
    pub fn add_flag(&mut self, time: u64, label: impl Into<String>) {
        let time = self.clamp(time);
        let label = label.into();
        match self.flags.binary_search_by_key(&time, |f| f.time) {
            Ok(i) => self.flags[i].label = label,
            Err(i) => self.flags.insert(i, TimelineFlag { time, label }),
        }
    }

    pub fn remove_flag(&mut self, index: usize) -> bool {
        if index < self.flags.len() {
            self.flags.remove(index);
            true
        } else {
            false
        }
    }

    /// Time of the flag at `index`
    pub fn flag_time(&self, index: usize) -> Option<u64> {
        self.flags.get(index).map(|f| f.time)
    }

    /// Next flag strictly after `t`
    pub fn next_flag(&self, t: u64) -> Option<&TimelineFlag> {
        self.flags.iter().find(|f| f.time > t)
    }

    /// Last flag strictly before `t`
    pub fn previous_flag(&self, t: u64) -> Option<&TimelineFlag> {
        self.flags.iter().rev().find(|f| f.time < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn ten_seconds() -> Timeline {
        Timeline::new(0, 10 * SEC, SEC / 30)
    }

    #[test]
    fn section_and_gap_are_exclusive() {
        let mut tl = ten_seconds();
        tl.cut(4 * SEC, false, false);
        for t in (0..10).map(|s| s * SEC + SEC / 2) {
            assert!(
                tl.section_at(t) ^ tl.gap_at(t),
                "t={} should be exactly one of section/gap",
                t
            );
        }
    }

    #[test]
    fn section_and_gap_are_exclusive_at_the_end_boundary() {
        // closed interval: the end itself belongs to the last section
        let full = ten_seconds();
        assert!(full.section_at(full.end()) ^ full.gap_at(full.end()));
        assert!(full.section_at(full.end()));

        // with a trailing gap, the end falls into that gap instead
        let mut trailing = ten_seconds();
        trailing.cut(4 * SEC, true, false); // sections [0,4], gap [4,10]
        assert!(trailing.section_at(trailing.end()) ^ trailing.gap_at(trailing.end()));
        assert!(trailing.gap_at(trailing.end()));

        // begin boundary, for symmetry
        assert!(full.section_at(0) ^ full.gap_at(0));
    }

    #[test]
    fn cut_keep_right_leaves_trailing_section() {
        let mut tl = ten_seconds();
        assert!(tl.cut(4 * SEC, false, false));
        assert_eq!(tl.sections(), &[TimeInterval::new(4 * SEC, 10 * SEC)]);
        assert_eq!(tl.sections_duration(), 6 * SEC);
        // playing from the section start reaches the end after 6s of content
        assert_eq!(tl.sections_time_at(6 * SEC), 10 * SEC);
    }

    #[test]
    fn cut_is_idempotent() {
        let mut tl = ten_seconds();
        assert!(tl.cut(4 * SEC, true, false));
        let once = tl.clone();
        assert!(!tl.cut(4 * SEC, true, false));
        assert_eq!(tl.sections(), once.sections());
    }

    #[test]
    fn dry_run_does_not_mutate() {
        let mut tl = ten_seconds();
        assert!(tl.cut(5 * SEC, true, true));
        assert_eq!(tl.sections(), &[TimeInterval::new(0, 10 * SEC)]);
    }

    #[test]
    fn remove_gap_merges_neighbours() {
        let mut tl = ten_seconds();
        tl.cut(4 * SEC, true, false); // gap [4,10]
        assert!(tl.gap_at(7 * SEC));
        assert!(tl.remove_gap_at(7 * SEC));
        assert_eq!(tl.sections(), &[TimeInterval::new(0, 10 * SEC)]);
        assert!(!tl.remove_gap_at(7 * SEC));
    }

    #[test]
    fn inner_gap_merge() {
        let mut tl = ten_seconds();
        // carve an inner gap [4,6] with two cuts
        tl.cut(4 * SEC, true, false); // sections [0,4]
        // re-add the tail as its own section for the scenario
        tl.sections.push(TimeInterval::new(6 * SEC, 10 * SEC));
        assert!(tl.gap_at(5 * SEC));
        assert!(tl.remove_gap_at(5 * SEC));
        assert_eq!(tl.sections(), &[TimeInterval::new(0, 10 * SEC)]);
    }

    #[test]
    fn linear_advance_without_gaps() {
        let tl = ten_seconds();
        for t in [0, SEC, 3 * SEC, 9 * SEC] {
            assert_eq!(tl.sections_time_at(t), t);
        }
    }

    #[test]
    fn elapsed_is_inverse_of_sections_time() {
        let mut tl = ten_seconds();
        tl.cut(2 * SEC, false, false);
        for elapsed in [0, SEC / 2, 3 * SEC, 7 * SEC] {
            let t = tl.sections_time_at(elapsed);
            assert_eq!(tl.elapsed_at(t), elapsed);
        }
    }

    #[test]
    fn fade_in_rises_from_zero() {
        let mut tl = ten_seconds();
        tl.fade_in(2 * SEC, FadingCurve::Linear);
        assert_eq!(tl.fading()[0], 0.0);
        assert!(tl.fading_at(SEC) > 0.0 && tl.fading_at(SEC) < 1.0);
        assert_eq!(tl.fading_at(5 * SEC), 1.0);
    }

    #[test]
    fn fade_out_falls_to_zero() {
        let mut tl = ten_seconds();
        tl.fade_out(2 * SEC, FadingCurve::Linear);
        assert_eq!(*tl.fading().last().unwrap(), 0.0);
        assert_eq!(tl.fading_at(SEC), 1.0);
    }

    #[test]
    fn smoothing_keeps_range() {
        let mut tl = ten_seconds();
        tl.auto_fading(SEC, FadingCurve::Abrupt);
        tl.smooth_fading(3);
        assert!(tl.fading().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn fading_index_endpoints() {
        let tl = ten_seconds();
        assert_eq!(tl.fading_index_at(0), 0);
        assert_eq!(tl.fading_index_at(10 * SEC), MAX_TIMELINE_ARRAY - 1);
    }

    #[test]
    fn flags_stay_ordered() {
        let mut tl = ten_seconds();
        tl.add_flag(7 * SEC, "late");
        tl.add_flag(2 * SEC, "early");
        assert_eq!(tl.flag_time(0), Some(2 * SEC));
        assert_eq!(tl.flag_time(1), Some(7 * SEC));
        assert_eq!(tl.next_flag(3 * SEC).unwrap().label, "late");
        assert_eq!(tl.previous_flag(3 * SEC).unwrap().label, "early");
    }
}
