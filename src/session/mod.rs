//! Session: the ordered multi-source composition and its output frame
//!
//! A session uniquely owns its sources. Selection, batches, play groups and
//! clones refer to sources by id and are resolved through the session on
//! access; stale ids are pruned when a source is removed.

pub mod document;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::defines::unique_id;
use crate::frame::{FrameBuffer, Image};
use crate::metronome::Metronome;
use crate::source::core::View;
use crate::source::{Source, SourceKind, SourceMode};

pub use document::{SessionDocument, SessionState, SourceState};

/// A sticky note pinned in the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Note {
    pub text: String,
    pub position: (f32, f32),
    pub size: (f32, f32),
    /// When set, the note is only shown in this view
    pub stick_to_view: Option<View>,
}

/// A named ordered subset of sources for group control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Batch {
    pub label: String,
    pub ids: Vec<u64>,
}

/// A named subset of sources driven together by the player controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlayGroup {
    pub label: String,
    pub ids: Vec<u64>,
}

/// A named, persistable capture of the whole session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub label: String,
    /// ISO-8601 capture date
    pub date: String,
    pub state: SessionState,
    pub thumbnail: Option<(u32, u32, Vec<u8>)>,
}

/// The ordered multi-source composition rendered into one output framebuffer
pub struct Session {
    id: u64,
    filename: Option<std::path::PathBuf>,
    sources: Vec<Source>,
    selection: Vec<u64>,
    batches: Vec<Batch>,
    play_groups: Vec<PlayGroup>,
    notes: Vec<Note>,
    snapshots: Vec<Snapshot>,
    frame: FrameBuffer,
    /// Output fading, `0` fully visible, `1` black
    fading: f32,
    /// Fades unselected sources out during transitions, `[0, 1]`
    activation_threshold: f32,
    thumbnail: Option<Image>,
    pub input_mapping: crate::control::inputs::InputMappingTable,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(1280, 720)
    }
}

impl Session {
    pub fn new(width: u32, height: u32) -> Self {
        Session {
            id: unique_id(),
            filename: None,
            sources: Vec::new(),
            selection: Vec::new(),
            batches: Vec::new(),
            play_groups: Vec::new(),
            notes: Vec::new(),
            snapshots: Vec::new(),
            frame: FrameBuffer::new(width, height, true),
            fading: 0.0,
            activation_threshold: 0.0,
            thumbnail: None,
            input_mapping: Default::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filename(&self) -> Option<&std::path::Path> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, filename: impl Into<std::path::PathBuf>) {
        self.filename = Some(filename.into());
    }

    /// The session output framebuffer, valid after [`render`](Session::render)
    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.frame.width(), self.frame.height())
    }

    pub fn set_resolution(&mut self, width: u32, height: u32) {
        self.frame.resize(width, height);
    }

    pub fn fading(&self) -> f32 {
        self.fading
    }

    pub fn set_fading(&mut self, fading: f32) {
        self.fading = fading.clamp(0.0, 1.0);
    }

    pub fn activation_threshold(&self) -> f32 {
        self.activation_threshold
    }

    pub fn set_activation_threshold(&mut self, t: f32) {
        self.activation_threshold = t.clamp(0.0, 1.0);
    }

    // ---- source list -------------------------------------------------------

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.sources.iter_mut()
    }

    /// Adds a source, enforcing name uniqueness by suffixing a counter.
    /// Returns the source id.
    pub fn add_source(&mut self, mut source: Source) -> u64 {
        let name = self.unique_name(source.name());
        source.set_name(name);
        let id = source.id();
        info!(source = %source.name(), kind = source.kind().label(), "Source added");
        self.sources.push(source);
        id
    }

    fn unique_name(&self, wanted: &str) -> String {
        if !self.sources.iter().any(|s| s.name() == wanted) {
            return wanted.to_string();
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{} {}", wanted, counter);
            if !self.sources.iter().any(|s| s.name() == candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Removes and returns a source; prunes it from the selection, batches
    /// and play groups.
    pub fn remove_source(&mut self, id: u64) -> Option<Source> {
        let index = self.sources.iter().position(|s| s.id() == id)?;
        let source = self.sources.remove(index);
        info!(source = %source.name(), "Source removed");
        self.selection.retain(|&i| i != id);
        for batch in &mut self.batches {
            batch.ids.retain(|&i| i != id);
        }
        for group in &mut self.play_groups {
            group.ids.retain(|&i| i != id);
        }
        Some(source)
    }

    pub fn find_by_id(&self, id: u64) -> Option<&Source> {
        self.sources.iter().find(|s| s.id() == id)
    }

    pub fn find_by_id_mut(&mut self, id: u64) -> Option<&mut Source> {
        self.sources.iter_mut().find(|s| s.id() == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name() == name)
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut Source> {
        self.sources.iter_mut().find(|s| s.name() == name)
    }

    /// Renames a source, keeping names unique
    pub fn rename_source(&mut self, id: u64, name: &str) -> bool {
        if self.find_by_id(id).is_none() {
            return false;
        }
        let taken = self
            .sources
            .iter()
            .any(|s| s.id() != id && s.name() == name);
        let unique = if taken { self.unique_name(name) } else { name.to_string() };
        if let Some(source) = self.find_by_id_mut(id) {
            source.set_name(unique);
            true
        } else {
            false
        }
    }

    /// Ids of all sources in insertion order
    pub fn source_ids(&self) -> Vec<u64> {
        self.sources.iter().map(|s| s.id()).collect()
    }

    // ---- selection ---------------------------------------------------------

    pub fn selection(&self) -> &[u64] {
        &self.selection
    }

    pub fn is_selected(&self, id: u64) -> bool {
        self.selection.contains(&id)
    }

    pub fn select(&mut self, id: u64) {
        if self.find_by_id(id).is_some() && !self.selection.contains(&id) {
            self.selection.push(id);
        }
    }

    pub fn deselect(&mut self, id: u64) {
        self.selection.retain(|&i| i != id);
    }

    pub fn toggle_selection(&mut self, id: u64) {
        if self.is_selected(id) {
            self.deselect(id);
        } else {
            self.select(id);
        }
    }

    /// Replaces the selection, dropping ids of dead sources
    pub fn set_selection(&mut self, ids: Vec<u64>) {
        self.selection = ids
            .into_iter()
            .filter(|&id| self.sources.iter().any(|s| s.id() == id))
            .collect();
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Selected ids ordered by ascending depth
    pub fn selection_depth_sorted(&self) -> Vec<u64> {
        let mut ids = self.selection.clone();
        ids.sort_by(|&a, &b| {
            let da = self.find_by_id(a).map(|s| s.depth()).unwrap_or(0.0);
            let db = self.find_by_id(b).map(|s| s.depth()).unwrap_or(0.0);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        ids
    }

    // ---- batches & play groups ---------------------------------------------

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn batch(&self, index: usize) -> Option<&Batch> {
        self.batches.get(index)
    }

    /// Replaces (or creates) the batch at `index`
    pub fn set_batch(&mut self, index: usize, label: impl Into<String>, ids: Vec<u64>) {
        let ids: Vec<u64> = ids
            .into_iter()
            .filter(|&id| self.sources.iter().any(|s| s.id() == id))
            .collect();
        while self.batches.len() <= index {
            self.batches.push(Batch::default());
        }
        self.batches[index] = Batch { label: label.into(), ids };
    }

    pub fn add_to_batch(&mut self, index: usize, id: u64) {
        if self.find_by_id(id).is_none() {
            return;
        }
        while self.batches.len() <= index {
            self.batches.push(Batch::default());
        }
        if !self.batches[index].ids.contains(&id) {
            self.batches[index].ids.push(id);
        }
    }

    pub fn remove_from_batch(&mut self, index: usize, id: u64) {
        if let Some(batch) = self.batches.get_mut(index) {
            batch.ids.retain(|&i| i != id);
        }
    }

    pub fn clear_batches(&mut self) {
        self.batches.clear();
    }

    pub fn play_groups(&self) -> &[PlayGroup] {
        &self.play_groups
    }

    pub fn set_play_group(&mut self, index: usize, label: impl Into<String>, ids: Vec<u64>) {
        let ids: Vec<u64> = ids
            .into_iter()
            .filter(|&id| self.sources.iter().any(|s| s.id() == id))
            .collect();
        while self.play_groups.len() <= index {
            self.play_groups.push(PlayGroup::default());
        }
        self.play_groups[index] = PlayGroup { label: label.into(), ids };
    }

    // ---- notes -------------------------------------------------------------

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn add_note(&mut self, note: Note) {
        self.notes.push(note);
    }

    pub fn notes_mut(&mut self) -> &mut Vec<Note> {
        &mut self.notes
    }

    // ---- snapshots ---------------------------------------------------------

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn snapshot_by_id(&self, id: u64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    pub(crate) fn snapshots_mut(&mut self) -> &mut Vec<Snapshot> {
        &mut self.snapshots
    }

    // ---- render ------------------------------------------------------------

    /// Updates and renders every source, then composites them into the
    /// output framebuffer in ascending depth order. Ties are broken by
    /// insertion order. Sources with negative alpha are skipped.
    pub fn render(&mut self, dt: f64, metronome: &Metronome) {
        // 1. per-source update, exactly once each
        for source in &mut self.sources {
            source.update(dt, metronome);
        }

        // 2. resolve clone textures from their origin; a missing origin
        //    fails the clone
        let clones: Vec<(usize, u64)> = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s.kind() {
                SourceKind::Clone { origin_id, .. } => Some((i, *origin_id)),
                _ => None,
            })
            .collect();
        for (index, origin_id) in clones {
            let origin_texture = self
                .sources
                .iter()
                .find(|s| s.id() == origin_id && !s.failed())
                .map(|s| s.texture());
            match origin_texture {
                Some(texture) => self.sources[index].set_texture_from(&texture),
                None => self.sources[index].set_failed(),
            }
        }

        // 3. per-source render into private framebuffers
        for source in &mut self.sources {
            source.render();
        }

        // 4. composition pass
        self.frame.clear([0, 0, 0, 255]);
        let mut order: Vec<usize> = (0..self.sources.len()).collect();
        order.sort_by(|&a, &b| {
            self.sources[a]
                .depth()
                .partial_cmp(&self.sources[b].depth())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        for index in order {
            let source = &self.sources[index];
            let alpha = source.alpha();
            if alpha < 0.0 {
                continue;
            }
            let activation = if self.activation_threshold > 0.0 && !self.selection.contains(&source.id())
            {
                1.0 - self.activation_threshold
            } else {
                1.0
            };
            let effective = alpha * activation;
            if effective <= 0.0 {
                continue;
            }
            let placement = *source.placement(View::Geometry);
            self.frame.blend(
                source.frame().image(),
                &placement,
                effective,
                source.core().blending,
            );
        }

        // 5. output fading
        if self.fading > 0.0 {
            let keep = 1.0 - self.fading;
            for chunk in self.frame.image_mut().pixels.chunks_exact_mut(4) {
                for c in chunk.iter_mut().take(3) {
                    *c = (*c as f32 * keep) as u8;
                }
            }
        }

        // 6. render-variant sources observe the output, one frame behind
        let output = self.frame.image().clone();
        for source in &mut self.sources {
            if matches!(source.kind(), SourceKind::Render) {
                source.set_texture_from(&output);
            }
        }
    }

    /// Re-renders the session thumbnail from the current output
    pub fn render_thumbnail(&mut self) -> Image {
        let thumb = self.frame.thumbnail();
        self.thumbnail = Some(thumb.clone());
        debug!(width = thumb.width, height = thumb.height, "Session thumbnail rendered");
        thumb
    }

    pub fn thumbnail(&self) -> Option<&Image> {
        self.thumbnail.as_ref()
    }

    // ---- bulk helpers used by the control surface --------------------------

    /// Resolves a batch index to the ids of its live sources
    pub fn batch_source_ids(&self, index: usize) -> Vec<u64> {
        self.batches
            .get(index)
            .map(|b| {
                b.ids
                    .iter()
                    .copied()
                    .filter(|&id| self.sources.iter().any(|s| s.id() == id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The source currently in `Current` mode
    pub fn current_source_id(&self) -> Option<u64> {
        self.sources
            .iter()
            .find(|s| s.mode() == SourceMode::Current)
            .map(|s| s.id())
    }

    /// Moves the `Current` mode to the next/previous source in depth order.
    pub fn cycle_current(&mut self, forward: bool) -> Option<u64> {
        if self.sources.is_empty() {
            return None;
        }
        let mut order: Vec<usize> = (0..self.sources.len()).collect();
        order.sort_by(|&a, &b| {
            self.sources[a]
                .depth()
                .partial_cmp(&self.sources[b].depth())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let current = self
            .sources
            .iter()
            .position(|s| s.mode() == SourceMode::Current);
        let position_in_order = current.and_then(|c| order.iter().position(|&i| i == c));
        let next_in_order = match position_in_order {
            Some(p) => {
                if forward {
                    (p + 1) % order.len()
                } else {
                    (p + order.len() - 1) % order.len()
                }
            }
            None => 0,
        };
        let next_index = order[next_in_order];
        for (i, source) in self.sources.iter_mut().enumerate() {
            if source.mode() == SourceMode::Current {
                source.set_mode(SourceMode::Visible);
            }
            if i == next_index {
                source.set_mode(SourceMode::Current);
            }
        }
        Some(self.sources[next_index].id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_patterns(n: usize) -> Session {
        let mut session = Session::new(64, 64);
        for i in 0..n {
            session.add_source(Source::new_pattern(format!("pattern {}", i), 2, (16, 16)));
        }
        session
    }

    #[test]
    fn empty_session_renders_black() {
        let metronome = Metronome::default();
        let mut session = Session::new(32, 16);
        session.render(0.033, &metronome);
        assert_eq!(session.frame().width(), 32);
        assert_eq!(session.frame().image().pixel(10, 8), [0, 0, 0, 255]);
    }

    #[test]
    fn render_keeps_source_count() {
        let metronome = Metronome::default();
        let mut session = session_with_patterns(3);
        session.render(0.033, &metronome);
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn names_are_made_unique() {
        let mut session = Session::new(64, 64);
        session.add_source(Source::new_pattern("dup", 0, (8, 8)));
        session.add_source(Source::new_pattern("dup", 0, (8, 8)));
        session.add_source(Source::new_pattern("dup", 0, (8, 8)));
        let names: Vec<&str> = session.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["dup", "dup 2", "dup 3"]);
    }

    #[test]
    fn find_by_id_round_trips() {
        let mut session = session_with_patterns(4);
        for id in session.source_ids() {
            assert_eq!(session.find_by_id(id).unwrap().id(), id);
        }
        assert!(session.find_by_id(0xdead_beef).is_none());
        let _ = session;
    }

    #[test]
    fn remove_prunes_selection_and_batches() {
        let mut session = session_with_patterns(3);
        let ids = session.source_ids();
        session.set_selection(ids.clone());
        session.set_batch(0, "all", ids.clone());
        session.remove_source(ids[1]);
        assert!(!session.selection().contains(&ids[1]));
        assert!(!session.batch(0).unwrap().ids.contains(&ids[1]));
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn set_batch_is_idempotent_after_clear() {
        let mut session = session_with_patterns(2);
        let ids = session.source_ids();
        session.set_batch(0, "b", ids.clone());
        let once = session.batch(0).unwrap().clone();
        session.clear_batches();
        session.set_batch(0, "b", ids);
        assert_eq!(session.batch(0).unwrap(), &once);
    }

    #[test]
    fn composition_skips_negative_alpha() {
        let metronome = Metronome::default();
        let mut session = Session::new(32, 32);
        let id = session.add_source(Source::new_pattern("white", 1, (32, 32)));
        session.find_by_id_mut(id).unwrap().set_alpha(-0.5);
        session.render(0.033, &metronome);
        assert_eq!(session.frame().image().pixel(16, 16), [0, 0, 0, 255]);
    }

    #[test]
    fn depth_orders_composition() {
        let metronome = Metronome::default();
        let mut session = Session::new(32, 32);
        let white = session.add_source(Source::new_pattern("white", 1, (32, 32)));
        let black = session.add_source(Source::new_pattern("black", 0, (32, 32)));
        // white on top (deeper draws later)
        session.find_by_id_mut(white).unwrap().set_depth(5.0);
        session.find_by_id_mut(black).unwrap().set_depth(1.0);
        session.render(0.033, &metronome);
        assert_eq!(session.frame().image().pixel(16, 16), [255, 255, 255, 255]);
    }

    #[test]
    fn clone_follows_origin_and_fails_on_deletion() {
        let metronome = Metronome::default();
        let mut session = Session::new(32, 32);
        let origin = session.add_source(Source::new_pattern("origin", 1, (16, 16)));
        let clone = {
            let name = session.find_by_id(origin).unwrap().name().to_string();
            session.add_source(Source::new_clone("clone", origin, name))
        };
        session.render(0.033, &metronome);
        assert!(!session.find_by_id(clone).unwrap().failed());
        session.remove_source(origin);
        session.render(0.033, &metronome);
        assert!(session.find_by_id(clone).unwrap().failed());
    }

    #[test]
    fn output_fading_darkens_frame() {
        let metronome = Metronome::default();
        let mut session = Session::new(16, 16);
        session.add_source(Source::new_pattern("white", 1, (16, 16)));
        session.set_fading(0.5);
        session.render(0.033, &metronome);
        let p = session.frame().image().pixel(8, 8);
        assert!(p[0] < 140 && p[0] > 110, "got {:?}", p);
    }

    #[test]
    fn cycle_current_walks_depth_order() {
        let mut session = session_with_patterns(3);
        let ids = session.source_ids();
        let first = session.cycle_current(true).unwrap();
        assert_eq!(first, ids[0]);
        let second = session.cycle_current(true).unwrap();
        assert_eq!(second, ids[1]);
        let back = session.cycle_current(false).unwrap();
        assert_eq!(back, ids[0]);
    }
}
