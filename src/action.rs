//! Undo history and named snapshots of whole-session state
//!
//! Two orthogonal facilities share the state-capture machinery of the
//! session document: a linear, monotonically indexed undo history and
//! session-owned named snapshots that persist across save/load. An
//! interpolator can blend the live session continuously toward a snapshot.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::defines::unique_id;
use crate::interpolator::Interpolator;
use crate::session::document::{self, SessionDocument, SessionState, DOCUMENT_VERSION};
use crate::session::{Session, Snapshot};

/// One entry of the linear undo history
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub label: String,
    /// ISO-8601 date of the capture
    pub date: String,
    /// View active when the action occurred
    pub view: i32,
    pub state: SessionState,
    pub thumbnail: Option<(u32, u32, Vec<u8>)>,
}

/// Undo history plus snapshot operations
pub struct ActionManager {
    history: Mutex<Vec<HistoryEntry>>,
    /// Current position in the history, 1-based; 0 means empty
    step: usize,
    /// Live interpolator toward a snapshot, keyed by snapshot id
    interpolation: Option<(u64, Interpolator)>,
}

impl Default for ActionManager {
    fn default() -> Self {
        ActionManager {
            history: Mutex::new(Vec::new()),
            step: 0,
            interpolation: None,
        }
    }
}

impl ActionManager {
    /// Clears the history and stores the initial state.
    pub fn init(&mut self, session: &Session) {
        self.history.lock().clear();
        self.step = 0;
        self.interpolation = None;
        self.store(session, "Session start", 0);
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn max_step(&self) -> usize {
        self.history.lock().len()
    }

    pub fn label(&self, step: usize) -> Option<String> {
        self.history.lock().get(step.checked_sub(1)?).map(|e| e.label.clone())
    }

    /// Step carrying the given label, most recent first
    pub fn step_of_label(&self, label: &str) -> Option<usize> {
        let history = self.history.lock();
        history.iter().rposition(|e| e.label == label).map(|i| i + 1)
    }

    /// Appends the current session state after the current step, truncating
    /// any future. A store while another store holds the history is dropped
    /// for that tick.
    pub fn store(&mut self, session: &Session, label: &str, view: i32) {
        if label.is_empty() {
            return;
        }
        let Some(mut history) = self.history.try_lock() else {
            debug!(label, "History contested, store dropped");
            return;
        };
        history.truncate(self.step);
        history.push(HistoryEntry {
            label: label.to_string(),
            date: chrono::Local::now().to_rfc3339(),
            view,
            state: document::capture_state(session),
            thumbnail: session
                .thumbnail()
                .map(|t| (t.width, t.height, t.pixels.clone())),
        });
        self.step = history.len();
        debug!(step = self.step, label, "Action stored");
    }

    /// Steps back one entry.
    pub fn undo(&mut self, session: &mut Session) {
        if self.step <= 1 {
            return;
        }
        self.restore_step(session, self.step - 1);
    }

    /// Steps forward one entry.
    pub fn redo(&mut self, session: &mut Session) {
        if self.step >= self.max_step() {
            return;
        }
        self.restore_step(session, self.step + 1);
    }

    /// Jumps to an explicit step, clamped to the valid range.
    pub fn step_to(&mut self, session: &mut Session, target: usize) {
        let target = target.clamp(1, self.max_step().max(1));
        if target != self.step {
            self.restore_step(session, target);
        }
    }

    fn restore_step(&mut self, session: &mut Session, step: usize) {
        let state = {
            let history = self.history.lock();
            match history.get(step - 1) {
                Some(entry) => entry.state.clone(),
                None => return,
            }
        };
        self.step = step;
        document::restore_state(session, &state);
        debug!(step, "History restored");
    }

    // ---- named snapshots ---------------------------------------------------

    /// Captures a named snapshot into the session. Returns its id.
    pub fn snapshot(&mut self, session: &mut Session, label: &str) -> u64 {
        let id = unique_id();
        let state = document::capture_state(session);
        let label = unique_snapshot_label(session, label);
        let thumbnail = session
            .thumbnail()
            .map(|t| (t.width, t.height, t.pixels.clone()));
        session.snapshots_mut().push(Snapshot {
            id,
            label: label.clone(),
            date: chrono::Local::now().to_rfc3339(),
            state,
            thumbnail,
        });
        info!(id, label = %label, "Snapshot stored");
        id
    }

    /// Deletes a snapshot.
    pub fn remove_snapshot(&mut self, session: &mut Session, id: u64) -> bool {
        if let Some((interp_id, _)) = &self.interpolation {
            if *interp_id == id {
                self.interpolation = None;
            }
        }
        let before = session.snapshots().len();
        session.snapshots_mut().retain(|s| s.id != id);
        session.snapshots().len() != before
    }

    /// Replaces the current session state with a snapshot's.
    pub fn restore_snapshot(&mut self, session: &mut Session, id: u64) -> bool {
        let Some(state) = session.snapshot_by_id(id).map(|s| s.state.clone()) else {
            warn!(id, "Snapshot not found");
            return false;
        };
        document::restore_state(session, &state);
        self.interpolation = None;
        true
    }

    /// Overwrites a snapshot with the current state, keeping its label.
    pub fn replace_snapshot(&mut self, session: &mut Session, id: u64) -> bool {
        let state = document::capture_state(session);
        let date = chrono::Local::now().to_rfc3339();
        let Some(snapshot) = session.snapshots_mut().iter_mut().find(|s| s.id == id) else {
            return false;
        };
        snapshot.state = state;
        snapshot.date = date;
        if let Some((interp_id, _)) = &self.interpolation {
            if *interp_id == id {
                self.interpolation = None;
            }
        }
        true
    }

    /// Renames a snapshot, keeping labels unique.
    pub fn set_snapshot_label(&mut self, session: &mut Session, id: u64, label: &str) -> bool {
        if session.snapshot_by_id(id).is_none() {
            return false;
        }
        let unique = unique_snapshot_label_excluding(session, label, id);
        if let Some(snapshot) = session.snapshots_mut().iter_mut().find(|s| s.id == id) {
            snapshot.label = unique;
            true
        } else {
            false
        }
    }

    /// Exports one snapshot as a standalone session file.
    pub fn save_snapshot_as(&self, session: &Session, id: u64, path: &std::path::Path) -> Result<()> {
        let snapshot = session
            .snapshot_by_id(id)
            .with_context(|| format!("No snapshot with id {}", id))?;
        let doc = SessionDocument {
            version: DOCUMENT_VERSION.to_string(),
            resolution: session.resolution(),
            state: snapshot.state.clone(),
            snapshots: Vec::new(),
            input_mapping: session.input_mapping.clone(),
            thumbnail: snapshot.thumbnail.clone(),
        };
        let data = serde_json::to_vec_pretty(&doc).context("Failed to serialize snapshot")?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(id, path = %path.display(), "Snapshot exported");
        Ok(())
    }

    /// Blends the live session toward a snapshot by `percent`. The
    /// interpolator is (re)built when targeting a different snapshot.
    pub fn interpolate(&mut self, session: &mut Session, id: u64, percent: f32) -> bool {
        let rebuild = match &self.interpolation {
            Some((current, _)) => *current != id,
            None => true,
        };
        if rebuild {
            let Some(state) = session.snapshot_by_id(id).map(|s| s.state.clone()) else {
                warn!(id, "Snapshot not found for interpolation");
                return false;
            };
            self.interpolation = Some((id, Interpolator::new(session, &state)));
        }
        if let Some((_, interp)) = &mut self.interpolation {
            interp.apply(session, percent);
        }
        true
    }
}

fn unique_snapshot_label(session: &Session, wanted: &str) -> String {
    unique_snapshot_label_excluding(session, wanted, 0)
}

fn unique_snapshot_label_excluding(session: &Session, wanted: &str, exclude_id: u64) -> String {
    let taken = |label: &str| {
        session
            .snapshots()
            .iter()
            .any(|s| s.id != exclude_id && s.label == label)
    };
    if !taken(wanted) {
        return wanted.to_string();
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{} {}", wanted, counter);
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::document::capture_state;
    use crate::source::Source;

    fn pattern(name: &str) -> Source {
        Source::new_pattern(name, 2, (16, 16))
    }

    #[test]
    fn store_undo_redo_is_bytewise_stable() {
        let mut session = Session::new(64, 64);
        let mut actions = ActionManager::default();
        actions.init(&session);

        session.add_source(pattern("a"));
        actions.store(&session, "add a", 0);
        let captured = capture_state(&session);

        actions.undo(&mut session);
        assert_eq!(session.len(), 0);
        actions.redo(&mut session);
        assert_eq!(capture_state(&session), captured);
    }

    #[test]
    fn undo_across_source_creation() {
        let mut session = Session::new(64, 64);
        let mut actions = ActionManager::default();
        actions.init(&session);

        let a = session.add_source(pattern("a"));
        actions.store(&session, "add a", 0);
        session.add_source(pattern("b"));
        actions.store(&session, "add b", 0);

        actions.undo(&mut session);
        assert_eq!(session.source_ids(), vec![a]);
        actions.undo(&mut session);
        assert!(session.is_empty());
        actions.redo(&mut session);
        assert_eq!(session.source_ids(), vec![a]);

        let checkpoint_label = "checkpoint";
        actions.store(&session, checkpoint_label, 0);
        let checkpoint = actions.current_step();
        session.add_source(pattern("c"));
        actions.store(&session, "add c", 0);

        actions.step_to(&mut session, checkpoint);
        assert_eq!(session.source_ids(), vec![a]);
        assert_eq!(actions.label(checkpoint).as_deref(), Some(checkpoint_label));
        assert_eq!(actions.step_of_label(checkpoint_label), Some(checkpoint));
    }

    #[test]
    fn store_truncates_future() {
        let mut session = Session::new(64, 64);
        let mut actions = ActionManager::default();
        actions.init(&session);

        session.add_source(pattern("a"));
        actions.store(&session, "add a", 0);
        session.add_source(pattern("b"));
        actions.store(&session, "add b", 0);
        actions.undo(&mut session);
        session.add_source(pattern("c"));
        actions.store(&session, "add c", 0);

        assert_eq!(actions.max_step(), 3);
        assert_eq!(actions.label(3).as_deref(), Some("add c"));
        actions.redo(&mut session); // no future left
        assert_eq!(actions.current_step(), 3);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut session = Session::new(64, 64);
        let mut actions = ActionManager::default();
        let id = session.add_source(pattern("x"));
        session.find_by_id_mut(id).unwrap().set_alpha(1.0);
        let snap = actions.snapshot(&mut session, "S1");
        let captured = capture_state(&session);

        session.find_by_id_mut(id).unwrap().set_alpha(0.0);
        assert!(actions.restore_snapshot(&mut session, snap));
        assert_eq!(capture_state(&session), captured);
    }

    #[test]
    fn interpolate_extremes_match_restore() {
        let mut session = Session::new(64, 64);
        let mut actions = ActionManager::default();
        let id = session.add_source(pattern("x"));
        {
            let s = session.find_by_id_mut(id).unwrap();
            s.set_alpha(1.0);
            s.set_depth(5.0);
        }
        let snap = actions.snapshot(&mut session, "S1");

        {
            let s = session.find_by_id_mut(id).unwrap();
            s.set_alpha(0.0);
            s.set_depth(1.0);
        }

        assert!(actions.interpolate(&mut session, snap, 0.5));
        {
            let s = session.find_by_id(id).unwrap();
            assert!((s.alpha() - 0.5).abs() < 1e-5);
            assert!((s.depth() - 3.0).abs() < 1e-5);
        }

        actions.interpolate(&mut session, snap, 1.0);
        let after_interp = capture_state(&session);
        actions.restore_snapshot(&mut session, snap);
        let after_restore = capture_state(&session);
        assert_eq!(after_interp, after_restore);
    }

    #[test]
    fn snapshot_labels_stay_unique() {
        let mut session = Session::new(64, 64);
        let mut actions = ActionManager::default();
        session.add_source(pattern("x"));
        let first = actions.snapshot(&mut session, "same");
        let second = actions.snapshot(&mut session, "same");
        let labels: Vec<&str> = session.snapshots().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["same", "same 2"]);
        assert!(actions.set_snapshot_label(&mut session, second, "other"));
        assert!(actions.set_snapshot_label(&mut session, first, "other"));
        assert_ne!(
            session.snapshots()[0].label,
            session.snapshots()[1].label
        );
    }

    #[test]
    fn save_snapshot_as_exports_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.mix");
        let mut session = Session::new(64, 64);
        let mut actions = ActionManager::default();
        session.add_source(pattern("x"));
        let snap = actions.snapshot(&mut session, "export me");
        actions.save_snapshot_as(&session, snap, &path).unwrap();
        let loaded = crate::session::document::read_session(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
