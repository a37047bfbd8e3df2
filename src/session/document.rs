//! Session persistence and state capture
//!
//! The whole mutable state of a session serializes into a
//! [`SessionState`]; undo history entries and named snapshots store the same
//! structure. A [`SessionDocument`] wraps the state with everything else a
//! session file carries (snapshots, input mapping, thumbnail) and must
//! round-trip: loading a saved session reproduces the same runtime state
//! modulo media availability.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::control::inputs::InputMappingTable;
use crate::media::player::LoopMode;
use crate::metronome::Synchronicity;
use crate::session::{Batch, Note, PlayGroup, Session, Snapshot};
use crate::source::core::SourceCore;
use crate::source::{DeviceConfig, Source, SourceKind, SourceMode};
use crate::timeline::Timeline;

/// Version tag written into documents, bumped on breaking layout changes
pub const DOCUMENT_VERSION: &str = "1";

/// Per-variant payload of a persisted source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KindState {
    Media {
        uri: String,
        play_speed: f64,
        loop_mode: LoopMode,
        sync: Synchronicity,
        software_decoding_forced: bool,
        timeline: Option<Timeline>,
    },
    Image {
        path: PathBuf,
    },
    Pattern {
        pattern_id: u32,
        resolution: (u32, u32),
    },
    Render,
    Clone {
        origin_id: u64,
        origin_name: String,
    },
    Device {
        pipeline: String,
    },
    Network {
        peer_name: String,
    },
    SessionFile {
        path: PathBuf,
    },
    SessionGroup {
        state: Box<SessionState>,
    },
    MultiFile {
        paths: Vec<PathBuf>,
        fps: f64,
    },
    GenericStream {
        description: String,
    },
    SrtReceiver {
        uri: String,
    },
}

/// Everything persisted about one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub id: u64,
    pub name: String,
    pub core: SourceCore,
    pub mode: SourceMode,
    pub active: bool,
    pub locked: bool,
    pub kind: KindState,
}

/// The full mutable state of a session at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionState {
    pub sources: Vec<SourceState>,
    pub selection: Vec<u64>,
    pub batches: Vec<Batch>,
    pub play_groups: Vec<PlayGroup>,
    pub notes: Vec<Note>,
    pub fading: f32,
    pub activation_threshold: f32,
}

/// A session file on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub version: String,
    pub resolution: (u32, u32),
    pub state: SessionState,
    pub snapshots: Vec<Snapshot>,
    pub input_mapping: InputMappingTable,
    pub thumbnail: Option<(u32, u32, Vec<u8>)>,
}

fn capture_kind(source: &Source) -> KindState {
    match source.kind() {
        SourceKind::Media { player } => KindState::Media {
            uri: player.uri().to_string(),
            play_speed: player.play_speed(),
            loop_mode: player.loop_mode(),
            sync: player.sync_to_metronome(),
            software_decoding_forced: player.software_decoding_forced(),
            timeline: Some(player.timeline().clone()),
        },
        SourceKind::Image { path, .. } => KindState::Image { path: path.clone() },
        SourceKind::Pattern { pattern, resolution } => KindState::Pattern {
            pattern_id: pattern.id(),
            resolution: *resolution,
        },
        SourceKind::Render => KindState::Render,
        SourceKind::Clone { origin_id, origin_name } => KindState::Clone {
            origin_id: *origin_id,
            origin_name: origin_name.clone(),
        },
        SourceKind::Device { config, .. } => KindState::Device {
            pipeline: config.pipeline.clone(),
        },
        SourceKind::Network { peer_name, .. } => KindState::Network {
            peer_name: peer_name.clone(),
        },
        SourceKind::SessionFile { path, .. } => KindState::SessionFile { path: path.clone() },
        SourceKind::SessionGroup { child } => KindState::SessionGroup {
            state: Box::new(capture_state(child)),
        },
        SourceKind::MultiFile { paths, fps, .. } => KindState::MultiFile {
            paths: paths.clone(),
            fps: *fps,
        },
        SourceKind::GenericStream { description, .. } => KindState::GenericStream {
            description: description.clone(),
        },
        SourceKind::SrtReceiver { uri, .. } => KindState::SrtReceiver { uri: uri.clone() },
    }
}

/// Captures the whole mutable state of a session.
pub fn capture_state(session: &Session) -> SessionState {
    SessionState {
        sources: session
            .iter()
            .map(|s| SourceState {
                id: s.id(),
                name: s.name().to_string(),
                core: s.core().clone(),
                mode: s.mode(),
                active: s.active(),
                locked: s.locked(),
                kind: capture_kind(s),
            })
            .collect(),
        selection: session.selection().to_vec(),
        batches: session.batches().to_vec(),
        play_groups: session.play_groups().to_vec(),
        notes: session.notes().to_vec(),
        fading: session.fading(),
        activation_threshold: session.activation_threshold(),
    }
}

/// Builds a fresh source from a persisted state, preserving its id.
pub fn source_from_state(state: &SourceState) -> Source {
    let mut source = match &state.kind {
        KindState::Media { uri, .. } => Source::new_media(&state.name, uri.clone()),
        KindState::Image { path } => Source::new_image(&state.name, path.clone()),
        KindState::Pattern { pattern_id, resolution } => {
            Source::new_pattern(&state.name, *pattern_id, *resolution)
        }
        KindState::Render => Source::new_render(&state.name),
        KindState::Clone { origin_id, origin_name } => {
            Source::new_clone(&state.name, *origin_id, origin_name.clone())
        }
        KindState::Device { pipeline } => Source::new_device(
            &state.name,
            DeviceConfig {
                pipeline: pipeline.clone(),
            },
        ),
        KindState::Network { peer_name } => Source::new_network(&state.name, peer_name.clone()),
        KindState::SessionFile { path } => Source::new_session_file(&state.name, path.clone()),
        KindState::SessionGroup { state: nested } => {
            let mut child = Session::default();
            restore_state(&mut child, nested);
            Source::new_session_group(&state.name, child)
        }
        KindState::MultiFile { paths, fps } => {
            Source::new_multifile(&state.name, paths.clone(), *fps)
        }
        KindState::GenericStream { description } => {
            Source::new_generic_stream(&state.name, description.clone())
        }
        KindState::SrtReceiver { uri } => Source::new_srt_receiver(&state.name, uri.clone()),
    };
    source.set_id(state.id);
    apply_source_state(&mut source, state);
    source
}

/// Applies the persisted attributes onto an existing source.
fn apply_source_state(source: &mut Source, state: &SourceState) {
    source.set_name(&state.name);
    source.set_core(state.core.clone());
    source.set_mode(state.mode);
    source.set_active(state.active);
    source.set_locked(state.locked);
    if let (
        KindState::Media {
            play_speed,
            loop_mode,
            sync,
            software_decoding_forced,
            timeline,
            ..
        },
        Some(player),
    ) = (&state.kind, source.media_player_mut())
    {
        player.set_play_speed(*play_speed);
        player.set_loop_mode(*loop_mode);
        player.set_sync_to_metronome(*sync);
        player.set_software_decoding_forced(*software_decoding_forced);
        if let Some(tl) = timeline {
            if tl.duration() == player.timeline().duration() || player.timeline().duration() == 0 {
                *player.timeline_mut() = tl.clone();
            }
        }
    }
}

/// Replaces the session's mutable state with `state`.
///
/// Sources that already exist (same id) are kept alive and updated in
/// place so running pipelines survive; missing ones are rebuilt and sources
/// absent from the state are dropped. Rebuilding a source whose media
/// disappeared fails that source on its next update; the session still
/// reaches a consistent state.
pub fn restore_state(session: &mut Session, state: &SessionState) {
    // drop sources absent from the target state
    let target_ids: Vec<u64> = state.sources.iter().map(|s| s.id).collect();
    let stale: Vec<u64> = session
        .source_ids()
        .into_iter()
        .filter(|id| !target_ids.contains(id))
        .collect();
    for id in stale {
        session.remove_source(id);
    }

    // rebuild order, reusing live sources
    let mut rebuilt: Vec<Source> = Vec::with_capacity(state.sources.len());
    for source_state in &state.sources {
        match session.remove_source(source_state.id) {
            Some(mut existing) => {
                apply_source_state(&mut existing, source_state);
                rebuilt.push(existing);
            }
            None => rebuilt.push(source_from_state(source_state)),
        }
    }
    for source in rebuilt {
        session.add_source(source);
    }

    session.set_selection(state.selection.clone());
    session.clear_batches();
    for (i, batch) in state.batches.iter().enumerate() {
        session.set_batch(i, batch.label.clone(), batch.ids.clone());
    }
    for (i, group) in state.play_groups.iter().enumerate() {
        session.set_play_group(i, group.label.clone(), group.ids.clone());
    }
    *session.notes_mut() = state.notes.clone();
    session.set_fading(state.fading);
    session.set_activation_threshold(state.activation_threshold);
}

/// Serializes a session into a document.
pub fn to_document(session: &Session) -> SessionDocument {
    SessionDocument {
        version: DOCUMENT_VERSION.to_string(),
        resolution: session.resolution(),
        state: capture_state(session),
        snapshots: session.snapshots().to_vec(),
        input_mapping: session.input_mapping.clone(),
        thumbnail: session
            .thumbnail()
            .map(|t| (t.width, t.height, t.pixels.clone())),
    }
}

/// Builds a session from a document.
pub fn from_document(doc: &SessionDocument) -> Session {
    if doc.version != DOCUMENT_VERSION {
        warn!(version = %doc.version, "Loading session document with a different version");
    }
    let mut session = Session::new(doc.resolution.0, doc.resolution.1);
    restore_state(&mut session, &doc.state);
    *session.snapshots_mut() = doc.snapshots.clone();
    session.input_mapping = doc.input_mapping.clone();
    session
}

/// Writes a session to disk.
pub fn write_session(session: &Session, path: &Path) -> Result<()> {
    let doc = to_document(session);
    let data = serde_json::to_vec_pretty(&doc).context("Failed to serialize session")?;
    std::fs::write(path, data)
        .with_context(|| format!("Failed to write session file {}", path.display()))?;
    Ok(())
}

/// Reads a session from disk.
pub fn read_session(path: &Path) -> Result<Session> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read session file {}", path.display()))?;
    let doc: SessionDocument =
        serde_json::from_slice(&data).context("Failed to parse session file")?;
    let mut session = from_document(&doc);
    session.set_filename(path);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        let mut session = Session::new(320, 240);
        let a = session.add_source(Source::new_pattern("bars", 3, (64, 64)));
        let b = session.add_source(Source::new_pattern("grid", 4, (64, 64)));
        session.find_by_id_mut(a).unwrap().set_depth(2.0);
        session.find_by_id_mut(b).unwrap().set_alpha(0.5);
        session.set_selection(vec![a]);
        session.set_batch(0, "both", vec![a, b]);
        session.set_play_group(0, "clips", vec![b]);
        session.add_note(Note {
            text: "hello".to_string(),
            position: (0.1, 0.2),
            size: (0.3, 0.2),
            stick_to_view: None,
        });
        session.set_fading(0.25);
        session
    }

    #[test]
    fn state_round_trips_through_json() {
        let session = sample_session();
        let state = capture_state(&session);
        let json = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn restore_reproduces_captured_state() {
        let mut session = sample_session();
        let state = capture_state(&session);

        // mutate everything
        let ids = session.source_ids();
        session.find_by_id_mut(ids[0]).unwrap().set_alpha(0.0);
        session.remove_source(ids[1]);
        session.clear_selection();
        session.set_fading(0.9);

        restore_state(&mut session, &state);
        assert_eq!(capture_state(&session), state);
    }

    #[test]
    fn restore_is_identity_on_matching_state() {
        let mut session = sample_session();
        let state = capture_state(&session);
        restore_state(&mut session, &state);
        assert_eq!(capture_state(&session), state);
    }

    #[test]
    fn document_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.mix");
        let mut session = sample_session();
        session.render_thumbnail();
        write_session(&session, &path).unwrap();
        let loaded = read_session(&path).unwrap();
        assert_eq!(capture_state(&loaded), capture_state(&session));
        assert_eq!(loaded.resolution(), session.resolution());
        assert_eq!(loaded.filename(), Some(path.as_path()));
    }

    #[test]
    fn restore_keeps_live_source_instances() {
        let mut session = sample_session();
        let state = capture_state(&session);
        let id = session.source_ids()[0];
        restore_state(&mut session, &state);
        // the same id is still resolvable, and only two sources exist
        assert!(session.find_by_id(id).is_some());
        assert_eq!(session.len(), 2);
    }
}
