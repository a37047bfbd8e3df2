//! Whole-session persistence: saving then loading reproduces the state

use mixel::action::ActionManager;
use mixel::control::inputs::{Binding, Target, INPUT_NUMPAD_FIRST};
use mixel::metronome::Synchronicity;
use mixel::session::document::{capture_state, read_session, write_session};
use mixel::session::{Note, Session};
use mixel::source::callback::SourceCallback;
use mixel::source::core::View;
use mixel::source::Source;

fn build_session() -> Session {
    let mut session = Session::new(960, 540);

    let bars = session.add_source(Source::new_pattern("bars", 3, (320, 180)));
    let grid = session.add_source(Source::new_pattern("grid", 4, (320, 180)));
    let clone = session.add_source(Source::new_clone("bars copy", bars, "bars"));
    let sequence = session.add_source(Source::new_multifile(
        "stills",
        vec!["/tmp/a.png".into(), "/tmp/b.png".into()],
        12.0,
    ));

    {
        let source = session.find_by_id_mut(bars).unwrap();
        source.set_depth(2.5);
        source.set_alpha(0.8);
        source.core_mut().image_processing.enabled = true;
        source.core_mut().image_processing.saturation = -0.4;
        source.placement_mut(View::Geometry).translation = (0.25, -0.1);
    }
    session.find_by_id_mut(grid).unwrap().set_depth(7.0);
    session.find_by_id_mut(clone).unwrap().set_alpha(0.5);

    session.set_selection(vec![bars, grid]);
    session.set_batch(0, "visuals", vec![bars, grid, clone]);
    session.set_play_group(0, "clips", vec![sequence]);
    session.add_note(Note {
        text: "cue the grid at the drop".to_string(),
        position: (0.7, 0.1),
        size: (0.25, 0.15),
        stick_to_view: Some(View::Mixing),
    });
    session.set_fading(0.1);
    session.set_activation_threshold(0.3);

    session.input_mapping.add(
        INPUT_NUMPAD_FIRST,
        Binding {
            target: Target::Batch(0),
            callback: SourceCallback::set_alpha(0.0).bidirectional(true),
            synchronicity: Synchronicity::Phase,
        },
    );

    session
}

#[test]
fn save_then_load_reproduces_all_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("show.mix");

    let mut session = build_session();
    session.render_thumbnail();
    write_session(&session, &path).unwrap();

    let loaded = read_session(&path).unwrap();
    assert_eq!(capture_state(&loaded), capture_state(&session));
    assert_eq!(loaded.resolution(), (960, 540));
    assert_eq!(loaded.selection(), session.selection());
    assert_eq!(loaded.batches(), session.batches());
    assert_eq!(loaded.play_groups(), session.play_groups());
    assert_eq!(loaded.notes(), session.notes());
    assert!(loaded.input_mapping.is_bound(INPUT_NUMPAD_FIRST));
    assert!((loaded.fading() - 0.1).abs() < 1e-6);
    assert!((loaded.activation_threshold() - 0.3).abs() < 1e-6);
}

#[test]
fn snapshots_persist_with_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots.mix");

    let mut session = build_session();
    let mut actions = ActionManager::default();
    let snapshot = actions.snapshot(&mut session, "before the break");

    write_session(&session, &path).unwrap();
    let mut loaded = read_session(&path).unwrap();

    assert_eq!(loaded.snapshots().len(), 1);
    assert_eq!(loaded.snapshots()[0].label, "before the break");

    // mutate the reloaded session, then restore the embedded snapshot
    let first = loaded.source_ids()[0];
    loaded.find_by_id_mut(first).unwrap().set_alpha(0.0);
    let mut actions = ActionManager::default();
    assert!(actions.restore_snapshot(&mut loaded, snapshot));
    assert!((loaded.find_by_id(first).unwrap().alpha() - 0.8).abs() < 1e-6);
}

#[test]
fn double_round_trip_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let first_path = dir.path().join("first.mix");
    let second_path = dir.path().join("second.mix");

    let session = build_session();
    write_session(&session, &first_path).unwrap();
    let loaded_once = read_session(&first_path).unwrap();
    write_session(&loaded_once, &second_path).unwrap();
    let loaded_twice = read_session(&second_path).unwrap();

    assert_eq!(capture_state(&loaded_once), capture_state(&loaded_twice));
}
