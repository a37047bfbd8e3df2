//! Input-mapping engine: discrete and continuous inputs bound to
//! parameterized source callbacks
//!
//! The binding table is part of the session (it persists in the session
//! document); the mapper is the runtime that watches input edges, spawns
//! live callback instances and drives them every tick.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metronome::{Metronome, Synchronicity};
use crate::session::Session;
use crate::source::callback::{CallbackState, SourceCallback};

pub type InputId = u32;

pub const INPUT_UNDEFINED: InputId = 0;
pub const INPUT_KEYBOARD_FIRST: InputId = 1;
pub const INPUT_KEYBOARD_COUNT: InputId = 25;
pub const INPUT_KEYBOARD_LAST: InputId = 26;
pub const INPUT_NUMPAD_FIRST: InputId = 27;
pub const INPUT_NUMPAD_COUNT: InputId = 16;
pub const INPUT_NUMPAD_LAST: InputId = 43;
pub const INPUT_JOYSTICK_FIRST_BUTTON: InputId = 44;
pub const INPUT_JOYSTICK_COUNT_BUTTON: InputId = 15;
pub const INPUT_JOYSTICK_LAST_BUTTON: InputId = 58;
pub const INPUT_JOYSTICK_FIRST_AXIS: InputId = 59;
pub const INPUT_JOYSTICK_COUNT_AXIS: InputId = 6;
pub const INPUT_JOYSTICK_LAST_AXIS: InputId = 64;
pub const INPUT_MULTITOUCH_FIRST: InputId = 65;
pub const INPUT_MULTITOUCH_COUNT: InputId = 16;
pub const INPUT_MULTITOUCH_LAST: InputId = 81;
pub const INPUT_TIMER_FIRST: InputId = 82;
pub const INPUT_TIMER_LAST: InputId = 114;
pub const INPUT_MAX: InputId = 115;

/// Default joystick axis dead-zone; configurable in settings
pub const DEFAULT_AXIS_DEAD_ZONE: f32 = 0.05;

/// Classification of an input id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputClass {
    Undefined,
    Keyboard,
    Numpad,
    JoystickButton,
    JoystickAxis,
    Multitouch,
    Timer,
}

pub fn classify(id: InputId) -> InputClass {
    match id {
        INPUT_KEYBOARD_FIRST..=INPUT_KEYBOARD_LAST => InputClass::Keyboard,
        INPUT_NUMPAD_FIRST..=INPUT_NUMPAD_LAST => InputClass::Numpad,
        INPUT_JOYSTICK_FIRST_BUTTON..=INPUT_JOYSTICK_LAST_BUTTON => InputClass::JoystickButton,
        INPUT_JOYSTICK_FIRST_AXIS..=INPUT_JOYSTICK_LAST_AXIS => InputClass::JoystickAxis,
        INPUT_MULTITOUCH_FIRST..=INPUT_MULTITOUCH_LAST => InputClass::Multitouch,
        INPUT_TIMER_FIRST..=INPUT_TIMER_LAST => InputClass::Timer,
        _ => InputClass::Undefined,
    }
}

/// Human-readable label of an input id
pub fn input_label(id: InputId) -> String {
    match classify(id) {
        InputClass::Keyboard => format!("Key {}", id - INPUT_KEYBOARD_FIRST),
        InputClass::Numpad => format!("Numpad {}", id - INPUT_NUMPAD_FIRST),
        InputClass::JoystickButton => format!("Button {}", id - INPUT_JOYSTICK_FIRST_BUTTON),
        InputClass::JoystickAxis => format!("Axis {}", id - INPUT_JOYSTICK_FIRST_AXIS),
        InputClass::Multitouch => format!("Touch {}", id - INPUT_MULTITOUCH_FIRST),
        InputClass::Timer => format!("Timer {}", id - INPUT_TIMER_FIRST),
        InputClass::Undefined => "Undefined".to_string(),
    }
}

/// What a binding applies its callback to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    Source(u64),
    Batch(usize),
}

/// One binding entry: target, callback template and alignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub target: Target,
    pub callback: SourceCallback,
    pub synchronicity: Synchronicity,
}

/// The persistent input → bindings table, owned by the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMappingTable {
    bindings: HashMap<InputId, Vec<Binding>>,
    pub disabled: bool,
}

impl Default for InputMappingTable {
    fn default() -> Self {
        InputMappingTable {
            bindings: HashMap::new(),
            disabled: false,
        }
    }
}

impl InputMappingTable {
    pub fn bindings(&self, input: InputId) -> &[Binding] {
        self.bindings.get(&input).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_bound(&self, input: InputId) -> bool {
        !self.bindings(input).is_empty()
    }

    /// Replaces the binding list of an input
    pub fn set(&mut self, input: InputId, bindings: Vec<Binding>) {
        if bindings.is_empty() {
            self.bindings.remove(&input);
        } else {
            self.bindings.insert(input, bindings);
        }
    }

    pub fn add(&mut self, input: InputId, binding: Binding) {
        self.bindings.entry(input).or_default().push(binding);
    }

    pub fn delete(&mut self, input: InputId) {
        self.bindings.remove(&input);
    }

    /// Copies the bindings of `from` onto `to`
    pub fn copy(&mut self, from: InputId, to: InputId) {
        let copied = self.bindings.get(&from).cloned();
        match copied {
            Some(b) => {
                self.bindings.insert(to, b);
            }
            None => {
                self.bindings.remove(&to);
            }
        }
    }

    pub fn bound_inputs(&self) -> Vec<InputId> {
        let mut ids: Vec<InputId> = self.bindings.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct InputState {
    active: bool,
    value: f32,
}

struct LiveCallback {
    input: InputId,
    target: u64,
    callback: SourceCallback,
    /// Beat at which the callback starts running, for synced bindings
    due_beat: f64,
}

/// Runtime engine translating input edges into running callbacks
pub struct InputMapper {
    states: Vec<InputState>,
    previous: Vec<bool>,
    live: Vec<LiveCallback>,
    axis_dead_zone: f32,
    last_timer_beat: i64,
}

impl Default for InputMapper {
    fn default() -> Self {
        InputMapper {
            states: vec![InputState::default(); INPUT_MAX as usize],
            previous: vec![false; INPUT_MAX as usize],
            live: Vec::new(),
            axis_dead_zone: DEFAULT_AXIS_DEAD_ZONE,
            last_timer_beat: -1,
        }
    }
}

impl InputMapper {
    pub fn set_axis_dead_zone(&mut self, dz: f32) {
        self.axis_dead_zone = dz.clamp(0.0, 0.9);
    }

    /// Feeds one input sample; joystick axes go through the dead-zone.
    pub fn set_input(&mut self, id: InputId, active: bool, value: f32) {
        if id >= INPUT_MAX {
            return;
        }
        let (active, value) = if classify(id) == InputClass::JoystickAxis {
            if value.abs() < self.axis_dead_zone {
                (false, 0.0)
            } else {
                (active, value)
            }
        } else {
            (active, value)
        };
        self.states[id as usize] = InputState { active, value };
    }

    pub fn input_active(&self, id: InputId) -> bool {
        self.states
            .get(id as usize)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    pub fn input_value(&self, id: InputId) -> f32 {
        self.states.get(id as usize).map(|s| s.value).unwrap_or(0.0)
    }

    /// Number of live callback instances (for status display)
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// One tick: detect edges, fire timer slices, run live callbacks.
    pub fn update(&mut self, session: &mut Session, metronome: &Metronome, dt_ms: f64) {
        self.fire_timer_inputs(metronome);

        if !session.input_mapping.disabled {
            for id in 0..INPUT_MAX {
                let now = self.states[id as usize].active;
                let before = self.previous[id as usize];
                if now && !before {
                    self.press(session, metronome, id);
                } else if !now && before {
                    self.release(id);
                }
            }
        }
        for id in 0..INPUT_MAX as usize {
            self.previous[id] = self.states[id].active;
        }

        // timer inputs are momentary
        for id in INPUT_TIMER_FIRST..=INPUT_TIMER_LAST {
            self.states[id as usize].active = false;
        }

        // run live callbacks that reached their boundary
        let now_beat = metronome.beats();
        let mut i = 0;
        while i < self.live.len() {
            if self.live[i].due_beat > now_beat {
                i += 1;
                continue;
            }
            let target = self.live[i].target;
            let state = match session.find_by_id_mut(target) {
                Some(source) => self.live[i].callback.apply(source, metronome, dt_ms),
                None => CallbackState::Done,
            };
            if state == CallbackState::Done {
                self.live.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn press(&mut self, session: &Session, metronome: &Metronome, id: InputId) {
        let bindings: Vec<Binding> = session.input_mapping.bindings(id).to_vec();
        for binding in bindings {
            let targets: Vec<u64> = match binding.target {
                Target::Source(source_id) => {
                    if session.find_by_id(source_id).is_some() {
                        vec![source_id]
                    } else {
                        Vec::new()
                    }
                }
                Target::Batch(index) => session.batch_source_ids(index),
            };
            let due_beat = metronome.due_beat(binding.synchronicity);
            for target in targets {
                debug!(input = %input_label(id), target, "Binding fired");
                self.live.push(LiveCallback {
                    input: id,
                    target,
                    callback: binding.callback.restarted(),
                    due_beat,
                });
            }
        }
    }

    fn release(&mut self, id: InputId) {
        for live in self.live.iter_mut().filter(|l| l.input == id) {
            live.callback.release();
        }
    }

    /// Activates the timer input of the current tempo slice when a new beat
    /// is entered.
    fn fire_timer_inputs(&mut self, metronome: &Metronome) {
        let beat = metronome.beats().floor() as i64;
        if beat != self.last_timer_beat {
            self.last_timer_beat = beat;
            let slice = (metronome.phase().floor() as i64).max(0) as InputId;
            let id = INPUT_TIMER_FIRST + slice;
            if id <= INPUT_TIMER_LAST {
                self.states[id as usize] = InputState {
                    active: true,
                    value: 1.0,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::callback::CallbackKind;
    use crate::source::Source;

    fn session_with_source() -> (Session, u64) {
        let mut session = Session::new(32, 32);
        let id = session.add_source(Source::new_pattern("s", 1, (8, 8)));
        (session, id)
    }

    fn alpha_binding(id: u64, value: f32) -> Binding {
        Binding {
            target: Target::Source(id),
            callback: SourceCallback::set_alpha(value),
            synchronicity: Synchronicity::None,
        }
    }

    #[test]
    fn classification_covers_partition() {
        assert_eq!(classify(INPUT_KEYBOARD_FIRST), InputClass::Keyboard);
        assert_eq!(classify(INPUT_NUMPAD_FIRST), InputClass::Numpad);
        assert_eq!(classify(INPUT_JOYSTICK_FIRST_BUTTON), InputClass::JoystickButton);
        assert_eq!(classify(INPUT_JOYSTICK_FIRST_AXIS), InputClass::JoystickAxis);
        assert_eq!(classify(INPUT_MULTITOUCH_FIRST), InputClass::Multitouch);
        assert_eq!(classify(INPUT_TIMER_FIRST), InputClass::Timer);
        assert_eq!(classify(INPUT_MAX), InputClass::Undefined);
    }

    #[test]
    fn press_applies_bound_callback() {
        let (mut session, id) = session_with_source();
        session.input_mapping.add(INPUT_KEYBOARD_FIRST, alpha_binding(id, 0.25));
        let mut mapper = InputMapper::default();
        let metronome = Metronome::default();

        mapper.set_input(INPUT_KEYBOARD_FIRST, true, 1.0);
        mapper.update(&mut session, &metronome, 16.0);
        assert!((session.find_by_id(id).unwrap().alpha() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn bidirectional_reverts_on_release() {
        let (mut session, id) = session_with_source();
        session.input_mapping.add(
            INPUT_KEYBOARD_FIRST,
            Binding {
                target: Target::Source(id),
                callback: SourceCallback::set_alpha(0.0)
                    .bidirectional(true)
                    .duration_ms(50.0),
                synchronicity: Synchronicity::None,
            },
        );
        let mut mapper = InputMapper::default();
        let metronome = Metronome::default();

        mapper.set_input(INPUT_KEYBOARD_FIRST, true, 1.0);
        mapper.update(&mut session, &metronome, 100.0);
        assert!(session.find_by_id(id).unwrap().alpha() < 1e-6);

        mapper.set_input(INPUT_KEYBOARD_FIRST, false, 0.0);
        mapper.update(&mut session, &metronome, 100.0);
        assert!((session.find_by_id(id).unwrap().alpha() - 1.0).abs() < 1e-6);
        assert_eq!(mapper.live_count(), 0);
    }

    #[test]
    fn batch_target_hits_all_members() {
        let mut session = Session::new(32, 32);
        let a = session.add_source(Source::new_pattern("a", 1, (8, 8)));
        let b = session.add_source(Source::new_pattern("b", 1, (8, 8)));
        session.set_batch(0, "pair", vec![a, b]);
        session.input_mapping.add(
            INPUT_NUMPAD_FIRST,
            Binding {
                target: Target::Batch(0),
                callback: SourceCallback::set_alpha(0.5),
                synchronicity: Synchronicity::None,
            },
        );
        let mut mapper = InputMapper::default();
        let metronome = Metronome::default();
        mapper.set_input(INPUT_NUMPAD_FIRST, true, 1.0);
        mapper.update(&mut session, &metronome, 16.0);
        assert!((session.find_by_id(a).unwrap().alpha() - 0.5).abs() < 1e-6);
        assert!((session.find_by_id(b).unwrap().alpha() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn axis_dead_zone_filters_noise() {
        let mut mapper = InputMapper::default();
        mapper.set_input(INPUT_JOYSTICK_FIRST_AXIS, true, 0.01);
        assert!(!mapper.input_active(INPUT_JOYSTICK_FIRST_AXIS));
        mapper.set_input(INPUT_JOYSTICK_FIRST_AXIS, true, 0.5);
        assert!(mapper.input_active(INPUT_JOYSTICK_FIRST_AXIS));
    }

    #[test]
    fn synced_binding_defers_to_boundary() {
        let (mut session, id) = session_with_source();
        session.input_mapping.add(
            INPUT_KEYBOARD_FIRST,
            Binding {
                target: Target::Source(id),
                callback: SourceCallback::set_alpha(0.1),
                synchronicity: Synchronicity::Beat,
            },
        );
        let mut mapper = InputMapper::default();
        let mut metronome = Metronome::new(120.0, 4.0);
        metronome.test_rewind(2.2);

        mapper.set_input(INPUT_KEYBOARD_FIRST, true, 1.0);
        mapper.update(&mut session, &metronome, 16.0);
        assert!((session.find_by_id(id).unwrap().alpha() - 1.0).abs() < 1e-6, "deferred");

        metronome.test_rewind(3.01);
        mapper.update(&mut session, &metronome, 16.0);
        assert!((session.find_by_id(id).unwrap().alpha() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn copy_and_delete_bindings() {
        let (mut session, id) = session_with_source();
        session.input_mapping.add(INPUT_KEYBOARD_FIRST, alpha_binding(id, 0.3));
        session.input_mapping.copy(INPUT_KEYBOARD_FIRST, INPUT_NUMPAD_FIRST);
        assert!(session.input_mapping.is_bound(INPUT_NUMPAD_FIRST));
        session.input_mapping.delete(INPUT_KEYBOARD_FIRST);
        assert!(!session.input_mapping.is_bound(INPUT_KEYBOARD_FIRST));
        assert!(session.input_mapping.is_bound(INPUT_NUMPAD_FIRST));
    }

    #[test]
    fn table_survives_serialization() {
        let (mut session, id) = session_with_source();
        session.input_mapping.add(
            INPUT_MULTITOUCH_FIRST,
            Binding {
                target: Target::Source(id),
                callback: SourceCallback::new(CallbackKind::Loom { speed: 0.5 }),
                synchronicity: Synchronicity::Phase,
            },
        );
        let json = serde_json::to_string(&session.input_mapping).unwrap();
        let back: InputMappingTable = serde_json::from_str(&json).unwrap();
        assert!(back.is_bound(INPUT_MULTITOUCH_FIRST));
        assert_eq!(back.bindings(INPUT_MULTITOUCH_FIRST).len(), 1);
    }
}
