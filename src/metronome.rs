//! Shared tempo clock: beat/phase accounting and deferred scheduling
//!
//! The clock is a local monotonic beat counter; tempo changes are exchanged
//! with LAN peers over the handshake channel (last writer wins), so several
//! instances converge on the same tempo while each keeps its own beat
//! origin. Work can be deferred to the next beat or the next phase boundary
//! and fires in FIFO order when the boundary passes.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Alignment choice for deferred work and input bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Synchronicity {
    #[default]
    None,
    Beat,
    Phase,
}

type DeferredFn = Box<dyn FnOnce() + Send>;

struct Deferred {
    due_beat: f64,
    work: DeferredFn,
}

/// Tempo, quantum, beat and phase accounting plus a deferral queue
pub struct Metronome {
    tempo_bpm: f64,
    quantum: f64,
    start: Instant,
    beat_offset: f64,
    start_stop_sync: bool,
    enabled: bool,
    peers: usize,
    deferred: Vec<Deferred>,
    /// Tempo value pending broadcast to peers, taken by the discovery loop
    pending_broadcast: Option<f64>,
}

impl Default for Metronome {
    fn default() -> Self {
        Metronome::new(120.0, 4.0)
    }
}

impl Metronome {
    pub fn new(tempo_bpm: f64, quantum: f64) -> Self {
        Metronome {
            tempo_bpm: tempo_bpm.max(1.0),
            quantum: quantum.max(1.0),
            start: Instant::now(),
            beat_offset: 0.0,
            start_stop_sync: true,
            enabled: true,
            peers: 0,
            deferred: Vec::new(),
            pending_broadcast: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
        info!(enabled = on, "Metronome {}", if on { "enabled" } else { "disabled" });
    }

    pub fn tempo(&self) -> f64 {
        self.tempo_bpm
    }

    /// Sets the tempo and queues a broadcast to peers.
    pub fn set_tempo(&mut self, bpm: f64) {
        self.rebase();
        self.tempo_bpm = bpm.clamp(1.0, 999.0);
        self.pending_broadcast = Some(self.tempo_bpm);
    }

    /// Adopts a tempo proposed by a peer, without re-broadcasting it.
    pub fn set_tempo_from_peer(&mut self, bpm: f64) {
        if (bpm - self.tempo_bpm).abs() > f64::EPSILON {
            self.rebase();
            self.tempo_bpm = bpm.clamp(1.0, 999.0);
        }
    }

    /// The tempo queued for broadcast, if any; taken by the discovery loop.
    pub fn take_pending_broadcast(&mut self) -> Option<f64> {
        self.pending_broadcast.take()
    }

    pub fn quantum(&self) -> f64 {
        self.quantum
    }

    pub fn set_quantum(&mut self, beats: f64) {
        self.quantum = beats.max(1.0);
    }

    pub fn start_stop_sync(&self) -> bool {
        self.start_stop_sync
    }

    pub fn set_start_stop_sync(&mut self, on: bool) {
        self.start_stop_sync = on;
    }

    pub fn peers(&self) -> usize {
        self.peers
    }

    pub fn set_peers(&mut self, n: usize) {
        self.peers = n;
    }

    /// Restarts the beat count from zero
    pub fn restart(&mut self) {
        self.start = Instant::now();
        self.beat_offset = 0.0;
    }

    // keep the current beat continuous across tempo changes
    fn rebase(&mut self) {
        self.beat_offset = self.beats();
        self.start = Instant::now();
    }

    /// Current beat count, monotonic
    pub fn beats(&self) -> f64 {
        self.beat_offset + self.start.elapsed().as_secs_f64() * self.tempo_bpm / 60.0
    }

    /// Position within the current quantum, in `[0, quantum)`
    pub fn phase(&self) -> f64 {
        self.beats().rem_euclid(self.quantum)
    }

    fn next_beat(&self) -> f64 {
        let b = self.beats();
        let next = b.ceil();
        if next - b < f64::EPSILON {
            next + 1.0
        } else {
            next
        }
    }

    fn next_phase_beat(&self) -> f64 {
        let b = self.beats();
        let next = (b / self.quantum).ceil() * self.quantum;
        if next - b < f64::EPSILON {
            next + self.quantum
        } else {
            next
        }
    }

    fn beats_to_micros(&self, beats: f64) -> u64 {
        (beats * 60.0 / self.tempo_bpm * 1_000_000.0).max(0.0) as u64
    }

    /// Microseconds until the next beat boundary
    pub fn time_to_beat(&self) -> u64 {
        self.beats_to_micros(self.next_beat() - self.beats())
    }

    /// Microseconds until the next phase boundary
    pub fn time_to_phase(&self) -> u64 {
        self.beats_to_micros(self.next_phase_beat() - self.beats())
    }

    /// Milliseconds until the boundary selected by `sync`; zero for `None`.
    pub fn time_to_sync(&self, sync: Synchronicity) -> f64 {
        match sync {
            Synchronicity::None => 0.0,
            Synchronicity::Beat => self.time_to_beat() as f64 / 1000.0,
            Synchronicity::Phase => self.time_to_phase() as f64 / 1000.0,
        }
    }

    /// Beat at which work deferred with `sync` becomes due. `None` is due
    /// immediately.
    pub fn due_beat(&self, sync: Synchronicity) -> f64 {
        match sync {
            Synchronicity::None => self.beats(),
            Synchronicity::Beat => self.next_beat(),
            Synchronicity::Phase => self.next_phase_beat(),
        }
    }

    /// Defers `f` to run once when the next beat boundary fires.
    pub fn execute_at_beat(&mut self, f: impl FnOnce() + Send + 'static) {
        let due_beat = self.next_beat();
        self.deferred.push(Deferred {
            due_beat,
            work: Box::new(f),
        });
    }

    /// Defers `f` to run once when the next phase boundary fires.
    pub fn execute_at_phase(&mut self, f: impl FnOnce() + Send + 'static) {
        let due_beat = self.next_phase_beat();
        self.deferred.push(Deferred {
            due_beat,
            work: Box::new(f),
        });
    }

    /// Fires all deferred work whose boundary has passed, in FIFO order.
    /// Called once per tick by the application loop.
    pub fn update(&mut self) {
        let now = self.beats();
        let mut i = 0;
        while i < self.deferred.len() {
            if self.deferred[i].due_beat <= now {
                let d = self.deferred.remove(i);
                (d.work)();
            } else {
                i += 1;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_rewind(&mut self, beats: f64) {
        // pretend the clock started `beats` beats ago
        self.beat_offset = beats;
        self.start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn phase_stays_within_quantum() {
        let mut m = Metronome::new(120.0, 4.0);
        m.test_rewind(10.5);
        let p = m.phase();
        assert!((0.0..4.0).contains(&p));
        assert!((p - 2.5).abs() < 0.05, "phase was {}", p);
    }

    #[test]
    fn quantum_one_collapses_beat_and_phase() {
        let mut m = Metronome::new(120.0, 1.0);
        m.test_rewind(3.25);
        let to_beat = m.time_to_beat() as i64;
        let to_phase = m.time_to_phase() as i64;
        assert!((to_beat - to_phase).abs() < 2_000, "{} vs {}", to_beat, to_phase);
    }

    #[test]
    fn tempo_change_keeps_beat_continuous() {
        let mut m = Metronome::new(120.0, 4.0);
        m.test_rewind(8.0);
        let before = m.beats();
        m.set_tempo(60.0);
        let after = m.beats();
        assert!((after - before).abs() < 0.05);
        assert_eq!(m.take_pending_broadcast(), Some(60.0));
        assert_eq!(m.take_pending_broadcast(), None);
    }

    #[test]
    fn peer_tempo_does_not_rebroadcast() {
        let mut m = Metronome::new(120.0, 4.0);
        m.set_tempo_from_peer(90.0);
        assert_eq!(m.tempo(), 90.0);
        assert_eq!(m.take_pending_broadcast(), None);
    }

    #[test]
    fn deferred_work_fires_in_fifo_order_after_boundary() {
        let mut m = Metronome::new(240.0, 4.0);
        m.test_rewind(3.9);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            let counter = counter.clone();
            m.execute_at_beat(move || {
                order.lock().push(tag);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // boundary not reached yet
        m.update();
        // 240 bpm: a beat lasts 250ms; 0.1 beat is 25ms away
        std::thread::sleep(std::time::Duration::from_millis(40));
        m.update();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn restart_resets_beats() {
        let mut m = Metronome::new(120.0, 4.0);
        m.test_rewind(100.0);
        assert!(m.beats() >= 100.0);
        m.restart();
        assert!(m.beats() < 1.0);
    }
}
