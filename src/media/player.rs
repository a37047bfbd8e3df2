//! Demand-driven media player: decoder wrapper, playhead and loop logic
//!
//! The player owns a [`Timeline`], a decoded-video stream and a playhead.
//! `update(dt)` advances the playhead by `dt * play_speed` through the
//! timeline sections; the decoder follows with non-blocking seeks so that
//! consumers always read the latest decoded frame.

use std::sync::mpsc;

use gstreamer as gst;
use gstreamer_pbutils as gst_pbutils;
use gstreamer_pbutils::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::defines::{unique_id, MAX_PLAY_SPEED};
use crate::frame::Image;
use crate::media::stream::GstStream;
use crate::metronome::{Metronome, Synchronicity};
use crate::timeline::Timeline;

/// How far the decoder may drift from the playhead before a catch-up seek
const DRIFT_TOLERANCE_NS: u64 = 100_000_000;

/// Player lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerState {
    Initializing,
    Ready,
    Playing,
    Paused,
    Ended,
}

/// Behavior when the playhead crosses the end of the playable content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LoopMode {
    None,
    #[default]
    Rewind,
    Bounce,
}

/// Facts discovered about the media before playback starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub aspect: f32,
    pub duration_ns: u64,
    pub framerate: f64,
    pub is_image: bool,
    pub has_audio: bool,
    pub decoder_name: String,
}

/// A discrete transition deferred to a metronome boundary
#[derive(Debug, Clone)]
enum PlayerAction {
    Play(bool),
    Seek(u64),
}

struct PendingAction {
    due_beat: f64,
    action: PlayerAction,
}

/// Decoder wrapper feeding one media source
pub struct MediaPlayer {
    id: u64,
    uri: String,
    state: PlayerState,
    enabled: bool,
    failed: bool,
    error: Option<String>,

    info: Option<MediaInfo>,
    timeline: Timeline,

    /// playable content consumed since the start of the sections, ns
    elapsed: f64,
    position: u64,
    play_speed: f64,
    bounce_reversed: bool,
    loop_mode: LoopMode,
    software_decoding_forced: bool,
    rewind_on_disabled: bool,
    sync_to_metronome: Synchronicity,
    jump_step_ms: u64,

    stream: Option<GstStream>,
    discovery_rx: Option<mpsc::Receiver<Result<MediaInfo, String>>>,
    pending: Vec<PendingAction>,
    seek_target: Option<u64>,
    texture: Option<Image>,
}

impl MediaPlayer {
    /// Opens a media URI; discovery runs on its own thread and the player
    /// stays `Initializing` until it completes.
    pub fn open(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (tx, rx) = mpsc::channel();
        spawn_discovery(uri.clone(), tx);
        MediaPlayer {
            id: unique_id(),
            uri,
            state: PlayerState::Initializing,
            enabled: true,
            failed: false,
            error: None,
            info: None,
            timeline: Timeline::default(),
            elapsed: 0.0,
            position: 0,
            play_speed: 1.0,
            bounce_reversed: false,
            loop_mode: LoopMode::default(),
            software_decoding_forced: false,
            rewind_on_disabled: false,
            sync_to_metronome: Synchronicity::None,
            jump_step_ms: 1000,
            stream: None,
            discovery_rx: Some(rx),
            pending: Vec::new(),
            seek_target: None,
            texture: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Error string persisted when the player failed
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.info.as_ref()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn timeline_mut(&mut self) -> &mut Timeline {
        &mut self.timeline
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, on: bool) {
        if !on && self.rewind_on_disabled {
            self.elapsed = 0.0;
            self.position = self.timeline.first();
        }
        self.enabled = on;
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn duration(&self) -> u64 {
        self.timeline.duration()
    }

    pub fn play_speed(&self) -> f64 {
        self.play_speed
    }

    /// Clamped to `[-10, 10]`, zero replaced by the smallest forward speed
    pub fn set_play_speed(&mut self, speed: f64) {
        let clamped = speed.clamp(-MAX_PLAY_SPEED, MAX_PLAY_SPEED);
        self.play_speed = if clamped == 0.0 { 0.01 } else { clamped };
        if let Some(stream) = &self.stream {
            stream.seek(self.position, self.effective_speed());
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn sync_to_metronome(&self) -> Synchronicity {
        self.sync_to_metronome
    }

    pub fn set_sync_to_metronome(&mut self, sync: Synchronicity) {
        self.sync_to_metronome = sync;
    }

    pub fn rewind_on_disabled(&self) -> bool {
        self.rewind_on_disabled
    }

    pub fn set_rewind_on_disabled(&mut self, on: bool) {
        self.rewind_on_disabled = on;
    }

    pub fn software_decoding_forced(&self) -> bool {
        self.software_decoding_forced
    }

    /// Requests a pipeline re-initialization with the new decoding policy.
    pub fn set_software_decoding_forced(&mut self, forced: bool) {
        if forced != self.software_decoding_forced {
            self.software_decoding_forced = forced;
            if self.stream.take().is_some() {
                self.open_stream();
            }
        }
    }

    pub fn jump_step_ms(&self) -> u64 {
        self.jump_step_ms
    }

    pub fn set_jump_step_ms(&mut self, ms: u64) {
        self.jump_step_ms = ms.max(1);
    }

    /// Latest decoded frame, valid after `update` for the current tick
    pub fn texture(&self) -> Option<&Image> {
        self.texture.as_ref()
    }

    fn effective_speed(&self) -> f64 {
        if self.bounce_reversed {
            -self.play_speed
        } else {
            self.play_speed
        }
    }

    // ---- transport --------------------------------------------------------

    /// Starts or pauses playback. With metronome sync enabled the change is
    /// deferred to the next beat/phase boundary.
    pub fn play(&mut self, on: bool, metronome: &Metronome) {
        if self.sync_to_metronome != Synchronicity::None {
            self.pending.push(PendingAction {
                due_beat: metronome.due_beat(self.sync_to_metronome),
                action: PlayerAction::Play(on),
            });
            return;
        }
        self.apply_play(on);
    }

    fn apply_play(&mut self, on: bool) {
        match (self.state, on) {
            (PlayerState::Ready | PlayerState::Paused, true) => {
                self.state = PlayerState::Playing;
                if let Some(s) = &self.stream {
                    s.play(true);
                }
            }
            (PlayerState::Playing, false) => {
                self.state = PlayerState::Paused;
                if let Some(s) = &self.stream {
                    s.play(false);
                }
            }
            _ => {}
        }
    }

    /// Restarts playback from the first playable time.
    pub fn replay(&mut self, metronome: &Metronome) {
        let first = self.timeline.first();
        self.seek_internal(first, metronome);
        self.play(true, metronome);
    }

    /// Asynchronous seek. Returns true once the decoder reached the target;
    /// keep calling (or poll [`seeking`]) until completion.
    pub fn go_to(&mut self, t: u64, metronome: &Metronome) -> bool {
        if self.seek_target != Some(t) {
            self.seek_internal(t, metronome);
        }
        !self.seeking()
    }

    /// True while an asynchronous seek is still settling
    pub fn seeking(&self) -> bool {
        self.seek_target.is_some()
    }

    fn seek_internal(&mut self, t: u64, metronome: &Metronome) {
        if self.sync_to_metronome != Synchronicity::None {
            self.pending.push(PendingAction {
                due_beat: metronome.due_beat(self.sync_to_metronome),
                action: PlayerAction::Seek(t),
            });
            return;
        }
        self.apply_seek(t);
    }

    fn apply_seek(&mut self, t: u64) {
        let t = t.clamp(self.timeline.begin(), self.timeline.end());
        self.position = t;
        self.elapsed = self.timeline.elapsed_at(t) as f64;
        match &self.stream {
            Some(stream) => {
                stream.seek(t, self.effective_speed());
                self.seek_target = Some(t);
            }
            None => self.seek_target = None,
        }
    }

    /// Advances one frame in the direction of the play speed.
    pub fn step(&mut self) {
        let step = self.timeline.step().max(1);
        let target = if self.effective_speed() >= 0.0 {
            self.position.saturating_add(step)
        } else {
            self.position.saturating_sub(step)
        };
        self.apply_seek(target);
    }

    /// Advances by the fast-forward step in the direction of the play speed.
    pub fn jump(&mut self) {
        let delta = self.jump_step_ms * 1_000_000;
        let target = if self.effective_speed() >= 0.0 {
            self.position.saturating_add(delta)
        } else {
            self.position.saturating_sub(delta)
        };
        self.apply_seek(target);
    }

    /// Jumps to the flag at `index`, honoring metronome sync.
    pub fn jump_to_flag(&mut self, index: usize, metronome: &Metronome) {
        if let Some(t) = self.timeline.flag_time(index) {
            self.seek_internal(t, metronome);
        }
    }

    /// Re-enters `Initializing` after a failure.
    pub fn reload(&mut self) {
        info!(uri = %self.uri, "Reloading media");
        self.stream = None;
        self.failed = false;
        self.error = None;
        self.texture = None;
        self.state = PlayerState::Initializing;
        let (tx, rx) = mpsc::channel();
        spawn_discovery(self.uri.clone(), tx);
        self.discovery_rx = Some(rx);
    }

    fn fail(&mut self, message: String) {
        warn!(uri = %self.uri, error = %message, "Media player failed");
        self.failed = true;
        self.error = Some(message);
        self.state = PlayerState::Ended;
        self.stream = None;
    }

    // ---- per-frame update -------------------------------------------------

    /// Advances the player by `dt` seconds. Must be called exactly once per
    /// frame, strictly before consumers read the texture. No-op when the
    /// player is disabled.
    pub fn update(&mut self, dt: f64, metronome: &Metronome) {
        if !self.enabled {
            return;
        }

        self.poll_discovery();
        self.fire_pending(metronome);

        if let Some(stream) = &self.stream {
            stream.poll_bus();
            if stream.failed() {
                let msg = stream.error().unwrap_or_else(|| "decoder error".to_string());
                self.fail(msg);
                return;
            }
            if let Some(frame) = stream.take_frame() {
                // a new decoded frame resolves a pending seek near the target
                if let (Some(target), Some(pts)) = (self.seek_target, frame.pts) {
                    if pts.abs_diff(target) <= DRIFT_TOLERANCE_NS {
                        self.seek_target = None;
                    }
                }
                self.texture = Some(frame.image);
            }
        }

        if self.state == PlayerState::Playing {
            self.advance(dt);
        }
    }

    fn poll_discovery(&mut self) {
        if self.state != PlayerState::Initializing {
            return;
        }
        let Some(rx) = &self.discovery_rx else { return };
        match rx.try_recv() {
            Ok(Ok(info)) => {
                debug!(uri = %self.uri, width = info.width, height = info.height,
                       duration = info.duration_ns, "Media discovered");
                let step = if info.framerate > 0.0 {
                    (1_000_000_000.0 / info.framerate) as u64
                } else {
                    1_000_000_000 / 30
                };
                self.timeline = Timeline::new(0, info.duration_ns, step);
                self.position = 0;
                self.elapsed = 0.0;
                self.info = Some(info);
                self.discovery_rx = None;
                self.state = PlayerState::Ready;
                self.open_stream();
            }
            Ok(Err(message)) => {
                self.discovery_rx = None;
                self.fail(message);
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => {
                self.discovery_rx = None;
                self.fail("media discovery aborted".to_string());
            }
        }
    }

    fn open_stream(&mut self) {
        let description = if self.software_decoding_forced {
            format!("uridecodebin uri={} force-sw-decoders=true", self.uri)
        } else {
            format!("uridecodebin uri={}", self.uri)
        };
        match GstStream::open(&description) {
            Ok(stream) => {
                stream.play(false);
                self.stream = Some(stream);
            }
            Err(e) => self.fail(format!("{:#}", e)),
        }
    }

    fn fire_pending(&mut self, metronome: &Metronome) {
        if self.pending.is_empty() {
            return;
        }
        let now = metronome.beats();
        let due: Vec<PlayerAction> = {
            let mut fired = Vec::new();
            let mut i = 0;
            while i < self.pending.len() {
                if self.pending[i].due_beat <= now {
                    fired.push(self.pending.remove(i).action);
                } else {
                    i += 1;
                }
            }
            fired
        };
        for action in due {
            match action {
                PlayerAction::Play(on) => self.apply_play(on),
                PlayerAction::Seek(t) => self.apply_seek(t),
            }
        }
    }

    fn advance(&mut self, dt: f64) {
        let total = self.timeline.sections_duration() as f64;
        if total <= 0.0 {
            return;
        }
        let mut elapsed = self.elapsed + dt * 1e9 * self.effective_speed();
        let mut resync = false;

        if elapsed >= total {
            match self.loop_mode {
                LoopMode::None => {
                    elapsed = total;
                    self.state = PlayerState::Paused;
                    if let Some(s) = &self.stream {
                        s.play(false);
                    }
                }
                LoopMode::Rewind => {
                    elapsed %= total;
                    resync = true;
                }
                LoopMode::Bounce => {
                    elapsed = (total - (elapsed - total)).max(0.0);
                    self.bounce_reversed = !self.bounce_reversed;
                    resync = true;
                }
            }
        } else if elapsed < 0.0 {
            match self.loop_mode {
                LoopMode::None => {
                    elapsed = 0.0;
                    self.state = PlayerState::Paused;
                    if let Some(s) = &self.stream {
                        s.play(false);
                    }
                }
                LoopMode::Rewind => {
                    elapsed = elapsed.rem_euclid(total);
                    resync = true;
                }
                LoopMode::Bounce => {
                    elapsed = -elapsed;
                    self.bounce_reversed = !self.bounce_reversed;
                    resync = true;
                }
            }
        }

        self.elapsed = elapsed;
        let previous = self.position;
        self.position = self.timeline.sections_time_at(elapsed as u64);

        // decoder follows the playhead: seek across loops, gaps skips and drift
        if let Some(stream) = &self.stream {
            let drifted = stream
                .position()
                .map(|p| p.abs_diff(self.position) > DRIFT_TOLERANCE_NS)
                .unwrap_or(false);
            let jumped = self.position.abs_diff(previous)
                > (2.0 * dt.max(0.001) * 1e9 * self.play_speed.abs()) as u64;
            if resync || jumped || drifted {
                stream.seek(self.position, self.effective_speed());
            }
        }
    }

    /// Test constructor: a ready player over a bare timeline, no decoder.
    #[cfg(test)]
    pub(crate) fn test_ready(duration_ns: u64) -> Self {
        let mut p = MediaPlayer::open("file:///dev/null");
        p.discovery_rx = None;
        p.state = PlayerState::Ready;
        p.timeline = Timeline::new(0, duration_ns, 1_000_000_000 / 30);
        p.info = Some(MediaInfo {
            width: 320,
            height: 240,
            aspect: 320.0 / 240.0,
            duration_ns,
            framerate: 30.0,
            is_image: false,
            has_audio: false,
            decoder_name: "test".to_string(),
        });
        p
    }
}

fn spawn_discovery(uri: String, tx: mpsc::Sender<Result<MediaInfo, String>>) {
    std::thread::Builder::new()
        .name("media-discovery".to_string())
        .spawn(move || {
            let _ = tx.send(discover(&uri));
        })
        .ok();
}

fn discover(uri: &str) -> Result<MediaInfo, String> {
    let discoverer = gst_pbutils::Discoverer::new(gst::ClockTime::from_seconds(5))
        .map_err(|e| e.to_string())?;
    let info = discoverer.discover_uri(uri).map_err(|e| e.to_string())?;

    let video = info
        .video_streams()
        .into_iter()
        .next()
        .ok_or_else(|| format!("no video stream in {}", uri))?;

    let width = video.width();
    let height = video.height().max(1);
    let framerate = {
        let fps = video.framerate();
        if fps.denom() > 0 {
            fps.numer() as f64 / fps.denom() as f64
        } else {
            0.0
        }
    };
    let decoder_name = video
        .caps()
        .and_then(|caps| caps.structure(0).map(|s| s.name().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    Ok(MediaInfo {
        width,
        height,
        aspect: width as f32 / height as f32,
        duration_ns: info.duration().map(|d| d.nseconds()).unwrap_or(0),
        framerate,
        is_image: video.is_image(),
        has_audio: !info.audio_streams().is_empty(),
        decoder_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn update_is_noop_when_disabled() {
        let mut p = MediaPlayer::test_ready(10 * SEC);
        let m = Metronome::default();
        p.play(true, &m);
        p.set_enabled(false);
        p.update(1.0, &m);
        assert_eq!(p.position(), 0);
    }

    #[test]
    fn playhead_advances_with_speed() {
        let mut p = MediaPlayer::test_ready(10 * SEC);
        let m = Metronome::default();
        p.play(true, &m);
        p.set_play_speed(2.0);
        p.update(1.0, &m);
        assert_eq!(p.position(), 2 * SEC);
    }

    #[test]
    fn loop_none_pauses_at_end() {
        let mut p = MediaPlayer::test_ready(2 * SEC);
        let m = Metronome::default();
        p.set_loop_mode(LoopMode::None);
        p.play(true, &m);
        p.update(5.0, &m);
        assert_eq!(p.state(), PlayerState::Paused);
        assert_eq!(p.position(), 2 * SEC);
    }

    #[test]
    fn loop_rewind_wraps_to_begin() {
        let mut p = MediaPlayer::test_ready(2 * SEC);
        let m = Metronome::default();
        p.set_loop_mode(LoopMode::Rewind);
        p.play(true, &m);
        p.update(2.5, &m);
        assert_eq!(p.state(), PlayerState::Playing);
        assert_eq!(p.position(), SEC / 2);
    }

    #[test]
    fn loop_bounce_reflects_direction() {
        let mut p = MediaPlayer::test_ready(2 * SEC);
        let m = Metronome::default();
        p.set_loop_mode(LoopMode::Bounce);
        p.play(true, &m);
        p.update(2.5, &m);
        assert_eq!(p.position(), (1.5 * SEC as f64) as u64);
        // now moving backward
        p.update(0.5, &m);
        assert_eq!(p.position(), SEC);
    }

    #[test]
    fn gaps_are_skipped_during_playback() {
        let mut p = MediaPlayer::test_ready(10 * SEC);
        let m = Metronome::default();
        p.timeline_mut().cut(4 * SEC, false, false); // playable [4,10]
        p.play(true, &m);
        p.update(1.0, &m);
        assert_eq!(p.position(), 5 * SEC);
    }

    #[test]
    fn synced_play_waits_for_phase_boundary() {
        let mut p = MediaPlayer::test_ready(10 * SEC);
        let mut m = Metronome::new(120.0, 4.0);
        m.test_rewind(2.5); // mid-phase
        p.set_sync_to_metronome(Synchronicity::Phase);
        p.play(true, &m);
        p.update(0.01, &m);
        assert_ne!(p.state(), PlayerState::Playing, "must wait for the boundary");
        m.test_rewind(4.01); // past the phase boundary
        p.update(0.01, &m);
        assert_eq!(p.state(), PlayerState::Playing);
    }

    #[test]
    fn go_to_without_decoder_completes_immediately() {
        let mut p = MediaPlayer::test_ready(10 * SEC);
        let m = Metronome::default();
        assert!(p.go_to(3 * SEC, &m));
        assert_eq!(p.position(), 3 * SEC);
        assert!(!p.seeking());
    }

    #[test]
    fn step_and_jump_follow_direction() {
        let mut p = MediaPlayer::test_ready(10 * SEC);
        let m = Metronome::default();
        p.go_to(5 * SEC, &m);
        p.step();
        assert_eq!(p.position(), 5 * SEC + SEC / 30);
        p.set_play_speed(-1.0);
        p.jump();
        assert_eq!(p.position(), 5 * SEC + SEC / 30 - SEC);
    }

    #[test]
    fn reload_reenters_initializing() {
        let mut p = MediaPlayer::test_ready(SEC);
        p.fail("boom".to_string());
        assert_eq!(p.state(), PlayerState::Ended);
        assert_eq!(p.error(), Some("boom"));
        p.reload();
        assert_eq!(p.state(), PlayerState::Initializing);
        assert!(!p.failed());
    }
}
