//! Disk recorders: encoded video files and PNG snapshots
//!
//! A recorder lazily builds its encoding pipeline on the first delivered
//! frame; if the encoder cannot start (plugin absent, bad path) it reports
//! the reason through `info(true)` and finishes immediately. Presentation
//! timestamps are exact multiples of the frame duration; input frames align
//! to the nearest cadence slot within a small tolerance.

use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use gstreamer as gst;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::defines::{
    unique_id, CADENCE_TOLERANCE_NS, DEFAULT_BUFFERING_SIZE, DEFAULT_GRABBER_FPS,
    MIN_BUFFER_SIZE, RECORD_MAX_TIMEOUT_MS,
};
use crate::grab::{EncoderSink, FrameCaps, FrameGrabber, GrabberState, SinkPoll};

/// Encoding profiles offered by the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RecordingProfile {
    #[default]
    H264Standard,
    H264Hq,
    H265Realtime,
    H265Animation,
    ProresStandard,
    ProresHq,
    Vp8,
    JpegMulti,
}

impl RecordingProfile {
    pub fn label(self) -> &'static str {
        match self {
            RecordingProfile::H264Standard => "H264 (standard)",
            RecordingProfile::H264Hq => "H264 (high quality)",
            RecordingProfile::H265Realtime => "H265 (realtime)",
            RecordingProfile::H265Animation => "H265 (animation)",
            RecordingProfile::ProresStandard => "ProRes (standard)",
            RecordingProfile::ProresHq => "ProRes (high quality)",
            RecordingProfile::Vp8 => "VP8",
            RecordingProfile::JpegMulti => "JPEG sequence",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            RecordingProfile::Vp8 => "webm",
            RecordingProfile::JpegMulti => "jpg",
            _ => "mov",
        }
    }

    /// Hardware encoder candidates, tried in order when their factory is
    /// available; the last entry is the software fallback.
    fn encoder_candidates(self) -> Vec<(&'static str, String)> {
        match self {
            RecordingProfile::H264Standard => vec![
                (
                    "nvh264enc",
                    "nvh264enc rc-mode=cbr zerolatency=true ! video/x-h264,profile=main ! h264parse".to_string(),
                ),
                (
                    "vaapih264enc",
                    "vaapih264enc rate-control=cqp init-qp=26 ! video/x-h264,profile=main ! h264parse".to_string(),
                ),
                (
                    "x264enc",
                    "x264enc tune=zerolatency pass=4 quantizer=24 speed-preset=2 ! video/x-h264,profile=main ! h264parse".to_string(),
                ),
            ],
            RecordingProfile::H264Hq => vec![
                (
                    "nvh264enc",
                    "nvh264enc rc-mode=vbr preset=hq ! video/x-h264,profile=high ! h264parse".to_string(),
                ),
                (
                    "x264enc",
                    "x264enc pass=4 quantizer=18 speed-preset=4 ! video/x-h264,profile=high ! h264parse".to_string(),
                ),
            ],
            RecordingProfile::H265Realtime => vec![
                (
                    "nvh265enc",
                    "nvh265enc rc-mode=cbr zerolatency=true ! h265parse".to_string(),
                ),
                (
                    "x265enc",
                    "x265enc speed-preset=superfast tune=zerolatency ! h265parse".to_string(),
                ),
            ],
            RecordingProfile::H265Animation => vec![(
                "x265enc",
                "x265enc speed-preset=medium tune=animation ! h265parse".to_string(),
            )],
            RecordingProfile::ProresStandard => {
                vec![("avenc_prores", "avenc_prores".to_string())]
            }
            RecordingProfile::ProresHq => {
                vec![("avenc_prores_ks", "avenc_prores_ks profile=3".to_string())]
            }
            RecordingProfile::Vp8 => vec![(
                "vp8enc",
                "vp8enc deadline=1 cpu-used=-5 threads=2 keyframe-max-dist=360".to_string(),
            )],
            RecordingProfile::JpegMulti => vec![("jpegenc", "jpegenc quality=95".to_string())],
        }
    }

    /// Full pipeline tail for this profile, choosing the best available
    /// encoder.
    fn pipeline_tail(self, location: &str) -> Option<String> {
        let candidates = self.encoder_candidates();
        let encoder = candidates
            .iter()
            .find(|(factory, _)| gst::ElementFactory::find(factory).is_some())
            .map(|(_, tail)| tail.clone())?;
        Some(match self {
            RecordingProfile::JpegMulti => format!(
                "videoconvert ! {} ! multifilesink name=sink location={}",
                encoder, location
            ),
            RecordingProfile::Vp8 => format!(
                "videoconvert ! {} ! webmmux name=mux ! filesink name=sink location={}",
                encoder, location
            ),
            _ => format!(
                "videoconvert ! video/x-raw,format=NV12 ! {} ! qtmux name=mux ! filesink name=sink location={}",
                encoder, location
            ),
        })
    }
}

/// Frame scheduling policy of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RecordingPriority {
    /// Variable framerate, preserve wall-clock duration; frames are skipped
    /// when the encoder backs up
    Clock,
    /// Fixed nominal framerate; recorded duration may drift shorter
    #[default]
    Framerate,
}

/// Aligns delivered frames to exact multiples of the frame duration
pub struct FrameCadence {
    frame_duration_ns: u64,
    on_clock: bool,
    duration_ns: u64,
    timestamp_ns: u64,
    frame_count: u64,
    started: bool,
}

impl FrameCadence {
    pub fn new(fps: u32, priority: RecordingPriority) -> Self {
        let fps = fps.max(1);
        FrameCadence {
            frame_duration_ns: 1_000_000_000 / fps as u64,
            on_clock: priority == RecordingPriority::Clock,
            duration_ns: 0,
            timestamp_ns: 0,
            frame_count: 0,
            started: false,
        }
    }

    pub fn frame_duration_ns(&self) -> u64 {
        self.frame_duration_ns
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn duration_ns(&self) -> u64 {
        self.duration_ns
    }

    /// Offers a frame observed `t` nanoseconds after the first one; returns
    /// its presentation timestamp when it falls on a cadence slot.
    pub fn accept(&mut self, t: u64) -> Option<u64> {
        if !self.started {
            self.started = true;
            self.frame_count = 1;
            self.duration_ns = 0;
            self.timestamp_ns = 0;
            return Some(0);
        }
        if t.saturating_sub(self.duration_ns)
            > self.frame_duration_ns.saturating_sub(CADENCE_TOLERANCE_NS)
        {
            self.frame_count += 1;
            self.duration_ns = (t / self.frame_duration_ns) * self.frame_duration_ns;
            if self.on_clock {
                self.timestamp_ns = self.duration_ns;
            } else {
                self.timestamp_ns += self.frame_duration_ns;
            }
            Some(self.timestamp_ns)
        } else {
            None
        }
    }
}

/// Configuration of one recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RecorderConfig {
    pub directory: PathBuf,
    pub profile: RecordingProfile,
    pub fps: u32,
    /// Recording stops after this long; the maximum value means unlimited
    pub timeout_ms: u64,
    /// Frames are dropped for this long after the recorder starts
    pub delay_ms: u64,
    pub buffering_size: u64,
    pub priority: RecordingPriority,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            directory: std::env::temp_dir(),
            profile: RecordingProfile::default(),
            fps: DEFAULT_GRABBER_FPS,
            timeout_ms: RECORD_MAX_TIMEOUT_MS,
            delay_ms: 0,
            buffering_size: DEFAULT_BUFFERING_SIZE,
            priority: RecordingPriority::default(),
        }
    }
}

/// Encoded video recorder
pub struct VideoRecorder {
    id: u64,
    config: RecorderConfig,
    filename: PathBuf,
    state: GrabberState,
    error: Option<String>,
    sink: Option<EncoderSink>,
    caps: Option<FrameCaps>,
    cadence: FrameCadence,
    buffering_full: bool,
    skip_parity: bool,
    first_frame: Option<Instant>,
}

impl VideoRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        let stamp = chrono::Local::now().format("%y%m%d_%H%M%S");
        let filename = if config.profile == RecordingProfile::JpegMulti {
            config
                .directory
                .join(format!("mixel_{}_%05d.{}", stamp, config.profile.extension()))
        } else {
            config
                .directory
                .join(format!("mixel_{}.{}", stamp, config.profile.extension()))
        };
        let cadence = FrameCadence::new(config.fps, config.priority);
        VideoRecorder {
            id: unique_id(),
            config,
            filename,
            state: GrabberState::Initializing,
            error: None,
            sink: None,
            caps: None,
            cadence,
            buffering_full: false,
            skip_parity: false,
            first_frame: None,
        }
    }

    pub fn filename(&self) -> &PathBuf {
        &self.filename
    }

    fn fail(&mut self, message: String) {
        warn!(id = self.id, error = %message, "Recorder failed");
        self.error = Some(message);
        self.state = GrabberState::Finished;
    }

    fn init(&mut self, caps: &FrameCaps) {
        let location = self.filename.to_string_lossy().to_string();
        let Some(tail) = self.config.profile.pipeline_tail(&location) else {
            self.fail(format!(
                "No encoder available for {}",
                self.config.profile.label()
            ));
            return;
        };
        match EncoderSink::open(&tail, caps, self.config.fps, self.config.buffering_size) {
            Ok(sink) => {
                info!(id = self.id, file = %location, profile = self.config.profile.label(),
                      "Recording started");
                self.sink = Some(sink);
                self.caps = Some(*caps);
                self.state = GrabberState::Active;
            }
            Err(e) => self.fail(format!("{:#}", e)),
        }
    }
}

impl FrameGrabber for VideoRecorder {
    fn id(&self) -> u64 {
        self.id
    }

    fn add_frame(&mut self, frame: &Bytes, caps: &FrameCaps) {
        match self.state {
            GrabberState::Initializing => {
                self.init(caps);
                if self.state != GrabberState::Active {
                    return;
                }
            }
            GrabberState::Finished => return,
            _ => {}
        }

        // interrupt when the output shape changed under us
        if self.caps.is_some() && self.caps != Some(*caps) {
            warn!(id = self.id, "Recording interrupted because the resolution changed");
            self.stop();
        }

        let Some(sink) = &self.sink else { return };

        match sink.poll() {
            SinkPoll::Running => {}
            SinkPoll::EndOfStream => {
                if self.state == GrabberState::Ending {
                    info!(id = self.id, file = %self.filename.display(), "Recording saved");
                } else {
                    // unexpected EOS: disk full, file deleted
                    self.error = Some("Recording ended unexpectedly".to_string());
                    warn!(id = self.id, "Unexpected end of stream while recording");
                }
                self.state = GrabberState::Finished;
                return;
            }
            SinkPoll::Error(message) => {
                self.fail(message);
                return;
            }
        }

        if self.state != GrabberState::Active {
            return;
        }

        let first = *self.first_frame.get_or_insert_with(Instant::now);
        let elapsed = first.elapsed().as_nanos() as u64;

        // delayed start
        if elapsed < self.config.delay_ms * 1_000_000 {
            return;
        }

        if sink.accepts() {
            if let Some(pts) = self.cadence.accept(elapsed) {
                // buffering-full mode accepts only every other frame
                if self.buffering_full {
                    self.skip_parity = !self.skip_parity;
                    if self.skip_parity {
                        return;
                    }
                    if self.config.buffering_size.saturating_sub(sink.queued_bytes())
                        > 2 * MIN_BUFFER_SIZE
                    {
                        self.buffering_full = false;
                    }
                } else if self
                    .config
                    .buffering_size
                    .saturating_sub(sink.queued_bytes())
                    < MIN_BUFFER_SIZE
                {
                    info!(id = self.id, "Recording buffer almost full");
                    self.buffering_full = true;
                }
                if !sink.push(frame, pts, self.cadence.frame_duration_ns()) {
                    self.fail("Encoder refused the frame".to_string());
                    return;
                }
            }
        }

        // duration cap
        if self.config.timeout_ms < RECORD_MAX_TIMEOUT_MS
            && self.duration_ms() >= self.config.timeout_ms
        {
            info!(id = self.id, "Recording timeout reached");
            self.stop();
        }
    }

    fn stop(&mut self) {
        if self.state == GrabberState::Active || self.state == GrabberState::Paused {
            self.state = GrabberState::Ending;
            if let Some(sink) = &self.sink {
                sink.end_stream();
            }
        }
    }

    fn pause(&mut self, on: bool) {
        match (self.state, on) {
            (GrabberState::Active, true) => self.state = GrabberState::Paused,
            (GrabberState::Paused, false) => self.state = GrabberState::Active,
            _ => {}
        }
    }

    fn state(&self) -> GrabberState {
        self.state
    }

    fn info(&self, extended: bool) -> String {
        match self.state {
            GrabberState::Initializing => "Initializing".to_string(),
            GrabberState::Finished => match (&self.error, extended) {
                (Some(e), true) => format!("Failed: {}", e),
                _ => "Finished".to_string(),
            },
            GrabberState::Paused => "Paused".to_string(),
            GrabberState::Ending => "Saving".to_string(),
            GrabberState::Active => {
                let seconds = self.duration_ms() / 1000;
                if extended {
                    format!(
                        "{} {:02}:{:02} ({})",
                        self.config.profile.label(),
                        seconds / 60,
                        seconds % 60,
                        self.filename.display()
                    )
                } else {
                    format!("{:02}:{:02}", seconds / 60, seconds % 60)
                }
            }
        }
    }

    fn duration_ms(&self) -> u64 {
        self.cadence.duration_ns() / 1_000_000
    }

    fn accept_buffer(&self) -> bool {
        self.sink.as_ref().map(EncoderSink::accepts).unwrap_or(false)
    }

    fn output_path(&self) -> Option<PathBuf> {
        self.sink.as_ref().map(|_| self.filename.clone())
    }
}

/// One-shot PNG capture of the next delivered frame
pub struct PngRecorder {
    id: u64,
    filename: PathBuf,
    state: GrabberState,
}

impl PngRecorder {
    pub fn new(directory: &std::path::Path) -> Self {
        let stamp = chrono::Local::now().format("%y%m%d_%H%M%S");
        PngRecorder {
            id: unique_id(),
            filename: directory.join(format!("mixel_{}.png", stamp)),
            state: GrabberState::Active,
        }
    }

    pub fn filename(&self) -> &PathBuf {
        &self.filename
    }
}

impl FrameGrabber for PngRecorder {
    fn id(&self) -> u64 {
        self.id
    }

    fn add_frame(&mut self, frame: &Bytes, caps: &FrameCaps) {
        if self.state != GrabberState::Active {
            return;
        }
        let path = self.filename.clone();
        let data = frame.clone();
        let (width, height, alpha) = (caps.width, caps.height, caps.use_alpha);
        // writing is off the render thread; the grabber itself is done
        std::thread::Builder::new()
            .name("png-capture".to_string())
            .spawn(move || {
                let color = if alpha {
                    image::ColorType::Rgba8
                } else {
                    image::ColorType::Rgb8
                };
                match image::save_buffer(&path, &data, width, height, color) {
                    Ok(()) => info!(file = %path.display(), "Capture saved"),
                    Err(e) => warn!(file = %path.display(), error = %e, "Capture failed"),
                }
            })
            .ok();
        self.state = GrabberState::Finished;
    }

    fn stop(&mut self) {
        self.state = GrabberState::Finished;
    }

    fn state(&self) -> GrabberState {
        self.state
    }

    fn info(&self, _extended: bool) -> String {
        format!("PNG capture {}", self.filename.display())
    }

    fn duration_ms(&self) -> u64 {
        0
    }

    fn accept_buffer(&self) -> bool {
        self.state == GrabberState::Active
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.filename.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn cadence_pts_are_exact_multiples() {
        let mut cadence = FrameCadence::new(25, RecordingPriority::Framerate);
        let frame = cadence.frame_duration_ns();
        assert_eq!(cadence.accept(0), Some(0));
        // jittered input times still produce exact slots
        let mut produced = Vec::new();
        for t in [42 * MS, 81 * MS, 119 * MS, 161 * MS] {
            if let Some(pts) = cadence.accept(t) {
                produced.push(pts);
            }
        }
        assert!(!produced.is_empty());
        for pts in produced {
            assert_eq!(pts % frame, 0, "pts {} not on the cadence", pts);
        }
    }

    #[test]
    fn cadence_skips_too_close_frames() {
        let mut cadence = FrameCadence::new(25, RecordingPriority::Framerate);
        cadence.accept(0);
        // 10ms after the first slot of a 40ms cadence
        assert_eq!(cadence.accept(10 * MS), None);
        assert_eq!(cadence.frame_count(), 1);
    }

    #[test]
    fn framerate_priority_timestamps_are_contiguous() {
        let mut cadence = FrameCadence::new(25, RecordingPriority::Framerate);
        let frame = cadence.frame_duration_ns();
        cadence.accept(0);
        // a long stall: clock jumps 5 frames ahead
        let pts = cadence.accept(5 * frame).unwrap();
        // framerate priority keeps timestamps contiguous, duration drifts
        assert_eq!(pts, frame);
        assert_eq!(cadence.duration_ns(), 5 * frame);
    }

    #[test]
    fn clock_priority_timestamps_follow_wall_clock() {
        let mut cadence = FrameCadence::new(25, RecordingPriority::Clock);
        let frame = cadence.frame_duration_ns();
        cadence.accept(0);
        let pts = cadence.accept(5 * frame).unwrap();
        assert_eq!(pts, 5 * frame);
    }

    #[test]
    fn profile_extensions() {
        assert_eq!(RecordingProfile::H264Standard.extension(), "mov");
        assert_eq!(RecordingProfile::Vp8.extension(), "webm");
        assert_eq!(RecordingProfile::JpegMulti.extension(), "jpg");
    }

    #[test]
    fn recorder_filename_carries_extension() {
        let recorder = VideoRecorder::new(RecorderConfig::default());
        assert_eq!(
            recorder.filename().extension().and_then(|e| e.to_str()),
            Some("mov")
        );
        assert_eq!(recorder.state(), GrabberState::Initializing);
    }

    #[test]
    fn png_recorder_finishes_after_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = PngRecorder::new(dir.path());
        let caps = FrameCaps {
            width: 4,
            height: 4,
            use_alpha: true,
        };
        let frame = Bytes::from(vec![200u8; caps.data_size()]);
        recorder.add_frame(&frame, &caps);
        assert!(recorder.finished());
        // allow the writer thread to flush
        for _ in 0..50 {
            if recorder.filename().exists() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(recorder.filename().exists());
    }
}
