//! Frame-grab fan-out: one producer, many sinks
//!
//! The pump is invoked once per rendered frame with the session output.
//! Readback goes through a pair of staging buffers swapped every tick, so
//! every consumer sees frames one tick late but the render thread never
//! waits on a sink. Grabbers in `active` receive every staged frame;
//! entries in `chain` are pending grabbers that atomically replace a
//! running one as soon as they accept buffers (save & continue).

pub mod broadcast;
pub mod loopback;
pub mod recorder;
pub mod streamer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use crate::frame::FrameBuffer;

/// Lifecycle common to every grabber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabberState {
    Initializing,
    Active,
    Paused,
    Ending,
    Finished,
}

/// Shape of the frames staged by the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCaps {
    pub width: u32,
    pub height: u32,
    pub use_alpha: bool,
}

impl FrameCaps {
    pub fn data_size(&self) -> usize {
        (self.width * self.height * if self.use_alpha { 4 } else { 3 }) as usize
    }

    pub fn format(&self) -> &'static str {
        if self.use_alpha {
            "RGBA"
        } else {
            "RGB"
        }
    }

    pub fn to_gst_caps(&self, fps: u32) -> gst::Caps {
        gst::Caps::builder("video/x-raw")
            .field("format", self.format())
            .field("width", self.width as i32)
            .field("height", self.height as i32)
            .field("framerate", gst::Fraction::new(fps as i32, 1))
            .build()
    }
}

/// A consumer of session output frames
pub trait FrameGrabber: Send {
    fn id(&self) -> u64;

    /// Delivers one staged frame. Called once per pump tick while the
    /// grabber is listed.
    fn add_frame(&mut self, frame: &Bytes, caps: &FrameCaps);

    /// Requests termination; the grabber flushes and reaches `Finished` on
    /// a later tick.
    fn stop(&mut self);

    /// Suspends or resumes frame intake
    fn pause(&mut self, _on: bool) {}

    fn state(&self) -> GrabberState;

    /// One-line status; `extended` adds the failure or configuration detail.
    fn info(&self, extended: bool) -> String;

    /// Amount of recorded content, in milliseconds
    fn duration_ms(&self) -> u64;

    fn finished(&self) -> bool {
        self.state() == GrabberState::Finished
    }

    fn active(&self) -> bool {
        self.state() == GrabberState::Active
    }

    /// True while the sink accepts buffers
    fn accept_buffer(&self) -> bool;

    fn busy(&self) -> bool {
        self.active() && self.accept_buffer()
    }

    /// File written by this grabber, if any; kept even when the grabber
    /// failed so it can be registered in the recent recordings.
    fn output_path(&self) -> Option<std::path::PathBuf> {
        None
    }
}

struct ChainEntry {
    pending: Box<dyn FrameGrabber>,
    replaces: u64,
}

/// The single-producer/multi-consumer pump
pub struct FrameGrabbing {
    grabbers: Vec<Box<dyn FrameGrabber>>,
    chain: Vec<ChainEntry>,
    stages: [Bytes; 2],
    front: usize,
    primed: bool,
    caps: Option<FrameCaps>,
    finished_ids: Vec<u64>,
    finished_outputs: Vec<std::path::PathBuf>,
}

impl Default for FrameGrabbing {
    fn default() -> Self {
        FrameGrabbing {
            grabbers: Vec::new(),
            chain: Vec::new(),
            stages: [Bytes::new(), Bytes::new()],
            front: 0,
            primed: false,
            caps: None,
            finished_ids: Vec::new(),
            finished_outputs: Vec::new(),
        }
    }
}

impl FrameGrabbing {
    pub fn add(&mut self, grabber: Box<dyn FrameGrabber>) {
        info!(id = grabber.id(), "Grabber added");
        self.grabbers.push(grabber);
    }

    /// Queues `next` to replace the running grabber `replaces` as soon as
    /// `next` is active and accepting buffers.
    pub fn chain(&mut self, replaces: u64, next: Box<dyn FrameGrabber>) {
        info!(id = next.id(), replaces, "Grabber chained");
        self.chain.push(ChainEntry { pending: next, replaces });
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Box<dyn FrameGrabber>> {
        self.grabbers.iter_mut().find(|g| g.id() == id)
    }

    pub fn stop(&mut self, id: u64) {
        if let Some(grabber) = self.get_mut(id) {
            grabber.stop();
        }
    }

    pub fn stop_all(&mut self) {
        for grabber in &mut self.grabbers {
            grabber.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.grabbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grabbers.is_empty()
    }

    pub fn busy(&self) -> bool {
        !self.grabbers.is_empty()
    }

    pub fn current_caps(&self) -> Option<FrameCaps> {
        self.caps
    }

    /// Ids of grabbers removed since the last call
    pub fn take_finished(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.finished_ids)
    }

    /// Output files of grabbers removed since the last call
    pub fn take_finished_outputs(&mut self) -> Vec<std::path::PathBuf> {
        std::mem::take(&mut self.finished_outputs)
    }

    /// Status lines of all grabbers, for display
    pub fn list(&self) -> Vec<(u64, String)> {
        self.grabbers.iter().map(|g| (g.id(), g.info(false))).collect()
    }

    /// The pump: stages the frame and fans it out. Invoked once per
    /// rendered session frame.
    pub fn grab_frame(&mut self, frame_buffer: &FrameBuffer) {
        let caps = FrameCaps {
            width: frame_buffer.width(),
            height: frame_buffer.height(),
            use_alpha: frame_buffer.use_alpha(),
        };

        // 1. rebuild the staging path when the output shape changed
        if self.caps != Some(caps) {
            debug!(width = caps.width, height = caps.height, alpha = caps.use_alpha,
                   "Staging path rebuilt");
            self.caps = Some(caps);
            self.stages = [Bytes::new(), Bytes::new()];
            self.front = 0;
            self.primed = false;
        }

        if self.grabbers.is_empty() && self.chain.is_empty() {
            return;
        }

        // 2. acquire the current frame into the back stage
        let mut back = Vec::with_capacity(caps.data_size());
        frame_buffer.read_pixels(&mut back);
        let back_index = 1 - self.front;
        self.stages[back_index] = Bytes::from(back);

        // 3. swap: the freshly written stage becomes next tick's front
        self.front = back_index;
        if !self.primed {
            // nothing staged yet to deliver, keep the one-tick latency
            self.primed = true;
            return;
        }
        let front = self.stages[1 - self.front].clone();
        if front.len() != caps.data_size() {
            return;
        }

        // 4. deliver to active grabbers, dropping the finished ones
        let mut index = 0;
        while index < self.grabbers.len() {
            self.grabbers[index].add_frame(&front, &caps);
            if self.grabbers[index].finished() {
                let grabber = self.grabbers.remove(index);
                info!(id = grabber.id(), info = %grabber.info(true), "Grabber finished");
                if let Some(path) = grabber.output_path() {
                    self.finished_outputs.push(path);
                }
                self.finished_ids.push(grabber.id());
            } else {
                index += 1;
            }
        }

        // 5. feed pending chained grabbers; promote them once they accept
        let mut chain_index = 0;
        while chain_index < self.chain.len() {
            self.chain[chain_index].pending.add_frame(&front, &caps);
            let entry = &self.chain[chain_index];
            if entry.pending.active() && entry.pending.accept_buffer() {
                let entry = self.chain.remove(chain_index);
                self.stop(entry.replaces);
                info!(id = entry.pending.id(), replaced = entry.replaces, "Chained grabber promoted");
                self.grabbers.push(entry.pending);
            } else if entry.pending.finished() {
                let entry = self.chain.remove(chain_index);
                warn!(id = entry.pending.id(), "Chained grabber failed before promotion");
                self.finished_ids.push(entry.pending.id());
            } else {
                chain_index += 1;
            }
        }
    }
}

/// A GStreamer encoding pipeline fed from an appsrc, shared by recorders,
/// broadcasters, the loopback writer and peer streamers.
pub(crate) struct EncoderSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    accept: Arc<AtomicBool>,
    description: String,
}

pub(crate) enum SinkPoll {
    Running,
    EndOfStream,
    Error(String),
}

impl EncoderSink {
    /// Builds `appsrc name=src ! <tail>` and starts it.
    pub(crate) fn open(tail: &str, caps: &FrameCaps, fps: u32, max_bytes: u64) -> Result<Self> {
        let description = format!("appsrc name=src ! {}", tail);
        debug!(pipeline = %description, "Opening encoder sink");

        let pipeline = gst::parse::launch(&description)
            .context("Failed to parse encoder pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow::anyhow!("Encoder description is not a pipeline"))?;

        let appsrc = pipeline
            .by_name("src")
            .context("Encoder pipeline has no appsrc")?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| anyhow::anyhow!("src element is not an appsrc"))?;

        appsrc.set_caps(Some(&caps.to_gst_caps(fps)));
        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(true);
        if max_bytes > 0 {
            appsrc.set_max_bytes(max_bytes);
        }

        let accept = Arc::new(AtomicBool::new(false));
        let need = accept.clone();
        let enough = accept.clone();
        appsrc.set_callbacks(
            gst_app::AppSrcCallbacks::builder()
                .need_data(move |_, _| {
                    need.store(true, Ordering::Release);
                })
                .enough_data(move |_| {
                    enough.store(false, Ordering::Release);
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to start encoder pipeline")?;

        Ok(EncoderSink {
            pipeline,
            appsrc,
            accept,
            description,
        })
    }

    pub(crate) fn accepts(&self) -> bool {
        self.accept.load(Ordering::Acquire)
    }

    pub(crate) fn queued_bytes(&self) -> u64 {
        self.appsrc.current_level_bytes()
    }

    /// Pushes one frame with explicit timing. Returns false on flow error.
    pub(crate) fn push(&self, data: &[u8], pts_ns: u64, duration_ns: u64) -> bool {
        let mut buffer = gst::Buffer::from_mut_slice(data.to_vec());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(pts_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(duration_ns));
        }
        self.appsrc.push_buffer(buffer).is_ok()
    }

    /// Sends end-of-stream so the encoder can flush its tail.
    pub(crate) fn end_stream(&self) {
        let _ = self.appsrc.end_of_stream();
    }

    /// Drains the bus; reports EOS completion or a pipeline error.
    pub(crate) fn poll(&self) -> SinkPoll {
        let Some(bus) = self.pipeline.bus() else {
            return SinkPoll::Running;
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let text = format!("{}", err.error());
                    warn!(pipeline = %self.description, error = %text, "Encoder error");
                    return SinkPoll::Error(text);
                }
                gst::MessageView::Eos(_) => return SinkPoll::EndOfStream,
                _ => {}
            }
        }
        SinkPoll::Running
    }
}

impl Drop for EncoderSink {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Shared core of grabbers that feed a live encoder pipeline at a fixed
/// framerate: lazy init on the first frame, cadence-aligned pushes, EOS
/// driven teardown. Broadcasters, the loopback writer and peer streamers
/// wrap this with their pipeline description and status text.
pub(crate) struct LiveEncoder {
    tail: String,
    fps: u32,
    state: GrabberState,
    error: Option<String>,
    sink: Option<EncoderSink>,
    caps: Option<FrameCaps>,
    cadence: recorder::FrameCadence,
    first_frame: Option<std::time::Instant>,
}

impl LiveEncoder {
    pub(crate) fn new(tail: String, fps: u32) -> Self {
        LiveEncoder {
            tail,
            fps,
            state: GrabberState::Initializing,
            error: None,
            sink: None,
            caps: None,
            cadence: recorder::FrameCadence::new(fps, recorder::RecordingPriority::Framerate),
            first_frame: None,
        }
    }

    pub(crate) fn state(&self) -> GrabberState {
        self.state
    }

    pub(crate) fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn duration_ms(&self) -> u64 {
        self.cadence.duration_ns() / 1_000_000
    }

    pub(crate) fn accepts(&self) -> bool {
        self.sink.as_ref().map(EncoderSink::accepts).unwrap_or(false)
    }

    fn fail(&mut self, message: String) {
        warn!(error = %message, "Live encoder failed");
        self.error = Some(message);
        self.state = GrabberState::Finished;
    }

    pub(crate) fn deliver(&mut self, frame: &Bytes, caps: &FrameCaps) {
        match self.state {
            GrabberState::Initializing => {
                match EncoderSink::open(&self.tail, caps, self.fps, 0) {
                    Ok(sink) => {
                        self.sink = Some(sink);
                        self.caps = Some(*caps);
                        self.state = GrabberState::Active;
                    }
                    Err(e) => {
                        self.fail(format!("{:#}", e));
                        return;
                    }
                }
            }
            GrabberState::Finished => return,
            _ => {}
        }

        // a resolution change ends the stream downstream
        if self.caps.is_some() && self.caps != Some(*caps) {
            warn!("Stream interrupted because the resolution changed");
            self.stop();
        }

        let Some(sink) = &self.sink else { return };
        match sink.poll() {
            SinkPoll::Running => {}
            SinkPoll::EndOfStream => {
                self.state = GrabberState::Finished;
                return;
            }
            SinkPoll::Error(message) => {
                self.fail(message);
                return;
            }
        }

        if self.state == GrabberState::Active && sink.accepts() {
            let first = *self
                .first_frame
                .get_or_insert_with(std::time::Instant::now);
            let elapsed = first.elapsed().as_nanos() as u64;
            if let Some(pts) = self.cadence.accept(elapsed) {
                if !sink.push(frame, pts, self.cadence.frame_duration_ns()) {
                    self.fail("Encoder refused the frame".to_string());
                }
            }
        }
    }

    pub(crate) fn stop(&mut self) {
        if matches!(self.state, GrabberState::Active | GrabberState::Paused) {
            self.state = GrabberState::Ending;
            if let Some(sink) = &self.sink {
                sink.end_stream();
            }
        } else if self.state == GrabberState::Initializing {
            self.state = GrabberState::Finished;
        }
    }

    pub(crate) fn pause(&mut self, on: bool) {
        match (self.state, on) {
            (GrabberState::Active, true) => self.state = GrabberState::Paused,
            (GrabberState::Paused, false) => self.state = GrabberState::Active,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Grabber that records the frames it received
    struct ProbeGrabber {
        id: u64,
        frames: Arc<AtomicUsize>,
        state: GrabberState,
        accept_at_frame: usize,
        seen: usize,
    }

    impl ProbeGrabber {
        fn new(id: u64, frames: Arc<AtomicUsize>) -> Self {
            ProbeGrabber {
                id,
                frames,
                state: GrabberState::Active,
                accept_at_frame: 0,
                seen: 0,
            }
        }
    }

    impl FrameGrabber for ProbeGrabber {
        fn id(&self) -> u64 {
            self.id
        }
        fn add_frame(&mut self, frame: &Bytes, caps: &FrameCaps) {
            assert_eq!(frame.len(), caps.data_size());
            self.seen += 1;
            self.frames.fetch_add(1, Ordering::SeqCst);
            if self.state == GrabberState::Ending {
                self.state = GrabberState::Finished;
            }
        }
        fn stop(&mut self) {
            self.state = GrabberState::Ending;
        }
        fn state(&self) -> GrabberState {
            self.state
        }
        fn info(&self, _extended: bool) -> String {
            format!("probe {}", self.id)
        }
        fn duration_ms(&self) -> u64 {
            0
        }
        fn accept_buffer(&self) -> bool {
            self.seen >= self.accept_at_frame
        }
    }

    fn frame_buffer() -> FrameBuffer {
        let mut fb = FrameBuffer::new(8, 8, true);
        fb.clear([1, 2, 3, 255]);
        fb
    }

    #[test]
    fn first_tick_only_primes_the_stages() {
        let mut pump = FrameGrabbing::default();
        let count = Arc::new(AtomicUsize::new(0));
        pump.add(Box::new(ProbeGrabber::new(1, count.clone())));
        let fb = frame_buffer();
        pump.grab_frame(&fb);
        assert_eq!(count.load(Ordering::SeqCst), 0, "one-tick latency");
        pump.grab_frame(&fb);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frames_are_monotonic_subsequence() {
        let mut pump = FrameGrabbing::default();
        let count = Arc::new(AtomicUsize::new(0));
        pump.add(Box::new(ProbeGrabber::new(1, count.clone())));
        let fb = frame_buffer();
        for _ in 0..10 {
            pump.grab_frame(&fb);
        }
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn resolution_change_rebuilds_staging() {
        let mut pump = FrameGrabbing::default();
        let count = Arc::new(AtomicUsize::new(0));
        pump.add(Box::new(ProbeGrabber::new(1, count.clone())));
        let fb = frame_buffer();
        pump.grab_frame(&fb);
        pump.grab_frame(&fb);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let mut larger = FrameBuffer::new(16, 16, true);
        larger.clear([0, 0, 0, 255]);
        pump.grab_frame(&larger);
        // re-priming after the caps change: no stale-sized frame delivered
        assert_eq!(count.load(Ordering::SeqCst), 1);
        pump.grab_frame(&larger);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stopped_grabber_is_removed_and_reported() {
        let mut pump = FrameGrabbing::default();
        let count = Arc::new(AtomicUsize::new(0));
        pump.add(Box::new(ProbeGrabber::new(7, count)));
        let fb = frame_buffer();
        pump.grab_frame(&fb);
        pump.stop(7);
        pump.grab_frame(&fb); // delivers, grabber transitions to Finished
        assert!(pump.is_empty());
        assert_eq!(pump.take_finished(), vec![7]);
        assert!(pump.take_finished().is_empty());
    }

    #[test]
    fn chain_promotes_when_pending_accepts() {
        let mut pump = FrameGrabbing::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        pump.add(Box::new(ProbeGrabber::new(1, first)));

        let mut pending = ProbeGrabber::new(2, second.clone());
        pending.accept_at_frame = 2; // accepts after two deliveries
        pump.chain(1, Box::new(pending));

        let fb = frame_buffer();
        pump.grab_frame(&fb); // prime
        pump.grab_frame(&fb); // chain fed (1), not accepting yet
        assert_eq!(pump.len(), 1);
        pump.grab_frame(&fb); // chain fed (2) -> promoted, replaced stopped
        assert_eq!(pump.len(), 2);
        pump.grab_frame(&fb); // replaced grabber finishes
        assert_eq!(pump.len(), 1);
        assert_eq!(pump.take_finished(), vec![1]);
        assert!(second.load(Ordering::SeqCst) >= 2);
    }
}
