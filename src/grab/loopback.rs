//! Virtual camera loopback writer
//!
//! Writes the session output into a v4l2 loopback device so any camera
//! application can pick it up. The device must exist (v4l2loopback module
//! loaded); when it does not, the grabber reports the reason and finishes
//! on the first delivered frame.

use bytes::Bytes;

use crate::defines::{unique_id, BROADCAST_FPS};
use crate::grab::{FrameCaps, FrameGrabber, GrabberState, LiveEncoder};
use crate::net::toolkit;

pub struct LoopbackWriter {
    id: u64,
    device_index: u32,
    encoder: LiveEncoder,
}

impl LoopbackWriter {
    pub fn new(device_index: u32) -> Self {
        LoopbackWriter {
            id: unique_id(),
            device_index,
            encoder: LiveEncoder::new(toolkit::loopback_sink_pipeline(device_index), BROADCAST_FPS),
        }
    }

    pub fn device(&self) -> String {
        format!("/dev/video{}", self.device_index)
    }

    /// Whether the loopback device node is present on this system
    pub fn device_available(device_index: u32) -> bool {
        std::path::Path::new(&format!("/dev/video{}", device_index)).exists()
    }
}

impl FrameGrabber for LoopbackWriter {
    fn id(&self) -> u64 {
        self.id
    }

    fn add_frame(&mut self, frame: &Bytes, caps: &FrameCaps) {
        self.encoder.deliver(frame, caps);
    }

    fn stop(&mut self) {
        self.encoder.stop();
    }

    fn pause(&mut self, on: bool) {
        self.encoder.pause(on);
    }

    fn state(&self) -> GrabberState {
        self.encoder.state()
    }

    fn info(&self, extended: bool) -> String {
        match (self.encoder.error(), extended) {
            (Some(e), true) => format!("Loopback failed: {}", e),
            _ => format!("Virtual camera {}", self.device()),
        }
    }

    fn duration_ms(&self) -> u64 {
        self.encoder.duration_ms()
    }

    fn accept_buffer(&self) -> bool {
        self.encoder.accepts()
    }
}
