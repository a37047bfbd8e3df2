//! Network broadcasters: SRT listener and shared-memory writer

use bytes::Bytes;

use crate::defines::{unique_id, BROADCAST_FPS};
use crate::grab::{FrameCaps, FrameGrabber, GrabberState, LiveEncoder};
use crate::net::toolkit;

/// Broadcasts the output as an MPEG-TS/H264 stream on an SRT listener port
pub struct SrtBroadcaster {
    id: u64,
    port: u16,
    encoder: LiveEncoder,
}

impl SrtBroadcaster {
    pub const DEFAULT_PORT: u16 = 7070;

    pub fn new(port: u16) -> Self {
        SrtBroadcaster {
            id: unique_id(),
            port,
            encoder: LiveEncoder::new(toolkit::srt_sink_pipeline(port), BROADCAST_FPS),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FrameGrabber for SrtBroadcaster {
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
            (Some(e), true) => format!("SRT broadcast failed: {}", e),
            _ => format!("SRT broadcast srt://:{}", self.port),
        }
    }

    fn duration_ms(&self) -> u64 {
        self.encoder.duration_ms()
    }

    fn accept_buffer(&self) -> bool {
        self.encoder.accepts()
    }
}

/// Writes raw RGB frames to a shared-memory socket
pub struct ShmBroadcaster {
    id: u64,
    socket_path: String,
    encoder: LiveEncoder,
}

impl ShmBroadcaster {
    pub fn new(socket_path: impl Into<String>) -> Self {
        let socket_path = socket_path.into();
        ShmBroadcaster {
            id: unique_id(),
            encoder: LiveEncoder::new(toolkit::shm_sink_pipeline(&socket_path), BROADCAST_FPS),
            socket_path,
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }
}

impl FrameGrabber for ShmBroadcaster {
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
            (Some(e), true) => format!("Shared memory failed: {}", e),
            _ => format!("Shared memory {}", self.socket_path),
        }
    }

    fn duration_ms(&self) -> u64 {
        self.encoder.duration_ms()
    }

    fn accept_buffer(&self) -> bool {
        self.encoder.accepts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasters_start_initializing() {
        let srt = SrtBroadcaster::new(7200);
        assert_eq!(srt.state(), GrabberState::Initializing);
        assert_eq!(srt.port(), 7200);
        let shm = ShmBroadcaster::new("/tmp/mixel_shm");
        assert_eq!(shm.state(), GrabberState::Initializing);
        assert!(shm.info(false).contains("/tmp/mixel_shm"));
    }

    #[test]
    fn stop_before_init_finishes_immediately() {
        let mut srt = SrtBroadcaster::new(7200);
        srt.stop();
        assert!(srt.finished());
    }
}
