//! Per-peer stream sender
//!
//! One `PeerStreamer` serves one accepted stream request; its transport was
//! chosen during negotiation. The streamer lives until the consumer sends a
//! disconnect, the peer times out, or the output resolution changes.

use bytes::Bytes;

use crate::defines::{unique_id, STREAMING_FPS};
use crate::grab::{FrameCaps, FrameGrabber, GrabberState, LiveEncoder};
use crate::net::streaming::StreamConfig;
use crate::net::toolkit;

pub struct PeerStreamer {
    id: u64,
    config: StreamConfig,
    encoder: LiveEncoder,
}

impl PeerStreamer {
    pub fn new(config: StreamConfig) -> Self {
        let tail = toolkit::send_pipeline(config.protocol, &config.client_address, config.port);
        PeerStreamer {
            id: unique_id(),
            config,
            encoder: LiveEncoder::new(tail, STREAMING_FPS),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl FrameGrabber for PeerStreamer {
    fn id(&self) -> u64 {
        self.id
    }

    fn add_frame(&mut self, frame: &Bytes, caps: &FrameCaps) {
        // the offer advertised a fixed size; a different output ends the
        // stream with EOS downstream
        if caps.width != self.config.width || caps.height != self.config.height {
            if self.encoder.state() == GrabberState::Initializing {
                self.config.width = caps.width;
                self.config.height = caps.height;
            } else {
                self.stop();
            }
        }
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
            (Some(e), true) => format!("Stream failed: {}", e),
            _ => format!(
                "{} to {}:{} ({})",
                self.config.protocol.label(),
                self.config.client_address,
                self.config.port,
                self.config.client_name
            ),
        }
    }

    fn duration_ms(&self) -> u64 {
        self.encoder.duration_ms()
    }

    fn accept_buffer(&self) -> bool {
        self.encoder.accepts()
    }
}
