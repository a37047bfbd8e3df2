//! Process-wide constants

use std::sync::atomic::{AtomicU64, Ordering};

pub const APP_NAME: &str = "mixel";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extension of session files
pub const SESSION_FILE_EXT: &str = "mix";

// ---- Peer handshake -------------------------------------------------------

/// OSC address prefix shared by all instances on the wire
pub const OSC_PREFIX: &str = "/vimix";

pub const OSC_PING: &str = "/ping";
pub const OSC_PONG: &str = "/pong";
pub const OSC_STREAM_REQUEST: &str = "/request";
pub const OSC_STREAM_OFFER: &str = "/offer";
pub const OSC_STREAM_REJECT: &str = "/reject";
pub const OSC_STREAM_DISCONNECT: &str = "/disconnect";
pub const OSC_TEMPO: &str = "/tempo";

/// Base port scanned for the handshake; an instance binds the lowest free one
pub const HANDSHAKE_PORT: u16 = 36510;
/// Number of ports scanned above [`HANDSHAKE_PORT`] (max concurrent instances)
pub const MAX_HANDSHAKE: u16 = 20;
/// Base port for stream requests, offset by instance id
pub const STREAM_REQUEST_PORT: u16 = 36540;
/// Base port for the per-instance OSC dialog, offset by instance id
pub const OSC_DIALOG_PORT: u16 = 36570;

/// Pings a peer may miss before being removed
pub const ALIVE: i32 = 5;
/// Period of the discovery broadcast, in milliseconds
pub const PING_PERIOD_MS: u64 = 500;

// ---- OSC control surface --------------------------------------------------

pub const OSC_PORT_RECV_DEFAULT: u16 = 7000;
pub const OSC_PORT_SEND_DEFAULT: u16 = 7001;

// ---- Timeline -------------------------------------------------------------

/// Number of samples in a timeline fading envelope
pub const MAX_TIMELINE_ARRAY: usize = 2000;

// ---- Sources --------------------------------------------------------------

/// Range of the source depth key
pub const MAX_DEPTH: f32 = 12.0;
/// Play speed is clamped to `[-MAX_PLAY_SPEED, MAX_PLAY_SPEED]`, zero excluded
pub const MAX_PLAY_SPEED: f64 = 10.0;

// ---- Frame grabbing -------------------------------------------------------

/// Default framerate of recorders when none is configured
pub const DEFAULT_GRABBER_FPS: u32 = 25;
/// Fixed framerate of peer streamers
pub const STREAMING_FPS: u32 = 30;
/// Fixed framerate of broadcasters (SRT, shared memory, loopback)
pub const BROADCAST_FPS: u32 = 30;

/// Below this free space in the appsrc queue, a recorder halves its intake
pub const MIN_BUFFER_SIZE: u64 = 10_485_760;
/// Default byte reservation of a recorder queue
pub const DEFAULT_BUFFERING_SIZE: u64 = 104_857_600;

/// Recording timeout upper bound, in milliseconds; the bound itself means
/// unlimited duration
pub const RECORD_MAX_TIMEOUT_MS: u64 = 86_400_000;

/// Tolerance when aligning an input frame to the recorder cadence, ns
pub const CADENCE_TOLERANCE_NS: u64 = 3_000_000;

// ---- Runtime --------------------------------------------------------------

/// Bounded wait when terminating receiver/ask threads, in seconds
pub const TERMINATE_TIMEOUT_SECS: u64 = 2;

/// Number of history entries kept in each recent-file FIFO
pub const MAX_RECENT_HISTORY: usize = 20;

static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique, non-zero 64-bit id.
///
/// Seeded from wall clock so ids also differ across runs of the same
/// process, which keeps snapshot and grabber ids distinguishable in logs.
pub fn unique_id() -> u64 {
    static SEED: once_cell::sync::Lazy<u64> = once_cell::sync::Lazy::new(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1)
            << 16
    });
    *SEED + NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_are_distinct_and_nonzero() {
        let a = unique_id();
        let b = unique_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn port_ranges_do_not_overlap() {
        assert!(HANDSHAKE_PORT + MAX_HANDSHAKE <= STREAM_REQUEST_PORT);
        assert!(STREAM_REQUEST_PORT + MAX_HANDSHAKE <= OSC_DIALOG_PORT);
    }
}
