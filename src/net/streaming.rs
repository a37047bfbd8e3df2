//! Per-peer stream negotiation
//!
//! A listener thread on the stream-request port answers `/vimix/request`
//! with `/vimix/offer` (or `/vimix/reject` when connections are refused)
//! and records accepted configurations on a queue. The render thread drains
//! that queue, spawns a peer streamer grabber per entry and keeps the
//! bookkeeping needed to stop the right streamer on `/vimix/disconnect`.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, info, warn};

use crate::defines::{
    OSC_PREFIX, OSC_STREAM_DISCONNECT, OSC_STREAM_OFFER, OSC_STREAM_REJECT, OSC_STREAM_REQUEST,
    TERMINATE_TIMEOUT_SECS,
};
use crate::net::toolkit::{self, StreamProtocol};

/// Negotiated parameters of one outgoing peer stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub client_address: String,
    pub client_name: String,
    pub port: u16,
    pub protocol: StreamProtocol,
    pub width: u32,
    pub height: u32,
}

struct Shared {
    enabled: AtomicBool,
    low_bandwidth: AtomicBool,
    resolution: Mutex<(u32, u32)>,
    new_streams: Mutex<Vec<StreamConfig>>,
    stop_requests: Mutex<Vec<(String, u16)>>,
}

/// Stream negotiation manager
pub struct Streaming {
    shared: Arc<Shared>,
    port: u16,
    running: Arc<AtomicBool>,
    done: Option<mpsc::Receiver<()>>,
    /// streamers currently serving peers: (config, grabber id)
    active: Vec<(StreamConfig, u64)>,
}

impl Streaming {
    pub fn new(port: u16) -> Self {
        Streaming {
            shared: Arc::new(Shared {
                enabled: AtomicBool::new(false),
                low_bandwidth: AtomicBool::new(false),
                resolution: Mutex::new((1280, 720)),
                new_streams: Mutex::new(Vec::new()),
                stop_requests: Mutex::new(Vec::new()),
            }),
            port,
            running: Arc::new(AtomicBool::new(false)),
            done: None,
            active: Vec::new(),
        }
    }

    /// The stream-request port; resolved after [`init`](Streaming::init)
    /// when constructed with port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Binds the stream-request port and starts answering requests.
    pub fn init(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .with_context(|| format!("Failed to bind stream request port {}", self.port))?;
        self.port = socket.local_addr().context("No local address")?.port();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("Failed to configure stream request socket")?;

        self.running.store(true, Ordering::Release);
        let (done_tx, done_rx) = mpsc::channel();
        let shared = self.shared.clone();
        let running = self.running.clone();
        std::thread::Builder::new()
            .name("stream-requests".to_string())
            .spawn(move || {
                request_loop(&socket, &shared, &running);
                let _ = done_tx.send(());
            })
            .context("Failed to spawn stream request listener")?;
        self.done = Some(done_rx);
        info!(port = self.port, "Answering stream requests");
        Ok(())
    }

    pub fn terminate(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(done) = self.done.take() {
            if done
                .recv_timeout(Duration::from_secs(TERMINATE_TIMEOUT_SECS))
                .is_err()
            {
                warn!("Failed to terminate stream request listener");
            }
        }
    }

    /// Accept or refuse incoming stream requests. Disabling queues a stop of
    /// every ongoing streamer.
    pub fn enable(&mut self, on: bool) {
        self.shared.enabled.store(on, Ordering::Release);
        if on {
            info!("Accepting stream requests");
        } else {
            info!("Refusing stream requests");
            let mut stops = self.shared.stop_requests.lock();
            for (config, _) in &self.active {
                stops.push((config.client_address.clone(), config.port));
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn set_low_bandwidth(&self, on: bool) {
        self.shared.low_bandwidth.store(on, Ordering::Release);
    }

    /// Kept current by the render loop so offers advertise the right size.
    pub fn set_resolution(&self, width: u32, height: u32) {
        *self.shared.resolution.lock() = (width, height);
    }

    /// Streams accepted since the last call; the caller binds a grabber to
    /// each and registers it back.
    pub fn drain_new_streams(&self) -> Vec<StreamConfig> {
        std::mem::take(&mut *self.shared.new_streams.lock())
    }

    /// Disconnect requests received since the last call.
    pub fn drain_stop_requests(&self) -> Vec<(String, u16)> {
        std::mem::take(&mut *self.shared.stop_requests.lock())
    }

    /// Records the grabber serving a config.
    pub fn register(&mut self, config: StreamConfig, grabber_id: u64) {
        debug!(client = %config.client_name, port = config.port, "Peer streamer registered");
        self.active.push((config, grabber_id));
    }

    /// Resolves a disconnect request to the grabber to stop.
    pub fn match_stop(&mut self, address: &str, port: u16) -> Option<u64> {
        let index = self
            .active
            .iter()
            .position(|(c, _)| c.client_address == address && c.port == port)?;
        let (config, id) = self.active.remove(index);
        info!(client = %config.client_name, port = config.port, "Ending peer stream");
        Some(id)
    }

    /// Drops a streamer that ended on its own (grabber finished).
    pub fn unregister_grabber(&mut self, grabber_id: u64) {
        self.active.retain(|(_, id)| *id != grabber_id);
    }

    pub fn busy(&self) -> bool {
        !self.active.is_empty()
    }

    /// Labels of ongoing streams
    pub fn list_streams(&self) -> Vec<String> {
        self.active
            .iter()
            .map(|(c, _)| {
                format!(
                    "{} to {}:{} ({})",
                    c.protocol.label(),
                    c.client_address,
                    c.port,
                    c.client_name
                )
            })
            .collect()
    }
}

impl Drop for Streaming {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn request_loop(socket: &UdpSocket, shared: &Arc<Shared>, running: &AtomicBool) {
    let mut buf = [0u8; rosc::decoder::MTU];
    while running.load(Ordering::Acquire) {
        let (size, sender) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Stream request receive failed");
                continue;
            }
        };
        let packet = match rosc::decoder::decode_udp(&buf[..size]) {
            Ok((_, p)) => p,
            Err(e) => {
                debug!(%sender, error = %e, "Dropped malformed stream request");
                continue;
            }
        };
        let OscPacket::Message(message) = packet else { continue };
        let sender_ip = sender.ip().to_string();

        if message.addr == format!("{}{}", OSC_PREFIX, OSC_STREAM_REQUEST) {
            let reply_port = message.args.first().and_then(|a| match a {
                OscType::Int(v) if *v > 0 && *v <= u16::MAX as i32 => Some(*v as u16),
                _ => None,
            });
            let client_name = message.args.get(1).and_then(|a| match a {
                OscType::String(s) => Some(s.clone()),
                _ => None,
            });
            let (Some(reply_port), Some(client_name)) = (reply_port, client_name) else {
                debug!(%sender, "Dropped malformed stream request");
                continue;
            };

            if shared.enabled.load(Ordering::Acquire) {
                let (width, height) = *shared.resolution.lock();
                let config = StreamConfig {
                    client_address: sender_ip.clone(),
                    client_name,
                    // the port the request came from is free on the client,
                    // re-use it for the stream
                    port: sender.port(),
                    protocol: toolkit::select_transport(
                        &sender_ip,
                        shared.low_bandwidth.load(Ordering::Acquire),
                    ),
                    width,
                    height,
                };
                let offer = OscMessage {
                    addr: format!("{}{}", OSC_PREFIX, OSC_STREAM_OFFER),
                    args: vec![
                        OscType::Int(config.port as i32),
                        OscType::Int(config.protocol as i32),
                        OscType::Int(config.width as i32),
                        OscType::Int(config.height as i32),
                    ],
                };
                send_message(socket, (&sender_ip, reply_port), offer);
                info!(client = %config.client_name, address = %sender_ip,
                      port = config.port, protocol = config.protocol.label(),
                      "Stream offered");
                shared.new_streams.lock().push(config);
            } else {
                send_message(
                    socket,
                    (&sender_ip, reply_port),
                    OscMessage {
                        addr: format!("{}{}", OSC_PREFIX, OSC_STREAM_REJECT),
                        args: vec![],
                    },
                );
                warn!(address = %sender_ip, "Stream request rejected, connections are refused");
            }
        } else if message.addr == format!("{}{}", OSC_PREFIX, OSC_STREAM_DISCONNECT) {
            if let Some(OscType::Int(port)) = message.args.first() {
                if *port > 0 && *port <= u16::MAX as i32 {
                    shared
                        .stop_requests
                        .lock()
                        .push((sender_ip, *port as u16));
                }
            }
        }
    }
}

fn send_message(socket: &UdpSocket, target: (&str, u16), message: OscMessage) {
    match rosc::encoder::encode(&OscPacket::Message(message)) {
        Ok(data) => {
            let _ = socket.send_to(&data, target);
        }
        Err(e) => debug!(error = %e, "Failed to encode stream reply"),
    }
}
