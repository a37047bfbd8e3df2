//! LAN peer discovery over an OSC/UDP handshake
//!
//! On init the instance binds the lowest free port of the handshake range;
//! its instance id is the offset from the base port. An ask loop broadcasts
//! `/vimix/ping` to the whole range every 500 ms and ages known peers; the
//! listener replies `/vimix/pong` with this instance's ports and records
//! peers from the pongs it receives. Index 0 of the peer list is self.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, info, warn};

use crate::defines::{
    ALIVE, APP_NAME, HANDSHAKE_PORT, MAX_HANDSHAKE, OSC_DIALOG_PORT, OSC_PING, OSC_PONG,
    OSC_PREFIX, OSC_TEMPO, PING_PERIOD_MS, STREAM_REQUEST_PORT, TERMINATE_TIMEOUT_SECS,
};
use crate::net::toolkit;

/// What an instance knows about one peer (or itself, at index 0)
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub name: String,
    pub address: String,
    pub port_handshake: u16,
    pub port_stream_request: u16,
    pub port_osc: u16,
    pub alive: i32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        ConnectionInfo {
            name: String::new(),
            address: "localhost".to_string(),
            port_handshake: HANDSHAKE_PORT,
            port_stream_request: STREAM_REQUEST_PORT,
            port_osc: OSC_DIALOG_PORT,
            alive: ALIVE,
        }
    }
}

impl ConnectionInfo {
    /// Two records designate the same peer when address and handshake port
    /// match.
    pub fn same_endpoint(&self, other: &ConnectionInfo) -> bool {
        self.address == other.address && self.port_handshake == other.port_handshake
    }
}

struct Shared {
    peers: Mutex<Vec<ConnectionInfo>>,
    tempo_from_peer: Mutex<Option<f64>>,
    tempo_to_broadcast: Mutex<Option<f64>>,
}

/// Peer discovery manager
pub struct Connection {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    listen_done: Option<mpsc::Receiver<()>>,
    ask_done: Option<mpsc::Receiver<()>>,
    instance_id: u16,
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            shared: Arc::new(Shared {
                peers: Mutex::new(vec![ConnectionInfo::default()]),
                tempo_from_peer: Mutex::new(None),
                tempo_to_broadcast: Mutex::new(None),
            }),
            running: Arc::new(AtomicBool::new(false)),
            listen_done: None,
            ask_done: None,
            instance_id: 0,
        }
    }

    /// Binds the lowest free handshake port and starts the listener and ask
    /// loops. Returns the instance id.
    pub fn init(&mut self) -> Result<u16> {
        let mut bound: Option<(UdpSocket, u16)> = None;
        for trial in 0..MAX_HANDSHAKE {
            match UdpSocket::bind(("0.0.0.0", HANDSHAKE_PORT + trial)) {
                Ok(socket) => {
                    bound = Some((socket, trial));
                    break;
                }
                Err(_) => continue,
            }
        }
        let (socket, trial) =
            bound.context("No free handshake port, too many instances running")?;
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("Failed to configure handshake socket")?;

        self.instance_id = trial;
        {
            let mut peers = self.shared.peers.lock();
            peers[0] = ConnectionInfo {
                name: format!("{}@{}.{}", APP_NAME, toolkit::hostname(), trial),
                address: "localhost".to_string(),
                port_handshake: HANDSHAKE_PORT + trial,
                port_stream_request: STREAM_REQUEST_PORT + trial,
                port_osc: OSC_DIALOG_PORT + trial,
                alive: ALIVE,
            };
        }

        self.running.store(true, Ordering::Release);

        // listener: replies to pings, records pongs
        let (listen_done_tx, listen_done_rx) = mpsc::channel();
        let listen_shared = self.shared.clone();
        let listen_running = self.running.clone();
        std::thread::Builder::new()
            .name("connection-listen".to_string())
            .spawn(move || {
                listen_loop(&socket, &listen_shared, &listen_running);
                let _ = listen_done_tx.send(());
            })
            .context("Failed to spawn connection listener")?;
        self.listen_done = Some(listen_done_rx);

        // ask loop: broadcasts pings, ages peers, relays tempo
        let (ask_done_tx, ask_done_rx) = mpsc::channel();
        let ask_shared = self.shared.clone();
        let ask_running = self.running.clone();
        std::thread::Builder::new()
            .name("connection-ask".to_string())
            .spawn(move || {
                ask_loop(&ask_shared, &ask_running);
                let _ = ask_done_tx.send(());
            })
            .context("Failed to spawn connection asker")?;
        self.ask_done = Some(ask_done_rx);

        info!(
            instance = self.instance_id,
            port = HANDSHAKE_PORT + trial,
            "Accepting handshake"
        );
        Ok(self.instance_id)
    }

    /// Stops both loops with a bounded wait; a loop that does not confirm in
    /// time is logged and leaked.
    pub fn terminate(&mut self) {
        self.running.store(false, Ordering::Release);
        for (done, label) in [
            (self.ask_done.take(), "asker"),
            (self.listen_done.take(), "listener"),
        ] {
            if let Some(done) = done {
                if done
                    .recv_timeout(Duration::from_secs(TERMINATE_TIMEOUT_SECS))
                    .is_err()
                {
                    warn!(label, "Failed to terminate connection manager");
                }
            }
        }
    }

    pub fn instance_id(&self) -> u16 {
        self.instance_id
    }

    pub fn num_hosts(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Info of the peer at `index`; index 0 is self.
    pub fn info(&self, index: usize) -> ConnectionInfo {
        let peers = self.shared.peers.lock();
        peers
            .get(index.min(peers.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_default()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.shared.peers.lock().iter().position(|p| p.name == name)
    }

    /// Short-critical-section copy of the peer list
    pub fn peers_snapshot(&self) -> Vec<ConnectionInfo> {
        self.shared.peers.lock().clone()
    }

    /// Queues a tempo value for broadcast to all known peers.
    pub fn queue_tempo_broadcast(&self, bpm: f64) {
        *self.shared.tempo_to_broadcast.lock() = Some(bpm);
    }

    /// Tempo proposed by a peer since the last call, if any.
    pub fn take_tempo_from_peer(&self) -> Option<f64> {
        self.shared.tempo_from_peer.lock().take()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn listen_loop(socket: &UdpSocket, shared: &Arc<Shared>, running: &AtomicBool) {
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
                warn!(error = %e, "Handshake receive failed");
                continue;
            }
        };
        let packet = match rosc::decoder::decode_udp(&buf[..size]) {
            Ok((_, p)) => p,
            Err(e) => {
                debug!(%sender, error = %e, "Dropped malformed handshake packet");
                continue;
            }
        };
        let OscPacket::Message(message) = packet else { continue };
        let sender_ip = sender.ip().to_string();

        if message.addr == format!("{}{}", OSC_PREFIX, OSC_PING) {
            let Some(reply_port) = message.args.first().and_then(osc_u16) else {
                continue;
            };
            let myself = shared.peers.lock()[0].clone();
            // ignore requests from myself
            if toolkit::is_host_ip(&sender_ip) && reply_port == myself.port_handshake {
                continue;
            }
            let pong = OscMessage {
                addr: format!("{}{}", OSC_PREFIX, OSC_PONG),
                args: vec![
                    OscType::String(myself.name.clone()),
                    OscType::Int(myself.port_handshake as i32),
                    OscType::Int(myself.port_stream_request as i32),
                    OscType::Int(myself.port_osc as i32),
                ],
            };
            send_message(socket, &(sender_ip.as_str(), reply_port), pong);
        } else if message.addr == format!("{}{}", OSC_PREFIX, OSC_PONG) {
            let mut args = message.args.iter();
            let (Some(name), Some(handshake), Some(request), Some(osc)) = (
                args.next().and_then(|a| match a {
                    OscType::String(s) => Some(s.clone()),
                    _ => None,
                }),
                args.next().and_then(osc_u16),
                args.next().and_then(osc_u16),
                args.next().and_then(osc_u16),
            ) else {
                debug!(%sender, "Dropped malformed pong");
                continue;
            };
            let record = ConnectionInfo {
                name,
                address: sender_ip,
                port_handshake: handshake,
                port_stream_request: request,
                port_osc: osc,
                alive: ALIVE,
            };
            let mut peers = shared.peers.lock();
            // never list ourselves twice
            if record.same_endpoint(&peers[0])
                || (toolkit::is_host_ip(&record.address)
                    && record.port_handshake == peers[0].port_handshake)
            {
                continue;
            }
            match peers.iter_mut().find(|p| p.same_endpoint(&record)) {
                Some(existing) => existing.alive = ALIVE,
                None => {
                    info!(peer = %record.name, address = %record.address, "Peer discovered");
                    peers.push(record);
                }
            }
        } else if message.addr == format!("{}{}", OSC_PREFIX, OSC_TEMPO) {
            if let Some(bpm) = message.args.first().and_then(|a| match a {
                OscType::Float(v) => Some(*v as f64),
                OscType::Double(v) => Some(*v),
                OscType::Int(v) => Some(*v as f64),
                _ => None,
            }) {
                *shared.tempo_from_peer.lock() = Some(bpm);
            }
        }
    }
}

fn ask_loop(shared: &Arc<Shared>, running: &AtomicBool) {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        warn!("Failed to bind ask socket");
        return;
    };
    let _ = socket.set_broadcast(true);

    while running.load(Ordering::Acquire) {
        let myself = shared.peers.lock()[0].clone();
        let ping = OscMessage {
            addr: format!("{}{}", OSC_PREFIX, OSC_PING),
            args: vec![OscType::Int(myself.port_handshake as i32)],
        };

        // scan the whole range, on the broadcast address and on localhost
        for port in HANDSHAKE_PORT..HANDSHAKE_PORT + MAX_HANDSHAKE {
            send_message(&socket, &("255.255.255.255", port), ping.clone());
            send_message(&socket, &("127.0.0.1", port), ping.clone());
        }

        // relay a pending tempo change to every known peer
        if let Some(bpm) = shared.tempo_to_broadcast.lock().take() {
            let tempo = OscMessage {
                addr: format!("{}{}", OSC_PREFIX, OSC_TEMPO),
                args: vec![OscType::Double(bpm)],
            };
            for peer in shared.peers.lock().iter().skip(1) {
                send_message(
                    &socket,
                    &(peer.address.as_str(), peer.port_handshake),
                    tempo.clone(),
                );
            }
        }

        std::thread::sleep(Duration::from_millis(PING_PERIOD_MS));

        // age peers, drop the silent ones
        let mut peers = shared.peers.lock();
        let mut index = 1;
        while index < peers.len() {
            peers[index].alive -= 1;
            if peers[index].alive < 0 {
                info!(peer = %peers[index].name, "Peer lost");
                peers.remove(index);
            } else {
                index += 1;
            }
        }
    }
}

fn send_message(socket: &UdpSocket, target: &(&str, u16), message: OscMessage) {
    match rosc::encoder::encode(&OscPacket::Message(message)) {
        Ok(data) => {
            let _ = socket.send_to(&data, (target.0, target.1));
        }
        Err(e) => debug!(error = %e, "Failed to encode handshake message"),
    }
}

fn osc_u16(arg: &OscType) -> Option<u16> {
    match arg {
        OscType::Int(v) if *v >= 0 && *v <= u16::MAX as i32 => Some(*v as u16),
        _ => None,
    }
}
