//! Application context: every manager, dependency-injected
//!
//! The managers of the process (settings, session, metronome, actions,
//! grabbing, connection, streaming, control, input mapping) are plain
//! structs owned here and threaded explicitly to whoever needs them. The
//! render loop runs `prepare`, `draw_scene`, `render_gui` once per tick;
//! the loop itself never blocks on I/O.

use std::net::UdpSocket;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscType};
use std::sync::Arc;
use tracing::{info, warn};

use crate::action::ActionManager;
use crate::control::inputs::InputMapper;
use crate::control::{Control, ControlContext};
use crate::defines::{APP_NAME, OSC_PREFIX, OSC_STREAM_DISCONNECT, OSC_STREAM_REQUEST};
use crate::grab::broadcast::{ShmBroadcaster, SrtBroadcaster};
use crate::grab::loopback::LoopbackWriter;
use crate::grab::recorder::{PngRecorder, VideoRecorder};
use crate::grab::streamer::PeerStreamer;
use crate::grab::FrameGrabbing;
use crate::metronome::Metronome;
use crate::net::toolkit::StreamProtocol;
use crate::net::{Connection, Streaming};
use crate::session::{document, Session};
use crate::settings::Settings;
use crate::source::Source;

/// Result of a stream request sent to a peer
enum PeerOffer {
    Accepted {
        protocol: StreamProtocol,
        port: u16,
        width: u32,
        height: u32,
    },
    Rejected,
    TimedOut,
}

/// Lock file advertising this instance; released on clean exit
struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    fn acquire(instance_id: u16) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{}_{}.lock", APP_NAME, instance_id));
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Lock file {} exists", path.display()))?;
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write lock file {}", path.display()))?;
        info!(path = %path.display(), "Instance lock taken");
        Ok(InstanceLock { path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The top-level application context
pub struct App {
    pub settings: Settings,
    settings_path: PathBuf,
    pub session: Session,
    pub metronome: Metronome,
    pub actions: ActionManager,
    pub mapper: InputMapper,
    pub grabbing: FrameGrabbing,
    pub connection: Connection,
    pub streaming: Streaming,
    pub control: Control,
    peer_offers: Arc<Mutex<Vec<(u64, PeerOffer)>>>,
    last_tick: Option<Instant>,
    _lock: Option<InstanceLock>,
}

impl App {
    pub fn new(settings: Settings, settings_path: PathBuf) -> Self {
        let session = Session::new(settings.render.width, settings.render.height);
        let metronome = Metronome::new(settings.metronome.tempo, settings.metronome.quantum);
        App {
            streaming: Streaming::new(0),
            control: Control::new(settings.osc.port_receive),
            settings,
            settings_path,
            session,
            metronome,
            actions: ActionManager::default(),
            mapper: InputMapper::default(),
            grabbing: FrameGrabbing::default(),
            connection: Connection::new(),
            peer_offers: Arc::new(Mutex::new(Vec::new())),
            last_tick: None,
            _lock: None,
        }
    }

    /// Brings every manager up. Fails when no handshake port or lock can be
    /// taken.
    pub fn init(&mut self) -> Result<()> {
        let instance_id = self.connection.init().context("Connection manager failed")?;
        self.settings.instance_id = instance_id;
        self._lock = Some(InstanceLock::acquire(instance_id)?);

        let myself = self.connection.info(0);
        self.streaming = Streaming::new(myself.port_stream_request);
        self.streaming.init().context("Streaming manager failed")?;
        self.streaming.enable(self.settings.accept_connections);
        self.streaming.set_low_bandwidth(self.settings.stream_low_bandwidth);

        self.control = Control::new(self.settings.osc.port_receive + instance_id);
        self.control.init().context("Control manager failed")?;
        for (from, to) in self.settings.osc.translation.clone() {
            self.control.set_translation(from, to);
        }

        self.metronome.set_enabled(self.settings.metronome.enabled);
        self.metronome
            .set_start_stop_sync(self.settings.metronome.start_stop_sync);
        self.mapper.set_axis_dead_zone(self.settings.inputs.axis_dead_zone);
        self.session.set_fading(self.settings.render.fading);

        self.actions.init(&self.session);
        info!(instance = instance_id, "Application initialized");
        Ok(())
    }

    /// First phase of a tick: drain control and network queues, fire
    /// deferred work. Never blocks.
    pub fn prepare(&mut self, dt: f64) {
        // commands from the OSC surface
        let mut ctx = ControlContext {
            session: &mut self.session,
            metronome: &mut self.metronome,
            actions: &mut self.actions,
            mapper: &mut self.mapper,
            settings: &mut self.settings,
            streaming: &mut self.streaming,
        };
        self.control.update(&mut ctx, dt * 1000.0);

        // tempo exchange with peers
        if let Some(bpm) = self.metronome.take_pending_broadcast() {
            self.connection.queue_tempo_broadcast(bpm);
        }
        if let Some(bpm) = self.connection.take_tempo_from_peer() {
            self.metronome.set_tempo_from_peer(bpm);
        }
        self.metronome
            .set_peers(self.connection.num_hosts().saturating_sub(1));
        self.metronome.update();

        // accepted stream requests become peer streamers
        for config in self.streaming.drain_new_streams() {
            let streamer = PeerStreamer::new(config.clone());
            let id = streamer.id();
            self.grabbing.add(Box::new(streamer));
            self.streaming.register(config, id);
        }
        // remote disconnects stop the matching streamer
        for (address, port) in self.streaming.drain_stop_requests() {
            if let Some(id) = self.streaming.match_stop(&address, port) {
                self.grabbing.stop(id);
            }
        }

        // offers answered by peers connect (or fail) network sources
        let offers: Vec<(u64, PeerOffer)> = std::mem::take(&mut *self.peer_offers.lock());
        for (source_id, offer) in offers {
            if let Some(source) = self.session.find_by_id_mut(source_id) {
                match offer {
                    PeerOffer::Accepted {
                        protocol,
                        port,
                        width,
                        height,
                    } => source.connect_network_stream(protocol, port, width, height),
                    PeerOffer::Rejected | PeerOffer::TimedOut => source.set_failed(),
                }
            }
        }

        // input bindings
        self.mapper
            .update(&mut self.session, &self.metronome, dt * 1000.0);
    }

    /// Second phase: render the session and fan the output out.
    pub fn draw_scene(&mut self, dt: f64) {
        self.session.render(dt, &self.metronome);

        let (width, height) = self.session.resolution();
        self.streaming.set_resolution(width, height);
        self.grabbing.grab_frame(self.session.frame());

        for id in self.grabbing.take_finished() {
            self.streaming.unregister_grabber(id);
        }
        for path in self.grabbing.take_finished_outputs() {
            self.settings
                .recent_recordings
                .push(path.to_string_lossy().as_ref());
        }
    }

    /// Third phase: seam for the external GUI; nothing to do headless.
    pub fn render_gui(&mut self) {}

    /// One full tick of the main loop.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let dt = self
            .last_tick
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(1.0 / 30.0)
            // tolerate stalls without jumping media forward unboundedly
            .min(0.5);
        self.last_tick = Some(now);

        self.prepare(dt);
        self.draw_scene(dt);
        self.render_gui();
    }

    // ---- recording & broadcasting controls ---------------------------------

    /// Starts a video recording with the configured profile. Returns the
    /// grabber id.
    pub fn start_recording(&mut self) -> u64 {
        let config = self.settings.record.clone();
        let recorder = VideoRecorder::new(config);
        let id = recorder.id();
        self.grabbing.add(Box::new(recorder));
        id
    }

    /// Save & continue: chains a fresh recorder to replace `current` as soon
    /// as it accepts frames. Returns the new grabber id.
    pub fn save_and_continue(&mut self, current: u64) -> u64 {
        let recorder = VideoRecorder::new(self.settings.record.clone());
        let id = recorder.id();
        self.grabbing.chain(current, Box::new(recorder));
        id
    }

    /// Captures the next output frame to a PNG file.
    pub fn capture_frame(&mut self) -> u64 {
        let recorder = PngRecorder::new(&self.settings.record.directory);
        let id = recorder.id();
        self.grabbing.add(Box::new(recorder));
        id
    }

    pub fn start_broadcast(&mut self) -> u64 {
        let broadcaster = SrtBroadcaster::new(self.settings.broadcast_port);
        let id = broadcaster.id();
        self.grabbing.add(Box::new(broadcaster));
        id
    }

    pub fn start_shm_broadcast(&mut self) -> u64 {
        let broadcaster = ShmBroadcaster::new(self.settings.shm_socket_path.clone());
        let id = broadcaster.id();
        self.grabbing.add(Box::new(broadcaster));
        id
    }

    pub fn start_loopback(&mut self) -> u64 {
        let writer = LoopbackWriter::new(self.settings.loopback_device);
        let id = writer.id();
        self.grabbing.add(Box::new(writer));
        id
    }

    // ---- peer streams (consumer side) --------------------------------------

    /// Adds a network source fed by the named peer and requests its stream.
    pub fn add_peer_source(&mut self, peer_name: &str) -> Result<u64> {
        let peer_index = self
            .connection
            .index_of(peer_name)
            .with_context(|| format!("Unknown peer {}", peer_name))?;
        let peer = self.connection.info(peer_index);
        let source_id = self
            .session
            .add_source(Source::new_network(peer_name, peer_name));
        self.request_peer_stream(source_id, &peer.address, peer.port_stream_request)?;
        Ok(source_id)
    }

    /// Sends `/vimix/request` to a producer and waits for the offer on a
    /// background thread; the answer lands in `prepare` on a later tick.
    fn request_peer_stream(
        &mut self,
        source_id: u64,
        address: &str,
        request_port: u16,
    ) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind reply socket")?;
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .context("Failed to configure reply socket")?;
        let reply_port = socket.local_addr().context("No local address")?.port();
        let client_name = self.connection.info(0).name;

        let request = OscMessage {
            addr: format!("{}{}", OSC_PREFIX, OSC_STREAM_REQUEST),
            args: vec![
                OscType::Int(reply_port as i32),
                OscType::String(client_name),
            ],
        };
        let data = rosc::encoder::encode(&OscPacket::Message(request))
            .context("Failed to encode stream request")?;
        socket
            .send_to(&data, (address, request_port))
            .context("Failed to send stream request")?;

        let offers = self.peer_offers.clone();
        std::thread::Builder::new()
            .name("stream-offer".to_string())
            .spawn(move || {
                let mut buf = [0u8; rosc::decoder::MTU];
                let offer = match socket.recv_from(&mut buf) {
                    Ok((size, _)) => parse_offer(&buf[..size]),
                    Err(_) => PeerOffer::TimedOut,
                };
                offers.lock().push((source_id, offer));
            })
            .context("Failed to spawn offer listener")?;
        Ok(())
    }

    /// Tells a producer we no longer need its stream.
    pub fn disconnect_peer_stream(&self, address: &str, osc_port: u16, stream_port: u16) {
        let message = OscMessage {
            addr: format!("{}{}", OSC_PREFIX, OSC_STREAM_DISCONNECT),
            args: vec![OscType::Int(stream_port as i32)],
        };
        if let Ok(data) = rosc::encoder::encode(&OscPacket::Message(message)) {
            if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
                let _ = socket.send_to(&data, (address, osc_port));
            }
        }
    }

    // ---- session I/O --------------------------------------------------------

    pub fn open_session(&mut self, path: &std::path::Path) -> Result<()> {
        let session = document::read_session(path)?;
        self.session = session;
        self.actions.init(&self.session);
        self.settings
            .recent_sessions
            .push(path.to_string_lossy().as_ref());
        Ok(())
    }

    pub fn save_session(&mut self, path: &std::path::Path) -> Result<()> {
        self.session.render_thumbnail();
        document::write_session(&self.session, path)?;
        self.session.set_filename(path);
        self.settings
            .recent_sessions
            .push(path.to_string_lossy().as_ref());
        Ok(())
    }

    /// Clean shutdown: stop grabbers, terminate threads, persist settings.
    pub fn terminate(&mut self) {
        self.grabbing.stop_all();
        // give encoders a few ticks to flush
        for _ in 0..10 {
            if self.grabbing.is_empty() {
                break;
            }
            self.grabbing.grab_frame(self.session.frame());
            std::thread::sleep(Duration::from_millis(33));
        }
        self.streaming.enable(false);
        self.streaming.terminate();
        self.control.terminate();
        self.connection.terminate();

        self.settings.metronome.tempo = self.metronome.tempo();
        self.settings.metronome.quantum = self.metronome.quantum();
        self.settings.render.fading = self.session.fading();
        if let Err(e) = self.settings.save(&self.settings_path) {
            warn!(error = %format!("{:#}", e), "Failed to save settings on exit");
        }
        info!("Application terminated");
    }
}

fn parse_offer(data: &[u8]) -> PeerOffer {
    let Ok((_, OscPacket::Message(message))) = rosc::decoder::decode_udp(data) else {
        return PeerOffer::TimedOut;
    };
    if message.addr.ends_with("/offer") {
        let int = |i: usize| match message.args.get(i) {
            Some(OscType::Int(v)) => Some(*v),
            _ => None,
        };
        let (Some(port), Some(protocol)) = (int(0), int(1)) else {
            return PeerOffer::Rejected;
        };
        let Some(protocol) = StreamProtocol::from_i32(protocol) else {
            return PeerOffer::Rejected;
        };
        PeerOffer::Accepted {
            protocol,
            port: port.clamp(0, u16::MAX as i32) as u16,
            width: int(2).unwrap_or(0).max(0) as u32,
            height: int(3).unwrap_or(0).max(0) as u32,
        }
    } else {
        PeerOffer::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_app() -> App {
        let dir = std::env::temp_dir().join("mixel_test_settings.toml");
        App::new(Settings::default(), dir)
    }

    #[test]
    fn ticks_keep_source_count_stable() {
        let mut app = test_app();
        app.session
            .add_source(Source::new_pattern("p", 2, (16, 16)));
        for _ in 0..3 {
            app.tick();
        }
        assert_eq!(app.session.len(), 1);
    }

    #[test]
    fn dt_is_clamped_for_slow_ticks() {
        let mut app = test_app();
        app.session
            .add_source(Source::new_pattern("p", 2, (16, 16)));
        app.tick();
        // simulate a very long stall
        app.last_tick = Some(Instant::now() - Duration::from_secs(5));
        app.tick();
        // still alive, no panic, source intact
        assert_eq!(app.session.len(), 1);
    }

    #[test]
    fn recording_controls_register_grabbers() {
        let mut app = test_app();
        let id = app.start_recording();
        assert_eq!(app.grabbing.len(), 1);
        let chained = app.save_and_continue(id);
        assert_ne!(id, chained);
    }
}
