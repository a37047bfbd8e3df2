//! External OSC command surface
//!
//! A receiver thread runs a blocking `recv` loop on the instance's OSC port
//! and enqueues parsed messages on a concurrent queue; the render thread
//! drains the queue at the start of `prepare` and dispatches each command.
//! Dispatch is a pure match on the normalized address; a user-editable
//! translation table and per-source aliases are consulted before dispatch.
//! Parse errors are logged and the message is dropped.

pub mod inputs;

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, info, warn};

use crate::action::ActionManager;
use crate::control::inputs::{InputMapper, INPUT_MULTITOUCH_COUNT, INPUT_MULTITOUCH_FIRST};
use crate::defines::{APP_VERSION, OSC_PREFIX, TERMINATE_TIMEOUT_SECS};
use crate::frame::BlendMode;
use crate::metronome::Metronome;
use crate::net::Streaming;
use crate::session::{document, Session};
use crate::settings::Settings;
use crate::source::callback::{CallbackKind, CallbackState, SourceCallback};
use crate::source::core::{InvertMode, View};
use crate::source::Source;

/// One received OSC message, queued for the render thread
struct IncomingCommand {
    address: String,
    args: Vec<OscType>,
    sender: SocketAddr,
}

struct ReceiverThread {
    running: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
}

struct LiveOsc {
    target: u64,
    callback: SourceCallback,
    /// released after the first application (single OSC message semantics)
    one_shot: bool,
}

/// Everything a dispatched command may touch
pub struct ControlContext<'a> {
    pub session: &'a mut Session,
    pub metronome: &'a mut Metronome,
    pub actions: &'a mut ActionManager,
    pub mapper: &'a mut InputMapper,
    pub settings: &'a mut Settings,
    pub streaming: &'a mut Streaming,
}

/// OSC command surface of one instance
pub struct Control {
    port: u16,
    queue: mpsc::Receiver<IncomingCommand>,
    queue_tx: mpsc::Sender<IncomingCommand>,
    receiver: Option<ReceiverThread>,
    send_socket: Option<UdpSocket>,
    /// address → address rewrites consulted before dispatch
    translation: HashMap<String, String>,
    /// alias → source name
    aliases: HashMap<String, String>,
    live: Vec<LiveOsc>,
    /// endpoints subscribed to log forwarding
    log_targets: Vec<SocketAddr>,
    /// output fading ramp: (target, per-second rate)
    fade_ramp: Option<(f32, f32)>,
}

impl Control {
    /// Creates the surface without binding; [`init`](Control::init) starts
    /// the receiver.
    pub fn new(port: u16) -> Self {
        let (queue_tx, queue) = mpsc::channel();
        Control {
            port,
            queue,
            queue_tx,
            receiver: None,
            send_socket: None,
            translation: HashMap::new(),
            aliases: HashMap::new(),
            live: Vec::new(),
            log_targets: Vec::new(),
            fade_ramp: None,
        }
    }

    /// Binds the OSC port and spawns the blocking receive loop.
    pub fn init(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .with_context(|| format!("Failed to bind OSC port {}", self.port))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("Failed to set OSC socket timeout")?;

        self.send_socket = Some(UdpSocket::bind("0.0.0.0:0").context("Failed to bind OSC sender")?);

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = mpsc::channel();
        let queue = self.queue_tx.clone();
        let thread_running = running.clone();

        std::thread::Builder::new()
            .name("osc-receiver".to_string())
            .spawn(move || {
                let mut buf = [0u8; rosc::decoder::MTU];
                while thread_running.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((size, sender)) => {
                            match rosc::decoder::decode_udp(&buf[..size]) {
                                Ok((_, packet)) => enqueue_packet(&queue, packet, sender),
                                Err(e) => {
                                    // protocol parse error: log and drop
                                    warn!(%sender, error = %e, "Dropped malformed OSC packet");
                                }
                            }
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!(error = %e, "OSC receive failed");
                        }
                    }
                }
                let _ = done_tx.send(());
            })
            .context("Failed to spawn OSC receiver")?;

        info!(port = self.port, "OSC control listening");
        self.receiver = Some(ReceiverThread { running, done: done_rx });
        Ok(())
    }

    /// Stops the receiver, waiting a bounded time; on timeout the thread is
    /// logged as failing to terminate and leaked.
    pub fn terminate(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.running.store(false, Ordering::Release);
            if receiver
                .done
                .recv_timeout(Duration::from_secs(TERMINATE_TIMEOUT_SECS))
                .is_err()
            {
                warn!("Failed to terminate OSC receiver");
            }
        }
    }

    pub fn set_translation(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.translation.insert(from.into(), to.into());
    }

    pub fn set_alias(&mut self, alias: impl Into<String>, source_name: impl Into<String>) {
        self.aliases.insert(alias.into(), source_name.into());
    }

    /// Drains and dispatches queued commands, then advances live callbacks
    /// and the output fading ramp. Called at the start of every tick.
    pub fn update(&mut self, ctx: &mut ControlContext<'_>, dt_ms: f64) {
        loop {
            let command = match self.queue.try_recv() {
                Ok(c) => c,
                Err(_) => break,
            };
            self.dispatch(command, ctx);
        }

        // output fading ramp
        if let Some((target, rate)) = self.fade_ramp {
            let current = ctx.session.fading();
            let step = rate * (dt_ms / 1000.0) as f32;
            let next = if target > current {
                (current + step).min(target)
            } else {
                (current - step).max(target)
            };
            ctx.session.set_fading(next);
            if (next - target).abs() < 1e-4 {
                self.fade_ramp = None;
            }
        }

        // live source callbacks
        let mut i = 0;
        while i < self.live.len() {
            let entry = &mut self.live[i];
            let state = match ctx.session.find_by_id_mut(entry.target) {
                Some(source) => {
                    let s = entry.callback.apply(source, ctx.metronome, dt_ms);
                    if entry.one_shot {
                        entry.callback.release();
                    }
                    s
                }
                None => CallbackState::Done,
            };
            if state == CallbackState::Done {
                self.live.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ---- dispatch ----------------------------------------------------------

    fn dispatch(&mut self, command: IncomingCommand, ctx: &mut ControlContext<'_>) {
        let Some(stripped) = command.address.strip_prefix(OSC_PREFIX) else {
            debug!(address = %command.address, "Ignored message outside prefix");
            return;
        };
        // user-defined address translation
        let address = self
            .translation
            .get(stripped)
            .cloned()
            .unwrap_or_else(|| stripped.to_string());

        let mut parts = address.splitn(3, '/').skip(1);
        let head = parts.next().unwrap_or_default().to_string();
        let rest = parts.next().unwrap_or_default().to_string();
        let args = command.args;

        match head.as_str() {
            "output" => self.output_attribute(&rest, &args, ctx),
            "session" => self.session_attribute(&rest, &args, ctx),
            "all" => {
                let targets = ctx.session.source_ids();
                self.source_attribute(&targets, &rest, &args, ctx);
            }
            "selection" => {
                let targets = ctx.session.selection().to_vec();
                self.source_attribute(&targets, &rest, &args, ctx);
            }
            "current" => {
                if let Some(id) = ctx.session.current_source_id() {
                    self.source_attribute(&[id], &rest, &args, ctx);
                }
            }
            "next" => {
                ctx.session.cycle_current(true);
            }
            "previous" => {
                ctx.session.cycle_current(false);
            }
            "metronome" => self.metronome_attribute(&rest, &args, ctx),
            "multitouch" => self.multitouch_input(&rest, &args, ctx),
            "peertopeer" => self.stream_attribute(&rest, &args, ctx),
            "sync" => self.send_status(command.sender, ctx),
            "info" => match rest.as_str() {
                "log" | "notify" => {
                    if !self.log_targets.contains(&command.sender) {
                        self.log_targets.push(command.sender);
                        info!(target = %command.sender, "Log forwarding enabled");
                    }
                }
                _ => debug!(attribute = %rest, "Unknown info attribute"),
            },
            other => {
                // "#<index>", "batch#<n>", source name or alias
                if let Some(index) = other.strip_prefix('#').and_then(|s| s.parse::<usize>().ok()) {
                    let ids = ctx.session.source_ids();
                    if let Some(&id) = ids.get(index) {
                        self.source_attribute(&[id], &rest, &args, ctx);
                    } else {
                        debug!(index, "Source index out of range");
                    }
                } else if let Some(n) = other
                    .strip_prefix("batch#")
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    let targets = ctx.session.batch_source_ids(n);
                    self.source_attribute(&targets, &rest, &args, ctx);
                } else {
                    let name = self.aliases.get(other).cloned().unwrap_or_else(|| other.to_string());
                    if let Some(id) = ctx.session.find_by_name(&name).map(Source::id) {
                        self.source_attribute(&[id], &rest, &args, ctx);
                    } else {
                        debug!(target = %other, "Unknown OSC target");
                    }
                }
            }
        }
    }

    fn output_attribute(&mut self, attribute: &str, args: &[OscType], ctx: &mut ControlContext<'_>) {
        match attribute {
            "enable" => ctx.session.set_fading(0.0),
            "disable" => ctx.session.set_fading(1.0),
            "fading" => {
                if let Some(v) = arg_f32(args, 0) {
                    ctx.session.set_fading(v);
                }
            }
            "fade-in" => {
                let duration = arg_f32(args, 0).unwrap_or(1.0).max(0.01);
                self.fade_ramp = Some((0.0, 1.0 / duration));
            }
            "fade-out" => {
                let duration = arg_f32(args, 0).unwrap_or(1.0).max(0.01);
                self.fade_ramp = Some((1.0, 1.0 / duration));
            }
            _ => debug!(attribute, "Unknown output attribute"),
        }
    }

    fn session_attribute(&mut self, attribute: &str, args: &[OscType], ctx: &mut ControlContext<'_>) {
        match attribute {
            "version" => {
                // reply to the registered log targets
                let message = OscMessage {
                    addr: format!("{}/session/version", OSC_PREFIX),
                    args: vec![OscType::String(APP_VERSION.to_string())],
                };
                let targets = self.log_targets.clone();
                for target in targets {
                    self.send_to(target, message.clone());
                }
            }
            "open" => {
                if let Some(path) = arg_string(args, 0) {
                    match document::read_session(std::path::Path::new(&path)) {
                        Ok(session) => {
                            *ctx.session = session;
                            ctx.actions.init(ctx.session);
                            ctx.settings.recent_sessions.push(&path);
                            info!(%path, "Session opened");
                        }
                        Err(e) => warn!(%path, error = %format!("{:#}", e), "Failed to open session"),
                    }
                }
            }
            "save" => {
                let path = arg_string(args, 0)
                    .map(std::path::PathBuf::from)
                    .or_else(|| ctx.session.filename().map(|p| p.to_path_buf()));
                match path {
                    Some(path) => match document::write_session(ctx.session, &path) {
                        Ok(()) => {
                            ctx.session.set_filename(&path);
                            ctx.settings.recent_sessions.push(path.to_string_lossy().as_ref());
                            info!(path = %path.display(), "Session saved");
                        }
                        Err(e) => warn!(error = %format!("{:#}", e), "Failed to save session"),
                    },
                    None => warn!("Session save requested but no filename known"),
                }
            }
            "close" => {
                *ctx.session = Session::new(
                    ctx.session.resolution().0,
                    ctx.session.resolution().1,
                );
                ctx.actions.init(ctx.session);
                info!("Session closed");
            }
            _ => debug!(attribute, "Unknown session attribute"),
        }
    }

    fn metronome_attribute(&mut self, attribute: &str, args: &[OscType], ctx: &mut ControlContext<'_>) {
        match attribute {
            "tempo" => {
                if let Some(bpm) = arg_f32(args, 0) {
                    ctx.metronome.set_tempo(bpm as f64);
                }
            }
            "quantum" => {
                if let Some(q) = arg_f32(args, 0) {
                    ctx.metronome.set_quantum(q as f64);
                }
            }
            "sync" => {
                if let Some(on) = arg_bool(args, 0) {
                    ctx.metronome.set_start_stop_sync(on);
                }
            }
            "restart" => ctx.metronome.restart(),
            _ => debug!(attribute, "Unknown metronome attribute"),
        }
    }

    fn multitouch_input(&mut self, rest: &str, args: &[OscType], ctx: &mut ControlContext<'_>) {
        let Some(index) = rest.parse::<u32>().ok().filter(|&n| n < INPUT_MULTITOUCH_COUNT) else {
            debug!(input = %rest, "Invalid multitouch index");
            return;
        };
        let pressure = arg_f32(args, 0).unwrap_or(0.0);
        ctx.mapper
            .set_input(INPUT_MULTITOUCH_FIRST + index, pressure > 0.0, pressure);
    }

    fn stream_attribute(&mut self, attribute: &str, args: &[OscType], ctx: &mut ControlContext<'_>) {
        match attribute {
            "enable" => {
                let on = arg_bool(args, 0).unwrap_or(true);
                ctx.streaming.enable(on);
                ctx.settings.accept_connections = on;
            }
            "disable" => {
                ctx.streaming.enable(false);
                ctx.settings.accept_connections = false;
            }
            _ => debug!(attribute, "Unknown peer-to-peer attribute"),
        }
    }

    /// Replies a bundle with one message per registered attribute.
    fn send_status(&mut self, sender: SocketAddr, ctx: &mut ControlContext<'_>) {
        let mut messages = vec![
            OscMessage {
                addr: format!("{}/output/fading", OSC_PREFIX),
                args: vec![OscType::Float(ctx.session.fading())],
            },
        ];
        for (index, source) in ctx.session.iter().enumerate() {
            messages.push(OscMessage {
                addr: format!("{}/#{}/name", OSC_PREFIX, index),
                args: vec![OscType::String(source.name().to_string())],
            });
            messages.push(OscMessage {
                addr: format!("{}/#{}/alpha", OSC_PREFIX, index),
                args: vec![OscType::Float(source.alpha())],
            });
            messages.push(OscMessage {
                addr: format!("{}/#{}/play", OSC_PREFIX, index),
                args: vec![OscType::Bool(source.playing())],
            });
            messages.push(OscMessage {
                addr: format!("{}/#{}/depth", OSC_PREFIX, index),
                args: vec![OscType::Float(source.depth())],
            });
        }
        for message in messages {
            self.send_to(sender, message);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn source_attribute(
        &mut self,
        targets: &[u64],
        attribute: &str,
        args: &[OscType],
        ctx: &mut ControlContext<'_>,
    ) {
        if targets.is_empty() {
            return;
        }
        // attribute with its own direct semantics first
        match attribute {
            "rename" | "name" => {
                if let (Some(name), [id]) = (arg_string(args, 0), targets) {
                    ctx.session.rename_source(*id, &name);
                }
                return;
            }
            "alias" => {
                if let (Some(alias), [id]) = (arg_string(args, 0), targets) {
                    if let Some(source) = ctx.session.find_by_id(*id) {
                        let name = source.name().to_string();
                        self.set_alias(alias, name);
                    }
                }
                return;
            }
            "lock" => {
                let locked = arg_bool(args, 0).unwrap_or(true);
                for id in targets {
                    if let Some(source) = ctx.session.find_by_id_mut(*id) {
                        source.set_locked(locked);
                    }
                }
                return;
            }
            "reset" => {
                for id in targets {
                    if let Some(source) = ctx.session.find_by_id_mut(*id) {
                        source.set_core(Default::default());
                    }
                }
                return;
            }
            "reload" => {
                for id in targets {
                    if let Some(player) = ctx
                        .session
                        .find_by_id_mut(*id)
                        .and_then(Source::media_player_mut)
                    {
                        player.reload();
                    }
                }
                return;
            }
            "replay" => {
                for id in targets {
                    if let Some(source) = ctx.session.find_by_id_mut(*id) {
                        source.replay(ctx.metronome);
                    }
                }
                return;
            }
            "posterize" => {
                if let Some(levels) = arg_i32(args, 0) {
                    for id in targets {
                        if let Some(source) = ctx.session.find_by_id_mut(*id) {
                            source.core_mut().image_processing.posterize = levels.max(0) as u32;
                        }
                    }
                }
                return;
            }
            "correction" => {
                let on = arg_bool(args, 0).unwrap_or(true);
                for id in targets {
                    if let Some(source) = ctx.session.find_by_id_mut(*id) {
                        source.core_mut().image_processing.enabled = on;
                    }
                }
                return;
            }
            "size" | "angle" | "texture_position" | "texture_size" | "texture_angle" => {
                let view = if attribute.starts_with("texture") {
                    View::Texture
                } else {
                    View::Geometry
                };
                let a = arg_f32(args, 0);
                let b = arg_f32(args, 1);
                for id in targets {
                    if let Some(source) = ctx.session.find_by_id_mut(*id) {
                        let placement = source.placement_mut(view);
                        match attribute {
                            "size" | "texture_size" => {
                                if let (Some(sx), Some(sy)) = (a, b) {
                                    placement.scale = (sx, sy);
                                }
                            }
                            "angle" | "texture_angle" => {
                                if let Some(angle) = a {
                                    placement.rotation = angle;
                                }
                            }
                            _ => {
                                if let (Some(x), Some(y)) = (a, b) {
                                    placement.translation = (x, y);
                                }
                            }
                        }
                    }
                }
                return;
            }
            "blending" => {
                if let Some(mode) = arg_i32(args, 0) {
                    let blending = match mode {
                        1 => BlendMode::Additive,
                        2 => BlendMode::Multiply,
                        3 => BlendMode::Screen,
                        4 => BlendMode::Subtract,
                        _ => BlendMode::Normal,
                    };
                    for id in targets {
                        if let Some(source) = ctx.session.find_by_id_mut(*id) {
                            source.core_mut().blending = blending;
                        }
                    }
                }
                return;
            }
            _ => {}
        }

        let Some(kind) = self.attribute_to_callback(attribute, args) else {
            debug!(attribute, "Unknown or unsupported source attribute");
            return;
        };
        for id in targets {
            // locked sources ignore callbacks
            if ctx.session.find_by_id(*id).map(Source::locked).unwrap_or(true) {
                continue;
            }
            self.live.push(LiveOsc {
                target: *id,
                callback: SourceCallback::new(kind.clone()),
                one_shot: true,
            });
        }
    }

    /// Maps a per-source OSC attribute onto a callback kind.
    fn attribute_to_callback(&self, attribute: &str, args: &[OscType]) -> Option<CallbackKind> {
        let f0 = arg_f32(args, 0);
        Some(match attribute {
            "play" => CallbackKind::Play {
                on: arg_bool(args, 0).unwrap_or(true),
            },
            "pause" => CallbackKind::Play { on: false },
            "alpha" => CallbackKind::SetAlpha { value: f0? },
            "transparency" => CallbackKind::SetAlpha { value: 1.0 - f0? },
            "loom" => CallbackKind::Loom { speed: f0? },
            "depth" => CallbackKind::SetDepth { value: f0? },
            "grab" => CallbackKind::Grab {
                dx: f0?,
                dy: arg_f32(args, 1).unwrap_or(0.0),
            },
            "resize" => CallbackKind::Resize {
                dsx: f0?,
                dsy: arg_f32(args, 1).unwrap_or(0.0),
            },
            "turn" => CallbackKind::Turn { velocity: f0? },
            "position" => CallbackKind::SetGeometry {
                view: View::Geometry,
                placement: crate::frame::Placement {
                    translation: (f0?, arg_f32(args, 1).unwrap_or(0.0)),
                    ..Default::default()
                },
            },
            "seek" => CallbackKind::Seek {
                target_ns: (f0?.max(0.0) as f64 * 1e9) as u64,
            },
            "ffwd" => CallbackKind::PlayFastForward {
                step_ms: f0.map(|v| (v * 1000.0) as u64).unwrap_or(1000),
            },
            "speed" => CallbackKind::PlaySpeed { factor: f0? as f64 },
            "brightness" => CallbackKind::SetBrightness { value: f0? },
            "contrast" => CallbackKind::SetContrast { value: f0? },
            "saturation" => CallbackKind::SetSaturation { value: f0? },
            "hue" => CallbackKind::SetHue { value: f0? },
            "threshold" => CallbackKind::SetThreshold { value: f0? },
            "gamma" => CallbackKind::SetGamma { value: f0? },
            "invert" => CallbackKind::SetInvert {
                mode: match arg_i32(args, 0).unwrap_or(1) {
                    0 => InvertMode::None,
                    2 => InvertMode::Luminance,
                    _ => InvertMode::Color,
                },
            },
            _ => return None,
        })
    }

    fn send_to(&self, target: SocketAddr, message: OscMessage) {
        let Some(socket) = &self.send_socket else { return };
        match rosc::encoder::encode(&OscPacket::Message(message)) {
            Ok(data) => {
                if let Err(e) = socket.send_to(&data, target) {
                    debug!(%target, error = %e, "Failed to send OSC reply");
                }
            }
            Err(e) => debug!(error = %e, "Failed to encode OSC reply"),
        }
    }

    /// Test/local entry: feed a message as if it had been received.
    pub fn inject(&mut self, address: &str, args: Vec<OscType>, sender: SocketAddr) {
        let _ = self.queue_tx.send(IncomingCommand {
            address: address.to_string(),
            args,
            sender,
        });
    }
}

fn enqueue_packet(queue: &mpsc::Sender<IncomingCommand>, packet: OscPacket, sender: SocketAddr) {
    match packet {
        OscPacket::Message(message) => {
            let _ = queue.send(IncomingCommand {
                address: message.addr,
                args: message.args,
                sender,
            });
        }
        OscPacket::Bundle(bundle) => {
            for packet in bundle.content {
                enqueue_packet(queue, packet, sender);
            }
        }
    }
}

fn arg_f32(args: &[OscType], index: usize) -> Option<f32> {
    match args.get(index)? {
        OscType::Float(v) => Some(*v),
        OscType::Double(v) => Some(*v as f32),
        OscType::Int(v) => Some(*v as f32),
        OscType::Long(v) => Some(*v as f32),
        OscType::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn arg_i32(args: &[OscType], index: usize) -> Option<i32> {
    match args.get(index)? {
        OscType::Int(v) => Some(*v),
        OscType::Long(v) => Some(*v as i32),
        OscType::Float(v) => Some(*v as i32),
        _ => None,
    }
}

fn arg_bool(args: &[OscType], index: usize) -> Option<bool> {
    match args.get(index)? {
        OscType::Bool(v) => Some(*v),
        OscType::Int(v) => Some(*v != 0),
        OscType::Float(v) => Some(*v > 0.5),
        _ => None,
    }
}

fn arg_string(args: &[OscType], index: usize) -> Option<String> {
    match args.get(index)? {
        OscType::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> (
        Session,
        Metronome,
        ActionManager,
        InputMapper,
        Settings,
        Streaming,
    ) {
        let mut session = Session::new(32, 32);
        session.add_source(Source::new_pattern("bars", 3, (16, 16)));
        (
            session,
            Metronome::default(),
            ActionManager::default(),
            InputMapper::default(),
            Settings::default(),
            Streaming::new(0),
        )
    }

    fn sender() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    macro_rules! ctx {
        ($parts:expr) => {
            ControlContext {
                session: &mut $parts.0,
                metronome: &mut $parts.1,
                actions: &mut $parts.2,
                mapper: &mut $parts.3,
                settings: &mut $parts.4,
                streaming: &mut $parts.5,
            }
        };
    }

    #[test]
    fn alpha_command_reaches_source() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        control.inject("/vimix/#0/alpha", vec![OscType::Float(0.25)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!((parts.0.iter().next().unwrap().alpha() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn unknown_prefix_is_dropped() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        control.inject("/other/#0/alpha", vec![OscType::Float(0.0)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!((parts.0.iter().next().unwrap().alpha() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn output_fading_commands() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        control.inject("/vimix/output/disable", vec![], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert_eq!(parts.0.fading(), 1.0);
        control.inject("/vimix/output/fading", vec![OscType::Float(0.3)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!((parts.0.fading() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn fade_in_ramps_over_time() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        parts.0.set_fading(1.0);
        control.inject("/vimix/output/fade-in", vec![OscType::Float(1.0)], sender());
        control.update(&mut ctx!(parts), 500.0);
        let half = parts.0.fading();
        assert!(half < 1.0 && half > 0.2, "mid-ramp {}", half);
        control.update(&mut ctx!(parts), 1000.0);
        assert_eq!(parts.0.fading(), 0.0);
    }

    #[test]
    fn name_targeting_and_alias() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        control.inject("/vimix/bars/alpha", vec![OscType::Float(0.5)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!((parts.0.find_by_name("bars").unwrap().alpha() - 0.5).abs() < 1e-6);

        control.set_alias("deck", "bars");
        control.inject("/vimix/deck/alpha", vec![OscType::Float(0.1)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!((parts.0.find_by_name("bars").unwrap().alpha() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn translation_rewrites_address() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        control.set_translation("/shortcut", "/#0/alpha");
        control.inject("/vimix/shortcut", vec![OscType::Float(0.66)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!((parts.0.iter().next().unwrap().alpha() - 0.66).abs() < 1e-6);
    }

    #[test]
    fn metronome_tempo_command() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        control.inject("/vimix/metronome/tempo", vec![OscType::Float(90.0)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert_eq!(parts.1.tempo(), 90.0);
    }

    #[test]
    fn multitouch_feeds_input_mapper() {
        let mut parts = test_context();
        let mut control = Control::new(0);
        control.inject("/vimix/multitouch/2", vec![OscType::Float(0.8)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!(parts.3.input_active(INPUT_MULTITOUCH_FIRST + 2));
    }

    #[test]
    fn locked_source_ignores_callbacks() {
        let mut parts = test_context();
        let id = parts.0.iter().next().unwrap().id();
        parts.0.find_by_id_mut(id).unwrap().set_locked(true);
        let mut control = Control::new(0);
        control.inject("/vimix/#0/alpha", vec![OscType::Float(0.0)], sender());
        control.update(&mut ctx!(parts), 16.0);
        assert!((parts.0.find_by_id(id).unwrap().alpha() - 1.0).abs() < 1e-6);
    }
}
