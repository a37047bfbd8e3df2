//! Sources: named, updatable producers of one RGBA texture per frame
//!
//! A source is one variant of [`SourceKind`] plus the shared state every
//! variant carries: identity, depth, alpha, mode, placement groups and image
//! processing. The owning [`Session`](crate::session::Session) creates and
//! destroys sources; everything else refers to them by id.

pub mod callback;
pub mod core;
pub mod imageproc;
pub mod pattern;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::defines::{unique_id, MAX_DEPTH};
use crate::frame::{FrameBuffer, Image, Placement};
use crate::media::player::{MediaPlayer, PlayerState};
use crate::media::stream::GstStream;
use crate::metronome::Metronome;
use crate::net::toolkit::{self, StreamProtocol};
use crate::source::core::{SourceCore, View};
use crate::source::pattern::Pattern;

/// Display mode of a source in the mixing interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SourceMode {
    #[default]
    Visible,
    Selected,
    Current,
}

/// Capture device configuration, expressed as the source half of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub pipeline: String,
}

impl DeviceConfig {
    /// A V4L2 camera device
    pub fn v4l2(device: &str) -> Self {
        DeviceConfig {
            pipeline: format!("v4l2src device={}", device),
        }
    }
}

/// Connection state of a peer-fed network source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NetworkState {
    #[default]
    Disconnected,
    Requested,
    Connected,
}

/// The variant tree of source kinds
pub enum SourceKind {
    /// Decoded video stream driven by a [`MediaPlayer`]
    Media { player: MediaPlayer },
    /// Still image loaded from disk
    Image {
        path: PathBuf,
        loaded: bool,
    },
    /// Procedural pattern
    Pattern { pattern: Pattern, resolution: (u32, u32) },
    /// The session's own output, one frame behind
    Render,
    /// Clone of another source, resolved by id through the session
    Clone { origin_id: u64, origin_name: String },
    /// Capture device
    Device { config: DeviceConfig, stream: Option<GstStream> },
    /// Stream received from a LAN peer
    Network {
        peer_name: String,
        state: NetworkState,
        stream: Option<GstStream>,
    },
    /// Another session file rendered as a source
    SessionFile {
        path: PathBuf,
        child: Option<Box<crate::session::Session>>,
    },
    /// A group of sources bundled into a nested session
    SessionGroup { child: Box<crate::session::Session> },
    /// Image sequence played at a fixed framerate
    MultiFile {
        paths: Vec<PathBuf>,
        fps: f64,
        index: usize,
        accumulator: f64,
        playing: bool,
    },
    /// Arbitrary pipeline description
    GenericStream { description: String, stream: Option<GstStream> },
    /// SRT listener/caller receiver
    SrtReceiver { uri: String, stream: Option<GstStream> },
}

impl SourceKind {
    /// Short label of the variant, used in logs and the OSC surface
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Media { .. } => "media",
            SourceKind::Image { .. } => "image",
            SourceKind::Pattern { .. } => "pattern",
            SourceKind::Render => "render",
            SourceKind::Clone { .. } => "clone",
            SourceKind::Device { .. } => "device",
            SourceKind::Network { .. } => "network",
            SourceKind::SessionFile { .. } => "session file",
            SourceKind::SessionGroup { .. } => "session group",
            SourceKind::MultiFile { .. } => "sequence",
            SourceKind::GenericStream { .. } => "stream",
            SourceKind::SrtReceiver { .. } => "srt",
        }
    }
}

/// Double-dispatch hook used for (de)serialization; not on the runtime path
pub trait SourceVisitor {
    fn visit_source(&mut self, source: &Source);
    fn visit_media(&mut self, _player: &MediaPlayer) {}
    fn visit_session(&mut self, _session: &crate::session::Session) {}
}

/// A named, updatable producer of one RGBA texture per frame
pub struct Source {
    id: u64,
    name: String,
    core: SourceCore,
    mode: SourceMode,
    active: bool,
    locked: bool,
    failed: bool,
    kind: SourceKind,
    texture: Option<Image>,
    frame: FrameBuffer,
}

impl Source {
    fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Source {
            id: unique_id(),
            name: name.into(),
            core: SourceCore::default(),
            mode: SourceMode::Visible,
            active: true,
            locked: false,
            failed: false,
            kind,
            texture: None,
            frame: FrameBuffer::new(64, 64, true),
        }
    }

    pub fn new_media(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Source::new(name, SourceKind::Media { player: MediaPlayer::open(uri) })
    }

    pub fn new_image(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Source::new(
            name,
            SourceKind::Image {
                path: path.into(),
                loaded: false,
            },
        )
    }

    pub fn new_pattern(name: impl Into<String>, pattern_id: u32, resolution: (u32, u32)) -> Self {
        Source::new(
            name,
            SourceKind::Pattern {
                pattern: Pattern::from_id(pattern_id),
                resolution,
            },
        )
    }

    pub fn new_render(name: impl Into<String>) -> Self {
        Source::new(name, SourceKind::Render)
    }

    pub fn new_clone(name: impl Into<String>, origin_id: u64, origin_name: impl Into<String>) -> Self {
        Source::new(
            name,
            SourceKind::Clone {
                origin_id,
                origin_name: origin_name.into(),
            },
        )
    }

    pub fn new_device(name: impl Into<String>, config: DeviceConfig) -> Self {
        Source::new(name, SourceKind::Device { config, stream: None })
    }

    pub fn new_network(name: impl Into<String>, peer_name: impl Into<String>) -> Self {
        Source::new(
            name,
            SourceKind::Network {
                peer_name: peer_name.into(),
                state: NetworkState::Disconnected,
                stream: None,
            },
        )
    }

    pub fn new_session_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Source::new(
            name,
            SourceKind::SessionFile {
                path: path.into(),
                child: None,
            },
        )
    }

    pub fn new_session_group(name: impl Into<String>, child: crate::session::Session) -> Self {
        Source::new(name, SourceKind::SessionGroup { child: Box::new(child) })
    }

    pub fn new_multifile(name: impl Into<String>, paths: Vec<PathBuf>, fps: f64) -> Self {
        Source::new(
            name,
            SourceKind::MultiFile {
                paths,
                fps: fps.max(1.0),
                index: 0,
                accumulator: 0.0,
                playing: true,
            },
        )
    }

    pub fn new_generic_stream(name: impl Into<String>, description: impl Into<String>) -> Self {
        Source::new(
            name,
            SourceKind::GenericStream {
                description: description.into(),
                stream: None,
            },
        )
    }

    pub fn new_srt_receiver(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Source::new(name, SourceKind::SrtReceiver { uri: uri.into(), stream: None })
    }

    // ---- identity & direct mutations --------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Restores a persisted id; only used when rebuilding a source from a
    /// saved state so that selections and clones keep resolving.
    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut SourceKind {
        &mut self.kind
    }

    pub fn core(&self) -> &SourceCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut SourceCore {
        &mut self.core
    }

    /// Replaces the interpolable state wholesale (snapshot restore)
    pub fn set_core(&mut self, core: SourceCore) {
        self.core = core;
    }

    pub fn alpha(&self) -> f32 {
        self.core.alpha
    }

    pub fn set_alpha(&mut self, alpha: f32) {
        self.core.alpha = alpha.clamp(-1.0, 1.0);
    }

    pub fn depth(&self) -> f32 {
        self.core.depth
    }

    pub fn set_depth(&mut self, depth: f32) {
        self.core.depth = depth.clamp(0.0, MAX_DEPTH);
    }

    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SourceMode) {
        self.mode = mode;
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, on: bool) {
        self.active = on;
        if let SourceKind::Media { player } = &mut self.kind {
            player.set_enabled(on);
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Marks the source failed for the rest of its lifetime.
    pub fn set_failed(&mut self) {
        if !self.failed {
            warn!(source = %self.name, kind = self.kind.label(), "Source failed");
            self.failed = true;
            self.texture = Some(failure_texture());
        }
    }

    pub fn placement(&self, view: View) -> &Placement {
        self.core.placements.get(view)
    }

    pub fn placement_mut(&mut self, view: View) -> &mut Placement {
        self.core.placements.get_mut(view)
    }

    /// True iff the variant supports play/pause semantics
    pub fn playable(&self) -> bool {
        matches!(
            self.kind,
            SourceKind::Media { .. }
                | SourceKind::MultiFile { .. }
                | SourceKind::GenericStream { .. }
                | SourceKind::SrtReceiver { .. }
                | SourceKind::Device { .. }
                | SourceKind::Network { .. }
        )
    }

    pub fn playing(&self) -> bool {
        match &self.kind {
            SourceKind::Media { player } => player.is_playing(),
            SourceKind::MultiFile { playing, .. } => *playing,
            SourceKind::Device { stream, .. }
            | SourceKind::Network { stream, .. }
            | SourceKind::GenericStream { stream, .. }
            | SourceKind::SrtReceiver { stream, .. } => stream.is_some(),
            _ => false,
        }
    }

    pub fn play(&mut self, on: bool, metronome: &Metronome) {
        match &mut self.kind {
            SourceKind::Media { player } => player.play(on, metronome),
            SourceKind::MultiFile { playing, .. } => *playing = on,
            SourceKind::Device { stream, .. }
            | SourceKind::Network { stream, .. }
            | SourceKind::GenericStream { stream, .. }
            | SourceKind::SrtReceiver { stream, .. } => {
                if let Some(s) = stream {
                    s.play(on);
                }
            }
            _ => {}
        }
    }

    pub fn replay(&mut self, metronome: &Metronome) {
        match &mut self.kind {
            SourceKind::Media { player } => player.replay(metronome),
            SourceKind::MultiFile { index, accumulator, playing, .. } => {
                *index = 0;
                *accumulator = 0.0;
                *playing = true;
            }
            _ => {}
        }
    }

    /// The media player of a media source
    pub fn media_player(&self) -> Option<&MediaPlayer> {
        match &self.kind {
            SourceKind::Media { player } => Some(player),
            _ => None,
        }
    }

    pub fn media_player_mut(&mut self) -> Option<&mut MediaPlayer> {
        match &mut self.kind {
            SourceKind::Media { player } => Some(player),
            _ => None,
        }
    }

    /// Whether the image-processing chain applies to this variant
    pub fn image_processing_enabled(&self) -> bool {
        self.core.image_processing.enabled && !matches!(self.kind, SourceKind::Render)
    }

    // ---- per-frame contract ------------------------------------------------

    /// Current texture; the failure texture when the source failed, a
    /// placeholder before the first frame arrived.
    pub fn texture(&self) -> Image {
        self.texture.clone().unwrap_or_else(placeholder_texture)
    }

    /// Injects a texture produced elsewhere (render and clone variants).
    pub fn set_texture_from(&mut self, image: &Image) {
        self.texture = Some(image.clone());
    }

    /// The source's private framebuffer, holding its visual contribution
    /// after [`render`](Source::render).
    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }

    /// Updates the variant and refreshes the texture. Must be called exactly
    /// once per frame, before [`render`](Source::render).
    pub fn update(&mut self, dt: f64, metronome: &Metronome) {
        if self.failed {
            return;
        }
        let mut failure: Option<String> = None;

        match &mut self.kind {
            SourceKind::Media { player } => {
                player.update(dt, metronome);
                if player.failed() {
                    failure = Some(player.error().unwrap_or("decoder failure").to_string());
                } else if let Some(frame) = player.texture() {
                    self.texture = Some(frame.clone());
                }
            }
            SourceKind::Image { path, loaded } => {
                if !*loaded {
                    match load_image(path) {
                        Ok(img) => {
                            self.texture = Some(img);
                            *loaded = true;
                        }
                        Err(e) => failure = Some(e),
                    }
                }
            }
            SourceKind::Pattern { pattern, resolution } => {
                pattern.advance(dt);
                self.texture = Some(pattern.generate(resolution.0, resolution.1));
            }
            SourceKind::Render => {
                // texture injected by the session after composition
            }
            SourceKind::Clone { .. } => {
                // texture injected by the session from the origin
            }
            SourceKind::Device { config, stream } => {
                if stream.is_none() {
                    match GstStream::open(&config.pipeline) {
                        Ok(s) => *stream = Some(s),
                        Err(e) => failure = Some(format!("{:#}", e)),
                    }
                }
                Self::pump_stream(stream, &mut self.texture, &mut failure);
            }
            SourceKind::Network { stream, .. } => {
                Self::pump_stream(stream, &mut self.texture, &mut failure);
            }
            SourceKind::SessionFile { path, child } => {
                if child.is_none() {
                    match crate::session::document::read_session(path) {
                        Ok(session) => *child = Some(Box::new(session)),
                        Err(e) => failure = Some(format!("{:#}", e)),
                    }
                }
                if let Some(session) = child {
                    session.render(dt, metronome);
                    self.texture = Some(session.frame().image().clone());
                }
            }
            SourceKind::SessionGroup { child } => {
                child.render(dt, metronome);
                self.texture = Some(child.frame().image().clone());
            }
            SourceKind::MultiFile { paths, fps, index, accumulator, playing } => {
                if paths.is_empty() {
                    failure = Some("empty image sequence".to_string());
                } else {
                    if *playing {
                        *accumulator += dt;
                        let period = 1.0 / *fps;
                        while *accumulator >= period {
                            *accumulator -= period;
                            *index = (*index + 1) % paths.len();
                            self.texture = None;
                        }
                    }
                    if self.texture.is_none() {
                        match load_image(&paths[*index]) {
                            Ok(img) => self.texture = Some(img),
                            Err(e) => failure = Some(e),
                        }
                    }
                }
            }
            SourceKind::GenericStream { description, stream } => {
                if stream.is_none() {
                    match GstStream::open(description) {
                        Ok(s) => *stream = Some(s),
                        Err(e) => failure = Some(format!("{:#}", e)),
                    }
                }
                Self::pump_stream(stream, &mut self.texture, &mut failure);
            }
            SourceKind::SrtReceiver { uri, stream } => {
                if stream.is_none() {
                    let description = format!("srtsrc uri={} ! tsdemux ! decodebin", uri);
                    match GstStream::open(&description) {
                        Ok(s) => *stream = Some(s),
                        Err(e) => failure = Some(format!("{:#}", e)),
                    }
                }
                Self::pump_stream(stream, &mut self.texture, &mut failure);
            }
        }

        if let Some(message) = failure {
            debug!(source = %self.name, error = %message, "Source update failed");
            self.set_failed();
        }
    }

    fn pump_stream(stream: &mut Option<GstStream>, texture: &mut Option<Image>, failure: &mut Option<String>) {
        if let Some(s) = stream {
            s.poll_bus();
            if s.failed() {
                *failure = Some(s.error().unwrap_or_else(|| "stream error".to_string()));
                *stream = None;
            } else if let Some(frame) = s.take_frame() {
                *texture = Some(frame.image);
            }
        }
    }

    /// Draws the texture through the image-processing chain into the private
    /// framebuffer. Post-condition: `frame()` holds this source's visual
    /// contribution for the current tick.
    pub fn render(&mut self) {
        let texture = self.texture();
        let processed = if self.image_processing_enabled() {
            imageproc::apply(&texture, &self.core.image_processing)
        } else {
            texture
        };
        if processed.width != self.frame.width() || processed.height != self.frame.height() {
            self.frame.resize(processed.width, processed.height);
        }
        *self.frame.image_mut() = processed;
    }

    /// Attaches an accepted stream offer to a network source.
    pub fn connect_network_stream(
        &mut self,
        protocol: StreamProtocol,
        port: u16,
        width: u32,
        height: u32,
    ) {
        let peer = match &self.kind {
            SourceKind::Network { peer_name, .. } => peer_name.clone(),
            _ => return,
        };
        let description = toolkit::receive_pipeline(protocol, port, width, height);
        match GstStream::open(&description) {
            Ok(s) => {
                debug!(peer = %peer, ?protocol, port, "Network source connected");
                if let SourceKind::Network { state, stream, .. } = &mut self.kind {
                    *stream = Some(s);
                    *state = NetworkState::Connected;
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %format!("{:#}", e), "Network source failed to connect");
                self.set_failed();
            }
        }
    }

    /// Double dispatch for (de)serialization.
    pub fn accept(&self, visitor: &mut dyn SourceVisitor) {
        visitor.visit_source(self);
        match &self.kind {
            SourceKind::Media { player } => visitor.visit_media(player),
            SourceKind::SessionFile { child: Some(session), .. } => visitor.visit_session(session),
            SourceKind::SessionGroup { child } => visitor.visit_session(child),
            _ => {}
        }
    }

    /// State label shown by consumers
    pub fn state_label(&self) -> &'static str {
        if self.failed {
            return "Ended";
        }
        match &self.kind {
            SourceKind::Media { player } => match player.state() {
                PlayerState::Initializing => "Initializing",
                PlayerState::Ready => "Ready",
                PlayerState::Playing => "Playing",
                PlayerState::Paused => "Paused",
                PlayerState::Ended => "Ended",
            },
            _ => {
                if self.active {
                    "Active"
                } else {
                    "Inactive"
                }
            }
        }
    }
}

fn load_image(path: &PathBuf) -> Result<Image, String> {
    let decoded = image::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let rgba = decoded.to_rgba8();
    Ok(Image {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    })
}

/// Mid-gray frame shown before a source produced its first texture
fn placeholder_texture() -> Image {
    Image::filled(64, 64, [40, 40, 40, 255])
}

/// Clearly distinguished placeholder for failed sources
fn failure_texture() -> Image {
    let mut img = Image::new(64, 64);
    for y in 0..64u32 {
        for x in 0..64u32 {
            let on_cross = x.abs_diff(y) < 4 || (63 - x).abs_diff(y) < 4;
            let rgba = if on_cross { [200, 30, 30, 255] } else { [20, 20, 20, 255] };
            img.set_pixel(x, y, rgba);
        }
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_source_produces_texture_each_frame() {
        let metronome = Metronome::default();
        let mut s = Source::new_pattern("pat", 2, (32, 32));
        s.update(0.033, &metronome);
        s.render();
        assert_eq!(s.frame().width(), 32);
        assert!(!s.failed());
    }

    #[test]
    fn playable_matches_variants() {
        assert!(!Source::new_pattern("p", 0, (8, 8)).playable());
        assert!(!Source::new_render("r").playable());
        assert!(Source::new_multifile("m", vec![], 10.0).playable());
        assert!(Source::new_network("n", "peer").playable());
        assert!(Source::new_generic_stream("g", "videotestsrc").playable());
    }

    #[test]
    fn failed_source_never_retries() {
        let metronome = Metronome::default();
        let mut s = Source::new_multifile("m", vec![], 10.0);
        s.update(0.033, &metronome);
        assert!(s.failed());
        assert_eq!(s.state_label(), "Ended");
        let failure = s.texture();
        s.update(0.033, &metronome);
        assert_eq!(s.texture(), failure, "failure texture must be stable");
    }

    #[test]
    fn missing_image_fails_the_source() {
        let metronome = Metronome::default();
        let mut s = Source::new_image("img", "/nonexistent/path.png");
        s.update(0.033, &metronome);
        assert!(s.failed());
    }

    #[test]
    fn depth_and_alpha_are_clamped() {
        let mut s = Source::new_pattern("p", 0, (8, 8));
        s.set_depth(99.0);
        assert_eq!(s.depth(), MAX_DEPTH);
        s.set_alpha(-7.0);
        assert_eq!(s.alpha(), -1.0);
    }

    #[test]
    fn render_applies_image_processing_when_enabled() {
        let metronome = Metronome::default();
        let mut s = Source::new_pattern("p", 1, (8, 8)); // white
        s.update(0.033, &metronome);
        s.core_mut().image_processing.enabled = true;
        s.core_mut().image_processing.invert = crate::source::core::InvertMode::Color;
        s.render();
        assert_eq!(s.frame().image().pixel(4, 4)[0], 0);
    }
}
