//! Process-wide configuration and recent-file histories
//!
//! Settings load from a TOML file with per-field defaults, so a partial or
//! missing file always yields a usable configuration. Save and load are
//! serialized behind a lock; reads elsewhere take no lock.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::control::inputs::DEFAULT_AXIS_DEAD_ZONE;
use crate::defines::{MAX_RECENT_HISTORY, OSC_PORT_RECV_DEFAULT, OSC_PORT_SEND_DEFAULT};
use crate::grab::recorder::RecorderConfig;

static IO_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Bounded, deduplicated FIFO of recently used paths
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct History {
    pub filenames: VecDeque<String>,
    pub load_at_start: bool,
    pub save_on_exit: bool,
}

impl History {
    /// Pushes a path to the front, deduplicating and bounding the list.
    pub fn push(&mut self, filename: &str) {
        if filename.is_empty() {
            return;
        }
        self.filenames.retain(|f| f != filename);
        self.filenames.push_front(filename.to_string());
        self.filenames.truncate(MAX_RECENT_HISTORY);
    }

    pub fn remove(&mut self, filename: &str) {
        self.filenames.retain(|f| f != filename);
    }

    pub fn front(&self) -> Option<&String> {
        self.filenames.front()
    }

    /// Drops entries whose path no longer exists.
    pub fn validate(&mut self) {
        self.filenames.retain(|f| Path::new(f).exists());
    }
}

/// Output rendering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub fading: f32,
    pub disabled: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            width: 1280,
            height: 720,
            fading: 0.0,
            disabled: false,
        }
    }
}

/// Metronome configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MetronomeConfig {
    pub enabled: bool,
    pub tempo: f64,
    pub quantum: f64,
    pub start_stop_sync: bool,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        MetronomeConfig {
            enabled: true,
            tempo: 120.0,
            quantum: 4.0,
            start_stop_sync: true,
        }
    }
}

/// OSC control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OscConfig {
    pub port_receive: u16,
    pub port_send: u16,
    /// address rewrites applied before dispatch
    pub translation: Vec<(String, String)>,
}

impl Default for OscConfig {
    fn default() -> Self {
        OscConfig {
            port_receive: OSC_PORT_RECV_DEFAULT,
            port_send: OSC_PORT_SEND_DEFAULT,
            translation: Vec::new(),
        }
    }
}

/// Input mapping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InputConfig {
    pub disabled: bool,
    pub axis_dead_zone: f32,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            disabled: false,
            axis_dead_zone: DEFAULT_AXIS_DEAD_ZONE,
        }
    }
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    pub render: RenderConfig,
    pub record: RecorderConfig,
    pub metronome: MetronomeConfig,
    pub osc: OscConfig,
    pub inputs: InputConfig,

    /// Accept incoming peer stream requests
    pub accept_connections: bool,
    /// Offer H264 instead of JPEG to remote peers
    pub stream_low_bandwidth: bool,
    /// Loopback device index for the virtual camera
    pub loopback_device: u32,
    /// SRT broadcast listener port
    pub broadcast_port: u16,
    /// Shared memory socket path
    pub shm_socket_path: String,

    pub recent_sessions: History,
    pub recent_folders: History,
    pub recent_imports: History,
    pub recent_import_folders: History,
    pub recent_recordings: History,

    /// Session file loaded on startup when set
    pub last_session: Option<String>,

    /// Instance id assigned by the connection manager, not persisted
    #[serde(skip)]
    pub instance_id: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            render: RenderConfig::default(),
            record: RecorderConfig::default(),
            metronome: MetronomeConfig::default(),
            osc: OscConfig::default(),
            inputs: InputConfig::default(),
            accept_connections: false,
            stream_low_bandwidth: false,
            loopback_device: 10,
            broadcast_port: crate::grab::broadcast::SrtBroadcaster::DEFAULT_PORT,
            shm_socket_path: "/tmp/mixel_shm".to_string(),
            recent_sessions: History::default(),
            recent_folders: History::default(),
            recent_imports: History::default(),
            recent_import_folders: History::default(),
            recent_recordings: History::default(),
            last_session: None,
            instance_id: 0,
        }
    }
}

impl Settings {
    /// Default location of the settings file
    pub fn default_path() -> PathBuf {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .unwrap_or_else(std::env::temp_dir);
        base.join("mixel").join("settings.toml")
    }

    /// Loads settings; a missing file yields defaults, a malformed one is
    /// an error.
    pub fn load(path: &Path) -> Result<Self> {
        let _guard = IO_LOCK.lock();
        if !path.exists() {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings {}", path.display()))?;
        info!(path = %path.display(), "Settings loaded");
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let _guard = IO_LOCK.lock();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings {}", path.display()))?;
        info!(path = %path.display(), "Settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_push_deduplicates_and_bounds() {
        let mut history = History::default();
        history.push("a.mix");
        history.push("b.mix");
        history.push("a.mix");
        assert_eq!(history.front().map(String::as_str), Some("a.mix"));
        assert_eq!(history.filenames.len(), 2);

        for i in 0..2 * MAX_RECENT_HISTORY {
            history.push(&format!("file{}.mix", i));
        }
        assert_eq!(history.filenames.len(), MAX_RECENT_HISTORY);
    }

    #[test]
    fn history_validate_drops_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("real.mix");
        std::fs::write(&existing, b"x").unwrap();
        let mut history = History::default();
        history.push("/nonexistent/ghost.mix");
        history.push(existing.to_str().unwrap());
        history.validate();
        assert_eq!(history.filenames.len(), 1);
        assert_eq!(history.front().unwrap(), existing.to_str().unwrap());
    }

    #[test]
    fn settings_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut settings = Settings::default();
        settings.render.width = 1920;
        settings.render.height = 1080;
        settings.metronome.tempo = 93.5;
        settings.accept_connections = true;
        settings.recent_sessions.push("show.mix");
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.render.width, 1920);
        assert_eq!(loaded.metronome.tempo, 93.5);
        assert!(loaded.accept_connections);
        assert_eq!(loaded.recent_sessions.front().map(String::as_str), Some("show.mix"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.toml")).unwrap();
        assert_eq!(settings.osc.port_receive, OSC_PORT_RECV_DEFAULT);
        assert_eq!(settings.osc.port_send, OSC_PORT_SEND_DEFAULT);
        assert!(!settings.accept_connections);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[render]\nwidth = 640\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.render.width, 640);
        assert_eq!(settings.render.height, 720);
        assert_eq!(settings.metronome.quantum, 4.0);
    }
}
