//! Application configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty file (or no
//! file at all) yields a working setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub liveness: LivenessConfig,
    pub rtc: RtcConfig,
}

/// HTTP / signaling server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to
    pub bind_address: String,
    /// First port to try; the server probes upward from here
    pub base_port: u16,
    /// How many consecutive ports to probe before giving up
    pub port_attempts: u16,
    /// Directory with the listener page and client script
    pub static_dir: Option<PathBuf>,
    /// Accept `mix` messages from listeners, not just from the local API
    pub accept_remote_mix: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            base_port: DEFAULT_HTTP_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            static_dir: None,
            accept_remote_mix: true,
        }
    }
}

/// Audio engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_size_ms: u32,
    /// Ring buffer capacity in samples
    pub ring_capacity: usize,
    /// Capture device id (`input:<name>`); default input device when unset
    pub mic_device: Option<String>,
    /// Raw s16le mono PCM fed as the player bus
    pub player_pcm: Option<PathBuf>,
    /// Restart the player file at EOF
    pub player_loop: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size_ms: DEFAULT_FRAME_SIZE_MS,
            ring_capacity: DEFAULT_RING_CAPACITY,
            mic_device: None,
            player_pcm: None,
            player_loop: true,
        }
    }
}

impl AudioConfig {
    /// Samples in one mono frame
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(self.frame_size_ms))
    }
}

/// Listener liveness polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub poll_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Peer transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// STUN/TURN URLs. Empty is fine on a LAN.
    pub ice_servers: Vec<String>,
    /// Opus target bitrate in bits per second
    pub opus_bitrate: u32,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            opus_bitrate: 64_000,
        }
    }
}

impl AppConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the platform config dir when `path` is `None`.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be > 0".into()));
        }
        let frame = self.audio.frame_samples();
        if frame == 0 {
            return Err(Error::Config("audio.frame_size_ms yields an empty frame".into()));
        }
        if self.audio.ring_capacity < frame * 2 {
            return Err(Error::Config(format!(
                "audio.ring_capacity must hold at least two frames ({} samples)",
                frame * 2
            )));
        }
        if self.liveness.poll_interval_ms == 0 {
            return Err(Error::Config("liveness.poll_interval_ms must be > 0".into()));
        }
        if self.server.port_attempts == 0 {
            return Err(Error::Config("server.port_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// `<config dir>/mixcast/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "mixcast", "mixcast")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.frame_samples(), 480);
        assert_eq!(config.liveness.poll_interval_ms, 200);
        assert_eq!(config.server.base_port, 8080);
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            base_port = 9000
            accept_remote_mix = false

            [rtc]
            ice_servers = []
            "#,
        )
        .unwrap();
        assert_eq!(config.server.base_port, 9000);
        assert!(!config.server.accept_remote_mix);
        assert!(config.rtc.ice_servers.is_empty());
        assert_eq!(config.audio.ring_capacity, 96_000);
    }

    #[test]
    fn test_rejects_tiny_ring() {
        let err = AppConfig::from_toml("[audio]\nring_capacity = 500\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        assert!(AppConfig::from_toml("[liveness]\npoll_interval_ms = 0\n").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = AppConfig::load(Some(Path::new("/nonexistent/mixcast.toml"))).unwrap();
        assert_eq!(config.audio.sample_rate, DEFAULT_SAMPLE_RATE);
    }
}
