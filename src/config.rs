use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::MediaKind;

pub const DEFAULT_AUDIO_PORT: u16 = 12345;
pub const DEFAULT_VIDEO_PORT: u16 = 12346;

/// Bytes per 16-bit PCM sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Audio capture/playback parameters. Both ends must agree on them since
/// the chunk size is never sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    #[serde(alias = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per chunk.
    #[serde(alias = "chunkSize")]
    pub chunk_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
            chunk_size: 1024,
        }
    }
}

impl AudioConfig {
    /// Size of one chunk on the wire.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_size * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Real-time duration of one chunk.
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    #[serde(alias = "cameraIndex")]
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    #[serde(alias = "targetFPS")]
    pub target_fps: u32,
    /// 0-100, fixed for the lifetime of a session.
    #[serde(alias = "jpegQuality")]
    pub jpeg_quality: u8,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 640,
            height: 480,
            target_fps: 30,
            jpeg_quality: 80,
        }
    }
}

impl VideoConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.target_fps.max(1) as u64)
    }
}

/// Everything one call needs to know up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote host in client role, bind address in server role.
    pub host: String,
    #[serde(alias = "audioPort")]
    pub audio_port: u16,
    #[serde(alias = "videoPort")]
    pub video_port: u16,
    #[serde(alias = "enableAudio")]
    pub enable_audio: bool,
    #[serde(alias = "enableVideo")]
    pub enable_video: bool,
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    /// Frames buffered per peer before frames are dropped for that peer.
    #[serde(alias = "peerQueueDepth")]
    pub peer_queue_depth: usize,
    #[serde(alias = "maxVideoFrameBytes")]
    pub max_video_frame_bytes: usize,
    pub audio: AudioConfig,
    pub video: VideoConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            audio_port: DEFAULT_AUDIO_PORT,
            video_port: DEFAULT_VIDEO_PORT,
            enable_audio: true,
            enable_video: true,
            connect_timeout_ms: 5_000,
            peer_queue_depth: 16,
            max_video_frame_bytes: 16 * 1024 * 1024,
            audio: AudioConfig::default(),
            video: VideoConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Loads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config file {}", path.display()))?;
        let config: SessionConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn port(&self, kind: MediaKind) -> u16 {
        match kind {
            MediaKind::Audio => self.audio_port,
            MediaKind::Video => self.video_port,
        }
    }

    pub fn enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.enable_audio,
            MediaKind::Video => self.enable_video,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };

        if self.audio.sample_rate == 0 || self.audio.channels == 0 || self.audio.chunk_size == 0 {
            return invalid("audio sample_rate, channels and chunk_size must be non-zero");
        }
        if self.video.width == 0 || self.video.height == 0 || self.video.target_fps == 0 {
            return invalid("video width, height and target_fps must be non-zero");
        }
        if self.video.jpeg_quality > 100 {
            return invalid("jpeg_quality must be within 0-100");
        }
        if self.peer_queue_depth == 0 {
            return invalid("peer_queue_depth must be non-zero");
        }
        if self.max_video_frame_bytes == 0 {
            return invalid("max_video_frame_bytes must be non-zero");
        }
        if self.audio_port != 0 && self.audio_port == self.video_port {
            return invalid("audio and video need separate ports");
        }
        if !self.enable_audio && !self.enable_video {
            return invalid("at least one of audio or video must be enabled");
        }
        Ok(())
    }
}
