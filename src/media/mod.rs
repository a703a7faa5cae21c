//! Capture and playback adapter
//!
//! Devices are reached through [`MediaBackend`]. Every handle it returns
//! owns its OS resources and releases them on drop, so a worker that exits
//! on any path (stop, error, panic unwind) leaves no device open.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::RgbImage;
use serde::Serialize;

use crate::config::{AudioConfig, VideoConfig};
use crate::error::MediaError;
use crate::model::MediaKind;

#[cfg(feature = "camera")]
pub mod camera;
#[cfg(feature = "audio-device")]
pub mod device;
pub mod synthetic;
pub mod worker;

pub use synthetic::SyntheticBackend;

pub trait AudioSource: Send {
    /// Blocks for at most about one chunk duration. Returns `None` when
    /// nothing was captured in that window.
    fn read_chunk(&mut self) -> Result<Option<Bytes>, MediaError>;
}

pub trait AudioSink: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), MediaError>;

    /// Return the output to silence.
    fn reset(&mut self) {}
}

pub trait VideoSource: Send {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError>;
}

pub trait VideoSink: Send {
    fn show_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError>;

    /// Return the display to a black frame.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// One entry of the informational device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: MediaKind,
    pub direction: Direction,
    pub is_default: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Input => "in ",
            Direction::Output => "out",
        };
        let marker = if self.is_default { " (default)" } else { "" };
        write!(f, "{} {} {}{}", self.kind, direction, self.name, marker)
    }
}

/// Opens capture and playback devices.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_audio_input(&self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, MediaError>;

    fn open_audio_output(&self, config: &AudioConfig) -> Result<Box<dyn AudioSink>, MediaError>;

    fn open_camera(&self, config: &VideoConfig) -> Result<Box<dyn VideoSource>, MediaError>;

    fn open_display(&self, config: &VideoConfig) -> Result<Box<dyn VideoSink>, MediaError>;

    fn list_devices(&self) -> Vec<DeviceInfo>;
}

/// The capture half of one media type.
pub enum Capture {
    Audio(Box<dyn AudioSource>),
    Video(Box<dyn VideoSource>),
}

/// The playback half of one media type.
pub enum Playback {
    Audio(Box<dyn AudioSink>),
    Video(Box<dyn VideoSink>),
}

impl Playback {
    pub fn reset(&mut self) {
        match self {
            Playback::Audio(sink) => sink.reset(),
            Playback::Video(sink) => sink.reset(),
        }
    }
}

/// Open both directions of `kind`. Either both succeed or nothing is held.
pub fn open_devices(
    backend: &dyn MediaBackend,
    kind: MediaKind,
    audio: &AudioConfig,
    video: &VideoConfig,
) -> Result<(Capture, Playback), MediaError> {
    match kind {
        MediaKind::Audio => {
            let source = backend.open_audio_input(audio)?;
            let sink = backend.open_audio_output(audio)?;
            Ok((Capture::Audio(source), Playback::Audio(sink)))
        }
        MediaKind::Video => {
            let source = backend.open_camera(video)?;
            let sink = backend.open_display(video)?;
            Ok((Capture::Video(source), Playback::Video(sink)))
        }
    }
}

/// Backends selectable at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendKind {
    /// Generated tone and test pattern, no hardware needed.
    #[default]
    Synthetic,
    /// OS default audio devices via cpal; cameras via nokhwa when built
    /// with the `camera` feature.
    Device,
}

pub fn open_backend(kind: BackendKind, muted: bool) -> Result<Arc<dyn MediaBackend>, MediaError> {
    match kind {
        BackendKind::Synthetic if muted => Ok(Arc::new(SyntheticBackend::muted())),
        BackendKind::Synthetic => Ok(Arc::new(SyntheticBackend::new())),
        #[cfg(feature = "audio-device")]
        BackendKind::Device => Ok(Arc::new(device::CpalBackend::new(muted))),
        #[cfg(not(feature = "audio-device"))]
        BackendKind::Device => Err(MediaError::BackendUnavailable("device".to_string())),
    }
}
