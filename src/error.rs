//! Error types shared by the media, codec and session layers.

use thiserror::Error;

use crate::model::MediaKind;

/// Failures of the capture/playback adapter.
///
/// These are fatal to the media type that raised them and never to the
/// other one.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("{kind} device unavailable: {reason}")]
    DeviceUnavailable { kind: MediaKind, reason: String },

    #[error("{kind} stream failed: {reason}")]
    StreamFailed { kind: MediaKind, reason: String },

    #[error("backend '{0}' is not compiled into this build")]
    BackendUnavailable(String),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JPEG encode failed: {0}")]
    Encode(String),

    #[error("JPEG decode failed: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connect to {addr} timed out after {ms}ms")]
    ConnectTimeout { addr: String, ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {reason}")]
    Invalid { reason: String },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyRunning,

    #[error("no media type could be started: {reasons}")]
    NothingStarted { reasons: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
