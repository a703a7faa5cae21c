//! Media frames exchanged between capture, transport and playback.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two independent media streams of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// A timestamped unit of media.
///
/// Video payloads hold one JPEG image, audio payloads one fixed-size chunk
/// of 16-bit little-endian PCM. The timestamp is local bookkeeping and is
/// never put on the wire.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: MediaKind,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl MediaFrame {
    pub fn new(kind: MediaKind, payload: Bytes) -> MediaFrame {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn audio(payload: Bytes) -> MediaFrame {
        Self::new(MediaKind::Audio, payload)
    }

    pub fn video(payload: Bytes) -> MediaFrame {
        Self::new(MediaKind::Video, payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Time elapsed since the frame was captured or received.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}
