//! Session lifecycle state and the per-media gate flags.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::MediaKind;

/// Which end of the call this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// One outbound connection per media type.
    Client,
    /// One listener per media type, relaying between all accepted peers.
    Server,
}

/// `Idle → Starting → Active → Stopping → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Gate flags polled by every capture and relay loop.
#[derive(Debug, Default)]
pub struct MediaFlags {
    audio_sending: AtomicBool,
    audio_receiving: AtomicBool,
    video_sending: AtomicBool,
    video_receiving: AtomicBool,
}

/// Point-in-time copy of [`MediaFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagsSnapshot {
    pub audio_sending: bool,
    pub audio_receiving: bool,
    pub video_sending: bool,
    pub video_receiving: bool,
}

impl FlagsSnapshot {
    pub fn any(&self) -> bool {
        self.audio_sending || self.audio_receiving || self.video_sending || self.video_receiving
    }
}

impl MediaFlags {
    fn pair(&self, kind: MediaKind) -> (&AtomicBool, &AtomicBool) {
        match kind {
            MediaKind::Audio => (&self.audio_sending, &self.audio_receiving),
            MediaKind::Video => (&self.video_sending, &self.video_receiving),
        }
    }

    /// Sets both the sending and receiving flag of `kind`.
    pub fn set(&self, kind: MediaKind, on: bool) {
        let (send, recv) = self.pair(kind);
        send.store(on, Ordering::SeqCst);
        recv.store(on, Ordering::SeqCst);
    }

    pub fn sending(&self, kind: MediaKind) -> bool {
        self.pair(kind).0.load(Ordering::SeqCst)
    }

    pub fn receiving(&self, kind: MediaKind) -> bool {
        self.pair(kind).1.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        for kind in MediaKind::ALL {
            self.set(kind, false);
        }
    }

    pub fn snapshot(&self) -> FlagsSnapshot {
        FlagsSnapshot {
            audio_sending: self.sending(MediaKind::Audio),
            audio_receiving: self.receiving(MediaKind::Audio),
            video_sending: self.sending(MediaKind::Video),
            video_receiving: self.receiving(MediaKind::Video),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent_per_kind() {
        let flags = MediaFlags::default();
        flags.set(MediaKind::Video, true);

        let snap = flags.snapshot();
        assert!(snap.video_sending && snap.video_receiving);
        assert!(!snap.audio_sending && !snap.audio_receiving);

        flags.clear();
        assert!(!flags.snapshot().any());
    }
}
