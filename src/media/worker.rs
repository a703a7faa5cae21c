//! Blocking capture and playback loops.
//!
//! Both run on dedicated blocking threads and own their device handle, so
//! the device is released when the loop returns.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::jpeg;
use crate::config::SessionConfig;
use crate::error::MediaError;
use crate::media::{Capture, Playback};
use crate::model::{MediaFlags, MediaFrame, MediaKind};

/// How long an idle capture loop waits before checking its flags again.
const IDLE_POLL: Duration = Duration::from_millis(20);

impl Capture {
    pub fn kind(&self) -> MediaKind {
        match self {
            Capture::Audio(_) => MediaKind::Audio,
            Capture::Video(_) => MediaKind::Video,
        }
    }
}

/// Capture, encode and hand frames to `deliver` until cancelled.
///
/// `deliver` returns `false` once the downstream side is gone, which ends
/// the loop normally. Device errors end it with an error.
pub fn capture_loop<F>(
    mut capture: Capture,
    config: &SessionConfig,
    flags: Arc<MediaFlags>,
    token: CancellationToken,
    mut deliver: F,
) -> Result<(), MediaError>
where
    F: FnMut(MediaFrame) -> bool,
{
    let kind = capture.kind();
    let chunk_bytes = config.audio.chunk_bytes();
    let quality = config.video.jpeg_quality;
    let interval = config.video.frame_interval();
    let mut next_deadline = Instant::now();

    info!("{} capture started", kind);

    while !token.is_cancelled() {
        if !flags.sending(kind) {
            thread::sleep(IDLE_POLL);
            next_deadline = Instant::now();
            continue;
        }

        let frame = match &mut capture {
            Capture::Audio(source) => match source.read_chunk()? {
                Some(chunk) if chunk.len() == chunk_bytes => Some(MediaFrame::audio(chunk)),
                Some(chunk) => {
                    warn!(
                        "Dropping audio chunk of {} bytes, expected {}",
                        chunk.len(),
                        chunk_bytes
                    );
                    None
                }
                None => None,
            },
            Capture::Video(source) => match source.read_frame()? {
                Some(image) => match jpeg::encode(&image, quality) {
                    Ok(data) => Some(MediaFrame::video(data)),
                    Err(e) => {
                        warn!("Dropping video frame: {}", e);
                        None
                    }
                },
                None => None,
            },
        };

        if let Some(frame) = frame {
            if !deliver(frame) {
                debug!("{} capture has no consumer left", kind);
                break;
            }
        }

        // Audio is paced by the device itself.
        if kind == MediaKind::Video {
            next_deadline += interval;
            let now = Instant::now();
            if next_deadline > now {
                thread::sleep(next_deadline - now);
            } else {
                next_deadline = now;
            }
        }
    }

    info!("{} capture stopped", kind);
    Ok(())
}

/// Decode and play frames until every sender is dropped, then reset the
/// output to its neutral state.
pub fn playback_loop(
    mut playback: Playback,
    mut rx: mpsc::Receiver<MediaFrame>,
) -> Result<(), MediaError> {
    let result = play_all(&mut playback, &mut rx);
    playback.reset();
    result
}

fn play_all(playback: &mut Playback, rx: &mut mpsc::Receiver<MediaFrame>) -> Result<(), MediaError> {
    while let Some(frame) = rx.blocking_recv() {
        match playback {
            Playback::Audio(sink) => sink.write_chunk(&frame.payload)?,
            Playback::Video(sink) => match jpeg::decode(&frame.payload) {
                Ok(image) => sink.show_frame(&image)?,
                Err(e) => warn!("Dropping undecodable video frame: {}", e),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use image::RgbImage;

    use super::*;
    use crate::media::{AudioSink, VideoSink, VideoSource};

    #[derive(Clone, Default)]
    struct Shown(Arc<Mutex<Vec<(u32, u32)>>>, Arc<Mutex<bool>>);

    impl VideoSink for Shown {
        fn show_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
            self.0.lock().unwrap().push(frame.dimensions());
            Ok(())
        }

        fn reset(&mut self) {
            *self.1.lock().unwrap() = true;
        }
    }

    struct FailingSink;

    impl AudioSink for FailingSink {
        fn write_chunk(&mut self, _chunk: &[u8]) -> Result<(), MediaError> {
            Err(MediaError::StreamFailed {
                kind: MediaKind::Audio,
                reason: "unplugged".to_string(),
            })
        }
    }

    struct Pattern;

    impl VideoSource for Pattern {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
            Ok(Some(RgbImage::new(8, 6)))
        }
    }

    #[test]
    fn playback_drops_corrupt_frames_and_resets() {
        let sink = Shown::default();
        let (tx, rx) = mpsc::channel(4);
        let good = jpeg::encode(&RgbImage::new(10, 4), 70).unwrap();

        tx.blocking_send(MediaFrame::video(Bytes::from_static(b"garbage")))
            .unwrap();
        tx.blocking_send(MediaFrame::video(good)).unwrap();
        drop(tx);

        playback_loop(Playback::Video(Box::new(sink.clone())), rx).unwrap();
        assert_eq!(*sink.0.lock().unwrap(), vec![(10, 4)]);
        assert!(*sink.1.lock().unwrap());
    }

    #[test]
    fn sink_failure_ends_playback() {
        let (tx, rx) = mpsc::channel(1);
        tx.blocking_send(MediaFrame::audio(Bytes::from_static(&[0; 4])))
            .unwrap();
        assert!(playback_loop(Playback::Audio(Box::new(FailingSink)), rx).is_err());
    }

    #[test]
    fn capture_stops_when_consumer_is_gone() {
        let flags = Arc::new(MediaFlags::default());
        flags.set(MediaKind::Video, true);
        let config = SessionConfig::default();
        let mut delivered = 0;

        capture_loop(
            Capture::Video(Box::new(Pattern)),
            &config,
            flags,
            CancellationToken::new(),
            |frame| {
                assert_eq!(frame.kind, MediaKind::Video);
                delivered += 1;
                delivered < 3
            },
        )
        .unwrap();

        assert_eq!(delivered, 3);
    }

    #[test]
    fn cancelled_capture_returns_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        capture_loop(
            Capture::Video(Box::new(Pattern)),
            &SessionConfig::default(),
            Arc::new(MediaFlags::default()),
            token,
            |_| panic!("nothing should be captured"),
        )
        .unwrap();
    }
}
