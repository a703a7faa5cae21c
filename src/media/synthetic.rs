//! Hardware-free media: a sine tone, a moving colour-bar pattern and sinks
//! that only count what they are given.

use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use image::{Rgb, RgbImage};
use tracing::{debug, trace};

use crate::config::{AudioConfig, VideoConfig};
use crate::error::MediaError;
use crate::media::{
    AudioSink, AudioSource, DeviceInfo, Direction, MediaBackend, VideoSink, VideoSource,
};
use crate::model::MediaKind;

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.2 * i16::MAX as f32;

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    muted: bool,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self { muted: false }
    }

    /// Sources that never produce anything; playback still works.
    pub fn muted() -> Self {
        Self { muted: true }
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_audio_input(&self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, MediaError> {
        if self.muted {
            return Ok(Box::new(MutedAudioSource {
                chunk_duration: config.chunk_duration(),
            }));
        }
        Ok(Box::new(ToneSource::new(config)))
    }

    fn open_audio_output(&self, _config: &AudioConfig) -> Result<Box<dyn AudioSink>, MediaError> {
        Ok(Box::new(CountingAudioSink::default()))
    }

    fn open_camera(&self, config: &VideoConfig) -> Result<Box<dyn VideoSource>, MediaError> {
        if self.muted {
            return Ok(Box::new(MutedVideoSource));
        }
        Ok(Box::new(TestPatternSource::new(config.width, config.height)))
    }

    fn open_display(&self, _config: &VideoConfig) -> Result<Box<dyn VideoSink>, MediaError> {
        Ok(Box::new(CountingVideoSink::default()))
    }

    fn list_devices(&self) -> Vec<DeviceInfo> {
        synthetic_devices()
    }
}

pub(crate) fn synthetic_devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo {
            name: format!("Synthetic tone ({TONE_HZ} Hz)"),
            kind: MediaKind::Audio,
            direction: Direction::Input,
            is_default: true,
        },
        DeviceInfo {
            name: "Null speaker".to_string(),
            kind: MediaKind::Audio,
            direction: Direction::Output,
            is_default: true,
        },
        DeviceInfo {
            name: "Test pattern (synthetic)".to_string(),
            kind: MediaKind::Video,
            direction: Direction::Input,
            is_default: true,
        },
        DeviceInfo {
            name: "Null display".to_string(),
            kind: MediaKind::Video,
            direction: Direction::Output,
            is_default: true,
        },
    ]
}

/// 16-bit mono/multichannel sine, paced to real time.
pub struct ToneSource {
    sample_rate: f32,
    channels: usize,
    chunk_size: usize,
    chunk_duration: Duration,
    phase: f32,
    next_deadline: Option<Instant>,
}

impl ToneSource {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate as f32,
            channels: config.channels as usize,
            chunk_size: config.chunk_size,
            chunk_duration: config.chunk_duration(),
            phase: 0.0,
            next_deadline: None,
        }
    }

    fn pace(&mut self) {
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        // Resync after a stall instead of bursting to catch up.
        self.next_deadline = Some(deadline.max(now) + self.chunk_duration);
    }
}

impl AudioSource for ToneSource {
    fn read_chunk(&mut self) -> Result<Option<Bytes>, MediaError> {
        self.pace();

        let step = TAU * TONE_HZ / self.sample_rate;
        let mut buf = BytesMut::with_capacity(self.chunk_size * self.channels * 2);
        for _ in 0..self.chunk_size {
            let sample = (self.phase.sin() * TONE_AMPLITUDE) as i16;
            for _ in 0..self.channels {
                buf.put_i16_le(sample);
            }
            self.phase = (self.phase + step) % TAU;
        }
        Ok(Some(buf.freeze()))
    }
}

struct MutedAudioSource {
    chunk_duration: Duration,
}

impl AudioSource for MutedAudioSource {
    fn read_chunk(&mut self) -> Result<Option<Bytes>, MediaError> {
        thread::sleep(self.chunk_duration);
        Ok(None)
    }
}

/// Colour bars that scroll one column per frame.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    tick: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl VideoSource for TestPatternSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        let bar_width = (self.width / BARS.len() as u32).max(1);
        let tick = self.tick;
        let frame = RgbImage::from_fn(self.width, self.height, |x, _| {
            let bar = ((x + tick) / bar_width) as usize % BARS.len();
            Rgb(BARS[bar])
        });
        self.tick = self.tick.wrapping_add(1);
        Ok(Some(frame))
    }
}

struct MutedVideoSource;

impl VideoSource for MutedVideoSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        Ok(None)
    }
}

#[derive(Debug, Default)]
pub struct CountingAudioSink {
    pub chunks: u64,
    pub bytes: u64,
}

impl AudioSink for CountingAudioSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        self.chunks += 1;
        self.bytes += chunk.len() as u64;
        trace!("Played audio chunk #{} ({} bytes)", self.chunks, chunk.len());
        Ok(())
    }

    fn reset(&mut self) {
        debug!("Audio output reset to silence after {} chunks", self.chunks);
    }
}

#[derive(Debug, Default)]
pub struct CountingVideoSink {
    pub frames: u64,
}

impl VideoSink for CountingVideoSink {
    fn show_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        self.frames += 1;
        trace!(
            "Showing video frame #{} ({}x{})",
            self.frames,
            frame.width(),
            frame.height()
        );
        Ok(())
    }

    fn reset(&mut self) {
        debug!("Display reset to black after {} frames", self.frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_chunks_have_the_configured_size() {
        let config = AudioConfig {
            sample_rate: 48_000,
            channels: 1,
            chunk_size: 64,
        };
        let mut source = ToneSource::new(&config);
        for _ in 0..3 {
            let chunk = source.read_chunk().unwrap().unwrap();
            assert_eq!(chunk.len(), config.chunk_bytes());
        }
    }

    #[test]
    fn pattern_scrolls_between_frames() {
        let mut source = TestPatternSource::new(64, 8);
        let first = source.read_frame().unwrap().unwrap();
        let second = source.read_frame().unwrap().unwrap();
        assert_eq!(first.dimensions(), (64, 8));
        assert_ne!(first, second);
    }

    #[test]
    fn muted_backend_produces_nothing() {
        let backend = SyntheticBackend::muted();
        let mut camera = backend.open_camera(&VideoConfig::default()).unwrap();
        assert!(camera.read_frame().unwrap().is_none());
    }

    #[test]
    fn lists_one_device_per_direction() {
        let devices = SyntheticBackend::new().list_devices();
        assert_eq!(devices.len(), 4);
        assert!(devices.iter().all(|d| d.is_default));
        let camera = devices
            .iter()
            .find(|d| d.kind == MediaKind::Video && d.direction == Direction::Input)
            .unwrap();
        assert!(camera.name.contains("synthetic"));
    }
}
