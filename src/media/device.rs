//! OS audio devices through cpal, cameras through nokhwa.
//!
//! A `cpal::Stream` is not `Send`, so each stream lives on its own device
//! thread. The handle returned to the session owns that thread; dropping the
//! handle stops the stream and joins the thread.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{info, warn};

use crate::config::{AudioConfig, VideoConfig};
use crate::error::MediaError;
use crate::media::synthetic::synthetic_devices;
use crate::media::{
    AudioSink, AudioSource, DeviceInfo, Direction, MediaBackend, SyntheticBackend, VideoSink,
    VideoSource,
};
use crate::model::MediaKind;

const READ_POLL: Duration = Duration::from_millis(100);
const CAPTURE_QUEUE: usize = 64;

fn unavailable(reason: impl ToString) -> MediaError {
    MediaError::DeviceUnavailable {
        kind: MediaKind::Audio,
        reason: reason.to_string(),
    }
}

fn stream_config(config: &AudioConfig) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Default OS audio devices. Video uses a camera when the `camera` feature
/// is enabled and the test pattern otherwise; the display is always null.
pub struct CpalBackend {
    video: SyntheticBackend,
    muted: bool,
}

impl CpalBackend {
    pub fn new(muted: bool) -> Self {
        let video = if muted {
            SyntheticBackend::muted()
        } else {
            SyntheticBackend::new()
        };
        Self { video, muted }
    }
}

impl MediaBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "device"
    }

    fn open_audio_input(&self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, MediaError> {
        if self.muted {
            return self.video.open_audio_input(config);
        }
        Ok(Box::new(CpalAudioSource::open(config)?))
    }

    fn open_audio_output(&self, config: &AudioConfig) -> Result<Box<dyn AudioSink>, MediaError> {
        Ok(Box::new(CpalAudioSink::open(config)?))
    }

    #[cfg(feature = "camera")]
    fn open_camera(&self, config: &VideoConfig) -> Result<Box<dyn VideoSource>, MediaError> {
        if self.muted {
            return self.video.open_camera(config);
        }
        Ok(Box::new(super::camera::NokhwaSource::open(config)?))
    }

    #[cfg(not(feature = "camera"))]
    fn open_camera(&self, config: &VideoConfig) -> Result<Box<dyn VideoSource>, MediaError> {
        self.video.open_camera(config)
    }

    fn open_display(&self, config: &VideoConfig) -> Result<Box<dyn VideoSink>, MediaError> {
        self.video.open_display(config)
    }

    fn list_devices(&self) -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_in = host.default_input_device().and_then(|d| d.name().ok());
        let default_out = host.default_output_device().and_then(|d| d.name().ok());
        let mut devices = Vec::new();

        if let Ok(inputs) = host.input_devices() {
            for device in inputs {
                let Ok(name) = device.name() else { continue };
                devices.push(DeviceInfo {
                    is_default: default_in.as_deref() == Some(name.as_str()),
                    name,
                    kind: MediaKind::Audio,
                    direction: Direction::Input,
                });
            }
        }
        if let Ok(outputs) = host.output_devices() {
            for device in outputs {
                let Ok(name) = device.name() else { continue };
                devices.push(DeviceInfo {
                    is_default: default_out.as_deref() == Some(name.as_str()),
                    name,
                    kind: MediaKind::Audio,
                    direction: Direction::Output,
                });
            }
        }

        #[cfg(feature = "camera")]
        devices.extend(super::camera::list_cameras(VideoConfig::default().camera_index));
        devices.extend(synthetic_devices().into_iter().filter(|d| {
            d.kind == MediaKind::Video && (d.direction == Direction::Output || !cfg!(feature = "camera"))
        }));
        devices
    }
}

/// Keeps a stream alive on its own thread until dropped.
struct DeviceThread {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, MediaError>
    where
        F: FnOnce() -> Result<cpal::Stream, MediaError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(unavailable(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Returns once the owning handle drops the sender.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(unavailable)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(unavailable("device thread exited during setup"))
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Audio device thread panicked");
            }
        }
    }
}

pub struct CpalAudioSource {
    samples: Receiver<Vec<i16>>,
    pending: Vec<i16>,
    chunk_samples: usize,
    _device: DeviceThread,
}

impl CpalAudioSource {
    pub fn open(config: &AudioConfig) -> Result<Self, MediaError> {
        let (tx, rx): (SyncSender<Vec<i16>>, _) = mpsc::sync_channel(CAPTURE_QUEUE);
        let cfg = stream_config(config);

        let device = DeviceThread::spawn("audio-input", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| unavailable("no default input device"))?;
            info!("Opening audio input: {}", device.name().unwrap_or_default());

            device
                .build_input_stream(
                    &cfg,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        // A full queue means the capture loop is behind; drop.
                        let _ = tx.try_send(data.to_vec());
                    },
                    |err| warn!("Audio input stream error: {}", err),
                    None,
                )
                .map_err(unavailable)
        })?;

        Ok(Self {
            samples: rx,
            pending: Vec::new(),
            chunk_samples: config.chunk_size * config.channels as usize,
            _device: device,
        })
    }
}

impl AudioSource for CpalAudioSource {
    fn read_chunk(&mut self) -> Result<Option<Bytes>, MediaError> {
        while self.pending.len() < self.chunk_samples {
            match self.samples.recv_timeout(READ_POLL) {
                Ok(samples) => self.pending.extend_from_slice(&samples),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MediaError::StreamFailed {
                        kind: MediaKind::Audio,
                        reason: "input stream closed".to_string(),
                    })
                }
            }
        }

        let mut buf = BytesMut::with_capacity(self.chunk_samples * 2);
        for sample in self.pending.drain(..self.chunk_samples) {
            buf.put_i16_le(sample);
        }
        Ok(Some(buf.freeze()))
    }
}

pub struct CpalAudioSink {
    queue: Arc<Mutex<VecDeque<i16>>>,
    max_queued: usize,
    _device: DeviceThread,
}

impl CpalAudioSink {
    pub fn open(config: &AudioConfig) -> Result<Self, MediaError> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let shared = queue.clone();
        let cfg = stream_config(config);

        let device = DeviceThread::spawn("audio-output", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| unavailable("no default output device"))?;
            info!("Opening audio output: {}", device.name().unwrap_or_default());

            device
                .build_output_stream(
                    &cfg,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| match shared.lock() {
                        Ok(mut queue) => {
                            for out in data.iter_mut() {
                                *out = queue.pop_front().unwrap_or(0);
                            }
                        }
                        Err(_) => data.fill(0),
                    },
                    |err| warn!("Audio output stream error: {}", err),
                    None,
                )
                .map_err(unavailable)
        })?;

        Ok(Self {
            queue,
            // Half a second of buffered audio at most.
            max_queued: (config.sample_rate as usize * config.channels as usize) / 2,
            _device: device,
        })
    }
}

impl AudioSink for CpalAudioSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        let mut queue = self.queue.lock().map_err(|_| MediaError::StreamFailed {
            kind: MediaKind::Audio,
            reason: "output queue poisoned".to_string(),
        })?;

        queue.extend(
            chunk
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        let excess = queue.len().saturating_sub(self.max_queued);
        queue.drain(..excess);
        Ok(())
    }

    fn reset(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}
