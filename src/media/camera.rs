//! Cameras through nokhwa.
//!
//! The camera handle stays on a capture thread that decodes frames to RGB
//! and hands them over a small queue. Dropping the source stops the stream
//! and joins the thread, which releases the device.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
};
use nokhwa::Camera;
use tracing::{info, warn};

use crate::config::VideoConfig;
use crate::error::MediaError;
use crate::media::{DeviceInfo, Direction, VideoSource};
use crate::model::MediaKind;

const READ_POLL: Duration = Duration::from_millis(100);
const FRAME_QUEUE: usize = 2;

fn unavailable(reason: impl ToString) -> MediaError {
    MediaError::DeviceUnavailable {
        kind: MediaKind::Video,
        reason: reason.to_string(),
    }
}

fn stream_failed(reason: impl ToString) -> MediaError {
    MediaError::StreamFailed {
        kind: MediaKind::Video,
        reason: reason.to_string(),
    }
}

/// Cameras the OS reports. `default_index` is marked default.
pub fn list_cameras(default_index: u32) -> Vec<DeviceInfo> {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .into_iter()
            .map(|camera| DeviceInfo {
                is_default: *camera.index() == CameraIndex::Index(default_index),
                name: format!("{} ({})", camera.human_name(), camera.index()),
                kind: MediaKind::Video,
                direction: Direction::Input,
            })
            .collect(),
        Err(e) => {
            warn!("Camera query failed: {}", e);
            Vec::new()
        }
    }
}

pub struct NokhwaSource {
    frames: Receiver<Result<RgbImage, MediaError>>,
    stop: Option<SyncSender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl NokhwaSource {
    /// Open camera `config.camera_index` as close to the configured size and
    /// rate as it supports.
    pub fn open(config: &VideoConfig) -> Result<Self, MediaError> {
        let index = config.camera_index;
        let format = CameraFormat::new_from(
            config.width,
            config.height,
            FrameFormat::MJPEG,
            config.target_fps,
        );
        let (frames_tx, frames_rx) = mpsc::sync_channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);

        let handle = thread::Builder::new()
            .name(format!("camera-{index}"))
            .spawn(move || {
                let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));
                let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
                    Ok(camera) => camera,
                    Err(e) => {
                        let _ = ready_tx.send(Err(unavailable(e)));
                        return;
                    }
                };
                if let Err(e) = camera.open_stream() {
                    let _ = ready_tx.send(Err(unavailable(e)));
                    return;
                }
                info!("Camera {} streaming {}", index, camera.camera_format());
                let _ = ready_tx.send(Ok(()));

                capture_frames(&mut camera, &frames_tx, &stop_rx);

                if let Err(e) = camera.stop_stream() {
                    warn!("Camera {} did not stop cleanly: {}", index, e);
                }
            })
            .map_err(unavailable)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                frames: frames_rx,
                stop: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(unavailable("camera thread exited during setup"))
            }
        }
    }
}

fn capture_frames(
    camera: &mut Camera,
    frames: &SyncSender<Result<RgbImage, MediaError>>,
    stop: &Receiver<()>,
) {
    while let Err(TryRecvError::Empty) = stop.try_recv() {
        let frame = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>())
            .map_err(stream_failed)
            .and_then(|decoded| {
                let (width, height) = decoded.dimensions();
                RgbImage::from_raw(width, height, decoded.into_raw())
                    .ok_or_else(|| stream_failed("decoded frame has the wrong size"))
            });
        let failed = frame.is_err();

        match frames.try_send(frame) {
            // A full queue means the capture loop is behind; drop.
            Ok(()) | Err(mpsc::TrySendError::Full(_)) => {}
            Err(mpsc::TrySendError::Disconnected(_)) => break,
        }
        if failed {
            break;
        }
    }
}

impl VideoSource for NokhwaSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        match self.frames.recv_timeout(READ_POLL) {
            Ok(frame) => frame.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(stream_failed("camera stream closed")),
        }
    }
}

impl Drop for NokhwaSource {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Camera thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_camera_is_reported_as_unavailable() {
        let config = VideoConfig {
            camera_index: 250,
            ..VideoConfig::default()
        };
        match NokhwaSource::open(&config) {
            Err(MediaError::DeviceUnavailable { kind, .. }) => assert_eq!(kind, MediaKind::Video),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("camera 250 should not exist"),
        }
    }
}
