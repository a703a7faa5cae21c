//! End-to-end call tests over loopback TCP.
//!
//! A relay session runs with muted capture and recording sinks; peers are
//! either raw sockets speaking the wire format or full client sessions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbImage;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use peercall::codec::framing::{read_audio_chunk, read_video_frame, write_video_frame};
use peercall::codec::Inbound;
use peercall::config::{AudioConfig, VideoConfig};
use peercall::error::MediaError;
use peercall::media::{
    AudioSink, AudioSource, DeviceInfo, MediaBackend, SyntheticBackend, VideoSink, VideoSource,
};
use peercall::{MediaKind, Session, SessionConfig, SessionState};

const MAX: usize = 16 * 1024 * 1024;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Recorder {
    audio: Arc<Mutex<Vec<Vec<u8>>>>,
    video: Arc<Mutex<Vec<(u32, u32)>>>,
}

struct AudioTap(Arc<Mutex<Vec<Vec<u8>>>>);

impl AudioSink for AudioTap {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        self.0.lock().unwrap().push(chunk.to_vec());
        Ok(())
    }
}

struct VideoTap(Arc<Mutex<Vec<(u32, u32)>>>);

impl VideoSink for VideoTap {
    fn show_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        self.0.lock().unwrap().push(frame.dimensions());
        Ok(())
    }
}

impl MediaBackend for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn open_audio_input(&self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, MediaError> {
        SyntheticBackend::muted().open_audio_input(config)
    }

    fn open_audio_output(&self, _config: &AudioConfig) -> Result<Box<dyn AudioSink>, MediaError> {
        Ok(Box::new(AudioTap(self.audio.clone())))
    }

    fn open_camera(&self, config: &VideoConfig) -> Result<Box<dyn VideoSource>, MediaError> {
        SyntheticBackend::muted().open_camera(config)
    }

    fn open_display(&self, _config: &VideoConfig) -> Result<Box<dyn VideoSink>, MediaError> {
        Ok(Box::new(VideoTap(self.video.clone())))
    }

    fn list_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }
}

/// A backend whose camera cannot be opened.
struct NoCamera;

impl MediaBackend for NoCamera {
    fn name(&self) -> &'static str {
        "no-camera"
    }

    fn open_audio_input(&self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, MediaError> {
        SyntheticBackend::muted().open_audio_input(config)
    }

    fn open_audio_output(&self, config: &AudioConfig) -> Result<Box<dyn AudioSink>, MediaError> {
        SyntheticBackend::new().open_audio_output(config)
    }

    fn open_camera(&self, _config: &VideoConfig) -> Result<Box<dyn VideoSource>, MediaError> {
        Err(MediaError::DeviceUnavailable {
            kind: MediaKind::Video,
            reason: "camera 0 busy".to_string(),
        })
    }

    fn open_display(&self, config: &VideoConfig) -> Result<Box<dyn VideoSink>, MediaError> {
        SyntheticBackend::new().open_display(config)
    }

    fn list_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }
}

/// A backend whose camera driver panics on the first frame.
struct PanickingCamera;

struct BrokenDriver;

impl VideoSource for BrokenDriver {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        panic!("camera driver fault");
    }
}

impl MediaBackend for PanickingCamera {
    fn name(&self) -> &'static str {
        "panicking-camera"
    }

    fn open_audio_input(&self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, MediaError> {
        SyntheticBackend::muted().open_audio_input(config)
    }

    fn open_audio_output(&self, config: &AudioConfig) -> Result<Box<dyn AudioSink>, MediaError> {
        SyntheticBackend::new().open_audio_output(config)
    }

    fn open_camera(&self, _config: &VideoConfig) -> Result<Box<dyn VideoSource>, MediaError> {
        Ok(Box::new(BrokenDriver))
    }

    fn open_display(&self, config: &VideoConfig) -> Result<Box<dyn VideoSink>, MediaError> {
        SyntheticBackend::new().open_display(config)
    }

    fn list_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }
}

fn relay_config() -> SessionConfig {
    SessionConfig {
        host: "127.0.0.1".to_string(),
        audio_port: 0,
        video_port: 0,
        peer_queue_depth: 256,
        video: VideoConfig {
            width: 64,
            height: 48,
            ..VideoConfig::default()
        },
        ..SessionConfig::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn dial(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("relay accepts")
}

async fn listening(backend: Arc<dyn MediaBackend>, config: SessionConfig) -> Session {
    let session = Session::new(config, backend);
    session.listen().await.expect("relay starts");
    session
}

#[tokio::test]
async fn relay_fans_out_without_echo() {
    let session = listening(Arc::new(Recorder::default()), relay_config()).await;
    let addr = session.local_addr(MediaKind::Video).unwrap();

    let mut a = dial(addr).await;
    let mut b = dial(addr).await;
    let mut c = dial(addr).await;
    assert!(wait_until(|| session.peer_count(MediaKind::Video) == 3).await);
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.flags().video_sending);

    let payload = vec![0x5A; 32 * 1024];
    write_video_frame(&mut a, &payload).await.unwrap();

    for peer in [&mut b, &mut c] {
        let inbound = timeout(WAIT, read_video_frame(peer, MAX)).await.unwrap().unwrap();
        assert_eq!(inbound, Inbound::Frame(payload.clone().into()));
    }

    let echoed = timeout(Duration::from_millis(300), read_video_frame(&mut a, MAX)).await;
    assert!(echoed.is_err(), "origin must not receive its own frame");

    session.stop().await;
}

#[tokio::test]
async fn audio_chunks_arrive_in_order() {
    let recorder = Recorder::default();
    let config = SessionConfig {
        enable_video: false,
        ..relay_config()
    };
    let chunk_len = config.audio.chunk_bytes();
    let session = listening(Arc::new(recorder.clone()), config).await;
    let addr = session.local_addr(MediaKind::Audio).unwrap();

    let mut sender = dial(addr).await;
    let mut listener = dial(addr).await;
    assert!(wait_until(|| session.peer_count(MediaKind::Audio) == 2).await);

    const N: usize = 50;
    let chunks: Vec<Vec<u8>> = (0..N).map(|i| vec![i as u8; chunk_len]).collect();
    for chunk in &chunks {
        sender.write_all(chunk).await.unwrap();
    }

    let mut relayed = Vec::new();
    for _ in 0..N {
        match timeout(WAIT, read_audio_chunk(&mut listener, chunk_len)).await.unwrap().unwrap() {
            Inbound::Frame(chunk) => relayed.push(chunk.to_vec()),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(relayed, chunks);

    // The sender is the primary source, so the relay plays it locally too.
    assert!(wait_until(|| recorder.audio.lock().unwrap().len() == N).await);
    let played = recorder.audio.lock().unwrap().clone();
    assert_eq!(played, chunks);
    assert_eq!(played.iter().map(Vec::len).sum::<usize>(), N * chunk_len);

    session.stop().await;
}

#[tokio::test]
async fn partial_frame_is_dropped_and_relay_keeps_going() {
    let session = listening(Arc::new(Recorder::default()), relay_config()).await;
    let addr = session.local_addr(MediaKind::Video).unwrap();

    let mut broken = dial(addr).await;
    assert!(wait_until(|| session.peer_count(MediaKind::Video) == 1).await);
    broken.write_all(&1000u32.to_be_bytes()).await.unwrap();
    broken.write_all(&[1u8; 10]).await.unwrap();
    drop(broken);
    assert!(wait_until(|| session.peer_count(MediaKind::Video) == 0).await);

    let mut b = dial(addr).await;
    let mut c = dial(addr).await;
    assert!(wait_until(|| session.peer_count(MediaKind::Video) == 2).await);

    write_video_frame(&mut b, b"after").await.unwrap();
    let inbound = timeout(WAIT, read_video_frame(&mut c, MAX)).await.unwrap().unwrap();
    assert_eq!(inbound, Inbound::Frame(b"after".as_slice().into()));

    session.stop().await;
}

#[tokio::test]
async fn stop_twice_closes_every_peer() {
    let session = listening(Arc::new(Recorder::default()), relay_config()).await;
    let audio = session.local_addr(MediaKind::Audio).unwrap();
    let video = session.local_addr(MediaKind::Video).unwrap();

    let mut peers = vec![dial(audio).await, dial(video).await, dial(video).await];
    assert!(wait_until(|| {
        session.peer_count(MediaKind::Audio) == 1 && session.peer_count(MediaKind::Video) == 2
    })
    .await);

    session.stop().await;
    session.stop().await;

    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.flags().any());
    assert_eq!(session.peer_count(MediaKind::Audio), 0);
    assert_eq!(session.peer_count(MediaKind::Video), 0);

    for peer in &mut peers {
        let mut buf = [0u8; 16];
        let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0, "relay should have closed the connection");
    }
}

#[tokio::test]
async fn device_failure_only_stops_that_media_type() {
    let session = Session::new(relay_config(), Arc::new(NoCamera));
    let report = session.listen().await.unwrap();

    assert_eq!(report.started.len(), 1);
    assert_eq!(report.started[0].0, MediaKind::Audio);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, MediaKind::Video);
    assert!(session.local_addr(MediaKind::Video).is_none());

    session.stop().await;
}

#[tokio::test]
async fn client_session_streams_to_relay() {
    let recorder = Recorder::default();
    let relay = listening(Arc::new(recorder.clone()), relay_config()).await;

    let client_config = SessionConfig {
        audio_port: relay.local_addr(MediaKind::Audio).unwrap().port(),
        video_port: relay.local_addr(MediaKind::Video).unwrap().port(),
        ..relay_config()
    };
    let client = Session::new(client_config, Arc::new(SyntheticBackend::new()));
    let report = client.connect().await.unwrap();
    assert_eq!(report.started.len(), 2);
    assert_eq!(client.state(), SessionState::Active);

    assert!(wait_until(|| recorder.video.lock().unwrap().len() >= 3).await);
    assert!(wait_until(|| recorder.audio.lock().unwrap().len() >= 3).await);
    assert!(recorder
        .video
        .lock()
        .unwrap()
        .iter()
        .all(|dims| *dims == (64, 48)));

    client.stop().await;
    assert_eq!(client.state(), SessionState::Idle);
    assert!(wait_until(|| {
        relay.peer_count(MediaKind::Audio) == 0 && relay.peer_count(MediaKind::Video) == 0
    })
    .await);

    relay.stop().await;
}

#[tokio::test]
async fn client_session_ends_when_its_peer_leaves() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = SessionConfig {
        enable_audio: false,
        video_port: listener.local_addr().unwrap().port(),
        ..relay_config()
    };

    let client = Session::new(config, Arc::new(SyntheticBackend::muted()));
    let mut state = client.subscribe_state();
    client.connect().await.unwrap();

    let (mut remote, _) = listener.accept().await.unwrap();
    // Declare a frame, deliver part of it, hang up.
    remote.write_all(&64u32.to_be_bytes()).await.unwrap();
    remote.write_all(&[9u8; 8]).await.unwrap();
    drop(remote);

    timeout(WAIT, state.wait_for(|s| *s == SessionState::Idle))
        .await
        .unwrap()
        .unwrap();
    assert!(!client.flags().any());

    client.stop().await;
    assert_eq!(client.state(), SessionState::Idle);
}

#[tokio::test]
async fn capture_panic_stops_client_session() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = SessionConfig {
        video_port: listener.local_addr().unwrap().port(),
        enable_audio: false,
        ..relay_config()
    };

    let client = Session::new(config, Arc::new(PanickingCamera));
    let mut state = client.subscribe_state();
    client.connect().await.unwrap();
    let (_remote, _) = listener.accept().await.unwrap();

    timeout(WAIT, state.wait_for(|s| *s == SessionState::Idle))
        .await
        .expect("session should stop after the capture worker panics")
        .unwrap();
    assert!(!client.flags().any());
    assert_eq!(client.local_addr(MediaKind::Video), None);

    client.stop().await;
}

#[tokio::test]
async fn capture_panic_stops_relay_and_closes_peers() {
    let session = listening(Arc::new(PanickingCamera), relay_config()).await;
    let mut state = session.subscribe_state();
    let addr = session.local_addr(MediaKind::Video).unwrap();

    // The relay only captures once a peer is connected.
    let mut peer = dial(addr).await;

    timeout(WAIT, state.wait_for(|s| *s == SessionState::Idle))
        .await
        .expect("relay should stop after the capture worker panics")
        .unwrap();
    assert_eq!(session.peer_count(MediaKind::Video), 0);

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);

    session.stop().await;
}
