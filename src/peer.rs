//! Client role: one direct connection per media type
//!
//! Each connected media type runs four workers:
//! 1. a blocking capture worker that reads the device and encodes frames
//! 2. a send task that writes those frames to the socket
//! 3. a receive task that reassembles frames from the socket
//! 4. a blocking playback worker that decodes and plays them
//!
//! A broken connection stops only its own media type. Device or sink
//! failures stop the whole session.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::{framing, FrameReader, Inbound};
use crate::error::TransportError;
use crate::media::worker::{capture_loop, playback_loop};
use crate::media::{Capture, Playback};
use crate::model::MediaFrame;
use crate::session::PipelineContext;

/// Open the outbound connection for one media type.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(TransportError::ConnectTimeout {
                addr: format!("{host}:{port}"),
                ms: timeout.as_millis() as u64,
            })
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Spawn the capture, send, receive and playback workers for `stream`.
pub fn spawn_pipeline(
    tasks: &mut JoinSet<()>,
    ctx: PipelineContext,
    stream: TcpStream,
    capture: Capture,
    playback: Playback,
) {
    let depth = ctx.config.peer_queue_depth;
    let (read_half, write_half) = stream.into_split();
    let (frames_tx, frames_rx) = mpsc::channel::<MediaFrame>(depth);
    let (play_tx, play_rx) = mpsc::channel::<MediaFrame>(depth);

    let c = ctx.clone();
    tasks.spawn_blocking(move || {
        let result = capture_loop(capture, &c.config, c.flags.clone(), c.token.clone(), |frame| {
            frames_tx.blocking_send(frame).is_ok()
        });
        if let Err(e) = result {
            c.escalate(&e);
        }
    });

    tasks.spawn(send_loop(ctx.clone(), write_half, frames_rx));
    tasks.spawn(receive_loop(ctx.clone(), read_half, play_tx));

    let c = ctx;
    tasks.spawn_blocking(move || {
        if let Err(e) = playback_loop(playback, play_rx) {
            c.escalate(&e);
        }
    });
}

async fn send_loop(
    ctx: PipelineContext,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<MediaFrame>,
) {
    let kind = ctx.kind;
    let mut sent: u64 = 0;

    loop {
        let frame = tokio::select! {
            _ = ctx.token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let wire = match framing::wire_bytes(&frame) {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Dropping outgoing {} frame: {}", kind, e);
                continue;
            }
        };

        let written = tokio::select! {
            _ = ctx.token.cancelled() => break,
            written = writer.write_all(&wire) => written,
        };

        if let Err(e) = written {
            warn!("{} connection lost while sending: {}", kind, e);
            ctx.connection_lost();
            break;
        }
        sent += 1;
    }

    debug!("{} send loop finished after {} frames", kind, sent);
    let _ = writer.shutdown().await;
}

async fn receive_loop(
    ctx: PipelineContext,
    reader: OwnedReadHalf,
    play: mpsc::Sender<MediaFrame>,
) {
    let kind = ctx.kind;
    let mut reader = FrameReader::new(
        reader,
        kind,
        ctx.config.audio.chunk_bytes(),
        ctx.config.max_video_frame_bytes,
    );

    loop {
        let inbound = tokio::select! {
            _ = ctx.token.cancelled() => break,
            inbound = reader.next() => inbound,
        };

        match inbound {
            Ok(Inbound::Frame(payload)) => {
                let delivered = tokio::select! {
                    _ = ctx.token.cancelled() => break,
                    delivered = play.send(MediaFrame::new(kind, payload)) => delivered,
                };
                if delivered.is_err() {
                    // Playback is gone and has already reported why.
                    break;
                }
            }
            Ok(Inbound::Truncated { expected, received }) => {
                warn!(
                    "Dropping partial {} frame ({} of {} bytes)",
                    kind, received, expected
                );
            }
            Ok(Inbound::Closed) => {
                info!("{} peer closed the connection", kind);
                ctx.connection_lost();
                break;
            }
            Err(e) => {
                error!("{} receive failed: {}", kind, e);
                ctx.connection_lost();
                break;
            }
        }
    }
}
