//! Server role: accept any number of peers per media type and relay
//!
//! Every frame a peer sends is fanned out to all other peers of the same
//! media type, never back to its origin. The server's own capture is
//! fanned out the same way under `PeerId::LOCAL`.
//!
//! Per media type the relay runs:
//! - one acceptor task owning the listener and the per-peer tasks
//! - one reader task and one writer task per peer; each writer drains its
//!   own bounded queue, so a slow peer only loses its own frames
//! - one dispatcher task that owns fan-out and peer removal
//! - the blocking capture and playback workers

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{framing, FrameReader, Inbound};
use crate::error::TransportError;
use crate::media::worker::{capture_loop, playback_loop};
use crate::media::{Capture, Playback};
use crate::model::{MediaFrame, MediaKind, PeerId, Propagated};
use crate::session::PipelineContext;

/// One accepted connection as seen by the dispatcher.
#[derive(Debug)]
pub struct PeerLink {
    pub id: PeerId,
    pub addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

/// Outcome of handing one frame to every peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
    /// The longest-connected peer after this fan-out.
    pub primary: Option<PeerId>,
}

/// The live peers of one media type, in accept order.
///
/// Insertion, removal and fan-out all happen under one lock, so a link
/// that has been removed is never written to again.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    links: Arc<Mutex<Vec<PeerLink>>>,
}

impl PeerRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<PeerLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a link and returns the new peer count.
    pub fn insert(&self, link: PeerLink) -> usize {
        let mut links = self.lock();
        links.push(link);
        links.len()
    }

    /// Removes and closes a link. Returns whether it was present.
    pub fn remove(&self, id: PeerId) -> bool {
        let mut links = self.lock();
        let Some(pos) = links.iter().position(|l| l.id == id) else {
            return false;
        };
        links.remove(pos).token.cancel();
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.lock().iter().map(|l| l.id).collect()
    }

    pub fn primary(&self) -> Option<PeerId> {
        self.lock().first().map(|l| l.id)
    }

    /// Queue `wire` on every link except `origin`'s.
    pub fn fan_out(&self, origin: PeerId, wire: &Bytes) -> FanOut {
        let mut links = self.lock();
        let mut fan = FanOut::default();

        links.retain(|link| {
            if link.id == origin {
                return true;
            }
            match link.tx.try_send(wire.clone()) {
                Ok(()) => {
                    fan.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    debug!("{} is lagging, dropping frame", link.id);
                    fan.dropped += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    link.token.cancel();
                    fan.removed += 1;
                    false
                }
            }
        });

        fan.primary = links.first().map(|l| l.id);
        fan
    }

    /// Close every link.
    pub fn clear(&self) {
        for link in self.lock().drain(..) {
            link.token.cancel();
        }
    }
}

/// A bound, not yet running relay for one media type.
pub struct Relay {
    kind: MediaKind,
    listener: TcpListener,
    registry: PeerRegistry,
}

impl Relay {
    pub async fn bind(kind: MediaKind, host: &str, port: u16) -> Result<Relay, TransportError> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("{} relay listening on {}", kind, listener.local_addr()?);
        Ok(Self {
            kind,
            listener,
            registry: PeerRegistry::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> PeerRegistry {
        self.registry.clone()
    }

    /// Spawn the acceptor, dispatcher and media workers.
    pub fn spawn(
        self,
        tasks: &mut JoinSet<()>,
        ctx: PipelineContext,
        capture: Capture,
        playback: Playback,
    ) {
        debug_assert_eq!(self.kind, ctx.kind);
        let depth = ctx.config.peer_queue_depth;
        let (events_tx, events_rx) = mpsc::channel::<Propagated>(depth);
        let (play_tx, play_rx) = mpsc::channel::<MediaFrame>(depth);

        let c = ctx.clone();
        let local = events_tx.clone();
        tasks.spawn_blocking(move || {
            let result = capture_loop(capture, &c.config, c.flags.clone(), c.token.clone(), |frame| {
                local
                    .blocking_send(Propagated::Frame(PeerId::LOCAL, frame))
                    .is_ok()
            });
            if let Err(e) = result {
                c.escalate(&e);
            }
        });

        tasks.spawn(dispatch(ctx.clone(), self.registry.clone(), events_rx, play_tx));
        tasks.spawn(accept_loop(ctx.clone(), self.listener, self.registry, events_tx));

        let c = ctx;
        tasks.spawn_blocking(move || {
            if let Err(e) = playback_loop(playback, play_rx) {
                c.escalate(&e);
            }
        });
    }
}

/// Owns fan-out. Frames from the primary peer also go to local playback.
async fn dispatch(
    ctx: PipelineContext,
    registry: PeerRegistry,
    mut events: mpsc::Receiver<Propagated>,
    play: mpsc::Sender<MediaFrame>,
) {
    let kind = ctx.kind;

    loop {
        let event = tokio::select! {
            _ = ctx.token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Propagated::Left(id) => {
                if registry.remove(id) {
                    info!("{} {} left, {} peers remain", kind, id, registry.len());
                }
            }
            Propagated::Frame(origin, frame) => {
                let wire = match framing::wire_bytes(&frame) {
                    Ok(wire) => wire,
                    Err(e) => {
                        warn!("Dropping {} frame from {}: {}", kind, origin, e);
                        continue;
                    }
                };

                let fan = registry.fan_out(origin, &wire);
                trace!("{} frame from {}: {:?}", kind, origin, fan);

                if !origin.is_local() && fan.primary == Some(origin) {
                    if let Err(TrySendError::Full(_)) = play.try_send(frame) {
                        debug!("Local {} playback lagging, dropping frame", kind);
                    }
                }
            }
        }
    }

    debug!("{} dispatcher finished", kind);
}

async fn accept_loop(
    ctx: PipelineContext,
    listener: TcpListener,
    registry: PeerRegistry,
    events: mpsc::Sender<Propagated>,
) {
    let kind = ctx.kind;
    let mut peers = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = ctx.token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                add_peer(&ctx, &mut peers, &registry, &events, stream, addr);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                warn!("{} accept failed: {}", kind, e);
            }
            Err(e) => {
                ctx.escalate(&e);
                break;
            }
        }

        while let Some(finished) = peers.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("{} peer task panicked: {}", kind, e);
                }
            }
        }
    }

    registry.clear();
    peers.shutdown().await;
    debug!("{} acceptor finished", kind);
}

fn add_peer(
    ctx: &PipelineContext,
    peers: &mut JoinSet<()>,
    registry: &PeerRegistry,
    events: &mpsc::Sender<Propagated>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let id = PeerId::next();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, e);
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(ctx.config.peer_queue_depth);
    let token = ctx.token.child_token();

    let count = registry.insert(PeerLink {
        id,
        addr,
        tx,
        token: token.clone(),
    });
    info!("{} {} connected from {} ({} peers)", ctx.kind, id, addr, count);
    ctx.media_up();

    peers.spawn(run_peer(ctx.clone(), id, read_half, write_half, rx, events.clone(), token));
}

/// Runs both halves of one peer and reports it as left once both ended,
/// however they ended.
async fn run_peer(
    ctx: PipelineContext,
    id: PeerId,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    queue: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<Propagated>,
    token: CancellationToken,
) {
    let kind = ctx.kind;
    let mut halves = JoinSet::new();
    halves.spawn(read_peer(ctx.clone(), id, read_half, events.clone(), token.clone()));
    halves.spawn(write_peer(kind, id, write_half, queue, token.clone()));

    while let Some(joined) = halves.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("{} {} task panicked, dropping peer: {}", kind, id, e);
            }
            token.cancel();
        }
    }

    tokio::select! {
        _ = ctx.token.cancelled() => {}
        _ = events.send(Propagated::Left(id)) => {}
    }
}

async fn read_peer(
    ctx: PipelineContext,
    id: PeerId,
    reader: OwnedReadHalf,
    events: mpsc::Sender<Propagated>,
    token: CancellationToken,
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
            _ = token.cancelled() => break,
            inbound = reader.next() => inbound,
        };

        let event = match inbound {
            Ok(Inbound::Frame(payload)) => Propagated::Frame(id, MediaFrame::new(kind, payload)),
            Ok(Inbound::Truncated { expected, received }) => {
                warn!(
                    "Dropping partial {} frame from {} ({} of {} bytes)",
                    kind, id, received, expected
                );
                continue;
            }
            Ok(Inbound::Closed) => {
                info!("{} {} disconnected", kind, id);
                break;
            }
            Err(e) => {
                warn!("{} {} receive failed: {}", kind, id, e);
                break;
            }
        };

        let sent = tokio::select! {
            _ = token.cancelled() => break,
            sent = events.send(event) => sent,
        };
        if sent.is_err() {
            break;
        }
    }

    token.cancel();
}

async fn write_peer(
    kind: MediaKind,
    id: PeerId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) {
    loop {
        let wire = tokio::select! {
            _ = token.cancelled() => break,
            wire = queue.recv() => match wire {
                Some(wire) => wire,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = token.cancelled() => break,
            written = writer.write_all(&wire) => written,
        };
        if let Err(e) = written {
            warn!("{} {} send failed: {}", kind, id, e);
            break;
        }
    }

    token.cancel();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: PeerId, depth: usize) -> (PeerLink, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth);
        let link = PeerLink {
            id,
            addr: "127.0.0.1:9".parse().unwrap(),
            tx,
            token: CancellationToken::new(),
        };
        (link, rx)
    }

    #[test]
    fn fan_out_skips_origin() {
        let registry = PeerRegistry::default();
        let (a, b, c) = (PeerId::next(), PeerId::next(), PeerId::next());
        let (la, mut ra) = link(a, 4);
        let (lb, mut rb) = link(b, 4);
        let (lc, mut rc) = link(c, 4);
        registry.insert(la);
        registry.insert(lb);
        registry.insert(lc);

        let wire = Bytes::from_static(b"frame");
        let fan = registry.fan_out(a, &wire);

        assert_eq!(fan.delivered, 2);
        assert_eq!(fan.primary, Some(a));
        assert!(ra.try_recv().is_err());
        assert_eq!(rb.try_recv().unwrap(), wire);
        assert_eq!(rc.try_recv().unwrap(), wire);
    }

    #[test]
    fn full_queue_drops_only_for_that_peer() {
        let registry = PeerRegistry::default();
        let (slow, fast) = (PeerId::next(), PeerId::next());
        let (ls, _rs) = link(slow, 1);
        let (lf, mut rf) = link(fast, 4);
        registry.insert(ls);
        registry.insert(lf);

        let wire = Bytes::from_static(b"x");
        registry.fan_out(PeerId::LOCAL, &wire);
        let fan = registry.fan_out(PeerId::LOCAL, &wire);

        assert_eq!(fan.dropped, 1);
        assert_eq!(fan.delivered, 1);
        assert_eq!(registry.len(), 2);
        assert!(rf.try_recv().is_ok() && rf.try_recv().is_ok());
    }

    #[test]
    fn closed_links_are_pruned_and_cancelled() {
        let registry = PeerRegistry::default();
        let (gone, stays) = (PeerId::next(), PeerId::next());
        let (lg, rg) = link(gone, 1);
        let token = lg.token.clone();
        let (ls, _rs) = link(stays, 1);
        registry.insert(lg);
        registry.insert(ls);
        drop(rg);

        let fan = registry.fan_out(PeerId::LOCAL, &Bytes::from_static(b"x"));
        assert_eq!(fan.removed, 1);
        assert_eq!(fan.primary, Some(stays));
        assert!(token.is_cancelled());
        assert_eq!(registry.ids(), vec![stays]);
    }

    #[test]
    fn remove_and_clear_cancel_links() {
        let registry = PeerRegistry::default();
        let (a, b) = (PeerId::next(), PeerId::next());
        let (la, _ra) = link(a, 1);
        let (lb, _rb) = link(b, 1);
        let (ta, tb) = (la.token.clone(), lb.token.clone());
        registry.insert(la);
        registry.insert(lb);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert!(ta.is_cancelled());

        registry.clear();
        assert!(registry.is_empty());
        assert!(tb.is_cancelled());
    }
}
