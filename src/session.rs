//! Call session lifecycle
//!
//! A [`Session`] owns everything one call needs: the gate flags, the state
//! machine, and per media type a pipeline of tasks. Audio and video start
//! and fail independently. `stop` cancels every task, closes every socket,
//! joins the device workers and clears the flags; it is safe to call any
//! number of times.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, TransportError};
use crate::media::{self, MediaBackend};
use crate::model::{FlagsSnapshot, MediaFlags, MediaKind, Role, SessionState};
use crate::peer;
use crate::server::{PeerRegistry, Relay};

/// How long teardown waits for workers before giving up on them.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a pipeline's workers can see of and do to the session.
#[derive(Clone)]
pub struct PipelineContext {
    pub kind: MediaKind,
    pub config: Arc<SessionConfig>,
    pub flags: Arc<MediaFlags>,
    /// Cancelled when this media type stops.
    pub token: CancellationToken,
    root: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
}

impl PipelineContext {
    /// A connection for this media type is up.
    pub fn media_up(&self) {
        self.flags.set(self.kind, true);
        self.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
    }

    /// The only connection of this media type is gone. Stops this media
    /// type; the other one keeps running.
    pub fn connection_lost(&self) {
        self.flags.set(self.kind, false);
        self.token.cancel();
    }

    /// Something that should never fail did. Stops the whole session.
    pub fn escalate(&self, reason: &dyn Display) {
        error!("{} pipeline failed, stopping session: {}", self.kind, reason);
        self.root.cancel();
    }
}

/// Which media types came up, and why the others did not.
#[derive(Debug, Default, Clone)]
pub struct StartReport {
    /// Local listen address (server) or remote address (client).
    pub started: Vec<(MediaKind, SocketAddr)>,
    pub failed: Vec<(MediaKind, String)>,
}

struct Pipeline {
    kind: MediaKind,
    addr: SocketAddr,
    token: CancellationToken,
    /// Owns the pipeline's workers; see [`watch_workers`].
    workers: JoinHandle<()>,
    registry: Option<PeerRegistry>,
}

struct Running {
    role: Role,
    root: CancellationToken,
    pipelines: Vec<Pipeline>,
}

struct Shared {
    flags: Arc<MediaFlags>,
    state: Arc<watch::Sender<SessionState>>,
    running: Mutex<Option<Running>>,
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn teardown(&self) {
        // `running` is emptied and `Stopping` published under one lock.
        let running = {
            let mut guard = self.running();
            let Some(running) = guard.take() else {
                return;
            };
            self.state.send_replace(SessionState::Stopping);
            running
        };

        info!("Stopping {:?} session", running.role);
        running.root.cancel();

        for pipeline in running.pipelines {
            if let Some(registry) = &pipeline.registry {
                registry.clear();
            }
            let abort = pipeline.workers.abort_handle();
            match tokio::time::timeout(JOIN_TIMEOUT, pipeline.workers).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} worker watcher ended abnormally: {}", pipeline.kind, e),
                Err(_) => {
                    warn!(
                        "{} workers did not finish within {:?}, detaching",
                        pipeline.kind, JOIN_TIMEOUT
                    );
                    abort.abort();
                }
            }
        }

        self.flags.clear();
        self.state.send_replace(SessionState::Idle);
        info!("Session idle");
    }
}

pub struct Session {
    config: Arc<SessionConfig>,
    backend: Arc<dyn MediaBackend>,
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(config: SessionConfig, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            shared: Arc::new(Shared {
                flags: Arc::new(MediaFlags::default()),
                state: Arc::new(watch::Sender::new(SessionState::Idle)),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn flags(&self) -> FlagsSnapshot {
        self.shared.flags.snapshot()
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.running().as_ref().map(|r| r.role)
    }

    /// Connected peers of `kind` in server role; 0 otherwise.
    pub fn peer_count(&self, kind: MediaKind) -> usize {
        self.shared
            .running()
            .as_ref()
            .and_then(|r| r.pipelines.iter().find(|p| p.kind == kind))
            .and_then(|p| p.registry.as_ref())
            .map_or(0, PeerRegistry::len)
    }

    /// Listen address (server) or remote address (client) of `kind`.
    pub fn local_addr(&self, kind: MediaKind) -> Option<SocketAddr> {
        self.shared
            .running()
            .as_ref()
            .and_then(|r| r.pipelines.iter().find(|p| p.kind == kind))
            .map(|p| p.addr)
    }

    /// Client role: dial `host` once per enabled media type.
    pub async fn connect(&self) -> Result<StartReport, SessionError> {
        self.start(Role::Client).await
    }

    /// Server role: listen once per enabled media type and relay.
    pub async fn listen(&self) -> Result<StartReport, SessionError> {
        self.start(Role::Server).await
    }

    /// Tear the session down. Never fails; extra calls do nothing.
    pub async fn stop(&self) {
        self.shared.teardown().await;
        if self.state() == SessionState::Stopping {
            // The supervisor got there first; wait for it to finish.
            let mut state = self.subscribe_state();
            let _ = state.wait_for(|s| *s == SessionState::Idle).await;
        }
    }

    async fn start(&self, role: Role) -> Result<StartReport, SessionError> {
        self.config.validate()?;

        let began = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(SessionError::AlreadyRunning);
        }
        info!("Starting {:?} session via {} backend", role, self.backend.name());

        let root = CancellationToken::new();
        let mut report = StartReport::default();
        let mut pipelines = Vec::new();

        for kind in MediaKind::ALL {
            if !self.config.enabled(kind) {
                continue;
            }
            let ctx = PipelineContext {
                kind,
                config: self.config.clone(),
                flags: self.shared.flags.clone(),
                token: root.child_token(),
                root: root.clone(),
                state: self.shared.state.clone(),
            };

            match self.start_pipeline(role, ctx).await {
                Ok(pipeline) => {
                    report.started.push((kind, pipeline.addr));
                    pipelines.push(pipeline);
                }
                Err(e) => {
                    warn!("{} did not start: {}", kind, e);
                    report.failed.push((kind, e.to_string()));
                }
            }
        }

        if pipelines.is_empty() {
            self.shared.flags.clear();
            self.shared.state.send_replace(SessionState::Idle);
            let reasons = report
                .failed
                .iter()
                .map(|(kind, reason)| format!("{kind}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SessionError::NothingStarted { reasons });
        }

        let tokens: Vec<CancellationToken> = pipelines.iter().map(|p| p.token.clone()).collect();
        *self.shared.running() = Some(Running {
            role,
            root: root.clone(),
            pipelines,
        });
        tokio::spawn(supervise(self.shared.clone(), root, tokens));

        Ok(report)
    }

    async fn start_pipeline(&self, role: Role, ctx: PipelineContext) -> Result<Pipeline, SessionError> {
        let kind = ctx.kind;
        let (capture, playback) =
            media::open_devices(&*self.backend, kind, &self.config.audio, &self.config.video)?;
        let port = self.config.port(kind);
        let mut tasks = JoinSet::new();
        let token = ctx.token.clone();
        let watcher = ctx.clone();

        match role {
            Role::Client => {
                let stream =
                    peer::connect(&self.config.host, port, self.config.connect_timeout()).await?;
                let addr = stream.peer_addr().map_err(TransportError::from)?;
                info!("{} connected to {}", kind, addr);
                ctx.media_up();
                peer::spawn_pipeline(&mut tasks, ctx, stream, capture, playback);
                Ok(Pipeline {
                    kind,
                    addr,
                    token,
                    workers: tokio::spawn(watch_workers(watcher, tasks)),
                    registry: None,
                })
            }
            Role::Server => {
                let relay = Relay::bind(kind, &self.config.host, port).await?;
                let addr = relay.local_addr()?;
                let registry = relay.registry();
                relay.spawn(&mut tasks, ctx, capture, playback);
                Ok(Pipeline {
                    kind,
                    addr,
                    token,
                    workers: tokio::spawn(watch_workers(watcher, tasks)),
                    registry: Some(registry),
                })
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Let the supervisor release everything.
        if let Some(running) = self.shared.running().as_ref() {
            running.root.cancel();
        }
    }
}

/// Joins a pipeline's workers as they finish. A panicking worker stops the
/// session like any other unexpected failure. Dropping this task's future
/// aborts whatever is still running.
async fn watch_workers(ctx: PipelineContext, mut tasks: JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                ctx.escalate(&e);
            }
        }
    }
}

/// Tears the session down once it is cancelled or every media type ended.
async fn supervise(shared: Arc<Shared>, root: CancellationToken, pipelines: Vec<CancellationToken>) {
    tokio::select! {
        _ = root.cancelled() => {}
        _ = async {
            for token in &pipelines {
                token.cancelled().await;
            }
        } => {
            info!("Every media pipeline ended");
        }
    }
    shared.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticBackend;

    fn local_config() -> SessionConfig {
        SessionConfig {
            host: "127.0.0.1".to_string(),
            audio_port: 0,
            video_port: 0,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn listen_then_stop_twice() {
        let session = Session::new(local_config(), Arc::new(SyntheticBackend::muted()));
        let report = session.listen().await.unwrap();

        assert_eq!(report.started.len(), 2);
        assert_eq!(session.state(), SessionState::Starting);
        assert_eq!(session.role(), Some(Role::Server));

        session.stop().await;
        session.stop().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.flags().any());
        assert_eq!(session.peer_count(MediaKind::Audio), 0);
        assert_eq!(session.peer_count(MediaKind::Video), 0);
    }

    #[tokio::test]
    async fn stop_on_idle_session_is_a_noop() {
        let session = Session::new(local_config(), Arc::new(SyntheticBackend::new()));
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stops_both_wait_for_idle() {
        for _ in 0..50 {
            let session = Arc::new(Session::new(local_config(), Arc::new(SyntheticBackend::muted())));
            session.listen().await.unwrap();

            let (a, b) = (session.clone(), session.clone());
            let first = tokio::spawn(async move {
                a.stop().await;
                a.state()
            });
            let second = tokio::spawn(async move {
                b.stop().await;
                b.state()
            });

            assert_eq!(first.await.unwrap(), SessionState::Idle);
            assert_eq!(second.await.unwrap(), SessionState::Idle);
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let session = Session::new(local_config(), Arc::new(SyntheticBackend::muted()));
        session.listen().await.unwrap();
        assert!(matches!(session.listen().await, Err(SessionError::AlreadyRunning)));
        session.stop().await;
    }

    #[tokio::test]
    async fn connect_with_nobody_listening_returns_to_idle() {
        // Grab a free port and release it so nothing listens there.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let config = SessionConfig {
            audio_port: port,
            enable_video: false,
            connect_timeout_ms: 500,
            ..local_config()
        };
        let session = Session::new(config, Arc::new(SyntheticBackend::new()));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::NothingStarted { .. }));
        assert_eq!(session.state(), SessionState::Idle);
    }
}
