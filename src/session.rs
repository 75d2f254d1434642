//! The session multiplexer.
//!
//! Each session runs as one task that owns its client channel and its grant on a
//! backend channel. Exclusive grants own a whole [`BackendChannel`]; shared grants
//! hold a subscription on the single shared channel, whose demultiplexing task routes
//! backend traffic by the proxy-assigned request ids kept in the [`RoutingTable`].
//!
//! `Establishing -> Active -> Draining -> Closed`, with backend failures and
//! shutdown going straight to `Closed`.

use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::VerifiedPrincipal;
use crate::channel::{
    client_pair, BackendChannel, BackendEvent, BackendFailure, BackendOptions, BackendSender,
    ClientChannel, ClientEndpoint, ClientEvent, ClientSender, CloseReason, SessionId,
    TransportError,
};
use crate::config::{BackendTarget, ClientTransportKind, ProxyConfig, ReconnectPolicy, Timeouts};
use crate::message::Message;
use crate::routing::RoutingTable;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("principal {0} has an expired token")]
    PrincipalExpired(String),
    #[error("failed to acquire backend: {0}")]
    Acquire(BackendFailure),
    #[error("backend acquisition timed out after {0:?}")]
    AcquireTimeout(Duration),
    #[error("unknown session {0}")]
    NotFound(SessionId),
    #[error("session belongs to a different subject")]
    SubjectMismatch,
    #[error("session {0} is closed")]
    Closed(SessionId),
    #[error("proxy is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Establishing,
    Active,
    Draining,
    Closed(CloseReason),
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub subject: String,
    pub transport: ClientTransportKind,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
}

/// The parts of [`ProxyConfig`] the multiplexer acts on.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub backend: BackendTarget,
    pub share_backend: bool,
    pub timeouts: Timeouts,
    pub reconnect: ReconnectPolicy,
    pub channel_capacity: usize,
}

impl From<&ProxyConfig> for MultiplexerConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            backend: config.backend.clone(),
            share_backend: config.share_backend,
            timeouts: config.timeouts,
            reconnect: config.reconnect,
            channel_capacity: config.channel_capacity,
        }
    }
}

struct SessionEntry {
    subject: String,
    transport: ClientTransportKind,
    created_at: SystemTime,
    last_activity: Arc<Mutex<SystemTime>>,
    principal: watch::Sender<VerifiedPrincipal>,
    state: watch::Receiver<SessionState>,
    client: ClientSender,
}

struct Subscribers {
    sessions: HashMap<SessionId, mpsc::Sender<BackendEvent>>,
    closed: Option<BackendFailure>,
}

/// The one backend channel all sessions share when pooling is configured.
struct SharedBackend {
    sender: BackendSender,
    subscribers: Mutex<Subscribers>,
    closing: CancellationToken,
    demux: Mutex<Option<JoinHandle<()>>>,
}

enum BackendGrant {
    Exclusive(BackendChannel),
    Shared {
        backend: Arc<SharedBackend>,
        inbound: mpsc::Receiver<BackendEvent>,
    },
}

impl BackendGrant {
    fn sender(&self, session: &SessionId) -> BackendSender {
        match self {
            Self::Exclusive(channel) => channel.sender(),
            Self::Shared { backend, .. } => backend.sender.for_session(session.clone()),
        }
    }

    /// Rewrites request ids so replies on a shared channel find their way back.
    fn prepare(&self, routing: &RoutingTable, session: &SessionId, message: Message) -> Message {
        match self {
            Self::Exclusive(_) => message,
            Self::Shared { .. } => routing.tag(session, &message),
        }
    }

    async fn receive(&mut self) -> BackendEvent {
        match self {
            Self::Exclusive(channel) => channel.receive().await,
            // The demultiplexer drops subscribers it could not keep up with.
            Self::Shared { inbound, .. } => inbound.recv().await.unwrap_or(BackendEvent::Closed(
                BackendFailure::Transport(TransportError::ConnectionLost(
                    "session fell behind the shared backend".to_string(),
                )),
            )),
        }
    }
}

struct Inner {
    config: MultiplexerConfig,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    shared: tokio::sync::Mutex<Option<Arc<SharedBackend>>>,
    routing: RoutingTable,
    shutdown: CancellationToken,
}

/// Owns every session and every backend channel grant.
#[derive(Clone)]
pub struct SessionMultiplexer {
    inner: Arc<Inner>,
}

impl SessionMultiplexer {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                shared: tokio::sync::Mutex::new(None),
                routing: RoutingTable::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.inner.config
    }

    /// Binds a new session for `principal` to a backend channel and starts it.
    ///
    /// `forwarded_headers` reach HTTP backends on exclusive channels only.
    pub async fn open_session(
        &self,
        principal: VerifiedPrincipal,
        transport: ClientTransportKind,
        forwarded_headers: HeaderMap,
    ) -> Result<ClientEndpoint> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        if principal.is_expired() {
            warn!(subject = %principal.subject, "Refusing session for expired principal");
            return Err(SessionError::PrincipalExpired(principal.subject));
        }

        let id = SessionId::new();
        let (client_channel, endpoint) = client_pair(id.clone(), inner.config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(SessionState::Establishing);
        let (principal_tx, principal_rx) = watch::channel(principal.clone());
        let now = SystemTime::now();
        let last_activity = Arc::new(Mutex::new(now));

        inner.sessions.lock().insert(
            id.clone(),
            SessionEntry {
                subject: principal.subject.clone(),
                transport,
                created_at: now,
                last_activity: last_activity.clone(),
                principal: principal_tx,
                state: state_rx,
                client: endpoint.sender(),
            },
        );
        info!(session_id = %id, subject = %principal.subject, transport = %transport, "Session establishing");

        let dial = inner.config.timeouts.dial;
        let grant = match tokio::time::timeout(dial, self.acquire(&id, forwarded_headers)).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(failure)) => {
                error!(session_id = %id, error = %failure, "Backend acquisition failed");
                state_tx.send_replace(SessionState::Closed(CloseReason::AcquireFailed(
                    failure.clone(),
                )));
                inner.sessions.lock().remove(&id);
                return Err(SessionError::Acquire(failure));
            }
            Err(_) => {
                error!(session_id = %id, timeout = ?dial, "Backend acquisition timed out");
                let failure = BackendFailure::Transport(TransportError::Timeout(dial));
                state_tx.send_replace(SessionState::Closed(CloseReason::AcquireFailed(failure)));
                inner.sessions.lock().remove(&id);
                self.detach_shared(&id, None).await;
                return Err(SessionError::AcquireTimeout(dial));
            }
        };

        state_tx.send_replace(SessionState::Active);
        info!(session_id = %id, backend = inner.config.backend.kind(), shared = inner.config.share_backend, "Session active");

        tokio::spawn(run_session(
            self.clone(),
            id,
            grant,
            client_channel,
            principal_rx,
            state_tx,
            last_activity,
        ));

        Ok(endpoint)
    }

    async fn acquire(
        &self,
        id: &SessionId,
        forwarded_headers: HeaderMap,
    ) -> std::result::Result<BackendGrant, BackendFailure> {
        let config = &self.inner.config;
        if !config.share_backend {
            let options = self.backend_options(forwarded_headers);
            let channel = BackendChannel::open(&config.backend, &options).await?;
            return Ok(BackendGrant::Exclusive(channel));
        }

        let mut shared = self.inner.shared.lock().await;
        if let Some(backend) = shared.as_ref() {
            let mut subscribers = backend.subscribers.lock();
            if subscribers.closed.is_none() {
                let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
                subscribers.sessions.insert(id.clone(), tx);
                debug!(session_id = %id, subscribers = subscribers.sessions.len(), "Joined shared backend");
                return Ok(BackendGrant::Shared {
                    backend: backend.clone(),
                    inbound: rx,
                });
            }
        }

        let options = self.backend_options(HeaderMap::new());
        let channel = BackendChannel::open(&config.backend, &options).await?;
        info!(backend = channel.kind(), "Opened shared backend channel");

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let backend = Arc::new(SharedBackend {
            sender: channel.sender(),
            subscribers: Mutex::new(Subscribers {
                sessions: HashMap::from([(id.clone(), tx)]),
                closed: None,
            }),
            closing: CancellationToken::new(),
            demux: Mutex::new(None),
        });
        let demux = tokio::spawn(run_demux(self.clone(), backend.clone(), channel));
        *backend.demux.lock() = Some(demux);
        *shared = Some(backend.clone());

        Ok(BackendGrant::Shared {
            backend,
            inbound: rx,
        })
    }

    fn backend_options(&self, forwarded_headers: HeaderMap) -> BackendOptions {
        let config = &self.inner.config;
        BackendOptions {
            timeouts: config.timeouts,
            reconnect: config.reconnect,
            capacity: config.channel_capacity,
            forwarded_headers,
        }
    }

    /// Drops `id` from the shared channel; the channel closes with its last subscriber.
    async fn detach_shared(&self, id: &SessionId, backend: Option<Arc<SharedBackend>>) {
        if !self.inner.config.share_backend {
            return;
        }
        let released = self.inner.routing.release_session(id);
        if released > 0 {
            debug!(session_id = %id, released, "Dropped pending routes");
        }

        let mut shared = self.inner.shared.lock().await;
        let Some(backend) = backend.or_else(|| shared.clone()) else {
            return;
        };
        let last = {
            let mut subscribers = backend.subscribers.lock();
            subscribers.sessions.remove(id);
            if subscribers.sessions.is_empty() && subscribers.closed.is_none() {
                subscribers.closed = Some(BackendFailure::Transport(TransportError::Closed));
            }
            subscribers.sessions.is_empty()
        };
        if last {
            debug!("Last session left the shared backend, closing it");
            backend.closing.cancel();
            if shared
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &backend))
            {
                *shared = None;
            }
        }
    }

    /// Extends a session's principal with a fresher token for the same subject.
    pub fn refresh_principal(&self, id: &SessionId, principal: &VerifiedPrincipal) -> Result<()> {
        let sessions = self.inner.sessions.lock();
        let entry = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if entry.subject != principal.subject {
            warn!(session_id = %id, "Token subject does not own this session");
            return Err(SessionError::SubjectMismatch);
        }
        entry.principal.send_if_modified(|current| {
            if principal.expires_at > current.expires_at {
                *current = principal.clone();
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// The handle a follow-up request uses to push client traffic into session `id`.
    pub fn client_sender(
        &self,
        id: &SessionId,
        principal: &VerifiedPrincipal,
    ) -> Result<ClientSender> {
        self.refresh_principal(id, principal)?;
        let sessions = self.inner.sessions.lock();
        let entry = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if entry.state.borrow().is_closed() || entry.client.is_closed() {
            return Err(SessionError::Closed(id.clone()));
        }
        Ok(entry.client.clone())
    }

    pub fn subscribe_state(&self, id: &SessionId) -> Option<watch::Receiver<SessionState>> {
        self.inner
            .sessions
            .lock()
            .get(id)
            .map(|entry| entry.state.clone())
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner
            .sessions
            .lock()
            .get(id)
            .map(|entry| snapshot_of(id, entry))
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.inner
            .sessions
            .lock()
            .iter()
            .map(|(id, entry)| snapshot_of(id, entry))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Closes every session and releases every backend channel.
    pub async fn shutdown(&self) {
        info!(sessions = self.session_count(), "Shutting down session multiplexer");
        self.inner.shutdown.cancel();

        let watchers: Vec<_> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|entry| entry.state.clone())
            .collect();
        let bound = self.inner.config.timeouts.process_exit * 2 + Duration::from_secs(1);
        for mut state in watchers {
            if tokio::time::timeout(bound, state.wait_for(SessionState::is_closed))
                .await
                .is_err()
            {
                warn!("Session did not close within the shutdown bound");
            }
        }

        let shared = self.inner.shared.lock().await.take();
        if let Some(backend) = shared {
            backend.closing.cancel();
            let demux = backend.demux.lock().take();
            if let Some(demux) = demux {
                if tokio::time::timeout(bound, demux).await.is_err() {
                    warn!("Shared backend did not close within the shutdown bound");
                }
            }
        }
    }
}

fn snapshot_of(id: &SessionId, entry: &SessionEntry) -> SessionSnapshot {
    SessionSnapshot {
        id: id.clone(),
        state: entry.state.borrow().clone(),
        subject: entry.subject.clone(),
        transport: entry.transport,
        created_at: entry.created_at,
        last_activity: *entry.last_activity.lock(),
    }
}

fn deadline_for(expires_at: SystemTime) -> Instant {
    let remaining = expires_at
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    Instant::now() + remaining
}

async fn run_session(
    mux: SessionMultiplexer,
    id: SessionId,
    mut grant: BackendGrant,
    mut client: ClientChannel,
    principal: watch::Receiver<VerifiedPrincipal>,
    state: watch::Sender<SessionState>,
    last_activity: Arc<Mutex<SystemTime>>,
) {
    let inner = mux.inner.clone();
    let idle = inner.config.timeouts.idle;
    let idle_deadline = tokio::time::sleep(idle);
    let expiry = tokio::time::sleep_until(deadline_for(principal.borrow().expires_at));
    tokio::pin!(idle_deadline, expiry);

    let touch = |deadline: std::pin::Pin<&mut tokio::time::Sleep>| {
        *last_activity.lock() = SystemTime::now();
        deadline.reset(Instant::now() + idle);
    };

    // Client traffic waits here for room on the backend channel, so backend traffic
    // keeps flowing to the client meanwhile.
    let sender = grant.sender(&id);
    let mut pending: Option<Message> = None;

    let reason = loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break CloseReason::Shutdown,
            event = client.receive(), if pending.is_none() => match event {
                ClientEvent::Message(message) => {
                    touch(idle_deadline.as_mut());
                    pending = Some(grant.prepare(&inner.routing, &id, message));
                }
                ClientEvent::Disconnected => break CloseReason::ClientDisconnected,
                ClientEvent::ProtocolError(detail) => break CloseReason::ClientProtocolError(detail),
            },
            permit = sender.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(message) = pending.take() {
                        permit.send(message);
                    }
                }
                Err(failure) => break CloseReason::Backend(failure),
            },
            event = grant.receive() => match event {
                BackendEvent::Message(message) => {
                    touch(idle_deadline.as_mut());
                    if client.send(message).is_err() {
                        break CloseReason::ClientDisconnected;
                    }
                }
                BackendEvent::Closed(failure) => break CloseReason::Backend(failure),
            },
            _ = &mut idle_deadline => break CloseReason::IdleTimeout,
            _ = &mut expiry => {
                let current = principal.borrow().expires_at;
                if SystemTime::now() >= current {
                    break CloseReason::PrincipalExpired;
                }
                debug!(session_id = %id, "Principal was refreshed, re-arming expiry");
                expiry.as_mut().reset(deadline_for(current));
            }
        }
    };

    info!(session_id = %id, reason = %reason, "Session ending");

    let drains = matches!(
        reason,
        CloseReason::ClientDisconnected
            | CloseReason::ClientProtocolError(_)
            | CloseReason::IdleTimeout
            | CloseReason::PrincipalExpired
    );
    if drains {
        state.send_replace(SessionState::Draining);
        drain(&inner, &id, &mut grant).await;
    }

    match grant {
        BackendGrant::Exclusive(channel) => {
            if let Err(e) = channel.close().await {
                warn!(session_id = %id, error = %e, "Backend channel release reported an error");
            }
        }
        BackendGrant::Shared { backend, .. } => mux.detach_shared(&id, Some(backend)).await,
    }

    client.close(reason.clone());
    inner.sessions.lock().remove(&id);
    state.send_replace(SessionState::Closed(reason));
    info!(session_id = %id, "Session closed");
}

/// Discards backend traffic for the drain grace period.
async fn drain(inner: &Inner, id: &SessionId, grant: &mut BackendGrant) {
    let grace = tokio::time::sleep(inner.config.timeouts.drain_grace);
    tokio::pin!(grace);
    let mut discarded = 0usize;
    loop {
        tokio::select! {
            _ = &mut grace => break,
            _ = inner.shutdown.cancelled() => break,
            event = grant.receive() => match event {
                BackendEvent::Message(_) => discarded += 1,
                BackendEvent::Closed(_) => break,
            },
        }
    }
    if discarded > 0 {
        debug!(session_id = %id, discarded, "Discarded backend messages while draining");
    }
}

/// Owns the shared channel's read side and hands each backend message to the
/// session its routing key names.
async fn run_demux(mux: SessionMultiplexer, backend: Arc<SharedBackend>, mut channel: BackendChannel) {
    let inner = mux.inner.clone();
    loop {
        tokio::select! {
            _ = backend.closing.cancelled() => break,
            event = channel.receive() => match event {
                BackendEvent::Message(message) => {
                    for part in message.split_batch() {
                        match inner.routing.route(&part) {
                            Ok((session, restored)) => {
                                let mut subscribers = backend.subscribers.lock();
                                let Some(tx) = subscribers.sessions.get(&session) else {
                                    warn!(session_id = %session, "Dropping response for departed session");
                                    continue;
                                };
                                match tx.try_send(BackendEvent::Message(restored)) {
                                    Ok(()) => {}
                                    Err(mpsc::error::TrySendError::Full(_)) => {
                                        warn!(session_id = %session, "Session fell behind the shared backend, detaching it");
                                        subscribers.sessions.remove(&session);
                                    }
                                    Err(mpsc::error::TrySendError::Closed(_)) => {
                                        debug!(session_id = %session, "Dropping response for closing session");
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "Dropping unroutable backend message"),
                        }
                    }
                }
                BackendEvent::Closed(failure) => {
                    error!(error = %failure, "Shared backend channel failed");
                    let mut subscribers = backend.subscribers.lock();
                    subscribers.closed = Some(failure.clone());
                    // A full queue drops the sender instead, which its session also reads as closed.
                    for (_, tx) in subscribers.sessions.drain() {
                        let _ = tx.try_send(BackendEvent::Closed(failure.clone()));
                    }
                    break;
                }
            },
        }
    }

    if let Err(e) = channel.close().await {
        warn!(error = %e, "Shared backend channel release reported an error");
    }
    debug!("Shared backend demultiplexer stopped");
}
