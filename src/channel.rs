//! Channel contracts shared by the client-side adapters, the backend variants and the
//! session multiplexer.
//!
//! Client side: an adapter holds a [`ClientEndpoint`], the multiplexer holds the
//! matching [`ClientChannel`]. Backend side: [`BackendChannel`] is a closed set of
//! variants sharing `open`/`send`/`receive`/`close`.

use http::HeaderMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::child_process::StdioBackend;
use crate::config::{BackendTarget, ReconnectPolicy, Timeouts};
use crate::http_client::HttpBackend;
use crate::message::Message;
use crate::sse_client::SseBackend;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("failed to reach backend: {0}")]
    Dial(String),
    #[error("backend protocol violation: {0}")]
    Protocol(String),
    #[error("backend connection lost: {0}")]
    ConnectionLost(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("process exited unexpectedly (exit code {code:?})")]
    UnexpectedExit { code: Option<i32> },
    #[error("process closed its output stream")]
    StreamClosed,
    #[error("process did not exit within {0:?} and was killed")]
    ForcedKill(Duration),
    #[error("process I/O error: {0}")]
    Io(String),
}

/// Why a backend channel stopped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Why a session ended. Delivered to the client adapter and published through the
/// session state watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    ClientProtocolError(String),
    IdleTimeout,
    PrincipalExpired,
    Backend(BackendFailure),
    AcquireFailed(BackendFailure),
    Shutdown,
}

impl CloseReason {
    pub fn process_error(&self) -> Option<&ProcessError> {
        match self {
            Self::Backend(BackendFailure::Process(e))
            | Self::AcquireFailed(BackendFailure::Process(e)) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => f.write_str("client disconnected"),
            Self::ClientProtocolError(detail) => write!(f, "client protocol error: {detail}"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::PrincipalExpired => f.write_str("principal expired"),
            Self::Backend(e) => write!(f, "backend failure: {e}"),
            Self::AcquireFailed(e) => write!(f, "backend acquisition failed: {e}"),
            Self::Shutdown => f.write_str("proxy shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a client adapter reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Message(Message),
    Disconnected,
    ProtocolError(String),
}

/// What a session delivers to its client adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientDelivery {
    Message(Message),
    Closed(CloseReason),
}

/// Creates the two halves of a client channel for `session_id`.
pub fn client_pair(session_id: SessionId, capacity: usize) -> (ClientChannel, ClientEndpoint) {
    let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
    let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
    (
        ClientChannel {
            session_id: session_id.clone(),
            events: events_rx,
            deliveries: deliveries_tx,
        },
        ClientEndpoint {
            session_id: session_id.clone(),
            sender: ClientSender {
                session_id,
                events: events_tx,
            },
            deliveries: deliveries_rx,
        },
    )
}

/// The multiplexer's half of a client channel.
pub struct ClientChannel {
    session_id: SessionId,
    events: mpsc::Receiver<ClientEvent>,
    deliveries: mpsc::UnboundedSender<ClientDelivery>,
}

impl ClientChannel {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Delivers a backend message to the client.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.deliveries
            .send(ClientDelivery::Message(message))
            .map_err(|_| TransportError::ClientDisconnected)
    }

    /// Next message from the client. A vanished adapter reads as a disconnect.
    pub async fn receive(&mut self) -> ClientEvent {
        self.events.recv().await.unwrap_or(ClientEvent::Disconnected)
    }

    pub fn close(self, reason: CloseReason) {
        if self.deliveries.send(ClientDelivery::Closed(reason)).is_err() {
            debug!(session_id = %self.session_id, "Client adapter already gone at close");
        }
    }
}

/// Cloneable handle an adapter uses to push client traffic into its session.
#[derive(Clone, Debug)]
pub struct ClientSender {
    session_id: SessionId,
    events: mpsc::Sender<ClientEvent>,
}

impl ClientSender {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.events
            .send(ClientEvent::Message(message))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn disconnect(&self) {
        let _ = self.events.send(ClientEvent::Disconnected).await;
    }

    pub async fn protocol_error(&self, detail: impl Into<String>) {
        let _ = self
            .events
            .send(ClientEvent::ProtocolError(detail.into()))
            .await;
    }

    /// Reports a disconnect from synchronous code such as a `Drop` impl.
    pub fn disconnect_now(&self) {
        match self.events.try_send(ClientEvent::Disconnected) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let events = self.events.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = events.send(ClientEvent::Disconnected).await;
                    });
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// The adapter's half of a client channel.
pub struct ClientEndpoint {
    session_id: SessionId,
    sender: ClientSender,
    deliveries: mpsc::UnboundedReceiver<ClientDelivery>,
}

impl ClientEndpoint {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn sender(&self) -> ClientSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.sender.send(message).await
    }

    /// Next delivery from the session; `None` once the session is gone.
    pub async fn receive(&mut self) -> Option<ClientDelivery> {
        self.deliveries.recv().await
    }

    pub fn into_parts(self) -> (ClientSender, mpsc::UnboundedReceiver<ClientDelivery>) {
        (self.sender, self.deliveries)
    }
}

/// Settings used when a backend channel is opened.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub timeouts: Timeouts,
    pub reconnect: ReconnectPolicy,
    pub capacity: usize,
    /// Client request headers relayed to HTTP backends, already stripped of
    /// credentials and hop-by-hop headers.
    pub forwarded_headers: HeaderMap,
}

/// What a backend channel produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Message(Message),
    Closed(BackendFailure),
}

/// A message on its way to a backend, tagged with the session whose send order it
/// keeps. Untagged messages all share one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub session: Option<SessionId>,
    pub message: Message,
}

/// Cloneable write handle onto a backend channel.
#[derive(Clone, Debug)]
pub struct BackendSender {
    outbound: mpsc::Sender<Outbound>,
    session: Option<SessionId>,
}

impl BackendSender {
    pub(crate) fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            outbound,
            session: None,
        }
    }

    /// The same channel, with everything sent through it ordered as `session`.
    pub fn for_session(&self, session: SessionId) -> Self {
        Self {
            outbound: self.outbound.clone(),
            session: Some(session),
        }
    }

    pub async fn send(&self, message: Message) -> Result<(), BackendFailure> {
        self.outbound
            .send(Outbound {
                session: self.session.clone(),
                message,
            })
            .await
            .map_err(|_| BackendFailure::Transport(TransportError::Closed))
    }

    /// Waits for room on the channel without committing a message to it.
    pub async fn reserve(&self) -> Result<BackendPermit<'_>, BackendFailure> {
        let permit = self
            .outbound
            .reserve()
            .await
            .map_err(|_| BackendFailure::Transport(TransportError::Closed))?;
        Ok(BackendPermit {
            permit,
            session: self.session.as_ref(),
        })
    }
}

/// Room for one message, obtained from [`BackendSender::reserve`].
pub struct BackendPermit<'a> {
    permit: mpsc::Permit<'a, Outbound>,
    session: Option<&'a SessionId>,
}

impl BackendPermit<'_> {
    pub fn send(self, message: Message) {
        self.permit.send(Outbound {
            session: self.session.cloned(),
            message,
        });
    }
}

/// A channel to the backend, one variant per backend transport.
pub enum BackendChannel {
    Http(HttpBackend),
    Sse(SseBackend),
    Stdio(StdioBackend),
}

impl BackendChannel {
    /// Dials or spawns the backend described by `target`.
    pub async fn open(
        target: &BackendTarget,
        options: &BackendOptions,
    ) -> Result<Self, BackendFailure> {
        match target {
            BackendTarget::Http { url } => Ok(Self::Http(HttpBackend::open(url.clone(), options)?)),
            BackendTarget::Sse { url } => Ok(Self::Sse(SseBackend::open(url.clone(), options).await?)),
            BackendTarget::Stdio(params) => Ok(Self::Stdio(StdioBackend::spawn(params, options)?)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Sse(_) => "sse",
            Self::Stdio(_) => "stdio",
        }
    }

    pub fn sender(&self) -> BackendSender {
        match self {
            Self::Http(backend) => backend.sender(),
            Self::Sse(backend) => backend.sender(),
            Self::Stdio(backend) => backend.sender(),
        }
    }

    pub async fn send(&self, message: Message) -> Result<(), BackendFailure> {
        self.sender().send(message).await
    }

    /// Next event from the backend. Once the channel has failed this keeps
    /// returning `Closed`.
    pub async fn receive(&mut self) -> BackendEvent {
        let next = match self {
            Self::Http(backend) => backend.receive().await,
            Self::Sse(backend) => backend.receive().await,
            Self::Stdio(backend) => backend.receive().await,
        };
        next.unwrap_or(BackendEvent::Closed(BackendFailure::Transport(
            TransportError::Closed,
        )))
    }

    /// Releases the channel. For processes this waits for exit and reports a
    /// forced kill as an error.
    pub async fn close(self) -> Result<(), BackendFailure> {
        match self {
            Self::Http(backend) => {
                backend.close().await;
                Ok(())
            }
            Self::Sse(backend) => {
                backend.close().await;
                Ok(())
            }
            Self::Stdio(backend) => backend.close().await.map_err(BackendFailure::from),
        }
    }
}
