use async_stream::stream;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{sse::Event, IntoResponse, Response},
    routing::post,
    Extension, Router,
};
use futures::Stream;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    auth::VerifiedPrincipal,
    channel::{ClientDelivery, ClientSender, SessionId},
    config::ClientTransportKind,
    http_client::forwardable_headers,
    message::{id_key, Message},
    session::SessionMultiplexer,
    sse_server::{session_error_response, sse_response},
    utils::MCP_SESSION_ID_HEADER,
};

pub const MCP_PATH: &str = "/mcp";

/// Settings for the Streamable HTTP transport
#[derive(Clone)]
pub struct StreamableHttpState {
    mux: SessionMultiplexer,
    keep_alive: Option<Duration>,
    sessions: Arc<Mutex<HashMap<SessionId, Arc<StreamSession>>>>,
}

impl StreamableHttpState {
    pub fn new(mux: SessionMultiplexer, keep_alive: Option<Duration>) -> Self {
        Self {
            mux,
            keep_alive,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn router(state: StreamableHttpState) -> Router {
    Router::new()
        .route(
            MCP_PATH,
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .with_state(state)
}

/// Where messages from the session go: the POST stream waiting on their id, else
/// the standalone GET stream, else the most recent POST stream still open.
#[derive(Default)]
struct Routes {
    pending: HashMap<String, mpsc::UnboundedSender<Message>>,
    standalone: Option<mpsc::UnboundedSender<Message>>,
    latest: Option<mpsc::UnboundedSender<Message>>,
}

struct StreamSession {
    sender: ClientSender,
    routes: Mutex<Routes>,
}

impl StreamSession {
    fn register(&self, request_ids: &[serde_json::Value], stream: mpsc::UnboundedSender<Message>) {
        let mut routes = self.routes.lock();
        for id in request_ids {
            routes.pending.insert(id_key(id), stream.clone());
        }
        routes.latest = Some(stream);
    }

    fn unregister(&self, request_ids: &[serde_json::Value]) {
        let mut routes = self.routes.lock();
        for id in request_ids {
            routes.pending.remove(&id_key(id));
        }
    }

    fn dispatch(&self, message: Message) {
        let mut routes = self.routes.lock();

        let response_ids = message.response_ids();
        let waiting = response_ids
            .iter()
            .find_map(|id| routes.pending.get(&id_key(id)).cloned());
        if let Some(stream) = waiting {
            for id in &response_ids {
                routes.pending.remove(&id_key(id));
            }
            let _ = stream.send(message);
            return;
        }

        let fallback = [routes.standalone.as_ref(), routes.latest.as_ref()]
            .into_iter()
            .flatten()
            .find(|stream| !stream.is_closed())
            .cloned();
        match fallback {
            Some(stream) => {
                let _ = stream.send(message);
            }
            None => debug!("No open stream for server message, dropping it"),
        }
    }

    fn close_streams(&self) {
        let mut routes = self.routes.lock();
        routes.pending.clear();
        routes.standalone = None;
        routes.latest = None;
    }
}

/// Releases a POST stream's request ids when the stream goes away, answered or not.
struct PendingRoutes {
    session: Arc<StreamSession>,
    request_ids: Vec<serde_json::Value>,
}

impl Drop for PendingRoutes {
    fn drop(&mut self) {
        self.session.unregister(&self.request_ids);
    }
}

/// The SSE body of a POST: ends once every request in it has been answered.
fn post_events(
    session: Arc<StreamSession>,
    request_ids: Vec<serde_json::Value>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let mut outstanding: HashSet<String> = request_ids.iter().map(id_key).collect();
    let pending = PendingRoutes {
        session,
        request_ids,
    };
    stream! {
        let _pending = pending;
        while let Some(message) = rx.recv().await {
            for id in message.response_ids() {
                outstanding.remove(&id_key(&id));
            }
            yield Ok::<_, Infallible>(Event::default().event("message").data(message.to_line()));
            if outstanding.is_empty() {
                break;
            }
        }
    }
}

fn session_header(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(SessionId::from)
}

fn with_session_header(mut response: Response, session_id: &SessionId) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(MCP_SESSION_ID_HEADER), value);
    }
    response
}

impl StreamableHttpState {
    fn lookup(
        &self,
        session_id: &SessionId,
        principal: &VerifiedPrincipal,
    ) -> Result<Arc<StreamSession>, Response> {
        let session = self.sessions.lock().get(session_id).cloned();
        let Some(session) = session else {
            return Err((StatusCode::NOT_FOUND, "Unknown session").into_response());
        };
        self.mux
            .refresh_principal(session_id, principal)
            .map_err(|e| session_error_response(&e))?;
        Ok(session)
    }

    async fn open(
        &self,
        principal: VerifiedPrincipal,
        headers: &HeaderMap,
    ) -> Result<(SessionId, Arc<StreamSession>), Response> {
        let endpoint = self
            .mux
            .open_session(
                principal,
                ClientTransportKind::StreamableHttp,
                forwardable_headers(headers),
            )
            .await
            .map_err(|e| session_error_response(&e))?;

        let session_id = endpoint.session_id().clone();
        let (sender, mut deliveries) = endpoint.into_parts();
        let session = Arc::new(StreamSession {
            sender,
            routes: Mutex::new(Routes::default()),
        });
        self.sessions
            .lock()
            .insert(session_id.clone(), session.clone());
        info!(session_id = %session_id, "Streamable HTTP session opened");

        let sessions = self.sessions.clone();
        let dispatcher_session = session.clone();
        let dispatcher_id = session_id.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    ClientDelivery::Message(message) => dispatcher_session.dispatch(message),
                    ClientDelivery::Closed(reason) => {
                        info!(session_id = %dispatcher_id, reason = %reason, "Streamable HTTP session closed");
                        break;
                    }
                }
            }
            dispatcher_session.close_streams();
            sessions.lock().remove(&dispatcher_id);
        });

        Ok((session_id, session))
    }
}

async fn handle_post(
    State(state): State<StreamableHttpState>,
    Extension(principal): Extension<VerifiedPrincipal>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let message = Message::new(body);
    if message.is_blank() {
        return (StatusCode::BAD_REQUEST, "Empty message").into_response();
    }

    let opened = match session_header(&headers) {
        Some(session_id) => state
            .lookup(&session_id, &principal)
            .map(|session| (session_id, session)),
        None => state.open(principal, &headers).await,
    };
    let (session_id, session) = match opened {
        Ok(opened) => opened,
        Err(response) => return response,
    };

    let request_ids = message.request_ids();
    if request_ids.is_empty() {
        return match session.sender.send(message).await {
            Ok(()) => with_session_header(StatusCode::ACCEPTED.into_response(), &session_id),
            Err(_) => (StatusCode::GONE, "Session closed").into_response(),
        };
    }

    let (tx, rx) = mpsc::unbounded_channel();
    session.register(&request_ids, tx);
    if let Err(e) = session.sender.send(message).await {
        warn!(session_id = %session_id, error = %e, "Session stopped accepting messages");
        session.unregister(&request_ids);
        return (StatusCode::GONE, "Session closed").into_response();
    }

    let events = post_events(session, request_ids, rx);
    with_session_header(sse_response(events, state.keep_alive), &session_id)
}

/// Opens the standalone stream for server-initiated messages.
async fn handle_get(
    State(state): State<StreamableHttpState>,
    Extension(principal): Extension<VerifiedPrincipal>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    let session = match state.lookup(&session_id, &principal) {
        Ok(session) => session,
        Err(response) => return response,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    session.routes.lock().standalone = Some(tx);
    debug!(session_id = %session_id, "Standalone stream opened");

    let events = UnboundedReceiverStream::new(rx).map(|message: Message| {
        Ok::<_, Infallible>(Event::default().event("message").data(message.to_line()))
    });
    with_session_header(sse_response(events, state.keep_alive), &session_id)
}

async fn handle_delete(
    State(state): State<StreamableHttpState>,
    Extension(principal): Extension<VerifiedPrincipal>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    let session = match state.lookup(&session_id, &principal) {
        Ok(session) => session,
        Err(response) => return response,
    };

    info!(session_id = %session_id, "Client ended Streamable HTTP session");
    session.sender.disconnect().await;
    state.sessions.lock().remove(&session_id);
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::client_pair;

    fn stream_session() -> Arc<StreamSession> {
        let (_channel, endpoint) = client_pair(SessionId::from("s1"), 4);
        Arc::new(StreamSession {
            sender: endpoint.sender(),
            routes: Mutex::new(Routes::default()),
        })
    }

    #[test]
    fn dropped_post_stream_releases_its_request_ids() {
        let session = stream_session();
        let (standalone, mut standalone_rx) = mpsc::unbounded_channel();
        session.routes.lock().standalone = Some(standalone);

        let request_ids = vec![serde_json::json!(1), serde_json::json!("two")];
        let (tx, rx) = mpsc::unbounded_channel();
        session.register(&request_ids, tx);
        assert_eq!(session.routes.lock().pending.len(), 2);

        // The client went away before any answer arrived.
        drop(post_events(session.clone(), request_ids, rx));
        assert!(session.routes.lock().pending.is_empty());

        // A late answer now reaches the standalone stream instead of vanishing.
        session.dispatch(Message::from(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#));
        assert_eq!(
            standalone_rx.try_recv().map(|message| message.into_string()),
            Ok(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string())
        );
    }
}
