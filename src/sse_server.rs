/**
 * Client-facing SSE transport.
 *
 * `GET /sse` opens a session and streams it back as server-sent events; the first
 * event, `endpoint`, names the URL the client POSTs its own messages to.
 */
use async_stream::stream;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Router,
};
use futures::Stream;
use serde::Deserialize;
use std::{convert::Infallible, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    auth::VerifiedPrincipal,
    channel::{ClientDelivery, ClientSender, SessionId},
    config::ClientTransportKind,
    http_client::forwardable_headers,
    message::Message,
    session::{SessionError, SessionMultiplexer},
};

pub const SSE_PATH: &str = "/sse";
pub const MESSAGE_PATH: &str = "/message";

/// Settings for the SSE transport
#[derive(Clone)]
pub struct SseServerState {
    pub mux: SessionMultiplexer,
    pub keep_alive: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub session_id: String,
}

pub fn router(state: SseServerState) -> Router {
    Router::new()
        .route(SSE_PATH, get(open_stream))
        .route(MESSAGE_PATH, post(post_message))
        .with_state(state)
}

/// Reports the client gone when the response stream is dropped.
struct DisconnectGuard(ClientSender);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        debug!(session_id = %self.0.session_id(), "SSE stream dropped");
        self.0.disconnect_now();
    }
}

async fn open_stream(
    State(state): State<SseServerState>,
    Extension(principal): Extension<VerifiedPrincipal>,
    headers: HeaderMap,
) -> Response {
    let endpoint = match state
        .mux
        .open_session(principal, ClientTransportKind::Sse, forwardable_headers(&headers))
        .await
    {
        Ok(endpoint) => endpoint,
        Err(e) => return session_error_response(&e),
    };

    let session_id = endpoint.session_id().clone();
    info!(session_id = %session_id, "SSE client connected");

    let (sender, mut deliveries) = endpoint.into_parts();
    let events = stream! {
        let _guard = DisconnectGuard(sender);
        yield Ok::<_, Infallible>(
            Event::default()
                .event("endpoint")
                .data(format!("{MESSAGE_PATH}?sessionId={session_id}")),
        );
        while let Some(delivery) = deliveries.recv().await {
            match delivery {
                ClientDelivery::Message(message) => {
                    yield Ok(Event::default().event("message").data(message.to_line()));
                }
                ClientDelivery::Closed(reason) => {
                    info!(session_id = %session_id, reason = %reason, "Ending SSE stream");
                    break;
                }
            }
        }
    };

    sse_response(events, state.keep_alive)
}

pub(crate) fn sse_response<S>(events: S, keep_alive: Option<Duration>) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    match keep_alive {
        Some(interval) => Sse::new(events)
            .keep_alive(KeepAlive::new().interval(interval))
            .into_response(),
        None => Sse::new(events).into_response(),
    }
}

async fn post_message(
    State(state): State<SseServerState>,
    Extension(principal): Extension<VerifiedPrincipal>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let session_id = SessionId::from(query.session_id);
    let sender = match state.mux.client_sender(&session_id, &principal) {
        Ok(sender) => sender,
        Err(e) => return session_error_response(&e),
    };

    let message = Message::new(body);
    if message.is_blank() {
        return (StatusCode::BAD_REQUEST, "Empty message").into_response();
    }

    match sender.send(message).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Session stopped accepting messages");
            (StatusCode::GONE, "Session closed").into_response()
        }
    }
}

/// Maps a multiplexer refusal onto an HTTP status.
pub(crate) fn session_error_response(error: &SessionError) -> Response {
    let status = match error {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::SubjectMismatch => StatusCode::FORBIDDEN,
        SessionError::Closed(_) => StatusCode::GONE,
        SessionError::PrincipalExpired(_) => StatusCode::UNAUTHORIZED,
        SessionError::Acquire(_) | SessionError::AcquireTimeout(_) => StatusCode::BAD_GATEWAY,
        SessionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        warn!(error = %error, "Session request failed");
    } else {
        debug!(error = %error, "Session request refused");
    }
    (status, error.to_string()).into_response()
}
