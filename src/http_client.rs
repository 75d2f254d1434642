use eventsource_stream::Eventsource;
use futures::StreamExt;
use http::header::{self, HeaderMap, HeaderValue};
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::{BackendEvent, BackendOptions, BackendSender, Outbound, TransportError};
use crate::lanes::run_lanes;
use crate::message::{jsonrpc_error, Message, INTERNAL_ERROR};
use crate::utils::MCP_SESSION_ID_HEADER;

/// Headers never relayed from a client request to an HTTP backend: credentials the
/// proxy owns, hop-by-hop headers and the ones the backend channel sets itself.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "host",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-type",
    "accept",
    "accept-encoding",
    MCP_SESSION_ID_HEADER,
];

/// Copies the client headers an HTTP backend may see.
pub fn forwardable_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in incoming {
        if STRIPPED_HEADERS.contains(&name.as_str()) || name.as_str().starts_with("proxy-") {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// HTTP-proxied backend: each outbound message is POSTed to a fixed URL and the
/// response body, JSON or an event stream, becomes inbound messages. Each session's
/// messages are POSTed in order; sessions sharing the channel run side by side.
pub struct HttpBackend {
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Receiver<BackendEvent>,
    closing: CancellationToken,
    writer: JoinHandle<()>,
    poster: Arc<Poster>,
}

struct Poster {
    client: HttpClient,
    url: Url,
    headers: HeaderMap,
    request_timeout: Duration,
    backend_session: parking_lot::RwLock<Option<HeaderValue>>,
}

impl HttpBackend {
    pub fn open(url: Url, options: &BackendOptions) -> Result<Self, TransportError> {
        let client = HttpClient::builder()
            .connect_timeout(options.timeouts.dial)
            .build()
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        info!(url = %url, "Opening HTTP backend channel");

        let capacity = options.capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let closing = CancellationToken::new();
        let poster = Arc::new(Poster {
            client,
            url,
            headers: options.forwarded_headers.clone(),
            request_timeout: options.timeouts.request,
            backend_session: parking_lot::RwLock::new(None),
        });

        let deliver = {
            let poster = poster.clone();
            let closing = closing.clone();
            move |message: Message| {
                let poster = poster.clone();
                let events = events_tx.clone();
                let closing = closing.clone();
                async move { poster.deliver(message, &events, &closing).await }
            }
        };
        let writer = tokio::spawn(run_lanes(outbound_rx, closing.clone(), deliver));

        Ok(Self {
            outbound: outbound_tx,
            events: events_rx,
            closing,
            writer,
            poster,
        })
    }

    pub fn sender(&self) -> BackendSender {
        BackendSender::new(self.outbound.clone())
    }

    pub async fn receive(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }

    /// Stops the writer and ends any backend-side session with a best-effort DELETE.
    pub async fn close(self) {
        self.closing.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.writer)
            .await
            .is_err()
        {
            warn!(url = %self.poster.url, "HTTP backend writer did not stop in time");
        }

        let session = self.poster.backend_session.read().clone();
        if let Some(session) = session {
            let result = self
                .poster
                .client
                .delete(self.poster.url.clone())
                .header(MCP_SESSION_ID_HEADER, session)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match result {
                Ok(response) => debug!(status = %response.status(), "Ended backend HTTP session"),
                Err(e) => debug!(error = %e, "Failed to end backend HTTP session"),
            }
        }
    }
}

impl Poster {
    /// POSTs one message. A connection failure ends the whole channel.
    async fn deliver(
        &self,
        message: Message,
        events: &mpsc::Sender<BackendEvent>,
        closing: &CancellationToken,
    ) {
        let Err(failure) = self.post(message, events, closing).await else {
            return;
        };
        if closing.is_cancelled() {
            return;
        }
        error!(url = %self.url, error = %failure, "HTTP backend connection failed");
        closing.cancel();
        let _ = events.send(BackendEvent::Closed(failure.into())).await;
    }

    /// Answers every request in a message that got no usable reply.
    async fn answer_with_error(
        &self,
        request_ids: &[serde_json::Value],
        reason: &str,
        events: &mpsc::Sender<BackendEvent>,
    ) {
        for id in request_ids {
            let error = jsonrpc_error(id, INTERNAL_ERROR, reason);
            if events.send(BackendEvent::Message(error)).await.is_err() {
                return;
            }
        }
    }

    async fn post(
        &self,
        message: Message,
        events: &mpsc::Sender<BackendEvent>,
        closing: &CancellationToken,
    ) -> Result<(), TransportError> {
        let request_ids = message.request_ids();

        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream");
        if let Some(session) = self.backend_session.read().clone() {
            request = request.header(MCP_SESSION_ID_HEADER, session);
        }

        let sent = tokio::time::timeout(
            self.request_timeout,
            request.body(message.into_string()).send(),
        )
        .await;
        let response = match sent {
            Ok(response) => response.map_err(|e| TransportError::ConnectionLost(e.to_string()))?,
            Err(_) => {
                warn!(url = %self.url, timeout = ?self.request_timeout, "Backend did not answer in time");
                let reason = format!("Backend did not answer within {:?}", self.request_timeout);
                self.answer_with_error(&request_ids, &reason, events).await;
                return Ok(());
            }
        };

        if let Some(session) = response.headers().get(MCP_SESSION_ID_HEADER) {
            let mut current = self.backend_session.write();
            if current.as_ref() != Some(session) {
                debug!(url = %self.url, "Backend assigned an HTTP session");
                *current = Some(session.clone());
            }
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        if !status.is_success() {
            warn!(url = %self.url, status = %status, "Backend rejected message");
            let reason = format!("Backend returned HTTP {status}");
            self.answer_with_error(&request_ids, &reason, events).await;
            return Ok(());
        }

        let is_event_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        if is_event_stream {
            // Streamed responses may stay open while the backend waits on the
            // client, so they are read off the writer's path.
            tokio::spawn(relay_event_stream(
                response,
                events.clone(),
                closing.clone(),
                self.url.clone(),
            ));
            return Ok(());
        }

        let body = match tokio::time::timeout(self.request_timeout, response.text()).await {
            Ok(body) => body.map_err(|e| TransportError::ConnectionLost(e.to_string()))?,
            Err(_) => {
                warn!(url = %self.url, timeout = ?self.request_timeout, "Backend response body stalled");
                let reason = format!("Backend did not answer within {:?}", self.request_timeout);
                self.answer_with_error(&request_ids, &reason, events).await;
                return Ok(());
            }
        };
        if body.trim().is_empty() {
            return Ok(());
        }
        for message in Message::new(body).split_batch() {
            if events.send(BackendEvent::Message(message)).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

async fn relay_event_stream(
    response: reqwest::Response,
    events: mpsc::Sender<BackendEvent>,
    closing: CancellationToken,
    url: Url,
) {
    let mut stream = response.bytes_stream().eventsource();
    loop {
        let next = tokio::select! {
            _ = closing.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if event.event != "message" && !event.event.is_empty() {
                    debug!(event = %event.event, "Ignoring backend event");
                    continue;
                }
                if event.data.trim().is_empty() {
                    continue;
                }
                if events
                    .send(BackendEvent::Message(Message::new(event.data)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(url = %url, error = %e, "Backend response stream failed");
                return;
            }
            None => return,
        }
    }
}
