use eventsource_stream::Eventsource;
use futures::StreamExt;
use http::header;
use reqwest::Client as HttpClient;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::{BackendEvent, BackendOptions, BackendSender, Outbound, TransportError};
use crate::config::ReconnectPolicy;
use crate::lanes::run_lanes;
use crate::message::{jsonrpc_error, Message, INTERNAL_ERROR};
use crate::utils::next_backoff;

/**
 * SSE-proxied backend.
 *
 * A long-lived GET carries server-to-client messages; the server announces the URL
 * that client-to-server messages are POSTed to in an `endpoint` event. A dropped
 * stream is redialed with capped exponential backoff.
 */
pub struct SseBackend {
    url: Url,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Receiver<BackendEvent>,
    closing: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SseBackend {
    /// Connects and waits, up to the dial timeout, for the message endpoint.
    pub async fn open(url: Url, options: &BackendOptions) -> Result<Self, TransportError> {
        let client = HttpClient::builder()
            .connect_timeout(options.timeouts.dial)
            .default_headers(options.forwarded_headers.clone())
            .build()
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        info!(url = %url, "Connecting to SSE backend");

        let capacity = options.capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (endpoint_tx, mut endpoint_rx) = watch::channel(None);
        let closing = CancellationToken::new();

        let reader = tokio::spawn(run_event_stream(
            client.clone(),
            url.clone(),
            options.reconnect,
            endpoint_tx,
            events_tx.clone(),
            closing.clone(),
        ));

        let announced = match tokio::time::timeout(
            options.timeouts.dial,
            endpoint_rx.wait_for(|endpoint: &Option<Url>| endpoint.is_some()),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Dial(format!(
                "{url} closed before announcing a message endpoint"
            ))),
            Err(_) => Err(TransportError::Timeout(options.timeouts.dial)),
        };
        if let Err(e) = announced {
            closing.cancel();
            return Err(e);
        }

        let request_timeout = options.timeouts.request;
        let deliver = move |message: Message| {
            post_message(
                client.clone(),
                endpoint_rx.clone(),
                message,
                events_tx.clone(),
                request_timeout,
            )
        };
        let writer = tokio::spawn(run_lanes(outbound_rx, closing.clone(), deliver));

        Ok(Self {
            url,
            outbound: outbound_tx,
            events: events_rx,
            closing,
            tasks: vec![reader, writer],
        })
    }

    pub fn sender(&self) -> BackendSender {
        BackendSender::new(self.outbound.clone())
    }

    pub async fn receive(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }

    pub async fn close(self) {
        debug!(url = %self.url, "Closing SSE backend");
        self.closing.cancel();
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(url = %self.url, "SSE backend task did not stop in time");
            }
        }
    }
}

async fn run_event_stream(
    client: HttpClient,
    url: Url,
    policy: ReconnectPolicy,
    endpoint: watch::Sender<Option<Url>>,
    events: mpsc::Sender<BackendEvent>,
    closing: CancellationToken,
) {
    let mut attempts = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        let response = tokio::select! {
            _ = closing.cancelled() => return,
            response = client
                .get(url.clone())
                .header(header::ACCEPT, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .send() => response,
        };

        let last_error = match response {
            Ok(response) if response.status().is_success() => {
                let mut stream = response.bytes_stream().eventsource();
                loop {
                    let next = tokio::select! {
                        _ = closing.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => match event.event.as_str() {
                            "endpoint" => match url.join(event.data.trim()) {
                                Ok(message_url) => {
                                    info!(endpoint = %message_url, "SSE backend announced message endpoint");
                                    endpoint.send_replace(Some(message_url));
                                    attempts = 0;
                                    delay = policy.initial_delay;
                                }
                                Err(e) => {
                                    warn!(data = %event.data, error = %e, "Ignoring unusable endpoint event");
                                }
                            },
                            "message" | "" => {
                                let sent = tokio::select! {
                                    _ = closing.cancelled() => return,
                                    sent = events.send(BackendEvent::Message(Message::new(event.data))) => sent,
                                };
                                if sent.is_err() {
                                    return;
                                }
                            }
                            other => debug!(event = %other, "Ignoring SSE backend event"),
                        },
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                }
            }
            Ok(response) => format!("status {}", response.status()),
            Err(e) => e.to_string(),
        };

        // The old message endpoint belongs to the dropped stream.
        endpoint.send_replace(None);
        attempts += 1;
        if attempts > policy.max_attempts {
            error!(url = %url, attempts, error = %last_error, "Giving up on SSE backend");
            let failure = TransportError::ConnectionLost(last_error);
            let _ = events.send(BackendEvent::Closed(failure.into())).await;
            return;
        }

        warn!(url = %url, attempt = attempts, delay = ?delay, error = %last_error, "SSE backend stream dropped, redialing");
        tokio::select! {
            _ = closing.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_backoff(delay, policy.max_delay);
    }
}

/// POSTs one message to the announced endpoint, waiting for one to be announced if
/// the stream is being redialed. Requests that fail are answered with an error.
async fn post_message(
    client: HttpClient,
    mut endpoint: watch::Receiver<Option<Url>>,
    message: Message,
    events: mpsc::Sender<BackendEvent>,
    request_timeout: Duration,
) {
    let target = match endpoint.wait_for(|endpoint| endpoint.is_some()).await {
        Ok(target) => target.clone(),
        Err(_) => return,
    };
    let Some(target) = target else { return };

    let request_ids = message.request_ids();
    let sent = tokio::time::timeout(
        request_timeout,
        client
            .post(target.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(message.into_string())
            .send(),
    )
    .await;

    let failure = match sent {
        Ok(Ok(response)) if response.status().is_success() => return,
        Ok(Ok(response)) => format!("Backend returned HTTP {}", response.status()),
        Ok(Err(e)) => format!("Failed to deliver message: {e}"),
        Err(_) => format!("Backend did not accept the message within {request_timeout:?}"),
    };
    warn!(endpoint = %target, error = %failure, "SSE backend message POST failed");
    for id in &request_ids {
        let error = jsonrpc_error(id, INTERNAL_ERROR, &failure);
        if events.send(BackendEvent::Message(error)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BackendChannel, BackendFailure};
    use crate::config::{BackendTarget, Timeouts};
    use http::HeaderMap;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(reconnect: ReconnectPolicy) -> BackendOptions {
        BackendOptions {
            timeouts: Timeouts {
                dial: Duration::from_secs(2),
                ..Timeouts::default()
            },
            reconnect,
            capacity: 16,
            forwarded_headers: HeaderMap::new(),
        }
    }

    fn quick_reconnect(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn relays_messages_and_posts_to_announced_endpoint() {
        let server = MockServer::start().await;
        let stream = "event: endpoint\ndata: /messages?session=abc\n\n\
                      event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"hello\"}\n\n";
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(stream),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_string(r#"{"jsonrpc":"2.0","method":"notify"}"#))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let target = BackendTarget::Sse {
            url: Url::parse(&format!("{}/sse", server.uri())).unwrap(),
        };
        let mut channel = BackendChannel::open(&target, &options(quick_reconnect(50)))
            .await
            .unwrap();

        assert_eq!(
            channel.receive().await,
            BackendEvent::Message(Message::from(r#"{"jsonrpc":"2.0","method":"hello"}"#))
        );

        channel
            .send(Message::from(r#"{"jsonrpc":"2.0","method":"notify"}"#))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("event: endpoint\ndata: /messages\n\n"),
            )
            .mount(&server)
            .await;

        let target = BackendTarget::Sse {
            url: Url::parse(&format!("{}/sse", server.uri())).unwrap(),
        };
        let mut channel = BackendChannel::open(&target, &options(quick_reconnect(2)))
            .await
            .unwrap();

        // Every redial announces the endpoint again, which resets the attempt count, so the
        // stream is made to fail before announcing anything.
        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let event = tokio::time::timeout(Duration::from_secs(5), channel.receive())
            .await
            .unwrap();
        assert!(matches!(
            event,
            BackendEvent::Closed(BackendFailure::Transport(TransportError::ConnectionLost(_)))
        ));
    }

    #[tokio::test]
    async fn missing_endpoint_fails_the_dial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let target = BackendTarget::Sse {
            url: Url::parse(&format!("{}/sse", server.uri())).unwrap(),
        };
        let result = BackendChannel::open(&target, &options(quick_reconnect(1))).await;
        assert!(matches!(
            result,
            Err(BackendFailure::Transport(TransportError::Dial(_)))
        ));
    }
}
