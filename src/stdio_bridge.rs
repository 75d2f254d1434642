//! Line-delimited bridge for clients that only speak stdio.
//!
//! A local helper (for example `nc`) connects over TCP, sends its credentials as
//! the first line, then exchanges newline-delimited JSON-RPC with the session.

use http::HeaderMap;
use serde_json::json;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    channel::ClientDelivery,
    config::ClientTransportKind,
    gate::AuthGate,
    message::Message,
    session::SessionMultiplexer,
};

pub struct StdioBridge {
    listener: TcpListener,
    gate: Arc<AuthGate>,
    mux: SessionMultiplexer,
    handshake_timeout: Duration,
}

impl StdioBridge {
    pub async fn bind(
        addr: SocketAddr,
        gate: Arc<AuthGate>,
        mux: SessionMultiplexer,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gate,
            mux,
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!("Stdio bridge listening on {}", addr),
            Err(e) => warn!(error = %e, "Stdio bridge listening on an unknown address"),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let gate = self.gate.clone();
                    let mux = self.mux.clone();
                    let handshake_timeout = self.handshake_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, gate, mux, handshake_timeout).await {
                            debug!(%peer, error = %e, "Bridge connection ended with an I/O error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Failed to accept bridge connection"),
            }
        }
        info!("Stdio bridge stopped accepting connections");
    }
}

/// Accepts `Authorization: Bearer <token>` as well as the bare `Bearer <token>`.
fn credentials_from_line(line: &str) -> &str {
    let line = line.trim();
    match line.split_once(':') {
        Some((name, value)) if name.trim().eq_ignore_ascii_case("authorization") => value.trim(),
        _ => line,
    }
}

async fn write_refusal(
    writer: &mut OwnedWriteHalf,
    error: &str,
    description: String,
    challenge: Option<String>,
) -> io::Result<()> {
    let mut body = json!({
        "error": error,
        "error_description": description,
    });
    if let Some(challenge) = challenge {
        body["www_authenticate"] = json!(challenge);
    }
    let mut line = body.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.shutdown().await
}

async fn handle_connection(
    stream: TcpStream,
    gate: Arc<AuthGate>,
    mux: SessionMultiplexer,
    handshake_timeout: Duration,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let first_line = match tokio::time::timeout(handshake_timeout, lines.next_line()).await {
        Ok(line) => line?,
        Err(_) => {
            debug!("Bridge client sent no credentials in time");
            None
        }
    };

    let principal = match gate
        .authorize_credentials(first_line.as_deref().map(credentials_from_line))
        .await
    {
        Ok(principal) => principal,
        Err(rejection) => {
            let challenge = gate.challenge(&rejection);
            return write_refusal(
                &mut writer,
                "invalid_token",
                rejection.description(),
                Some(challenge),
            )
            .await;
        }
    };

    let endpoint = match mux
        .open_session(principal, ClientTransportKind::StdioBridge, HeaderMap::new())
        .await
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            return write_refusal(&mut writer, "session_unavailable", e.to_string(), None).await;
        }
    };

    let session_id = endpoint.session_id().clone();
    info!(session_id = %session_id, "Bridge client connected");
    let (sender, mut deliveries) = endpoint.into_parts();

    let mut relay_out = tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            match delivery {
                ClientDelivery::Message(message) => {
                    let mut line = message.to_line();
                    line.push('\n');
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                ClientDelivery::Closed(reason) => {
                    debug!(reason = %reason, "Bridge session closed");
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    let client_sender = sender.clone();
    let relay_in = async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let message = Message::new(line);
                    if message.is_blank() {
                        continue;
                    }
                    if client_sender.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    client_sender.disconnect().await;
                    break;
                }
                Err(e) => {
                    client_sender.protocol_error(e.to_string()).await;
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = &mut relay_out => {}
        _ = relay_in => {
            let _ = relay_out.await;
        }
    }
    sender.disconnect_now();
    info!(session_id = %session_id, "Bridge client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_line_forms() {
        assert_eq!(credentials_from_line("Bearer abc\r"), "Bearer abc");
        assert_eq!(
            credentials_from_line("authorization: Bearer abc"),
            "Bearer abc"
        );
        assert_eq!(
            credentials_from_line("Authorization:Bearer abc"),
            "Bearer abc"
        );
        assert_eq!(credentials_from_line("Basic Zm9v"), "Basic Zm9v");
    }
}
