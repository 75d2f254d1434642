use axum::{
    http::{HeaderName, HeaderValue},
    middleware,
    routing::get,
    Router,
};
use std::{io, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::{
    auth::TokenVerifier,
    config::{ClientTransportKind, ConfigError, ProxyConfig},
    gate::{require_bearer, AuthGate},
    jwks::{JwksCache, JwksError},
    metadata::{self, MetadataPublisher},
    session::{MultiplexerConfig, SessionMultiplexer},
    sse_server::{self, SseServerState},
    stdio_bridge::StdioBridge,
    streamable_http_server::{self, StreamableHttpState},
    utils::MCP_SESSION_ID_HEADER,
};

pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Jwks(#[from] JwksError),
    #[error("failed to encode resource metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Everything the routes share, built once from a validated [`ProxyConfig`].
pub struct ProxyState {
    config: ProxyConfig,
    publisher: Arc<MetadataPublisher>,
    gate: Arc<AuthGate>,
    mux: SessionMultiplexer,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(JwksCache::new(
            config.jwks_cache_ttl,
            config.jwks_fetch_timeout,
        )?);
        let verifier = Arc::new(TokenVerifier::new(config.issuer.clone(), cache));
        let publisher = Arc::new(MetadataPublisher::new(&config.resource, &config.issuer)?);
        let gate = Arc::new(AuthGate::new(verifier, publisher.well_known_url()));
        let mux = SessionMultiplexer::new(MultiplexerConfig::from(&config));

        Ok(Self {
            config,
            publisher,
            gate,
            mux,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<AuthGate> {
        &self.gate
    }

    pub fn publisher(&self) -> &Arc<MetadataPublisher> {
        &self.publisher
    }

    pub fn mux(&self) -> &SessionMultiplexer {
        &self.mux
    }
}

/// Assembles the HTTP surface: health and discovery are public, the transport routes
/// sit behind the Auth Gate.
pub fn router(state: &ProxyState) -> Router {
    let config = &state.config;
    let transport = match config.client_transport {
        ClientTransportKind::Sse => sse_server::router(SseServerState {
            mux: state.mux.clone(),
            keep_alive: config.sse_keep_alive,
        }),
        ClientTransportKind::StreamableHttp => streamable_http_server::router(
            StreamableHttpState::new(state.mux.clone(), config.sse_keep_alive),
        ),
        ClientTransportKind::StdioBridge => Router::new(),
    }
    .layer(middleware::from_fn_with_state(
        state.gate.clone(),
        require_bearer,
    ));

    let app = Router::new()
        .route(HEALTH_PATH, get(|| async { "MCP Auth Proxy" }))
        .merge(metadata::router(state.publisher.clone()))
        .merge(transport);

    match cors_layer(&config.cors_allowed_origins) {
        Some(cors) => app.layer(cors),
        None => app,
    }
}

fn cors_layer(allowed_origins: &[String]) -> Option<CorsLayer> {
    if allowed_origins.is_empty() {
        return None;
    }

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            http::header::WWW_AUTHENTICATE,
            HeaderName::from_static(MCP_SESSION_ID_HEADER),
        ]);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return Some(cors.allow_origin(Any));
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    Some(cors.allow_origin(origins))
}

/// Serves until Ctrl+C or SIGTERM, then closes every session.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let state = ProxyState::new(config)?;
    let shutdown_token = CancellationToken::new();

    let bind_addr = state.config.bind_addr;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;
    let actual_addr = listener.local_addr().map_err(ServerError::Serve)?;
    info!(
        transport = %state.config.client_transport,
        backend = state.config.backend.kind(),
        "MCP auth proxy listening on http://{}",
        actual_addr
    );
    info!(
        "Protected resource metadata at {}",
        state.publisher.well_known_url()
    );

    let bridge = match state.config.bridge_addr {
        Some(addr) if state.config.client_transport == ClientTransportKind::StdioBridge => {
            let bridge = StdioBridge::bind(
                addr,
                state.gate.clone(),
                state.mux.clone(),
                state.config.timeouts.dial,
            )
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
            Some(tokio::spawn(bridge.serve(shutdown_token.clone())))
        }
        _ => None,
    };

    // Open event streams only end once their sessions close, so sessions must be
    // closed while the server is still draining connections.
    let closer = {
        let mux = state.mux.clone();
        let shutdown_token = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_token.cancelled().await;
            info!("Starting graceful shutdown...");
            mux.shutdown().await;
        })
    };

    let app = router(&state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_token.clone()))
        .await;
    if let Err(e) = &result {
        warn!("Server error: {}", e);
    }

    shutdown_token.cancel();
    if let Some(bridge) = bridge {
        let _ = bridge.await;
    }
    let _ = closer.await;
    info!("Shutdown complete");

    result.map_err(ServerError::Serve)
}

async fn shutdown_signal(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating shutdown...");
        },
        _ = shutdown_token.cancelled() => {},
    }

    shutdown_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_only_when_origins_configured() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["*".to_string()]).is_some());
        assert!(cors_layer(&["https://app.example.com".to_string()]).is_some());
    }
}
