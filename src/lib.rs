/**
 * MCP Auth Proxy Library
 *
 * An OAuth 2.0 protected resource in front of an MCP server:
 * 1. Bearer tokens are verified against the issuer's JWKS before any session opens
 * 2. Clients speak SSE, Streamable HTTP or line-delimited stdio over TCP
 * 3. Backends are reached over HTTP, SSE or a spawned stdio process
 */
pub mod auth;
pub mod channel;
pub mod child_process;
pub mod config;
pub mod gate;
pub mod http_client;
pub mod jwks;
mod lanes;
pub mod message;
pub mod metadata;
pub mod routing;
pub mod server;
pub mod session;
pub mod sse_client;
pub mod sse_server;
pub mod stdio_bridge;
pub mod streamable_http_server;
pub mod utils;

pub use self::auth::{AuthError, TokenVerifier, VerifiedPrincipal};
pub use self::channel::{BackendChannel, ClientEndpoint, CloseReason, SessionId};
pub use self::config::{
    BackendTarget, ClientTransportKind, IssuerConfig, ProxyConfig, ResourceConfig,
    StdioServerParameters,
};
pub use self::gate::AuthGate;
pub use self::jwks::JwksCache;
pub use self::metadata::MetadataPublisher;
pub use self::server::{router, run, ProxyState, ServerError};
pub use self::session::{SessionMultiplexer, SessionState};
