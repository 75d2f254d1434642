use jsonwebtoken::Algorithm;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::utils::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_CLOCK_SKEW, DEFAULT_DIAL_TIMEOUT, DEFAULT_DRAIN_GRACE,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_JWKS_CACHE_TTL, DEFAULT_JWKS_FETCH_TIMEOUT,
    DEFAULT_PROCESS_EXIT_TIMEOUT, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INITIAL,
    DEFAULT_RECONNECT_MAX, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SSE_KEEP_ALIVE,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {field} URL: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("JWKS URI must use https unless it points at a loopback host: {0}")]
    InsecureJwksUri(String),
    #[error("Algorithm {0:?} is not an asymmetric signing algorithm")]
    SymmetricAlgorithm(Algorithm),
    #[error("At least one signing algorithm must be allowed")]
    NoAlgorithms,
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),
    #[error("Missing {0}")]
    Missing(&'static str),
    #[error("Invalid value: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Transport spoken between MCP clients and this proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientTransportKind {
    Sse,
    StreamableHttp,
    StdioBridge,
}

impl FromStr for ClientTransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sse" => Ok(Self::Sse),
            "streamable-http" => Ok(Self::StreamableHttp),
            "stdio-bridge" | "stdio" => Ok(Self::StdioBridge),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

impl fmt::Display for ClientTransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sse => f.write_str("sse"),
            Self::StreamableHttp => f.write_str("streamable-http"),
            Self::StdioBridge => f.write_str("stdio-bridge"),
        }
    }
}

/// StdioServerParameters holds what is needed to spawn a stdio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioServerParameters {
    pub command: String,
    pub args: Vec<String>,
    /// Merged over the inherited environment of the proxy.
    pub env: HashMap<String, String>,
}

impl StdioServerParameters {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Where protocol traffic is relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    Http { url: Url },
    Sse { url: Url },
    Stdio(StdioServerParameters),
}

impl BackendTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
            Self::Stdio(_) => "stdio",
        }
    }
}

/// Issuer settings shared read-only by the token verifier.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    pub issuer: String,
    pub jwks_uri: Url,
    pub audience: String,
    pub clock_skew: Duration,
    pub allowed_algorithms: Vec<Algorithm>,
}

impl IssuerConfig {
    /// Builds a config whose JWKS URI defaults to `{issuer}/.well-known/jwks.json`.
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Result<Self> {
        let issuer = issuer.into();
        let jwks_uri = Url::parse(&format!(
            "{}/.well-known/jwks.json",
            issuer.trim_end_matches('/')
        ))
        .map_err(|source| ConfigError::InvalidUrl {
            field: "issuer",
            source,
        })?;

        Ok(Self {
            issuer,
            jwks_uri,
            audience: audience.into(),
            clock_skew: DEFAULT_CLOCK_SKEW,
            allowed_algorithms: default_algorithms(),
        })
    }

    pub fn with_jwks_uri(mut self, jwks_uri: &str) -> Result<Self> {
        self.jwks_uri = Url::parse(jwks_uri).map_err(|source| ConfigError::InvalidUrl {
            field: "JWKS",
            source,
        })?;
        Ok(self)
    }

    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.allowed_algorithms = algorithms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.issuer.is_empty() {
            return Err(ConfigError::Missing("issuer"));
        }
        if self.audience.is_empty() {
            return Err(ConfigError::Missing("audience"));
        }
        if self.jwks_uri.scheme() != "https" && !is_loopback(&self.jwks_uri) {
            return Err(ConfigError::InsecureJwksUri(self.jwks_uri.to_string()));
        }
        if self.allowed_algorithms.is_empty() {
            return Err(ConfigError::NoAlgorithms);
        }
        if let Some(alg) = self
            .allowed_algorithms
            .iter()
            .find(|alg| !is_asymmetric(**alg))
        {
            return Err(ConfigError::SymmetricAlgorithm(*alg));
        }
        Ok(())
    }
}

pub fn default_algorithms() -> Vec<Algorithm> {
    vec![
        Algorithm::RS256,
        Algorithm::RS384,
        Algorithm::RS512,
        Algorithm::PS256,
        Algorithm::PS384,
        Algorithm::PS512,
        Algorithm::ES256,
        Algorithm::ES384,
        Algorithm::EdDSA,
    ]
}

pub fn is_asymmetric(alg: Algorithm) -> bool {
    !matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

/// What the published protected-resource metadata says about this server.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub resource: Url,
    pub authorization_servers: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub resource_documentation: Option<String>,
}

impl ResourceConfig {
    pub fn new(resource: &str) -> Result<Self> {
        let resource = Url::parse(resource).map_err(|source| ConfigError::InvalidUrl {
            field: "resource",
            source,
        })?;
        // The metadata routes are built from this path, and the router reads these
        // characters as captures and wildcards.
        let route_syntax = resource.path().split('/').any(|segment| {
            segment.starts_with(':') || segment.starts_with('*') || segment.contains(['{', '}'])
        });
        if route_syntax {
            return Err(ConfigError::Invalid(format!(
                "resource path {:?} contains route pattern syntax",
                resource.path()
            )));
        }
        Ok(Self {
            resource,
            authorization_servers: Vec::new(),
            scopes_supported: Vec::new(),
            resource_documentation: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Backend dial or spawn.
    pub dial: Duration,
    /// Wait for a spawned process to exit before it is killed.
    pub process_exit: Duration,
    /// Active sessions without traffic for this long start draining.
    pub idle: Duration,
    /// Draining sessions discard backend traffic for this long before closing.
    pub drain_grace: Duration,
    /// One HTTP request to a backend, up to its response headers or JSON body.
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dial: DEFAULT_DIAL_TIMEOUT,
            process_exit: DEFAULT_PROCESS_EXIT_TIMEOUT,
            idle: DEFAULT_IDLE_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
            request: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Redial policy for SSE backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_RECONNECT_INITIAL,
            max_delay: DEFAULT_RECONNECT_MAX,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }
}

/// Everything the proxy needs, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    /// Required when the client transport is the stdio bridge.
    pub bridge_addr: Option<SocketAddr>,
    pub client_transport: ClientTransportKind,
    pub backend: BackendTarget,
    pub share_backend: bool,
    pub issuer: IssuerConfig,
    pub resource: ResourceConfig,
    pub cors_allowed_origins: Vec<String>,
    pub timeouts: Timeouts,
    pub reconnect: ReconnectPolicy,
    pub sse_keep_alive: Option<Duration>,
    pub jwks_cache_ttl: Duration,
    pub jwks_fetch_timeout: Duration,
    pub channel_capacity: usize,
}

impl ProxyConfig {
    pub fn new(
        bind_addr: SocketAddr,
        client_transport: ClientTransportKind,
        backend: BackendTarget,
        issuer: IssuerConfig,
        resource: ResourceConfig,
    ) -> Self {
        Self {
            bind_addr,
            bridge_addr: None,
            client_transport,
            backend,
            share_backend: false,
            issuer,
            resource,
            cors_allowed_origins: Vec::new(),
            timeouts: Timeouts::default(),
            reconnect: ReconnectPolicy::default(),
            sse_keep_alive: Some(DEFAULT_SSE_KEEP_ALIVE),
            jwks_cache_ttl: DEFAULT_JWKS_CACHE_TTL,
            jwks_fetch_timeout: DEFAULT_JWKS_FETCH_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.issuer.validate()?;

        if let BackendTarget::Stdio(params) = &self.backend {
            if params.command.trim().is_empty() {
                return Err(ConfigError::Missing("backend command"));
            }
        }

        if self.client_transport == ClientTransportKind::StdioBridge && self.bridge_addr.is_none()
        {
            return Err(ConfigError::Missing("stdio bridge listen address"));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel capacity must be at least 1".to_string(),
            ));
        }

        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(ConfigError::Invalid(
                "reconnect initial delay exceeds its cap".to_string(),
            ));
        }

        for (name, value) in [
            ("dial timeout", self.timeouts.dial),
            ("process exit timeout", self.timeouts.process_exit),
            ("idle timeout", self.timeouts.idle),
            ("request timeout", self.timeouts.request),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }
}
