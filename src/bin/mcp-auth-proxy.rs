/**
 * The entry point for the mcp-auth-proxy application.
 * It sets up logging, builds the configuration and runs the proxy.
 */
use clap::Parser;
use jsonwebtoken::Algorithm;
use mcp_auth_proxy::{
    config::{ReconnectPolicy, Timeouts},
    run, BackendTarget, ClientTransportKind, IssuerConfig, ProxyConfig, ResourceConfig,
    StdioServerParameters,
};
use std::{error::Error, net::SocketAddr, str::FromStr, time::Duration};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

/// MCP Auth Proxy CLI arguments
#[derive(Parser)]
#[command(
    name = "mcp-auth-proxy",
    version = env!("CARGO_PKG_VERSION"),
    about = concat!("MCP Auth Proxy v", env!("CARGO_PKG_VERSION"), ". Put an MCP server behind OAuth 2.0 bearer token verification."),
    long_about = None,
    after_help = "Examples:\n  \
        Protect a local stdio server, exposed over SSE:\n  \
        mcp-auth-proxy --issuer https://auth.example.com --audience https://mcp.example.com \\\n      \
        --resource https://mcp.example.com --port 8080 -- python mcp_server.py\n\n  \
        Protect a remote Streamable HTTP server:\n  \
        mcp-auth-proxy http://localhost:9000/mcp --client-transport streamable-http \\\n      \
        --issuer https://auth.example.com --audience mcp --resource https://mcp.example.com\n\n  \
        Accept stdio clients over TCP, one shared backend process:\n  \
        mcp-auth-proxy --client-transport stdio-bridge --bridge-port 7000 --share-backend \\\n      \
        --issuer https://auth.example.com --audience mcp --resource https://mcp.example.com -- your-command
",
)]
struct Cli {
    /// Backend command or URL. A URL is proxied over HTTP (or SSE), anything else
    /// is spawned and spoken to over stdio.
    #[arg(env = "MCP_BACKEND")]
    command_or_url: Option<String>,

    /// Any extra arguments to the backend command
    #[arg(last = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Environment variables merged over the inherited environment of the backend
    /// command. Can be used multiple times.
    #[arg(short = 'e', long = "env", value_names = ["KEY", "VALUE"], number_of_values = 2)]
    env_vars: Vec<String>,

    /// Backend transport for URLs. Options: auto, http, sse
    #[arg(long = "backend-transport", default_value = "auto")]
    backend_transport: String,

    /// Transport offered to clients. Options: sse, streamable-http, stdio-bridge
    #[arg(long = "client-transport", env = "MCP_CLIENT_TRANSPORT", default_value = "sse")]
    client_transport: String,

    /// Port to listen on for HTTP. Default is a random port
    #[arg(long = "port", env = "PORT", default_value = "0")]
    port: u16,

    /// Host to listen on. Default is 127.0.0.1
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Port for the stdio bridge listener
    #[arg(long = "bridge-port")]
    bridge_port: Option<u16>,

    /// Route every session through one backend channel
    #[arg(long = "share-backend")]
    share_backend: bool,

    /// Token issuer URL
    #[arg(long = "issuer", env = "OAUTH_ISSUER")]
    issuer: String,

    /// JWKS URI. Defaults to {issuer}/.well-known/jwks.json
    #[arg(long = "jwks-uri", env = "OAUTH_JWKS_URI")]
    jwks_uri: Option<String>,

    /// Audience tokens must carry
    #[arg(long = "audience", env = "OAUTH_AUDIENCE")]
    audience: String,

    /// Allowed clock skew in seconds
    #[arg(long = "clock-skew", default_value = "60")]
    clock_skew: u64,

    /// Allowed signing algorithms. Can be used multiple times
    #[arg(long = "algorithm")]
    algorithms: Vec<String>,

    /// Seconds a fetched JWKS stays fresh
    #[arg(long = "jwks-cache-ttl", default_value = "600")]
    jwks_cache_ttl: u64,

    /// Resource URL published in the protected resource metadata
    #[arg(long = "resource", env = "OAUTH_RESOURCE")]
    resource: String,

    /// Authorization servers to advertise. Defaults to the issuer
    #[arg(long = "authorization-server")]
    authorization_servers: Vec<String>,

    /// Scopes to advertise
    #[arg(long = "scope")]
    scopes: Vec<String>,

    /// Resource documentation URL
    #[arg(long = "resource-documentation")]
    resource_documentation: Option<String>,

    /// Allowed CORS origin, or * for any. Can be used multiple times
    #[arg(long = "cors-origin", env = "CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// Seconds to wait for a backend to connect or start
    #[arg(long = "dial-timeout", default_value = "30")]
    dial_timeout: u64,

    /// Seconds to wait for a backend process to exit before killing it
    #[arg(long = "process-exit-timeout", default_value = "5")]
    process_exit_timeout: u64,

    /// Seconds without traffic before a session is closed
    #[arg(long = "idle-timeout", default_value = "1800")]
    idle_timeout: u64,

    /// Milliseconds a closing session keeps discarding backend output
    #[arg(long = "drain-grace-ms", default_value = "2000")]
    drain_grace_ms: u64,

    /// Seconds an HTTP or SSE backend has to answer one request
    #[arg(long = "request-timeout", default_value = "60")]
    request_timeout: u64,

    /// Seconds between SSE keep-alive comments, 0 to disable
    #[arg(long = "keep-alive", default_value = "15")]
    keep_alive: u64,

    /// Milliseconds before the first SSE backend redial
    #[arg(long = "reconnect-initial-ms", default_value = "500")]
    reconnect_initial_ms: u64,

    /// Upper bound in milliseconds between SSE backend redials
    #[arg(long = "reconnect-max-ms", default_value = "30000")]
    reconnect_max_ms: u64,

    /// Redials before an SSE backend is given up on
    #[arg(long = "reconnect-attempts", default_value = "5")]
    reconnect_attempts: u32,
}

fn backend_target(cli: &mut Cli) -> Result<BackendTarget, Box<dyn Error>> {
    // Check if we have a command or URL, or use the first of the passed args
    let command_or_url = match cli.command_or_url.take() {
        Some(value) => value,
        None if !cli.args.is_empty() => cli.args.remove(0),
        None => return Err("command or URL is required".into()),
    };

    if command_or_url.starts_with("http://") || command_or_url.starts_with("https://") {
        let url = Url::parse(&command_or_url)?;
        let transport = match cli.backend_transport.as_str() {
            "auto" if url.path().ends_with("/sse") => "sse",
            "auto" => "http",
            other => other,
        };
        return match transport {
            "sse" => Ok(BackendTarget::Sse { url }),
            "http" | "streamable-http" => Ok(BackendTarget::Http { url }),
            other => Err(format!("unsupported backend transport: {other}").into()),
        };
    }

    let mut params = StdioServerParameters::new(command_or_url);
    params.args = std::mem::take(&mut cli.args);
    for pair in cli.env_vars.chunks_exact(2) {
        params.env.insert(pair[0].clone(), pair[1].clone());
    }
    Ok(BackendTarget::Stdio(params))
}

fn proxy_config(mut cli: Cli) -> Result<ProxyConfig, Box<dyn Error>> {
    let backend = backend_target(&mut cli)?;
    let client_transport = ClientTransportKind::from_str(&cli.client_transport)?;

    let mut issuer = IssuerConfig::new(&cli.issuer, &cli.audience)?
        .with_clock_skew(Duration::from_secs(cli.clock_skew));
    if let Some(jwks_uri) = &cli.jwks_uri {
        issuer = issuer.with_jwks_uri(jwks_uri)?;
    }
    if !cli.algorithms.is_empty() {
        let algorithms = cli
            .algorithms
            .iter()
            .map(|alg| Algorithm::from_str(alg))
            .collect::<Result<Vec<_>, _>>()?;
        issuer = issuer.with_algorithms(algorithms);
    }

    let mut resource = ResourceConfig::new(&cli.resource)?;
    resource.authorization_servers = cli.authorization_servers;
    resource.scopes_supported = cli.scopes;
    resource.resource_documentation = cli.resource_documentation;

    let bind_addr = format!("{}:{}", cli.host, cli.port).parse::<SocketAddr>()?;
    let mut config = ProxyConfig::new(bind_addr, client_transport, backend, issuer, resource);
    config.bridge_addr = cli
        .bridge_port
        .map(|port| format!("{}:{}", cli.host, port).parse::<SocketAddr>())
        .transpose()?;
    config.share_backend = cli.share_backend;
    config.cors_allowed_origins = cli.cors_origins;
    config.jwks_cache_ttl = Duration::from_secs(cli.jwks_cache_ttl);
    config.sse_keep_alive = (cli.keep_alive > 0).then(|| Duration::from_secs(cli.keep_alive));
    config.timeouts = Timeouts {
        dial: Duration::from_secs(cli.dial_timeout),
        process_exit: Duration::from_secs(cli.process_exit_timeout),
        idle: Duration::from_secs(cli.idle_timeout),
        drain_grace: Duration::from_millis(cli.drain_grace_ms),
        request: Duration::from_secs(cli.request_timeout),
    };
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(cli.reconnect_initial_ms),
        max_delay: Duration::from_millis(cli.reconnect_max_ms),
        max_attempts: cli.reconnect_attempts,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging; stdout may belong to a stdio client
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match proxy_config(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    debug!(
        transport = %config.client_transport,
        backend = config.backend.kind(),
        shared = config.share_backend,
        "Starting MCP auth proxy"
    );
    run(config).await?;
    Ok(())
}
