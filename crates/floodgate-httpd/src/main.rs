//! Demo HTTP server on the floodgate stack.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default port with one worker per core
//! floodgate-httpd
//!
//! # Small instance with tight limits
//! floodgate-httpd --port 8080 --workers 2 --max-connections 100
//! ```

use std::time::Duration;

use clap::Parser;
use floodgate_core::{
    CodecConduit, Conduit, ConnectionHandler, ConnectionId, Delegator, HandlerError, HandlerEvent,
    IoSystemConfig, ServerSettings, WorkerId,
};
use floodgate_http::{HttpRequest, HttpResponse, HttpServerCodec};
use floodgate_io::IoSystem;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Floodgate demo HTTP server
#[derive(Parser, Debug)]
#[command(name = "floodgate-httpd")]
#[command(about = "HTTP server on the floodgate event-driven core")]
#[command(version)]
struct Args {
    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    interface: String,

    /// Port to bind
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Worker pool size (0 = one per core)
    #[arg(short, long, default_value = "0")]
    workers: usize,

    /// Maximum concurrent connections
    #[arg(long, default_value = "1000")]
    max_connections: usize,

    /// Idle timeout in seconds under normal volume
    #[arg(long, default_value = "60")]
    max_idle_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct HelloHandler;

impl ConnectionHandler for HelloHandler {
    type Msg = HttpRequest;
    type Reply = HttpResponse;

    fn on_message(
        &mut self,
        request: HttpRequest,
    ) -> Result<Vec<HandlerEvent<HttpResponse>>, HandlerError> {
        let body = format!("hello from floodgate: {}\n", request.path);
        let response = HttpResponse::ok(body).with_header("Server", "floodgate-httpd");
        Ok(vec![HandlerEvent::Send(response)])
    }
}

struct HelloDelegator;

impl Delegator for HelloDelegator {
    fn accept_new_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn Conduit>> {
        Some(CodecConduit::boxed(HttpServerCodec::new(), HelloHandler))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = IoSystemConfig::new("floodgate-httpd");
    if args.workers > 0 {
        config = config.with_num_workers(args.workers);
    }
    let system = IoSystem::start(config)?;

    let settings = ServerSettings::new("web", args.port)
        .with_interface(args.interface)
        .with_max_connections(args.max_connections)
        .with_max_idle_time(Duration::from_secs(args.max_idle_secs));

    let server = system
        .attach_server(settings, |_worker: WorkerId| Box::new(HelloDelegator) as Box<dyn Delegator>)?;

    let addr = server.bound().await?;
    tracing::info!(%addr, "serving");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted; draining");
    system.shutdown().await;

    Ok(())
}
