//! Simple pub/sub server example
//!
//! Run with: cargo run --example simple_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example simple_server                    # binds to 0.0.0.0:4222
//!   cargo run --example simple_server localhost          # binds to 127.0.0.1:4222
//!   cargo run --example simple_server 127.0.0.1:4333     # binds to 127.0.0.1:4333
//!
//! ## Talking to it
//!
//! With telnet or nc:
//!   nc localhost 4222
//!   SUB foo.* 1
//!   PUB foo.bar 5
//!   hello
//!
//! Or run the subscriber example against it:
//!   cargo run --example subscriber -- localhost 'foo.>'

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use natsmd_rs::session::SessionContext;
use natsmd_rs::{NatsHandler, NatsServer, ServerConfig};

/// Handler that logs connections and keeps totals
struct LoggingHandler {
    connections: AtomicU64,
    msgs_received: AtomicU64,
    msgs_sent: AtomicU64,
}

impl LoggingHandler {
    fn new() -> Self {
        Self {
            connections: AtomicU64::new(0),
            msgs_received: AtomicU64::new(0),
            msgs_sent: AtomicU64::new(0),
        }
    }

    fn print_stats(&self) {
        println!(
            "Stats: connections={} published={} delivered={}",
            self.connections.load(Ordering::Relaxed),
            self.msgs_received.load(Ordering::Relaxed),
            self.msgs_sent.load(Ordering::Relaxed),
        );
    }
}

impl NatsHandler for LoggingHandler {
    async fn on_connect(&self, ctx: &SessionContext) -> bool {
        self.connections.fetch_add(1, Ordering::Relaxed);
        println!(
            "[{}] Connect from {}: name={:?} user={:?} implicit={}",
            ctx.session_id,
            ctx.peer_addr,
            ctx.name(),
            ctx.user(),
            ctx.implicit
        );

        // Example: require a token
        // if ctx.auth_token() != Some("secret") {
        //     return false;
        // }

        true
    }

    async fn on_disconnect(&self, ctx: &SessionContext) {
        self.msgs_received
            .fetch_add(ctx.stats.msgs_received, Ordering::Relaxed);
        self.msgs_sent.fetch_add(ctx.stats.msgs_sent, Ordering::Relaxed);
        println!(
            "[{}] Disconnected after {:?}: in={} out={} ({} bps)",
            ctx.session_id,
            ctx.stats.duration,
            ctx.stats.msgs_received,
            ctx.stats.msgs_sent,
            ctx.stats.receive_bitrate()
        );
        self.print_stats();
    }
}

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:4222
/// - "127.0.0.1" -> 127.0.0.1:4222
/// - "127.0.0.1:4333" -> 127.0.0.1:4333
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 4222;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: simple_server [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:4222)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ServerConfig::default();
    if let Some(addr_str) = args.get(1) {
        match parse_bind_addr(addr_str) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("natsmd_rs=debug".parse()?)
                .add_directive("simple_server=debug".parse()?),
        )
        .init();

    println!("Starting pub/sub server on {}", config.bind_addr);

    let server = NatsServer::new(config, LoggingHandler::new());
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await?;

    let stats = server.stats();
    println!(
        "Served {} connections ({} rejected) in {:?}",
        stats.total_connections,
        stats.rejected_connections,
        stats.uptime()
    );

    Ok(())
}
