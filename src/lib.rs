//! natsmd-rs: subject-based pub/sub over a NATS-style text protocol
//!
//! The crate is split into I/O-free engines and thin tokio drivers:
//!
//! - [`server::NatsService`] handles one server-side connection: it parses
//!   client commands, keeps the connection's subscription registry and turns
//!   publishes from other connections into `MSG` deliveries.
//! - [`client::NatsClient`] is the client-side counterpart: it allocates
//!   sids, suppresses duplicate wildcard deliveries and splits or joins
//!   payloads larger than the server's `max_payload`.
//! - [`route::RouteFabric`] is the seam between connections. The bundled
//!   [`route::LocalFabric`] routes within one process.
//!
//! # Server
//!
//! ```no_run
//! use natsmd_rs::{NatsServer, ServerConfig};
//! use natsmd_rs::server::AcceptAll;
//!
//! # async fn example() -> natsmd_rs::Result<()> {
//! let config = ServerConfig::default().bind("127.0.0.1:4222".parse().unwrap());
//! let server = NatsServer::new(config, AcceptAll);
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await
//! # }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod server;
pub mod session;
pub mod stats;

pub use client::{ClientConfig, ClientEvent, NatsClient, NatsSubscriber};
pub use error::{Error, Result};
pub use protocol::Subject;
pub use registry::SubscriptionMap;
pub use route::{LocalFabric, RouteFabric};
pub use server::{NatsHandler, NatsServer, ServerConfig};
