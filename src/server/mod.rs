//! Server implementation
//!
//! `NatsServer` accepts TCP connections; each runs a `Connection` task
//! driving its own `NatsService` engine. Connections reach each other only
//! through the shared routing fabric.

pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod service;

pub use config::ServerConfig;
pub use connection::Connection;
pub use handler::{AcceptAll, NatsHandler};
pub use listener::NatsServer;
pub use service::{Delivery, NatsService, ServiceEvent};
