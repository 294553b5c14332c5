//! Pub/sub client
//!
//! Provides the client side of the protocol:
//! - `NatsClient`: the I/O-free engine (sid allocation, wildcard dedup,
//!   fragmentation and reassembly)
//! - `NatsConnector`: the engine bound to a socket
//! - `NatsSubscriber`: a background task with an event channel

pub mod config;
pub mod connector;
pub mod dedup;
pub mod engine;
pub mod subscriber;

pub use config::ClientConfig;
pub use connector::NatsConnector;
pub use dedup::{Verdict, WildcardIndex};
pub use engine::{ClientEvent, ClientPhase, NatsClient};
pub use subscriber::NatsSubscriber;
