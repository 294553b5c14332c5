//! Protocol frames and handshake bodies
//!
//! Every frame owns its fields as `Bytes` sliced from the read buffer, so a
//! frame stays valid after the buffer is reused.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::{DEFAULT_MAX_PAYLOAD, DEFAULT_PORT, PROTOCOL_VERSION, SERVER_VERSION};

/// One decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `SUB <subject> [queue] <sid>`
    Sub {
        subject: Bytes,
        queue: Option<Bytes>,
        sid: Bytes,
    },
    /// `UNSUB <sid> [max_msgs]`
    Unsub { sid: Bytes, max_msgs: u64 },
    /// `PUB <subject> [reply] <size>` and its payload
    Pub {
        subject: Bytes,
        reply: Option<Bytes>,
        payload: Bytes,
    },
    /// `MSG <subject> <sid> [reply] <size>` and its payload
    Msg {
        subject: Bytes,
        sid: Bytes,
        reply: Option<Bytes>,
        payload: Bytes,
    },
    Ping,
    Pong,
    /// `+OK`
    Ok,
    /// `-ERR <text>`, quotes stripped
    Err(String),
    /// `INFO {json}`, raw JSON
    Info(Bytes),
    /// `CONNECT {json}`, raw JSON
    Connect(Bytes),
}

impl Frame {
    /// Keyword for logging
    pub fn keyword(&self) -> &'static str {
        match self {
            Frame::Sub { .. } => "SUB",
            Frame::Unsub { .. } => "UNSUB",
            Frame::Pub { .. } => "PUB",
            Frame::Msg { .. } => "MSG",
            Frame::Ping => "PING",
            Frame::Pong => "PONG",
            Frame::Ok => "+OK",
            Frame::Err(_) => "-ERR",
            Frame::Info(_) => "INFO",
            Frame::Connect(_) => "CONNECT",
        }
    }
}

/// Body of the server's `INFO` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub version: String,
    pub proto: u32,
    pub host: String,
    pub port: u16,
    pub auth_required: bool,
    pub ssl_required: bool,
    pub tls_required: bool,
    pub tls_verify: bool,
    pub max_payload: usize,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            version: SERVER_VERSION.to_string(),
            proto: PROTOCOL_VERSION,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            auth_required: false,
            ssl_required: false,
            tls_required: false,
            tls_verify: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ServerInfo {
    /// Parse an INFO body, keeping defaults for anything missing or malformed
    pub fn parse(json: &[u8]) -> Self {
        match serde_json::from_slice(json) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed INFO body");
                Self::default()
            }
        }
    }
}

/// Body of the client's `CONNECT` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    pub echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u32,
    pub tls_required: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            verbose: true,
            pedantic: false,
            echo: true,
            name: None,
            user: None,
            pass: None,
            auth_token: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            tls_required: false,
        }
    }
}

impl ConnectOptions {
    /// Parse a CONNECT body, keeping defaults for anything missing or malformed
    pub fn parse(json: &[u8]) -> Self {
        match serde_json::from_slice(json) {
            Ok(opts) => opts,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed CONNECT body");
                Self::default()
            }
        }
    }

    /// Options assumed when a client skips CONNECT
    pub fn implicit() -> Self {
        Self {
            user: Some("nobody".to_string()),
            ..Self::default()
        }
    }
}
