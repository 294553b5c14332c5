//! Server configuration

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::constants::*;
use crate::protocol::message::ServerInfo;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Largest PUB payload accepted, advertised in INFO
    pub max_payload: usize,

    /// Longest header line accepted without a terminator
    pub max_control_line: usize,

    /// Buffered output size at which the connection stops reading
    pub write_high_water: usize,

    /// Depth of each connection's fabric delivery queue
    pub fabric_queue_depth: usize,

    /// Idle timeout (disconnect if no data received)
    pub idle_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// Server identity sent in INFO, generated at startup when empty
    pub server_id: String,

    /// Server version sent in INFO
    pub version: String,

    /// Clients must authenticate
    pub auth_required: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 0, // Unlimited
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
            write_high_water: 4 * 1024 * 1024, // 4MB
            fabric_queue_depth: 1024,
            idle_timeout: Duration::from_secs(120),
            tcp_nodelay: true,
            read_buffer_size: 64 * 1024, // 64KB
            server_id: String::new(),
            version: SERVER_VERSION.to_string(),
            auth_required: false,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the maximum payload size
    pub fn max_payload(mut self, size: usize) -> Self {
        self.max_payload = size.max(TRAILER_SIZE + 1);
        self
    }

    /// Set the control line limit
    pub fn max_control_line(mut self, size: usize) -> Self {
        self.max_control_line = size;
        self
    }

    /// Set the output high-water mark
    pub fn write_high_water(mut self, size: usize) -> Self {
        self.write_high_water = size;
        self
    }

    /// Set the fabric queue depth per connection
    pub fn fabric_queue_depth(mut self, depth: usize) -> Self {
        self.fabric_queue_depth = depth.max(1);
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Use a fixed server id
    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }

    /// Require authentication in INFO
    pub fn auth_required(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    /// Fill in a server id if none was configured
    pub fn resolve_server_id(&mut self) {
        if self.server_id.is_empty() {
            self.server_id = generate_server_id();
        }
    }

    /// INFO body advertised to clients
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            server_id: self.server_id.clone(),
            version: self.version.clone(),
            proto: PROTOCOL_VERSION,
            host: self.bind_addr.ip().to_string(),
            port: self.bind_addr.port(),
            auth_required: self.auth_required,
            ssl_required: false,
            tls_required: false,
            tls_verify: false,
            max_payload: self.max_payload,
        }
    }
}

/// 22 base-62 characters seeded from the clock
pub fn generate_server_id() -> String {
    const ALPHABET: &[u8; 62] =
        b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut state = seed ^ (std::process::id() as u64).rotate_left(32);

    (0..SERVER_ID_LEN)
        .map(|_| {
            // Knuth MMIX constants
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ALPHABET[((state >> 33) % 62) as usize] as char
        })
        .collect()
}
