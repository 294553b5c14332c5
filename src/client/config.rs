//! Client configuration

use std::time::Duration;

use crate::protocol::constants::DEFAULT_PORT;
use crate::protocol::message::ConnectOptions;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Connection name sent in CONNECT
    pub name: Option<String>,

    pub user: Option<String>,

    pub pass: Option<String>,

    pub auth_token: Option<String>,

    /// Client language reported in CONNECT
    pub lang: String,

    /// Client version reported in CONNECT
    pub version: String,

    /// TCP connect and INFO wait timeout
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// Capacity of the event channel handed to the application
    pub event_channel_capacity: usize,

    /// Buffered output size at which publishing should wait for a flush
    pub high_water: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            name: None,
            user: None,
            pass: None,
            auth_token: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            read_buffer_size: 64 * 1024,
            event_channel_capacity: 256,
            high_water: 4 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Config for a server at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the connection name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set user and password
    pub fn credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Set an auth token
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// `host:port` for `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// CONNECT body; quiet and without echo
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            verbose: false,
            pedantic: false,
            echo: false,
            name: self.name.clone(),
            user: self.user.clone(),
            pass: self.pass.clone(),
            auth_token: self.auth_token.clone(),
            lang: self.lang.clone(),
            version: self.version.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:4222");
        assert_eq!(config.lang, "rust");
        assert!(config.name.is_none());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("nats.local", 4333)
            .name("bridge")
            .credentials("u", "p")
            .event_channel_capacity(0);

        assert_eq!(config.addr(), "nats.local:4333");
        assert_eq!(config.event_channel_capacity, 1);

        let opts = config.connect_options();
        assert!(!opts.verbose);
        assert!(!opts.echo);
        assert_eq!(opts.name.as_deref(), Some("bridge"));
        assert_eq!(opts.user.as_deref(), Some("u"));
        assert_eq!(opts.pass.as_deref(), Some("p"));
        assert!(opts.auth_token.is_none());
    }
}
