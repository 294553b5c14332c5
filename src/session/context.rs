//! Handler context
//!
//! Context passed to handler callbacks containing session information.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::message::ConnectOptions;
use crate::stats::SessionStats;

/// Context passed to NatsHandler callbacks
///
/// Provides read-only access to session information.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique session ID
    pub session_id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Connect options (if available)
    pub connect_opts: Option<Arc<ConnectOptions>>,

    /// Session began without CONNECT
    pub implicit: bool,

    /// Current session statistics
    pub stats: SessionStats,
}

impl SessionContext {
    /// Create a new context
    pub fn new(session_id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            session_id,
            peer_addr,
            connect_opts: None,
            implicit: false,
            stats: SessionStats::default(),
        }
    }

    /// Update with connect options
    pub fn with_connect(&mut self, opts: ConnectOptions, implicit: bool) {
        self.connect_opts = Some(Arc::new(opts));
        self.implicit = implicit;
    }

    pub fn name(&self) -> Option<&str> {
        self.connect_opts.as_ref().and_then(|o| o.name.as_deref())
    }

    pub fn user(&self) -> Option<&str> {
        self.connect_opts.as_ref().and_then(|o| o.user.as_deref())
    }

    pub fn pass(&self) -> Option<&str> {
        self.connect_opts.as_ref().and_then(|o| o.pass.as_deref())
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.connect_opts
            .as_ref()
            .and_then(|o| o.auth_token.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_connect() {
        let mut ctx = SessionContext::new(3, "127.0.0.1:5000".parse().unwrap());
        assert!(ctx.user().is_none());

        ctx.with_connect(
            ConnectOptions {
                user: Some("alice".into()),
                auth_token: Some("t".into()),
                ..Default::default()
            },
            false,
        );
        assert_eq!(ctx.user(), Some("alice"));
        assert_eq!(ctx.auth_token(), Some("t"));
        assert!(ctx.pass().is_none());
    }
}
