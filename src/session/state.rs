//! Session state machine
//!
//! Tracks a server-side connection from accept to close.

use std::net::SocketAddr;
use std::time::Instant;

use crate::protocol::message::ConnectOptions;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// TCP connected, INFO sent, no CONNECT yet
    Connected,
    /// CONNECT received (or implied) and accepted
    Active,
    /// Session is closing
    Closing,
    /// Session closed
    Closed,
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session ID
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Connect options (after CONNECT)
    pub connect_opts: Option<ConnectOptions>,

    /// Session was established without a CONNECT line
    pub implicit: bool,
}

impl SessionState {
    /// Create a new session state
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Connected,
            connected_at: Instant::now(),
            connect_opts: None,
            implicit: false,
        }
    }

    /// Handle CONNECT
    pub fn on_connect(&mut self, opts: ConnectOptions) {
        self.connect_opts = Some(opts);
        self.implicit = false;
        self.phase = SessionPhase::Active;
    }

    /// Activate with default options for a client that skipped CONNECT
    pub fn implicit_connect(&mut self) {
        self.on_connect(ConnectOptions::implicit());
        self.implicit = true;
    }

    /// `+OK` after each command
    pub fn verbose(&self) -> bool {
        self.connect_opts.as_ref().is_none_or(|o| o.verbose)
    }

    /// Validate subjects strictly
    pub fn pedantic(&self) -> bool {
        self.connect_opts.as_ref().is_some_and(|o| o.pedantic)
    }

    /// Receive own publishes
    pub fn echo(&self) -> bool {
        self.connect_opts.as_ref().is_none_or(|o| o.echo)
    }

    /// User from CONNECT
    pub fn user(&self) -> Option<&str> {
        self.connect_opts.as_ref().and_then(|o| o.user.as_deref())
    }

    /// Get session duration
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Check if session is active
    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    /// Start closing the session
    pub fn close(&mut self) {
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Closing;
        }
    }

    /// Mark the session closed
    pub fn mark_closed(&mut self) {
        self.phase = SessionPhase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4222)
    }

    #[test]
    fn test_session_lifecycle() {
        let mut state = SessionState::new(1, addr());
        assert_eq!(state.phase, SessionPhase::Connected);
        assert!(state.verbose()); // verbose until told otherwise

        let opts = ConnectOptions {
            verbose: false,
            echo: false,
            ..Default::default()
        };
        state.on_connect(opts);
        assert!(state.is_active());
        assert!(!state.verbose());
        assert!(!state.echo());

        state.close();
        assert_eq!(state.phase, SessionPhase::Closing);
        state.mark_closed();
        state.close();
        assert_eq!(state.phase, SessionPhase::Closed);
    }

    #[test]
    fn test_implicit_connect() {
        let mut state = SessionState::new(1, addr());
        state.implicit_connect();

        assert!(state.is_active());
        assert!(state.implicit);
        assert_eq!(state.user(), Some("nobody"));
        assert!(!state.pedantic());
    }
}
