//! Statistics for pub/sub sessions

use std::time::{Duration, Instant};

/// Session-level statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_received: u64,
    /// Total bytes written to the output buffer
    pub bytes_sent: u64,
    /// Messages received from the peer (PUB or MSG)
    pub msgs_received: u64,
    /// Messages delivered to the peer
    pub msgs_sent: u64,
    /// Protocol errors reported
    pub protocol_errors: u64,
    /// Deliveries suppressed as duplicates
    pub duplicates_dropped: u64,
    /// Fragment groups completed
    pub fragments_reassembled: u64,
    /// Fragment groups discarded
    pub fragments_dropped: u64,
    /// Connection duration
    pub duration: Duration,
}

impl SessionStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Average received throughput in bits per second
    pub fn receive_bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }
}

/// Server-wide statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Total connections ever
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Connections refused by the limit or handler
    pub rejected_connections: u64,
    /// Total bytes received
    pub total_bytes_received: u64,
    /// Total bytes sent
    pub total_bytes_sent: u64,
    /// Server start time
    pub started_at: Instant,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            total_connections: 0,
            active_connections: 0,
            rejected_connections: 0,
            total_bytes_received: 0,
            total_bytes_sent: 0,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fold a finished session into the totals
    pub fn record_session(&mut self, session: &SessionStats) {
        self.total_bytes_received += session.bytes_received;
        self.total_bytes_sent += session.bytes_sent;
        self.active_connections = self.active_connections.saturating_sub(1);
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_stats_new() {
        let stats = SessionStats::new();
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.msgs_sent, 0);
        assert_eq!(stats.fragments_dropped, 0);
        assert_eq!(stats.receive_bitrate(), 0);
    }

    #[test]
    fn test_receive_bitrate() {
        let mut stats = SessionStats::new();
        stats.bytes_received = 1_000_000; // 1 MB
        stats.duration = Duration::from_secs(10);

        // 1,000,000 bytes * 8 bits / 10 seconds = 800,000 bps
        assert_eq!(stats.receive_bitrate(), 800_000);
    }

    #[test]
    fn test_record_session() {
        let mut server = ServerStats::new();
        server.total_connections = 1;
        server.active_connections = 1;

        let session = SessionStats {
            bytes_received: 10,
            bytes_sent: 20,
            ..Default::default()
        };
        server.record_session(&session);

        assert_eq!(server.active_connections, 0);
        assert_eq!(server.total_bytes_received, 10);
        assert_eq!(server.total_bytes_sent, 20);

        // Never underflows
        server.record_session(&session);
        assert_eq!(server.active_connections, 0);
    }
}
