//! Routing fabric interface
//!
//! The fabric carries publishes between connections. It only knows subject
//! and prefix hashes; each receiving connection matches exactly against its
//! own subscription map.

use bytes::Bytes;

/// A publish travelling between connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub subject: Bytes,
    pub reply: Option<Bytes>,
    pub payload: Bytes,
    /// Connection the publish came from
    pub src_conn: u64,
    pub subject_hash: u32,
}

/// Interest change for one subject or pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubNotify {
    pub conn_id: u64,
    /// Subject or pattern text
    pub subject: Bytes,
    /// Subject hash, or prefix hash for patterns
    pub hash: u32,
    /// Literal prefix length for patterns
    pub prefix_len: Option<usize>,
    /// Hash shared with another subject or pattern on this connection
    pub collision: bool,
}

/// Cross-connection delivery
pub trait RouteFabric: Send + Sync {
    /// Offer a publish to every interested connection
    ///
    /// Returns false if some connection could not take it.
    fn forward(&self, msg: &Publish) -> bool;

    /// First sid for a subject or pattern on a connection
    fn notify_subscribe(&self, sub: &SubNotify);

    /// Last sid for a subject or pattern on a connection went away
    fn notify_unsubscribe(&self, sub: &SubNotify);
}
