//! In-process routing fabric
//!
//! Connections register a bounded queue and their subject interests. A
//! publish is pushed to every connection holding interest in its subject
//! hash or in the hash of one of its prefixes.
//!
//! ```text
//!   forward(A.B.C) ─┬─► subjects[hash(A.B.C)]        ─► {conn 1}
//!                   ├─► prefixes[2][hash("A.")]      ─► {conn 2}
//!                   └─► prefixes[0][hash("")]        ─► {conn 3}
//!                                 │
//!                                 ▼
//!                     queues[conn]: mpsc::Sender<Publish>
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::protocol::subject::crc32c;

use super::fabric::{Publish, RouteFabric, SubNotify};

/// Reference counts of interest per connection
type Interest = HashMap<u64, u32>;

#[derive(Default)]
struct Tables {
    queues: HashMap<u64, mpsc::Sender<Publish>>,
    subjects: HashMap<u32, Interest>,
    /// prefix length -> prefix hash -> interest
    prefixes: BTreeMap<usize, HashMap<u32, Interest>>,
}

/// Fabric for connections living in one process
pub struct LocalFabric {
    tables: RwLock<Tables>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Register a connection and get its delivery queue
    pub fn register(&self, conn_id: u64, capacity: usize) -> mpsc::Receiver<Publish> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Ok(mut t) = self.tables.write() {
            t.queues.insert(conn_id, tx);
        }
        rx
    }

    /// Drop a connection and any interest it still holds
    pub fn unregister(&self, conn_id: u64) {
        let Ok(mut t) = self.tables.write() else {
            return;
        };
        t.queues.remove(&conn_id);
        t.subjects.retain(|_, interest| {
            interest.remove(&conn_id);
            !interest.is_empty()
        });
        t.prefixes.retain(|_, by_hash| {
            by_hash.retain(|_, interest| {
                interest.remove(&conn_id);
                !interest.is_empty()
            });
            !by_hash.is_empty()
        });
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.tables.read().map(|t| t.queues.len()).unwrap_or(0)
    }

    /// Connections interested in a subject
    fn targets(t: &Tables, msg: &Publish) -> HashSet<u64> {
        let mut out = HashSet::new();
        if let Some(interest) = t.subjects.get(&msg.subject_hash) {
            out.extend(interest.keys().copied());
        }
        for (&len, by_hash) in &t.prefixes {
            if len > msg.subject.len() {
                break;
            }
            if let Some(interest) = by_hash.get(&crc32c(&msg.subject[..len])) {
                out.extend(interest.keys().copied());
            }
        }
        out
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new()
    }
}

fn add_ref(interest: &mut Interest, conn_id: u64) {
    *interest.entry(conn_id).or_insert(0) += 1;
}

/// Returns true once the interest map is empty
fn drop_ref(interest: &mut Interest, conn_id: u64) -> bool {
    if let Some(n) = interest.get_mut(&conn_id) {
        *n -= 1;
        if *n == 0 {
            interest.remove(&conn_id);
        }
    }
    interest.is_empty()
}

impl RouteFabric for LocalFabric {
    fn forward(&self, msg: &Publish) -> bool {
        let Ok(t) = self.tables.read() else {
            return false;
        };
        let mut delivered = true;
        for conn_id in Self::targets(&t, msg) {
            let Some(tx) = t.queues.get(&conn_id) else {
                continue;
            };
            if let Err(e) = tx.try_send(msg.clone()) {
                tracing::debug!(
                    conn_id = conn_id,
                    subject = %String::from_utf8_lossy(&msg.subject),
                    error = %e,
                    "Delivery queue refused publish"
                );
                delivered = false;
            }
        }
        delivered
    }

    fn notify_subscribe(&self, sub: &SubNotify) {
        let Ok(mut t) = self.tables.write() else {
            return;
        };
        match sub.prefix_len {
            None => add_ref(t.subjects.entry(sub.hash).or_default(), sub.conn_id),
            Some(len) => add_ref(
                t.prefixes
                    .entry(len)
                    .or_default()
                    .entry(sub.hash)
                    .or_default(),
                sub.conn_id,
            ),
        }
        tracing::trace!(
            conn_id = sub.conn_id,
            subject = %String::from_utf8_lossy(&sub.subject),
            collision = sub.collision,
            "Interest added"
        );
    }

    fn notify_unsubscribe(&self, sub: &SubNotify) {
        let Ok(mut t) = self.tables.write() else {
            return;
        };
        match sub.prefix_len {
            None => {
                if let Some(interest) = t.subjects.get_mut(&sub.hash) {
                    if drop_ref(interest, sub.conn_id) {
                        t.subjects.remove(&sub.hash);
                    }
                }
            }
            Some(len) => {
                if let Some(by_hash) = t.prefixes.get_mut(&len) {
                    if let Some(interest) = by_hash.get_mut(&sub.hash) {
                        if drop_ref(interest, sub.conn_id) {
                            by_hash.remove(&sub.hash);
                        }
                    }
                    if by_hash.is_empty() {
                        t.prefixes.remove(&len);
                    }
                }
            }
        }
        tracing::trace!(
            conn_id = sub.conn_id,
            subject = %String::from_utf8_lossy(&sub.subject),
            "Interest removed"
        );
    }
}
