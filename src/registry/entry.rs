//! Route and sid entry types
//!
//! This module defines the per-subject, per-pattern and per-sid state
//! stored in the subscription map.

use bytes::Bytes;

use crate::protocol::constants::MAX_SID_LIST_BYTES;

use super::pattern::PatternMatcher;

/// Lifecycle of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// Route has at least one sid
    Active,
    /// Last sid removed, waiting for `remove_empty_route`
    PendingRemoval,
}

/// One sid on a route with its absolute delivery deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidRecord {
    pub sid: Bytes,
    /// Route counter value after which the sid expires (0 = unlimited)
    pub limit: u64,
}

/// Ordered sids of one subject or pattern
#[derive(Debug, Default)]
pub struct SidList {
    /// Messages published to this route
    pub msg_cnt: u64,
    /// Smallest non-zero `limit` among the sids (0 = none)
    pub pending_limit: u64,
    pub sids: Vec<SidRecord>,
}

impl SidList {
    /// Size of the list packed behind `subject_len` bytes of subject, with
    /// every sid prefixed by a 2-byte length
    pub fn packed_size(&self, subject_len: usize) -> usize {
        subject_len + self.sids.iter().map(|r| r.sid.len() + 2).sum::<usize>()
    }

    /// Check whether another sid still fits
    pub(super) fn check_room(&self, subject_len: usize, sid_len: usize) -> Result<(), usize> {
        let size = self.packed_size(subject_len) + sid_len + 2;
        if size > MAX_SID_LIST_BYTES {
            Err(size)
        } else {
            Ok(())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sids.len()
    }

    /// Remove `sid`, returns true if it was present
    pub(super) fn remove(&mut self, sid: &[u8]) -> bool {
        match self.sids.iter().position(|r| r.sid == sid) {
            Some(pos) => {
                let rec = self.sids.remove(pos);
                if rec.limit != 0 && rec.limit == self.pending_limit {
                    self.recompute_pending();
                }
                true
            }
            None => false,
        }
    }

    /// Install an absolute limit on `sid`
    pub(super) fn set_limit(&mut self, sid: &[u8], limit: u64) {
        if let Some(rec) = self.sids.iter_mut().find(|r| r.sid == sid) {
            rec.limit = limit;
        }
        self.recompute_pending();
    }

    /// True once the counter has passed the nearest deadline
    pub fn is_expired(&self) -> bool {
        self.pending_limit != 0 && self.msg_cnt > self.pending_limit
    }

    /// Drop every sid whose deadline has passed
    pub(super) fn expire(&mut self) -> Vec<Bytes> {
        let cnt = self.msg_cnt;
        let mut removed = Vec::new();
        self.sids.retain(|r| {
            if r.limit != 0 && r.limit < cnt {
                removed.push(r.sid.clone());
                false
            } else {
                true
            }
        });
        self.recompute_pending();
        removed
    }

    fn recompute_pending(&mut self) {
        self.pending_limit = self
            .sids
            .iter()
            .filter(|r| r.limit != 0)
            .map(|r| r.limit)
            .min()
            .unwrap_or(0);
    }
}

/// A literal subject with its subscribers
#[derive(Debug)]
pub struct SubjectRoute {
    pub subject: Bytes,
    pub hash: u32,
    pub list: SidList,
    pub state: RouteState,
}

impl SubjectRoute {
    pub(super) fn new(subject: Bytes, hash: u32) -> Self {
        Self {
            subject,
            hash,
            list: SidList::default(),
            state: RouteState::Active,
        }
    }
}

/// A wildcard pattern under a shared prefix
pub struct WildcardMatch {
    pub pattern: Bytes,
    /// `None` when the pattern is `prefix + ">"`
    pub(super) matcher: Option<Box<dyn PatternMatcher>>,
    pub list: SidList,
    pub state: RouteState,
}

impl WildcardMatch {
    pub(super) fn new(pattern: Bytes, matcher: Option<Box<dyn PatternMatcher>>) -> Self {
        Self {
            pattern,
            matcher,
            list: SidList::default(),
            state: RouteState::Active,
        }
    }

    /// Test a subject that already starts with this match's prefix
    pub fn accepts(&self, subject: &[u8]) -> bool {
        match &self.matcher {
            Some(m) => m.is_match(subject),
            None => {
                // prefix + ">": at least one more byte after the prefix
                let prefix = &self.pattern[..self.pattern.len() - 1];
                subject.len() > prefix.len() && subject.starts_with(prefix)
            }
        }
    }

    /// True if no compiled matcher is needed
    pub fn is_full_wildcard(&self) -> bool {
        self.matcher.is_none()
    }
}

impl std::fmt::Debug for WildcardMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WildcardMatch")
            .field("pattern", &self.pattern)
            .field("full_wildcard", &self.matcher.is_none())
            .field("list", &self.list)
            .field("state", &self.state)
            .finish()
    }
}

/// All wildcard patterns sharing one literal prefix
#[derive(Debug)]
pub struct PatternRoute {
    pub prefix: Bytes,
    pub hash: u32,
    pub matches: Vec<WildcardMatch>,
}

impl PatternRoute {
    pub(super) fn new(prefix: Bytes, hash: u32) -> Self {
        Self {
            prefix,
            hash,
            matches: Vec::new(),
        }
    }
}

/// Route a sid belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidOwner {
    Subject { subject: Bytes, hash: u32 },
    Pattern {
        prefix: Bytes,
        prefix_hash: u32,
        pattern: Bytes,
    },
}

/// One active subscriber identifier
#[derive(Debug, Clone)]
pub struct SidEntry {
    pub sid: Bytes,
    pub owner: SidOwner,
    /// Route counter when the sid was added
    pub base: u64,
    /// Requested message limit (0 = unlimited)
    pub max_msgs: u64,
}

impl SidEntry {
    /// Hash of the owning subject, or of the pattern itself
    pub fn subject_hash(&self) -> u32 {
        match &self.owner {
            SidOwner::Subject { hash, .. } => *hash,
            SidOwner::Pattern { pattern, .. } => crate::protocol::subject::crc32c(pattern),
        }
    }

    /// Hash of the pattern prefix, `None` for literal subjects
    pub fn pattern_prefix_hash(&self) -> Option<u32> {
        match &self.owner {
            SidOwner::Subject { .. } => None,
            SidOwner::Pattern { prefix_hash, .. } => Some(*prefix_hash),
        }
    }
}

/// Handle to a route, valid until it is removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteRef {
    Subject { subject: Bytes, hash: u32 },
    Pattern {
        prefix: Bytes,
        prefix_hash: u32,
        pattern: Bytes,
    },
}

impl RouteRef {
    /// Subject or pattern text
    pub fn subject(&self) -> &Bytes {
        match self {
            RouteRef::Subject { subject, .. } => subject,
            RouteRef::Pattern { pattern, .. } => pattern,
        }
    }

    /// Hash the routing fabric keys this route by
    pub fn fabric_hash(&self) -> u32 {
        match self {
            RouteRef::Subject { hash, .. } => *hash,
            RouteRef::Pattern { prefix_hash, .. } => *prefix_hash,
        }
    }

    /// Literal prefix length for patterns
    pub fn prefix_len(&self) -> Option<usize> {
        match self {
            RouteRef::Subject { .. } => None,
            RouteRef::Pattern { prefix, .. } => Some(prefix.len()),
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, RouteRef::Pattern { .. })
    }
}

impl From<SidOwner> for RouteRef {
    fn from(owner: SidOwner) -> Self {
        match owner {
            SidOwner::Subject { subject, hash } => RouteRef::Subject { subject, hash },
            SidOwner::Pattern {
                prefix,
                prefix_hash,
                pattern,
            } => RouteRef::Pattern {
                prefix,
                prefix_hash,
                pattern,
            },
        }
    }
}
