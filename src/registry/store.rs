//! Subscription map implementation
//!
//! Owns every subscription of one connection: literal subjects, wildcard
//! patterns grouped by literal prefix, and the sid index used to find a
//! sid's route again on unsubscribe.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::protocol::subject::Subject;

use super::entry::{
    PatternRoute, RouteRef, RouteState, SidEntry, SidList, SidOwner, SidRecord, SubjectRoute,
    WildcardMatch,
};
use super::error::RegistryError;
use super::pattern::{PatternCompiler, RegexCompiler};

/// Result of a subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// First sid for this subject or pattern
    pub is_new: bool,
    /// Hash bucket holds another subject or pattern
    pub collision: bool,
}

/// How an unsubscribe was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeStatus {
    /// Sid removed now
    Removed,
    /// Sid stays until its message limit is reached
    Deferred,
}

/// Result of an unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    pub status: UnsubscribeStatus,
    /// Route emptied by this call, still to be detached
    pub empty_route: Option<RouteRef>,
    pub collision: bool,
}

/// Literal route hit by a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishLookup {
    pub route: RouteRef,
    /// A sid limit was passed, call `resolve_expired` before delivery
    pub expired: bool,
}

/// Result of pruning expired sids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpireOutcome {
    pub removed: Vec<Bytes>,
    /// Route emptied by the pruning, still to be detached
    pub empty_route: Option<RouteRef>,
    pub collision: bool,
}

/// Whether a subject or pattern has subscribers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub subscribed: bool,
    pub collision: bool,
}

/// One subscribed subject or pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub route: RouteRef,
    pub sid_count: usize,
    pub collision: bool,
}

/// Position in the wildcard matches of one prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternCursor {
    hash: u32,
    route_idx: usize,
    match_idx: usize,
}

/// Per-connection subscription state
pub struct SubscriptionMap {
    /// Literal subjects by hash
    sub_tab: HashMap<u32, Vec<SubjectRoute>>,

    /// Pattern routes by prefix hash
    pat_tab: HashMap<u32, Vec<PatternRoute>>,

    /// Sid index
    sid_tab: HashMap<Bytes, SidEntry>,

    /// Number of pattern routes per prefix length
    prefix_lens: BTreeMap<usize, usize>,

    compiler: Box<dyn PatternCompiler>,
}

impl SubscriptionMap {
    /// Create an empty map using regex pattern matching
    pub fn new() -> Self {
        Self::with_compiler(Box::new(RegexCompiler))
    }

    /// Create an empty map with a custom pattern compiler
    pub fn with_compiler(compiler: Box<dyn PatternCompiler>) -> Self {
        Self {
            sub_tab: HashMap::new(),
            pat_tab: HashMap::new(),
            sid_tab: HashMap::new(),
            prefix_lens: BTreeMap::new(),
            compiler,
        }
    }

    /// Add `sid` to a literal subject or wildcard pattern
    pub fn subscribe(
        &mut self,
        subject: &Subject<'_>,
        sid: &[u8],
    ) -> Result<SubscribeOutcome, RegistryError> {
        if subject.is_empty() || sid.is_empty() {
            return Err(RegistryError::InvalidSubject(subject.to_string()));
        }
        if self.sid_tab.contains_key(sid) {
            return Err(RegistryError::Exists(
                String::from_utf8_lossy(sid).into_owned(),
            ));
        }
        let sid = Bytes::copy_from_slice(sid);

        let (outcome, owner, base) = match subject.wildcard_prefix_len() {
            Some(prefix_len) => self.put_pattern(subject, prefix_len, &sid)?,
            None => self.put_subject(subject, &sid)?,
        };

        tracing::debug!(
            subject = %subject,
            sid = %String::from_utf8_lossy(&sid),
            is_new = outcome.is_new,
            collision = outcome.collision,
            "Subscribed"
        );

        self.sid_tab.insert(
            sid.clone(),
            SidEntry {
                sid,
                owner,
                base,
                max_msgs: 0,
            },
        );
        Ok(outcome)
    }

    fn put_subject(
        &mut self,
        subject: &Subject<'_>,
        sid: &Bytes,
    ) -> Result<(SubscribeOutcome, SidOwner, u64), RegistryError> {
        let hash = subject.hash();
        let bucket = self.sub_tab.entry(hash).or_default();

        let (route, is_new, collision) =
            match bucket.iter().position(|r| subject.equals(&r.subject)) {
                Some(idx) => {
                    let collision = bucket.len() > 1;
                    let route = &mut bucket[idx];
                    if let Err(size) = route.list.check_room(subject.len(), sid.len()) {
                        return Err(RegistryError::TooMany { size });
                    }
                    // A route waiting for removal is brought back
                    let is_new = route.state == RouteState::PendingRemoval;
                    route.state = RouteState::Active;
                    (route, is_new, collision)
                }
                None => {
                    if let Err(size) = SidList::default().check_room(subject.len(), sid.len()) {
                        if bucket.is_empty() {
                            self.sub_tab.remove(&hash);
                        }
                        return Err(RegistryError::TooMany { size });
                    }
                    let collision = !bucket.is_empty();
                    let subject_bytes = Bytes::copy_from_slice(subject.as_bytes());
                    bucket.push(SubjectRoute::new(subject_bytes, hash));
                    let last = bucket.len() - 1;
                    (&mut bucket[last], true, collision)
                }
            };

        route.list.sids.push(SidRecord {
            sid: sid.clone(),
            limit: 0,
        });
        let owner = SidOwner::Subject {
            subject: route.subject.clone(),
            hash,
        };
        Ok((SubscribeOutcome { is_new, collision }, owner, route.list.msg_cnt))
    }

    fn put_pattern(
        &mut self,
        pattern: &Subject<'_>,
        prefix_len: usize,
        sid: &Bytes,
    ) -> Result<(SubscribeOutcome, SidOwner, u64), RegistryError> {
        let prefix = pattern.prefix(prefix_len);
        let prefix_hash = prefix.hash();
        let full_wildcard = pattern.len() == prefix_len + 1 && pattern.as_bytes()[prefix_len] == b'>';

        let bucket = self.pat_tab.entry(prefix_hash).or_default();
        let route_idx = bucket.iter().position(|r| prefix.equals(&r.prefix));

        // Everything that can fail happens before the tables change
        let match_idx = route_idx.and_then(|ri| {
            bucket[ri]
                .matches
                .iter()
                .position(|m| pattern.equals(&m.pattern))
        });
        if let (Some(ri), Some(mi)) = (route_idx, match_idx) {
            if let Err(size) = bucket[ri].matches[mi]
                .list
                .check_room(pattern.len(), sid.len())
            {
                return Err(RegistryError::TooMany { size });
            }
        } else if let Err(size) = SidList::default().check_room(pattern.len(), sid.len()) {
            if bucket.is_empty() {
                self.pat_tab.remove(&prefix_hash);
            }
            return Err(RegistryError::TooMany { size });
        }
        let matcher = if match_idx.is_none() && !full_wildcard {
            match self.compiler.compile(pattern.as_bytes()) {
                Ok(m) => Some(m),
                Err(e) => {
                    if bucket.is_empty() {
                        self.pat_tab.remove(&prefix_hash);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let route_idx = match route_idx {
            Some(ri) => ri,
            None => {
                bucket.push(PatternRoute::new(
                    Bytes::copy_from_slice(prefix.as_bytes()),
                    prefix_hash,
                ));
                *self.prefix_lens.entry(prefix_len).or_insert(0) += 1;
                bucket.len() - 1
            }
        };
        let bucket_len = bucket.len();
        let route = &mut bucket[route_idx];

        let (wm, is_new) = match match_idx {
            Some(mi) => {
                let wm = &mut route.matches[mi];
                let is_new = wm.state == RouteState::PendingRemoval;
                wm.state = RouteState::Active;
                (wm, is_new)
            }
            None => {
                route.matches.push(WildcardMatch::new(
                    Bytes::copy_from_slice(pattern.as_bytes()),
                    matcher,
                ));
                let last = route.matches.len() - 1;
                (&mut route.matches[last], true)
            }
        };
        wm.list.sids.push(SidRecord {
            sid: sid.clone(),
            limit: 0,
        });
        let base = wm.list.msg_cnt;
        let pattern_bytes = wm.pattern.clone();
        let collision = bucket_len > 1 || route.matches.len() > 1;

        let owner = SidOwner::Pattern {
            prefix: route.prefix.clone(),
            prefix_hash,
            pattern: pattern_bytes,
        };
        Ok((SubscribeOutcome { is_new, collision }, owner, base))
    }

    /// Remove `sid` now (`max_msgs == 0`) or after `max_msgs` deliveries
    /// counted from when it subscribed
    pub fn unsubscribe(
        &mut self,
        sid: &[u8],
        max_msgs: u64,
    ) -> Result<UnsubscribeOutcome, RegistryError> {
        let not_found = || RegistryError::NotFound(String::from_utf8_lossy(sid).into_owned());
        let entry = self.sid_tab.get(sid).ok_or_else(not_found)?;
        let owner = entry.owner.clone();
        let base = entry.base;

        let list = match self.list_mut(&owner) {
            Some(list) => list,
            None => {
                // Orphaned entry, drop it
                self.sid_tab.remove(sid);
                return Err(not_found());
            }
        };

        if max_msgs != 0 && list.msg_cnt.saturating_sub(base) < max_msgs {
            list.set_limit(sid, base + max_msgs);
            if let Some(entry) = self.sid_tab.get_mut(sid) {
                entry.max_msgs = max_msgs;
            }
            tracing::debug!(
                sid = %String::from_utf8_lossy(sid),
                max_msgs = max_msgs,
                "Unsubscribe deferred"
            );
            return Ok(UnsubscribeOutcome {
                status: UnsubscribeStatus::Deferred,
                empty_route: None,
                collision: false,
            });
        }

        list.remove(sid);
        let now_empty = list.is_empty();
        self.sid_tab.remove(sid);

        let route = RouteRef::from(owner);
        let (empty_route, collision) = if now_empty {
            self.set_state(&route, RouteState::PendingRemoval);
            let collision = self.route_collision(&route);
            (Some(route), collision)
        } else {
            (None, false)
        };

        tracing::debug!(
            sid = %String::from_utf8_lossy(sid),
            route_empty = empty_route.is_some(),
            "Unsubscribed"
        );
        Ok(UnsubscribeOutcome {
            status: UnsubscribeStatus::Removed,
            empty_route,
            collision,
        })
    }

    /// Detach a route emptied by `unsubscribe` or `resolve_expired`
    ///
    /// Returns false if the route is gone or got a new sid meanwhile.
    pub fn remove_empty_route(&mut self, route: &RouteRef) -> bool {
        match route {
            RouteRef::Subject { subject, hash } => {
                let Some(bucket) = self.sub_tab.get_mut(hash) else {
                    return false;
                };
                let Some(idx) = bucket.iter().position(|r| r.subject == *subject) else {
                    return false;
                };
                if bucket[idx].state != RouteState::PendingRemoval || !bucket[idx].list.is_empty()
                {
                    return false;
                }
                bucket.remove(idx);
                if bucket.is_empty() {
                    self.sub_tab.remove(hash);
                }
                true
            }
            RouteRef::Pattern {
                prefix,
                prefix_hash,
                pattern,
            } => {
                let Some(bucket) = self.pat_tab.get_mut(prefix_hash) else {
                    return false;
                };
                let Some(ri) = bucket.iter().position(|r| r.prefix == *prefix) else {
                    return false;
                };
                let matches = &mut bucket[ri].matches;
                let Some(mi) = matches.iter().position(|m| m.pattern == *pattern) else {
                    return false;
                };
                if matches[mi].state != RouteState::PendingRemoval || !matches[mi].list.is_empty()
                {
                    return false;
                }
                matches.remove(mi);
                if matches.is_empty() {
                    bucket.remove(ri);
                    if bucket.is_empty() {
                        self.pat_tab.remove(prefix_hash);
                    }
                    if let Some(n) = self.prefix_lens.get_mut(&prefix.len()) {
                        *n -= 1;
                        if *n == 0 {
                            self.prefix_lens.remove(&prefix.len());
                        }
                    }
                }
                true
            }
        }
    }

    /// Exact lookup for a published subject, counts the message
    pub fn lookup_publish(&mut self, subject: &Subject<'_>) -> Option<PublishLookup> {
        let bucket = self.sub_tab.get_mut(&subject.hash())?;
        let route = bucket
            .iter_mut()
            .find(|r| r.state == RouteState::Active && subject.equals(&r.subject))?;
        route.list.msg_cnt += 1;
        Some(PublishLookup {
            route: RouteRef::Subject {
                subject: route.subject.clone(),
                hash: route.hash,
            },
            expired: route.list.is_expired(),
        })
    }

    /// Drop the sids of `route` whose limit has passed
    pub fn resolve_expired(&mut self, route: &RouteRef) -> ExpireOutcome {
        let Some(list) = self.route_list_mut(route) else {
            return ExpireOutcome::default();
        };
        let removed = list.expire();
        let now_empty = list.is_empty();
        for sid in &removed {
            self.sid_tab.remove(sid);
            tracing::debug!(sid = %String::from_utf8_lossy(sid), "Sid expired");
        }
        if now_empty {
            self.set_state(route, RouteState::PendingRemoval);
            ExpireOutcome {
                removed,
                empty_route: Some(route.clone()),
                collision: self.route_collision(route),
            }
        } else {
            ExpireOutcome {
                removed,
                empty_route: None,
                collision: false,
            }
        }
    }

    /// Sids currently attached to `route`, in subscribe order
    pub fn sids(&self, route: &RouteRef) -> impl Iterator<Item = &Bytes> + '_ {
        self.route_list(route)
            .into_iter()
            .flat_map(|list| list.sids.iter().map(|r| &r.sid))
    }

    /// Find the pattern route for a literal prefix
    pub fn lookup_pattern(&self, prefix: &Subject<'_>) -> Option<PatternCursor> {
        let hash = prefix.hash();
        let route_idx = self
            .pat_tab
            .get(&hash)?
            .iter()
            .position(|r| prefix.equals(&r.prefix))?;
        Some(PatternCursor {
            hash,
            route_idx,
            match_idx: 0,
        })
    }

    /// Next wildcard match under the cursor that accepts `subject`
    ///
    /// Counts the message on the match. Routes emptied while walking stay in
    /// place until `remove_empty_route`, so the cursor remains valid.
    pub fn match_next(
        &mut self,
        cursor: &mut PatternCursor,
        subject: &[u8],
    ) -> Option<PublishLookup> {
        let route = self.pat_tab.get_mut(&cursor.hash)?.get_mut(cursor.route_idx)?;
        while cursor.match_idx < route.matches.len() {
            let wm = &mut route.matches[cursor.match_idx];
            cursor.match_idx += 1;
            if wm.state == RouteState::Active && wm.accepts(subject) {
                wm.list.msg_cnt += 1;
                return Some(PublishLookup {
                    route: RouteRef::Pattern {
                        prefix: route.prefix.clone(),
                        prefix_hash: route.hash,
                        pattern: wm.pattern.clone(),
                    },
                    expired: wm.list.is_expired(),
                });
            }
        }
        None
    }

    /// Sids of every active pattern accepting `subject`, without counting
    /// the message
    pub fn matching_pattern_sids(&self, subject: &[u8]) -> Vec<&Bytes> {
        let mut out = Vec::new();
        for len in self.prefix_lens.keys().copied() {
            if len > subject.len() {
                break;
            }
            let prefix = Subject::new(&subject[..len]);
            let Some(bucket) = self.pat_tab.get(&prefix.hash()) else {
                continue;
            };
            for route in bucket.iter().filter(|r| prefix.equals(&r.prefix)) {
                for m in &route.matches {
                    if m.state == RouteState::Active && m.accepts(subject) {
                        out.extend(m.list.sids.iter().map(|r| &r.sid));
                    }
                }
            }
        }
        out
    }

    /// Prefix lengths that have at least one pattern route, ascending
    pub fn pattern_prefix_lens(&self) -> impl Iterator<Item = usize> + '_ {
        self.prefix_lens.keys().copied()
    }

    /// Whether a literal subject has subscribers
    pub fn is_subscribed(&self, subject: &Subject<'_>) -> SubscriptionStatus {
        match self.sub_tab.get(&subject.hash()) {
            Some(bucket) => SubscriptionStatus {
                subscribed: bucket
                    .iter()
                    .any(|r| r.state == RouteState::Active && subject.equals(&r.subject)),
                collision: bucket.len() > 1,
            },
            None => SubscriptionStatus::default(),
        }
    }

    /// Whether a wildcard pattern has subscribers
    pub fn is_psubscribed(&self, pattern: &Subject<'_>) -> SubscriptionStatus {
        let Some(prefix_len) = pattern.wildcard_prefix_len() else {
            return SubscriptionStatus::default();
        };
        let prefix = pattern.prefix(prefix_len);
        let Some(bucket) = self.pat_tab.get(&prefix.hash()) else {
            return SubscriptionStatus::default();
        };
        let route = bucket.iter().find(|r| prefix.equals(&r.prefix));
        SubscriptionStatus {
            subscribed: route.is_some_and(|r| {
                r.matches
                    .iter()
                    .any(|m| m.state == RouteState::Active && pattern.equals(&m.pattern))
            }),
            collision: bucket.len() > 1 || route.is_some_and(|r| r.matches.len() > 1),
        }
    }

    /// Every subscribed subject and pattern
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut out = Vec::new();
        for bucket in self.sub_tab.values() {
            for r in bucket.iter().filter(|r| !r.list.is_empty()) {
                out.push(SubscriptionInfo {
                    route: RouteRef::Subject {
                        subject: r.subject.clone(),
                        hash: r.hash,
                    },
                    sid_count: r.list.len(),
                    collision: bucket.len() > 1,
                });
            }
        }
        for bucket in self.pat_tab.values() {
            for r in bucket {
                for m in r.matches.iter().filter(|m| !m.list.is_empty()) {
                    out.push(SubscriptionInfo {
                        route: RouteRef::Pattern {
                            prefix: r.prefix.clone(),
                            prefix_hash: r.hash,
                            pattern: m.pattern.clone(),
                        },
                        sid_count: m.list.len(),
                        collision: bucket.len() > 1 || r.matches.len() > 1,
                    });
                }
            }
        }
        out
    }

    /// Release everything, returning what was subscribed
    pub fn release(&mut self) -> Vec<SubscriptionInfo> {
        let subs = self.subscriptions();
        self.sub_tab.clear();
        self.pat_tab.clear();
        self.sid_tab.clear();
        self.prefix_lens.clear();
        subs
    }

    /// Look up a sid entry
    pub fn sid_entry(&self, sid: &[u8]) -> Option<&SidEntry> {
        self.sid_tab.get(sid)
    }

    /// Number of active sids
    pub fn sid_count(&self) -> usize {
        self.sid_tab.len()
    }

    /// Number of literal and wildcard routes, including ones pending removal
    pub fn route_count(&self) -> usize {
        let subjects: usize = self.sub_tab.values().map(Vec::len).sum();
        let patterns: usize = self
            .pat_tab
            .values()
            .flat_map(|b| b.iter())
            .map(|r| r.matches.len())
            .sum();
        subjects + patterns
    }

    pub fn is_empty(&self) -> bool {
        self.sid_tab.is_empty()
    }

    fn list_mut(&mut self, owner: &SidOwner) -> Option<&mut SidList> {
        match owner {
            SidOwner::Subject { subject, hash } => self
                .sub_tab
                .get_mut(hash)?
                .iter_mut()
                .find(|r| r.subject == *subject)
                .map(|r| &mut r.list),
            SidOwner::Pattern {
                prefix,
                prefix_hash,
                pattern,
            } => self.pattern_list_mut(prefix, *prefix_hash, pattern),
        }
    }

    fn pattern_list_mut(
        &mut self,
        prefix: &Bytes,
        prefix_hash: u32,
        pattern: &Bytes,
    ) -> Option<&mut SidList> {
        self.pat_tab
            .get_mut(&prefix_hash)?
            .iter_mut()
            .find(|r| r.prefix == *prefix)?
            .matches
            .iter_mut()
            .find(|m| m.pattern == *pattern)
            .map(|m| &mut m.list)
    }

    fn route_list_mut(&mut self, route: &RouteRef) -> Option<&mut SidList> {
        match route {
            RouteRef::Subject { subject, hash } => self
                .sub_tab
                .get_mut(hash)?
                .iter_mut()
                .find(|r| r.subject == *subject)
                .map(|r| &mut r.list),
            RouteRef::Pattern {
                prefix,
                prefix_hash,
                pattern,
            } => self.pattern_list_mut(prefix, *prefix_hash, pattern),
        }
    }

    fn route_list(&self, route: &RouteRef) -> Option<&SidList> {
        match route {
            RouteRef::Subject { subject, hash } => self
                .sub_tab
                .get(hash)?
                .iter()
                .find(|r| r.subject == *subject)
                .map(|r| &r.list),
            RouteRef::Pattern {
                prefix,
                prefix_hash,
                pattern,
            } => self
                .pat_tab
                .get(prefix_hash)?
                .iter()
                .find(|r| r.prefix == *prefix)?
                .matches
                .iter()
                .find(|m| m.pattern == *pattern)
                .map(|m| &m.list),
        }
    }

    fn set_state(&mut self, route: &RouteRef, state: RouteState) {
        match route {
            RouteRef::Subject { subject, hash } => {
                if let Some(r) = self
                    .sub_tab
                    .get_mut(hash)
                    .and_then(|b| b.iter_mut().find(|r| r.subject == *subject))
                {
                    r.state = state;
                }
            }
            RouteRef::Pattern {
                prefix,
                prefix_hash,
                pattern,
            } => {
                if let Some(m) = self
                    .pat_tab
                    .get_mut(prefix_hash)
                    .and_then(|b| b.iter_mut().find(|r| r.prefix == *prefix))
                    .and_then(|r| r.matches.iter_mut().find(|m| m.pattern == *pattern))
                {
                    m.state = state;
                }
            }
        }
    }

    /// Whether the route shares its fabric hash with other routes
    fn route_collision(&self, route: &RouteRef) -> bool {
        match route {
            RouteRef::Subject { hash, .. } => self.sub_tab.get(hash).is_some_and(|b| b.len() > 1),
            RouteRef::Pattern {
                prefix,
                prefix_hash,
                ..
            } => self.pat_tab.get(prefix_hash).is_some_and(|b| {
                b.len() > 1
                    || b
                        .iter()
                        .find(|r| r.prefix == *prefix)
                        .is_some_and(|r| r.matches.len() > 1)
            }),
        }
    }
}

impl Default for SubscriptionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriptionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMap")
            .field("subjects", &self.sub_tab.len())
            .field("prefixes", &self.pat_tab.len())
            .field("sids", &self.sid_tab.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(map: &mut SubscriptionMap, subject: &str, sid: &str) -> SubscribeOutcome {
        map.subscribe(&Subject::new(subject.as_bytes()), sid.as_bytes())
            .unwrap()
    }

    fn publish(map: &mut SubscriptionMap, subject: &str) -> Option<(Vec<Bytes>, bool)> {
        let lookup = map.lookup_publish(&Subject::new(subject.as_bytes()))?;
        if lookup.expired {
            let out = map.resolve_expired(&lookup.route);
            if let Some(route) = out.empty_route {
                map.remove_empty_route(&route);
            }
        }
        let sids = map.sids(&lookup.route).cloned().collect();
        Some((sids, lookup.expired))
    }

    /// Every pattern sid accepting `subject`, across all prefix lengths
    fn pattern_sids(map: &mut SubscriptionMap, subject: &str) -> Vec<Bytes> {
        let lens: Vec<usize> = map.pattern_prefix_lens().collect();
        let mut out = Vec::new();
        for len in lens.into_iter().filter(|&l| l <= subject.len()) {
            let prefix = Subject::new(&subject.as_bytes()[..len]);
            if let Some(mut cursor) = map.lookup_pattern(&prefix) {
                while let Some(hit) = map.match_next(&mut cursor, subject.as_bytes()) {
                    out.extend(map.sids(&hit.route).cloned());
                }
            }
        }
        out
    }

    #[test]
    fn test_subscribe_and_publish() {
        let mut map = SubscriptionMap::new();

        let out = sub(&mut map, "A.B", "1");
        assert!(out.is_new);
        assert!(!out.collision);

        // Second sid on the same subject
        let out = sub(&mut map, "A.B", "2");
        assert!(!out.is_new);

        let (sids, expired) = publish(&mut map, "A.B").unwrap();
        assert_eq!(sids, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
        assert!(!expired);

        assert!(publish(&mut map, "A.C").is_none());
    }

    #[test]
    fn test_duplicate_sid() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "A.B", "1");

        let err = map.subscribe(&Subject::new(b"X"), b"1");
        assert!(matches!(err, Err(RegistryError::Exists(_))));
    }

    #[test]
    fn test_unsubscribe_twice() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "A.B", "1");

        let out = map.unsubscribe(b"1", 0).unwrap();
        assert_eq!(out.status, UnsubscribeStatus::Removed);
        let route = out.empty_route.unwrap();
        assert!(map.remove_empty_route(&route));

        let err = map.unsubscribe(b"1", 0);
        assert!(matches!(err, Err(RegistryError::NotFound(_))));
        assert!(map.is_empty());
        assert_eq!(map.route_count(), 0);
    }

    #[test]
    fn test_two_phase_route_removal() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "A.B", "1");

        let out = map.unsubscribe(b"1", 0).unwrap();
        let route = out.empty_route.unwrap();

        // Detached from lookups, still present until removed
        assert!(publish(&mut map, "A.B").is_none());
        assert_eq!(map.route_count(), 1);

        // Resubscribe before removal revives the route
        let again = sub(&mut map, "A.B", "2");
        assert!(again.is_new);
        assert!(!map.remove_empty_route(&route));
        assert!(map.is_subscribed(&Subject::new(b"A.B")).subscribed);
    }

    #[test]
    fn test_deferred_expiry() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "S", "X");

        let out = map.unsubscribe(b"X", 2).unwrap();
        assert_eq!(out.status, UnsubscribeStatus::Deferred);
        assert_eq!(map.sid_entry(b"X").unwrap().max_msgs, 2);

        let (sids, expired) = publish(&mut map, "S").unwrap();
        assert_eq!(sids.len(), 1);
        assert!(!expired);

        let (sids, expired) = publish(&mut map, "S").unwrap();
        assert_eq!(sids.len(), 1);
        assert!(!expired);

        // Third publish expires and removes the sid
        let (sids, expired) = publish(&mut map, "S").unwrap();
        assert!(expired);
        assert!(sids.is_empty());
        assert!(map.sid_entry(b"X").is_none());
        assert_eq!(map.route_count(), 0);
    }

    #[test]
    fn test_deferred_limit_already_reached() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "S", "X");
        sub(&mut map, "S", "Y");
        publish(&mut map, "S");
        publish(&mut map, "S");

        // X already got two messages
        let out = map.unsubscribe(b"X", 2).unwrap();
        assert_eq!(out.status, UnsubscribeStatus::Removed);
        assert!(out.empty_route.is_none());

        let out = map.unsubscribe(b"Y", 3).unwrap();
        assert_eq!(out.status, UnsubscribeStatus::Deferred);
    }

    #[test]
    fn test_expiry_keeps_other_sids() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "S", "a");
        sub(&mut map, "S", "b");
        map.unsubscribe(b"a", 1).unwrap();
        map.unsubscribe(b"b", 3).unwrap();

        let (sids, _) = publish(&mut map, "S").unwrap();
        assert_eq!(sids.len(), 2);

        let (sids, expired) = publish(&mut map, "S").unwrap();
        assert!(expired);
        assert_eq!(sids, vec![Bytes::from_static(b"b")]);

        let (sids, expired) = publish(&mut map, "S").unwrap();
        assert!(!expired);
        assert_eq!(sids.len(), 1);
    }

    #[test]
    fn test_hash_collision() {
        let mut map = SubscriptionMap::new();

        let first = map.subscribe(&Subject::with_hash(b"foo", 42), b"1").unwrap();
        assert!(!first.collision);

        let second = map.subscribe(&Subject::with_hash(b"bar", 42), b"2").unwrap();
        assert!(second.is_new);
        assert!(second.collision);

        // Both retrievable by their bytes
        let foo = map.lookup_publish(&Subject::with_hash(b"foo", 42)).unwrap();
        assert_eq!(map.sids(&foo.route).collect::<Vec<_>>(), vec![&Bytes::from_static(b"1")]);
        let bar = map.lookup_publish(&Subject::with_hash(b"bar", 42)).unwrap();
        assert_eq!(map.sids(&bar.route).collect::<Vec<_>>(), vec![&Bytes::from_static(b"2")]);
        assert!(map.lookup_publish(&Subject::with_hash(b"baz", 42)).is_none());

        // Emptying one route reports the shared bucket
        let out = map.unsubscribe(b"1", 0).unwrap();
        assert!(out.collision);
        assert!(map.remove_empty_route(&out.empty_route.unwrap()));
        let status = map.is_subscribed(&Subject::with_hash(b"bar", 42));
        assert!(status.subscribed);
        assert!(!status.collision);
    }

    #[test]
    fn test_too_many() {
        let mut map = SubscriptionMap::new();
        let long_sid = vec![b'x'; 30_000];
        map.subscribe(&Subject::new(b"S"), &long_sid).unwrap();

        let mut second = long_sid.clone();
        second[0] = b'y';
        map.subscribe(&Subject::new(b"S"), &second).unwrap();

        let mut third = long_sid.clone();
        third[0] = b'z';
        let err = map.subscribe(&Subject::new(b"S"), &third);
        assert!(matches!(err, Err(RegistryError::TooMany { .. })));
        assert_eq!(map.sid_count(), 2);
    }

    #[test]
    fn test_wildcard_match() {
        let mut map = SubscriptionMap::new();
        assert!(sub(&mut map, "A.*.C", "1").is_new);
        assert!(sub(&mut map, "A.>", "2").is_new);

        assert_eq!(pattern_sids(&mut map, "A.B.C").len(), 2);
        assert_eq!(pattern_sids(&mut map, "A.X.C").len(), 2);
        assert_eq!(pattern_sids(&mut map, "A.B.B.C"), vec![Bytes::from_static(b"2")]);
        assert_eq!(pattern_sids(&mut map, "A.C"), vec![Bytes::from_static(b"2")]);
        assert!(pattern_sids(&mut map, "A").is_empty());
        assert!(pattern_sids(&mut map, "B.C").is_empty());
    }

    #[test]
    fn test_patterns_share_prefix() {
        let mut map = SubscriptionMap::new();
        let first = sub(&mut map, "A.*.C", "1");
        assert!(!first.collision);

        // Same prefix "A.", different pattern
        let second = sub(&mut map, "A.*.D", "2");
        assert!(second.is_new);
        assert!(second.collision);
        assert_eq!(map.pattern_prefix_lens().collect::<Vec<_>>(), vec![2]);

        let third = sub(&mut map, "A.*.D", "3");
        assert!(!third.is_new);

        assert_eq!(pattern_sids(&mut map, "A.x.D").len(), 2);

        let status = map.is_psubscribed(&Subject::new(b"A.*.C"));
        assert!(status.subscribed);
        assert!(status.collision);
        assert!(!map.is_psubscribed(&Subject::new(b"A.*.E")).subscribed);
    }

    #[test]
    fn test_pattern_removal() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "A.*.C", "1");
        sub(&mut map, "B.>", "2");

        let out = map.unsubscribe(b"1", 0).unwrap();
        let route = out.empty_route.unwrap();
        assert!(route.is_pattern());
        assert!(map.remove_empty_route(&route));

        assert_eq!(map.pattern_prefix_lens().collect::<Vec<_>>(), vec![2]);
        assert!(pattern_sids(&mut map, "A.B.C").is_empty());
        assert_eq!(pattern_sids(&mut map, "B.C").len(), 1);
    }

    #[test]
    fn test_pattern_deferred_expiry() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "A.>", "w");
        map.unsubscribe(b"w", 1).unwrap();

        let prefix = Subject::new(b"A.");
        let mut cursor = map.lookup_pattern(&prefix).unwrap();
        let hit = map.match_next(&mut cursor, b"A.B").unwrap();
        assert!(!hit.expired);

        let mut cursor = map.lookup_pattern(&prefix).unwrap();
        let hit = map.match_next(&mut cursor, b"A.B").unwrap();
        assert!(hit.expired);
        let out = map.resolve_expired(&hit.route);
        assert_eq!(out.removed, vec![Bytes::from_static(b"w")]);

        // The cursor stays valid while the emptied match is pending
        assert!(map.match_next(&mut cursor, b"A.B").is_none());
        assert!(map.remove_empty_route(&out.empty_route.unwrap()));
        assert!(map.lookup_pattern(&prefix).is_none());
    }

    #[test]
    fn test_matching_pattern_sids() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, ">", "-1");
        sub(&mut map, "A.*", "-2");
        sub(&mut map, "A.B.>", "-3");
        sub(&mut map, "A.B", "4");

        let mut sids = map.matching_pattern_sids(b"A.B");
        sids.sort();
        assert_eq!(sids, vec![&Bytes::from_static(b"-1"), &Bytes::from_static(b"-2")]);
        assert_eq!(map.matching_pattern_sids(b"Z").len(), 1);
        assert_eq!(map.matching_pattern_sids(b"A.B.C").len(), 2);
    }

    #[test]
    fn test_subscriptions_and_release() {
        let mut map = SubscriptionMap::new();
        sub(&mut map, "A.B", "1");
        sub(&mut map, "A.B", "2");
        sub(&mut map, "A.>", "3");

        let mut subs = map.subscriptions();
        subs.sort_by(|a, b| a.route.subject().cmp(b.route.subject()));
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].route.subject().as_ref(), b"A.>");
        assert_eq!(subs[1].sid_count, 2);

        let released = map.release();
        assert_eq!(released.len(), 2);
        assert!(map.is_empty());
        assert_eq!(map.route_count(), 0);
        assert_eq!(map.pattern_prefix_lens().count(), 0);
    }

    #[test]
    fn test_bad_pattern_leaves_no_state() {
        let mut map = SubscriptionMap::new();
        let err = map.subscribe(&Subject::new(&[b'A', b'.', b'*', b'.', 0xff]), b"1");
        assert!(matches!(err, Err(RegistryError::BadPattern(_))));
        assert!(map.is_empty());
        assert_eq!(map.pattern_prefix_lens().count(), 0);
        assert_eq!(map.route_count(), 0);
    }
}
