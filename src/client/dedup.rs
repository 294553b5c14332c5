//! Wildcard delivery deduplication
//!
//! A client subscribed to `A.B` (sid `1`) and `A.>` (sid `-2`) gets the same
//! publish twice, once per sid. Only one copy may go to the application.
//!
//! Rules, applied per received MSG:
//! - A literal sid is dropped when some local pattern also accepts the
//!   subject; the pattern's copy is kept instead.
//! - Among pattern sids, only the numerically greatest sid whose pattern
//!   accepts the subject is kept.
//!
//! The first-character counts let the common case (no pattern could
//! possibly match) skip the pattern walk.

use crate::protocol::constants::WILDCARD_SID_MARK;
use crate::protocol::parser::parse_decimal;
use crate::protocol::subject::wildcard_prefix_len;
use crate::registry::SubscriptionMap;

/// Whether a received MSG goes to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Duplicate,
}

/// Active pattern counts by first character
#[derive(Debug, Clone)]
pub struct WildcardIndex {
    first_char: [u32; 256],
    /// Patterns starting with a wildcard token match any first character
    any: u32,
}

impl WildcardIndex {
    pub fn new() -> Self {
        Self {
            first_char: [0; 256],
            any: 0,
        }
    }

    pub fn add(&mut self, pattern: &[u8]) {
        match first_literal(pattern) {
            Some(c) => self.first_char[c as usize] += 1,
            None => self.any += 1,
        }
    }

    pub fn remove(&mut self, pattern: &[u8]) {
        let slot = match first_literal(pattern) {
            Some(c) => &mut self.first_char[c as usize],
            None => &mut self.any,
        };
        *slot = slot.saturating_sub(1);
    }

    /// Patterns that could match a subject starting with `first`
    pub fn possible_matches(&self, first: Option<u8>) -> u32 {
        self.any + first.map_or(0, |c| self.first_char[c as usize])
    }

    pub fn is_empty(&self) -> bool {
        self.any == 0 && self.first_char.iter().all(|&n| n == 0)
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Default for WildcardIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// First byte of the literal prefix, `None` when the pattern starts wild
fn first_literal(pattern: &[u8]) -> Option<u8> {
    match wildcard_prefix_len(pattern) {
        Some(0) => None,
        _ => pattern.first().copied(),
    }
}

fn is_wild_sid(sid: &[u8]) -> bool {
    sid.first() == Some(&WILDCARD_SID_MARK)
}

fn wild_sid_number(sid: &[u8]) -> Option<u64> {
    if is_wild_sid(sid) {
        parse_decimal(&sid[1..])
    } else {
        None
    }
}

/// Decide whether the MSG for `subject` tagged with `sid` is a duplicate
pub fn verdict(
    index: &WildcardIndex,
    subs: &SubscriptionMap,
    subject: &[u8],
    sid: &[u8],
) -> Verdict {
    let wild = is_wild_sid(sid);
    let possible = index.possible_matches(subject.first().copied());
    let pmatch = if wild {
        possible
    } else if possible > 0 {
        2 // the subject and a pattern
    } else {
        1
    };
    if pmatch <= 1 {
        return Verdict::Deliver;
    }

    let matching = subs.matching_pattern_sids(subject);
    if !wild {
        return if matching.is_empty() {
            Verdict::Deliver
        } else {
            Verdict::Duplicate
        };
    }

    let max_sid = matching.iter().filter_map(|s| wild_sid_number(s)).max();
    match (max_sid, wild_sid_number(sid)) {
        (None, _) | (_, None) => Verdict::Deliver,
        (Some(max), Some(own)) if own == max => Verdict::Deliver,
        _ => Verdict::Duplicate,
    }
}
