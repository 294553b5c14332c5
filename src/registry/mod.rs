//! Subscription registry
//!
//! Maps subjects and wildcard patterns to the sids subscribed to them, for
//! one connection. No locking: each connection owns its own map.
//!
//! # Layout
//!
//! ```text
//!  sub_tab: hash(subject) ──► [SubjectRoute { subject, sids }]
//!  pat_tab: hash(prefix)  ──► [PatternRoute { prefix,
//!                                matches: [WildcardMatch { pattern, matcher, sids }] }]
//!  sid_tab: sid           ──► SidEntry { owner, base, max_msgs }
//! ```
//!
//! A bucket holding more than one route is a hash collision; routes are
//! always compared byte for byte.
//!
//! # Removal
//!
//! Emptying a route marks it `PendingRemoval` and hands back a `RouteRef`.
//! The caller notifies the routing fabric, then calls `remove_empty_route`.

pub mod entry;
pub mod error;
pub mod pattern;
pub mod store;

pub use entry::{RouteRef, RouteState, SidEntry, SidOwner};
pub use error::RegistryError;
pub use pattern::{PatternCompiler, PatternMatcher, RegexCompiler};
pub use store::{
    ExpireOutcome, PatternCursor, PublishLookup, SubscribeOutcome, SubscriptionInfo,
    SubscriptionMap, SubscriptionStatus, UnsubscribeOutcome, UnsubscribeStatus,
};
