//! Server callbacks
//!
//! Implement `NatsHandler` to authorize connections and observe their end.
//! Every method has a default, so a handler only overrides what it needs.

use std::future::Future;

use crate::session::SessionContext;

/// Hooks invoked by the connection task
pub trait NatsHandler: Send + Sync + 'static {
    /// Called once the session is established, by CONNECT or implicitly
    ///
    /// `ctx` carries the parsed CONNECT fields (name, user, pass,
    /// auth_token). Return false to refuse the connection.
    fn on_connect(&self, _ctx: &SessionContext) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Called after the connection closed and its subscriptions were released
    fn on_disconnect(&self, _ctx: &SessionContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Accepts everyone
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl NatsHandler for AcceptAll {}
