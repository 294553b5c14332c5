//! Server-side protocol engine
//!
//! One `NatsService` per accepted connection. It owns the connection's
//! parser, subscription map and output buffer, and does no I/O: the caller
//! feeds it received bytes and publishes from the routing fabric, then
//! drains `take_output` to the socket.
//!
//! ```text
//!   socket bytes ──► on_bytes_readable ──► SUB/UNSUB ──► SubscriptionMap
//!                                      └─► PUB ──────► fabric.forward
//!   fabric ──────► on_publish_from_fabric ──► MSG lines ──► output
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::encoder;
use crate::protocol::message::{ConnectOptions, Frame};
use crate::protocol::parser::FrameParser;
use crate::protocol::subject::Subject;
use crate::registry::{RegistryError, RouteRef, SubscriptionMap, UnsubscribeStatus};
use crate::route::{Publish, RouteFabric, SubNotify};
use crate::session::state::{SessionPhase, SessionState};
use crate::stats::SessionStats;

use super::config::ServerConfig;

/// Something the caller may want to act on after feeding bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Session established by CONNECT or by the first command
    Connected {
        opts: ConnectOptions,
        implicit: bool,
    },
    /// A PUB was handed to the fabric
    Published { subject: Bytes, delivered: bool },
    /// Peer sent something malformed; `fatal` closes the connection
    ProtocolError { error: ProtocolError, fatal: bool },
}

/// Result of delivering a fabric publish to this connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No sid matched, or the publish was our own and echo is off
    Skipped,
    /// MSG lines were queued for the peer
    Written {
        msgs: usize,
        /// Output is above the high-water mark
        backpressure: bool,
    },
}

/// Per-connection server engine
pub struct NatsService {
    state: SessionState,
    parser: FrameParser,
    subs: SubscriptionMap,
    fabric: Arc<dyn RouteFabric>,
    out: BytesMut,
    high_water: usize,
    /// Last forward was refused by some receiver
    fabric_backpressure: bool,
    stats: SessionStats,
}

impl NatsService {
    /// Create the engine and queue the INFO line
    pub fn new(
        conn_id: u64,
        peer_addr: SocketAddr,
        config: &ServerConfig,
        fabric: Arc<dyn RouteFabric>,
    ) -> Self {
        let mut out = BytesMut::with_capacity(1024);
        if let Err(e) = encoder::write_info(&mut out, &config.server_info()) {
            tracing::error!(conn_id = conn_id, error = %e, "Failed to encode INFO");
        }

        Self {
            state: SessionState::new(conn_id, peer_addr),
            parser: FrameParser::with_limits(config.max_payload, config.max_control_line),
            subs: SubscriptionMap::new(),
            fabric,
            out,
            high_water: config.write_high_water,
            fabric_backpressure: false,
            stats: SessionStats::new(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.state.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn subscriptions(&self) -> &SubscriptionMap {
        &self.subs
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.stats.clone();
        stats.duration = self.state.duration();
        stats
    }

    /// The connection should be closed once output is flushed
    pub fn is_closing(&self) -> bool {
        matches!(self.state.phase, SessionPhase::Closing | SessionPhase::Closed)
    }

    /// Stop reading until the peer or the fabric catches up
    pub fn wants_pause(&self) -> bool {
        self.out.len() >= self.high_water || self.fabric_backpressure
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Bytes ready to be written to the socket
    pub fn take_output(&mut self) -> BytesMut {
        self.stats.bytes_sent += self.out.len() as u64;
        self.out.split()
    }

    /// Consume as many complete commands as `buf` holds
    ///
    /// Partial lines and payloads stay in `buf` for the next call.
    pub fn on_bytes_readable(&mut self, buf: &mut BytesMut) -> Vec<ServiceEvent> {
        let mut events = Vec::new();
        let start_len = buf.len();
        self.fabric_backpressure = false;

        while !self.is_closing() {
            match self.parser.parse(buf) {
                Ok(Some(frame)) => self.on_frame(frame, &mut events),
                Ok(None) => break,
                Err(error) => {
                    let fatal = matches!(error, ProtocolError::LineTooLong { .. });
                    self.stats.protocol_errors += 1;
                    tracing::warn!(
                        conn_id = self.state.id,
                        error = %error,
                        fatal = fatal,
                        "Protocol error"
                    );
                    encoder::write_err(&mut self.out, error.reply_text());
                    if fatal {
                        self.state.close();
                    }
                    events.push(ServiceEvent::ProtocolError { error, fatal });
                }
            }
        }

        self.stats.bytes_received += (start_len - buf.len()) as u64;
        events
    }

    fn on_frame(&mut self, frame: Frame, events: &mut Vec<ServiceEvent>) {
        if self.state.phase == SessionPhase::Connected
            && matches!(
                frame,
                Frame::Sub { .. } | Frame::Unsub { .. } | Frame::Pub { .. } | Frame::Ping
            )
        {
            self.state.implicit_connect();
            tracing::debug!(conn_id = self.state.id, "Implicit connect");
            events.push(ServiceEvent::Connected {
                opts: ConnectOptions::implicit(),
                implicit: true,
            });
        }

        match frame {
            Frame::Connect(json) => {
                let opts = ConnectOptions::parse(&json);
                tracing::info!(
                    conn_id = self.state.id,
                    name = opts.name.as_deref().unwrap_or(""),
                    user = opts.user.as_deref().unwrap_or(""),
                    verbose = opts.verbose,
                    echo = opts.echo,
                    "CONNECT"
                );
                self.state.on_connect(opts.clone());
                if opts.verbose {
                    encoder::write_ok(&mut self.out);
                }
                events.push(ServiceEvent::Connected {
                    opts,
                    implicit: false,
                });
            }
            Frame::Sub {
                subject,
                queue,
                sid,
            } => {
                if queue.is_some() {
                    tracing::debug!(conn_id = self.state.id, "Queue group ignored");
                }
                self.on_sub(subject, sid, events);
            }
            Frame::Unsub { sid, max_msgs } => self.on_unsub(&sid, max_msgs),
            Frame::Pub {
                subject,
                reply,
                payload,
            } => self.on_pub(subject, reply, payload, events),
            Frame::Ping => encoder::write_pong(&mut self.out),
            Frame::Pong => {}
            other => {
                tracing::debug!(
                    conn_id = self.state.id,
                    keyword = other.keyword(),
                    "Ignoring client-bound frame"
                );
            }
        }
    }

    fn reply_error(&mut self, error: ProtocolError, events: &mut Vec<ServiceEvent>) {
        self.stats.protocol_errors += 1;
        tracing::warn!(conn_id = self.state.id, error = %error, "Protocol error");
        encoder::write_err(&mut self.out, error.reply_text());
        events.push(ServiceEvent::ProtocolError {
            error,
            fatal: false,
        });
    }

    fn on_sub(&mut self, subject: Bytes, sid: Bytes, events: &mut Vec<ServiceEvent>) {
        let subj = Subject::new(&subject);
        if self.state.pedantic() && !subj.is_valid() {
            let text = subj.to_string();
            self.reply_error(ProtocolError::InvalidSubject(text), events);
            return;
        }

        match self.subs.subscribe(&subj, &sid) {
            Ok(outcome) => {
                if outcome.is_new {
                    if let Some(route) = self
                        .subs
                        .sid_entry(&sid)
                        .map(|e| RouteRef::from(e.owner.clone()))
                    {
                        let notify = self.notify_for(&route, outcome.collision);
                        self.fabric.notify_subscribe(&notify);
                    }
                }
                if self.state.verbose() {
                    encoder::write_ok(&mut self.out);
                }
            }
            Err(e) => {
                tracing::warn!(
                    conn_id = self.state.id,
                    subject = %subj,
                    sid = %String::from_utf8_lossy(&sid),
                    error = %e,
                    "Subscribe failed"
                );
                encoder::write_err(&mut self.out, subscribe_error_text(&e));
            }
        }
    }

    fn on_unsub(&mut self, sid: &[u8], max_msgs: u64) {
        match self.subs.unsubscribe(sid, max_msgs) {
            Ok(outcome) => {
                if let (UnsubscribeStatus::Removed, Some(route)) =
                    (outcome.status, outcome.empty_route)
                {
                    self.detach_route(&route, outcome.collision);
                }
            }
            Err(e) => {
                // Unknown sid is not fatal
                tracing::warn!(
                    conn_id = self.state.id,
                    sid = %String::from_utf8_lossy(sid),
                    error = %e,
                    "Unsubscribe failed"
                );
            }
        }
        if self.state.verbose() {
            encoder::write_ok(&mut self.out);
        }
    }

    fn on_pub(
        &mut self,
        subject: Bytes,
        reply: Option<Bytes>,
        payload: Bytes,
        events: &mut Vec<ServiceEvent>,
    ) {
        let subj = Subject::new(&subject);
        if self.state.pedantic() && (!subj.is_valid() || subj.is_wild()) {
            let text = subj.to_string();
            self.reply_error(ProtocolError::InvalidSubject(text), events);
            return;
        }
        let subject_hash = subj.hash();
        self.stats.msgs_received += 1;

        if self.state.verbose() {
            encoder::write_ok(&mut self.out);
        }

        let msg = Publish {
            subject: subject.clone(),
            reply,
            payload,
            src_conn: self.state.id,
            subject_hash,
        };
        let delivered = self.fabric.forward(&msg);
        if !delivered {
            self.fabric_backpressure = true;
        }
        events.push(ServiceEvent::Published { subject, delivered });
    }

    /// Queue MSG lines for every local sid matching a fabric publish
    pub fn on_publish_from_fabric(&mut self, msg: &Publish) -> Delivery {
        if msg.src_conn == self.state.id && !self.state.echo() {
            return Delivery::Skipped;
        }

        let subject = Subject::with_hash(&msg.subject, msg.subject_hash);
        let mut msgs = 0;
        let mut emptied: Vec<(RouteRef, bool)> = Vec::new();

        if let Some(hit) = self.subs.lookup_publish(&subject) {
            msgs += self.deliver_route(&hit.route, hit.expired, msg, &mut emptied);
        }

        let lens: Vec<usize> = self
            .subs
            .pattern_prefix_lens()
            .take_while(|&len| len <= msg.subject.len())
            .collect();
        for len in lens {
            let prefix = subject.prefix(len);
            let Some(mut cursor) = self.subs.lookup_pattern(&prefix) else {
                continue;
            };
            while let Some(hit) = self.subs.match_next(&mut cursor, &msg.subject) {
                msgs += self.deliver_route(&hit.route, hit.expired, msg, &mut emptied);
            }
        }

        // Routes emptied by expiry are detached after the walk
        for (route, collision) in emptied {
            self.detach_route(&route, collision);
        }

        if msgs == 0 {
            return Delivery::Skipped;
        }
        self.stats.msgs_sent += msgs as u64;
        Delivery::Written {
            msgs,
            backpressure: self.out.len() >= self.high_water,
        }
    }

    fn deliver_route(
        &mut self,
        route: &RouteRef,
        expired: bool,
        msg: &Publish,
        emptied: &mut Vec<(RouteRef, bool)>,
    ) -> usize {
        if expired {
            let outcome = self.subs.resolve_expired(route);
            if let Some(empty) = outcome.empty_route {
                emptied.push((empty, outcome.collision));
            }
        }
        let mut n = 0;
        for sid in self.subs.sids(route) {
            encoder::write_msg(
                &mut self.out,
                &msg.subject,
                sid,
                msg.reply.as_deref(),
                &msg.payload,
            );
            n += 1;
        }
        n
    }

    fn notify_for(&self, route: &RouteRef, collision: bool) -> SubNotify {
        SubNotify {
            conn_id: self.state.id,
            subject: route.subject().clone(),
            hash: route.fabric_hash(),
            prefix_len: route.prefix_len(),
            collision,
        }
    }

    /// Tell the fabric, then reclaim the route
    fn detach_route(&mut self, route: &RouteRef, collision: bool) {
        let notify = self.notify_for(route, collision);
        self.fabric.notify_unsubscribe(&notify);
        self.subs.remove_empty_route(route);
    }

    /// Refuse the session, used when the handler rejects CONNECT
    pub fn reject(&mut self, text: &str) {
        encoder::write_err(&mut self.out, text);
        self.state.close();
    }

    /// Withdraw every subscription from the fabric and release state
    ///
    /// Returns the number of subjects and patterns released.
    pub fn shutdown(&mut self) -> usize {
        if self.state.phase == SessionPhase::Closed {
            return 0;
        }
        let released = self.subs.release();
        for info in &released {
            let notify = self.notify_for(&info.route, info.collision);
            self.fabric.notify_unsubscribe(&notify);
        }
        self.parser.reset();
        self.state.mark_closed();
        tracing::debug!(
            conn_id = self.state.id,
            routes = released.len(),
            "Subscriptions released"
        );
        released.len()
    }
}

fn subscribe_error_text(e: &RegistryError) -> &'static str {
    match e {
        RegistryError::TooMany { .. } => "Too Many Subscriptions",
        RegistryError::BadPattern(_) | RegistryError::InvalidSubject(_) => "Invalid Subject",
        RegistryError::Exists(_) | RegistryError::NotFound(_) => "Invalid Subscription",
    }
}

impl std::fmt::Debug for NatsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsService")
            .field("conn_id", &self.state.id)
            .field("phase", &self.state.phase)
            .field("subs", &self.subs)
            .field("pending_output", &self.out.len())
            .finish()
    }
}
