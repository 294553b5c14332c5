//! Client-side protocol engine
//!
//! Speaks the client half of the protocol without doing I/O, the same way
//! `NatsService` does for the server half. Subscriptions get numeric sids,
//! negative for wildcard patterns, which the deduplicator relies on.
//!
//! Receive path for a `MSG`:
//!
//! ```text
//!   MSG ─► dedup ─► reassemble ─► decode +/< ─► ClientEvent::Message
//! ```

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::DEFAULT_MAX_PAYLOAD;
use crate::protocol::encoder;
use crate::protocol::fragment::{Fragmenter, Reassembler};
use crate::protocol::message::{Frame, ServerInfo};
use crate::protocol::parser::FrameParser;
use crate::protocol::subject::{crc32c, decode_wildcards, encode_wildcards, Subject};
use crate::registry::{RegistryError, SubscriptionMap};
use crate::stats::SessionStats;

use super::config::ClientConfig;
use super::dedup::{self, Verdict, WildcardIndex};

/// Client connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Waiting for the server's INFO
    AwaitingInfo,
    /// CONNECT sent
    Connected,
    Closed,
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake done
    Connected(ServerInfo),
    /// A deduplicated, reassembled message
    Message {
        subject: Bytes,
        reply: Option<Bytes>,
        payload: Bytes,
    },
    /// Non-fatal error, or the reason for a disconnect
    Error(String),
    Disconnected,
}

/// Per-connection client engine
pub struct NatsClient {
    config: ClientConfig,
    phase: ClientPhase,
    parser: FrameParser,
    info: Option<ServerInfo>,
    max_payload: usize,

    /// Local subscriptions keyed by the sids sent upstream
    subs: SubscriptionMap,
    /// Subject or pattern -> sid
    sids: HashMap<Bytes, Bytes>,
    wildcards: WildcardIndex,
    next_sid: u64,

    fragmenter: Fragmenter,
    reassembler: Reassembler,

    out: BytesMut,
    /// Commands issued before INFO, sent after CONNECT
    pending: BytesMut,
    stats: SessionStats,
}

impl NatsClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            phase: ClientPhase::AwaitingInfo,
            parser: FrameParser::new(),
            info: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            subs: SubscriptionMap::new(),
            sids: HashMap::new(),
            wildcards: WildcardIndex::new(),
            next_sid: 1,
            fragmenter: Fragmenter::new(source_id()),
            reassembler: Reassembler::new(DEFAULT_MAX_PAYLOAD),
            out: BytesMut::with_capacity(1024),
            pending: BytesMut::new(),
            stats: SessionStats::new(),
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ClientPhase::Connected
    }

    /// INFO last received from the server
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.info.as_ref()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Local subscription state
    pub fn subscriptions(&self) -> &SubscriptionMap {
        &self.subs
    }

    /// Partial fragment groups in flight
    pub fn pending_fragments(&self) -> usize {
        self.reassembler.pending_count()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Output is above the high-water mark
    pub fn wants_flush(&self) -> bool {
        self.out.len() >= self.config.high_water
    }

    /// Bytes ready to be written to the socket
    pub fn take_output(&mut self) -> BytesMut {
        self.stats.bytes_sent += self.out.len() as u64;
        self.out.split()
    }

    fn sink(&mut self) -> &mut BytesMut {
        match self.phase {
            ClientPhase::AwaitingInfo => &mut self.pending,
            _ => &mut self.out,
        }
    }

    /// Subscribe to a subject or wildcard pattern
    ///
    /// Returns false if it was already subscribed.
    pub fn subscribe(&mut self, subject: &[u8]) -> Result<bool> {
        if self.phase == ClientPhase::Closed {
            return Err(Error::ConnectionClosed);
        }
        let subj = Subject::new(subject);
        if !subj.is_valid() {
            return Err(RegistryError::InvalidSubject(subj.to_string()).into());
        }
        if self.sids.contains_key(subject) {
            return Ok(false);
        }

        let wild = subj.is_wild();
        let sid = if wild {
            format!("-{}", self.next_sid)
        } else {
            self.next_sid.to_string()
        };
        let sid = Bytes::from(sid);

        self.subs.subscribe(&subj, &sid)?;
        self.next_sid += 1;
        if wild {
            self.wildcards.add(subject);
        }
        self.sids.insert(Bytes::copy_from_slice(subject), sid.clone());
        encoder::write_sub(self.sink(), subject, None, &sid);

        tracing::debug!(subject = %subj, sid = %String::from_utf8_lossy(&sid), "SUB");
        Ok(true)
    }

    /// Drop a subscription made with `subscribe`
    ///
    /// Returns false if the subject was not subscribed.
    pub fn unsubscribe(&mut self, subject: &[u8]) -> Result<bool> {
        if self.phase == ClientPhase::Closed {
            return Err(Error::ConnectionClosed);
        }
        let Some(sid) = self.sids.remove(subject) else {
            return Ok(false);
        };

        let outcome = self.subs.unsubscribe(&sid, 0)?;
        if let Some(route) = outcome.empty_route {
            self.subs.remove_empty_route(&route);
        }
        if Subject::new(subject).is_wild() {
            self.wildcards.remove(subject);
        }
        encoder::write_unsub(self.sink(), &sid, 0);

        tracing::debug!(
            subject = %String::from_utf8_lossy(subject),
            sid = %String::from_utf8_lossy(&sid),
            "UNSUB"
        );
        Ok(true)
    }

    /// Publish, fragmenting payloads larger than the server's max payload
    ///
    /// Standalone `*` and `>` segments in the subject are sent as `+` and `<`.
    pub fn publish(&mut self, subject: &[u8], reply: Option<&[u8]>, payload: Bytes) -> Result<()> {
        if self.phase == ClientPhase::Closed {
            return Err(Error::ConnectionClosed);
        }
        if !Subject::new(subject).is_valid() {
            return Err(
                ProtocolError::InvalidSubject(String::from_utf8_lossy(subject).into_owned()).into(),
            );
        }
        let wire = encode_wildcards(subject);

        if payload.len() <= self.max_payload {
            encoder::write_pub(self.sink(), &wire, reply, &payload);
            return Ok(());
        }

        let hash = crc32c(&wire);
        let max_payload = self.max_payload;
        let frags = self.fragmenter.split(&payload, hash, max_payload);
        let last = frags.len().saturating_sub(1);
        tracing::debug!(
            subject = %String::from_utf8_lossy(subject),
            size = payload.len(),
            fragments = frags.len(),
            "Publishing fragmented payload"
        );
        for (i, frag) in frags.iter().enumerate() {
            let reply = if i == last { reply } else { None };
            encoder::write_pub(self.sink(), &wire, reply, frag);
        }
        Ok(())
    }

    /// Queue a PING
    pub fn ping(&mut self) {
        encoder::write_ping(self.sink());
    }

    /// Consume every complete frame in `buf`
    ///
    /// Errors are fatal: a `-ERR` from the server or a malformed frame. The
    /// engine is closed before the error is returned.
    pub fn on_bytes_readable(
        &mut self,
        buf: &mut BytesMut,
        events: &mut Vec<ClientEvent>,
    ) -> Result<()> {
        if self.phase == ClientPhase::Closed {
            return Err(Error::ConnectionClosed);
        }
        let start_len = buf.len();

        let result = loop {
            match self.parser.parse(buf) {
                Ok(Some(frame)) => {
                    if let Err(e) = self.on_frame(frame, events) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::Protocol(e)),
            }
        };

        self.stats.bytes_received += (start_len - buf.len()) as u64;
        if let Err(e) = &result {
            self.stats.protocol_errors += 1;
            tracing::warn!(error = %e, "Closing client connection");
            self.close();
        }
        result
    }

    fn on_frame(&mut self, frame: Frame, events: &mut Vec<ClientEvent>) -> Result<()> {
        match frame {
            Frame::Info(json) => self.on_info(ServerInfo::parse(&json), events)?,
            Frame::Msg {
                subject,
                sid,
                reply,
                payload,
            } => self.on_msg(subject, sid, reply, payload, events),
            Frame::Ping => encoder::write_pong(&mut self.out),
            Frame::Pong | Frame::Ok => {}
            Frame::Err(text) => {
                return Err(ProtocolError::Remote(text).into());
            }
            other => {
                tracing::debug!(keyword = other.keyword(), "Ignoring server-bound frame");
            }
        }
        Ok(())
    }

    fn on_info(&mut self, info: ServerInfo, events: &mut Vec<ClientEvent>) -> Result<()> {
        if info.max_payload > 0 {
            self.max_payload = info.max_payload;
            self.parser.set_max_payload(info.max_payload);
            self.reassembler.set_max_payload(info.max_payload);
        }

        if self.phase == ClientPhase::AwaitingInfo {
            encoder::write_connect(&mut self.out, &self.config.connect_options())
                .map_err(|e| ProtocolError::UnexpectedMessage(e.to_string()))?;
            let pending = self.pending.split();
            self.out.extend_from_slice(&pending);
            self.phase = ClientPhase::Connected;

            tracing::info!(
                server_id = %info.server_id,
                version = %info.version,
                max_payload = info.max_payload,
                "Connected"
            );
            events.push(ClientEvent::Connected(info.clone()));
        }
        self.info = Some(info);
        Ok(())
    }

    fn on_msg(
        &mut self,
        subject: Bytes,
        sid: Bytes,
        reply: Option<Bytes>,
        payload: Bytes,
        events: &mut Vec<ClientEvent>,
    ) {
        self.stats.msgs_received += 1;

        // Late delivery for a sid already unsubscribed
        if self.subs.sid_entry(&sid).is_none() {
            tracing::trace!(
                subject = %String::from_utf8_lossy(&subject),
                sid = %String::from_utf8_lossy(&sid),
                "Delivery for unknown sid dropped"
            );
            return;
        }

        if dedup::verdict(&self.wildcards, &self.subs, &subject, &sid) == Verdict::Duplicate {
            self.stats.duplicates_dropped += 1;
            tracing::trace!(
                subject = %String::from_utf8_lossy(&subject),
                sid = %String::from_utf8_lossy(&sid),
                "Duplicate delivery dropped"
            );
            return;
        }

        let groups = self.reassembler.pending_count();
        let accepted = self.reassembler.accept(crc32c(&subject), payload);
        let evicted = self.reassembler.take_evicted();
        self.stats.fragments_dropped += evicted as u64;
        let payload = match accepted {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                self.stats.fragments_dropped += 1;
                tracing::debug!(
                    subject = %String::from_utf8_lossy(&subject),
                    error = %e,
                    "Fragment discarded"
                );
                return;
            }
        };
        if self.reassembler.pending_count() + evicted < groups {
            self.stats.fragments_reassembled += 1;
        }

        self.stats.msgs_sent += 1;
        events.push(ClientEvent::Message {
            subject: Bytes::from(decode_wildcards(&subject)),
            reply,
            payload,
        });
    }

    /// Close the engine, dropping partial fragments and local subscriptions
    ///
    /// Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.phase == ClientPhase::Closed {
            return false;
        }
        self.phase = ClientPhase::Closed;
        let dropped = self.reassembler.clear();
        self.stats.fragments_dropped += dropped as u64;
        self.subs.release();
        self.sids.clear();
        self.wildcards.clear();
        self.pending.clear();
        self.parser.reset();
        if dropped > 0 {
            tracing::debug!(groups = dropped, "Discarded partial fragments");
        }
        true
    }
}

impl std::fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsClient")
            .field("phase", &self.phase)
            .field("subs", &self.subs)
            .field("max_payload", &self.max_payload)
            .field("pending_output", &self.out.len())
            .finish()
    }
}

/// Identifies this process's fragments
fn source_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ ((std::process::id() as u64) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{MAX_PENDING_GROUPS, TRAILER_SIZE};

    fn connected(max_payload: usize) -> (NatsClient, Vec<ClientEvent>) {
        let mut client = NatsClient::new(ClientConfig::default().name("t"));
        let mut events = Vec::new();
        let info = format!(
            "INFO {{\"server_id\":\"S\",\"max_payload\":{}}}\r\n",
            max_payload
        );
        client
            .on_bytes_readable(&mut BytesMut::from(info.as_bytes()), &mut events)
            .unwrap();
        (client, events)
    }

    fn feed(client: &mut NatsClient, data: &[u8]) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        client
            .on_bytes_readable(&mut BytesMut::from(data), &mut events)
            .unwrap();
        events
    }

    fn output(client: &mut NatsClient) -> String {
        String::from_utf8(client.take_output().to_vec()).unwrap()
    }

    #[test]
    fn test_handshake() {
        let mut client = NatsClient::new(ClientConfig::default());
        client.subscribe(b"early").unwrap();
        assert!(!client.has_output()); // held until INFO

        let mut events = Vec::new();
        client
            .on_bytes_readable(
                &mut BytesMut::from(&b"INFO {\"server_id\":\"X\",\"max_payload\":4096}\r\n"[..]),
                &mut events,
            )
            .unwrap();

        assert!(client.is_connected());
        assert_eq!(client.max_payload(), 4096);
        assert!(matches!(&events[0], ClientEvent::Connected(info) if info.server_id == "X"));

        let out = output(&mut client);
        assert!(out.starts_with("CONNECT {"));
        assert!(out.contains(r#""verbose":false"#));
        assert!(out.contains(r#""echo":false"#));
        assert!(out.ends_with("SUB early 1\r\n"));
    }

    #[test]
    fn test_ping_and_err() {
        let (mut client, _) = connected(1024);
        client.take_output();

        feed(&mut client, b"PING\r\n+OK\r\n");
        assert_eq!(output(&mut client), "PONG\r\n");

        let mut events = Vec::new();
        let err = client.on_bytes_readable(
            &mut BytesMut::from(&b"-ERR 'Authorization Violation'\r\n"[..]),
            &mut events,
        );
        assert!(matches!(
            err,
            Err(Error::Protocol(ProtocolError::Remote(ref t))) if t == "Authorization Violation"
        ));
        assert_eq!(client.phase(), ClientPhase::Closed);
        assert!(client.subscribe(b"x").is_err());
    }

    #[test]
    fn test_sid_allocation() {
        let (mut client, _) = connected(1024);
        client.take_output();

        assert!(client.subscribe(b"A.B").unwrap());
        assert!(client.subscribe(b"A.>").unwrap());
        assert!(!client.subscribe(b"A.B").unwrap());
        assert_eq!(output(&mut client), "SUB A.B 1\r\nSUB A.> -2\r\n");

        assert!(client.unsubscribe(b"A.>").unwrap());
        assert!(!client.unsubscribe(b"A.>").unwrap());
        assert_eq!(output(&mut client), "UNSUB -2\r\n");
        assert_eq!(client.subscriptions().sid_count(), 1);
    }

    #[test]
    fn test_invalid_subject_rejected() {
        let (mut client, _) = connected(1024);
        assert!(matches!(
            client.subscribe(b"a..b"),
            Err(Error::Registry(RegistryError::InvalidSubject(_)))
        ));
        assert!(client.publish(b".a", None, Bytes::new()).is_err());
    }

    #[test]
    fn test_dedup_literal_and_pattern() {
        let (mut client, _) = connected(1024);
        client.subscribe(b"A.B").unwrap();
        client.subscribe(b"A.>").unwrap();

        let events = feed(&mut client, b"MSG A.B 1 2\r\nhi\r\nMSG A.B -2 2\r\nhi\r\n");
        assert_eq!(
            events,
            vec![ClientEvent::Message {
                subject: Bytes::from_static(b"A.B"),
                reply: None,
                payload: Bytes::from_static(b"hi"),
            }]
        );
        assert_eq!(client.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_unknown_sid_dropped() {
        let (mut client, _) = connected(1024);
        client.subscribe(b"news").unwrap();

        assert_eq!(feed(&mut client, b"MSG news 1 1\r\na\r\n").len(), 1);
        assert!(feed(&mut client, b"MSG news 7 1\r\na\r\n").is_empty());

        client.unsubscribe(b"news").unwrap();
        assert!(feed(&mut client, b"MSG news 1 1\r\na\r\n").is_empty());
        assert_eq!(client.stats().msgs_received, 3);
    }

    #[test]
    fn test_pending_fragment_groups_evicted() {
        let max = 64;
        let (mut receiver, _) = connected(max);
        receiver.subscribe(b"big").unwrap();

        let mut msgs = BytesMut::new();
        for src_time in 0..(MAX_PENDING_GROUPS as u64 + 3) {
            let mut frag = BytesMut::from(&[0u8; 32][..]);
            crate::protocol::fragment::Trailer {
                src_id: 1,
                src_time,
                offset: 0,
                total: u32::MAX,
                subject_hash: crc32c(b"big"),
                magic: crate::protocol::constants::TRAILER_MAGIC,
            }
            .encode(&mut frag);
            encoder::write_msg(&mut msgs, b"big", b"1", None, &frag);
        }

        assert!(feed(&mut receiver, &msgs).is_empty());
        assert_eq!(receiver.pending_fragments(), MAX_PENDING_GROUPS);
        assert_eq!(receiver.stats().fragments_dropped, 3);
        assert_eq!(receiver.stats().fragments_reassembled, 0);
    }

    #[test]
    fn test_wildcard_subject_encoding() {
        let (mut client, _) = connected(1024);
        client.take_output();

        client.publish(b"a.*.>", Some(b"r"), Bytes::from_static(b"x")).unwrap();
        assert_eq!(output(&mut client), "PUB a.+.< r 1\r\nx\r\n");

        client.subscribe(b"a.>").unwrap();
        let events = feed(&mut client, b"MSG a.+.< -1 1\r\nx\r\n");
        assert!(matches!(
            &events[0],
            ClientEvent::Message { subject, .. } if subject.as_ref() == b"a.*.>"
        ));
    }

    #[test]
    fn test_fragment_roundtrip() {
        let max = 64;
        let (mut sender, _) = connected(max);
        let (mut receiver, _) = connected(max);
        sender.take_output();
        receiver.subscribe(b"big").unwrap();

        let payload: Bytes = (0..(3 * max + 17)).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        sender.publish(b"big", Some(b"inbox"), payload.clone()).unwrap();
        let wire = sender.take_output();

        // Re-frame the PUBs as the server would deliver them
        let mut parser = FrameParser::with_limits(max, 1024);
        let mut msgs = BytesMut::new();
        let mut buf = BytesMut::from(&wire[..]);
        let mut count = 0;
        while let Some(Frame::Pub {
            subject,
            reply,
            payload,
        }) = parser.parse(&mut buf).unwrap()
        {
            assert!(payload.len() <= max);
            encoder::write_msg(&mut msgs, &subject, b"1", reply.as_deref(), &payload);
            count += 1;
        }
        assert_eq!(count, (3 * max + 17).div_ceil(max - TRAILER_SIZE));

        let events = feed(&mut receiver, &msgs);
        assert_eq!(
            events,
            vec![ClientEvent::Message {
                subject: Bytes::from_static(b"big"),
                reply: Some(Bytes::from_static(b"inbox")),
                payload,
            }]
        );
        assert_eq!(receiver.stats().fragments_reassembled, 1);
        assert_eq!(receiver.pending_fragments(), 0);
    }

    #[test]
    fn test_close_discards_fragments() {
        let max = 64;
        let (mut sender, _) = connected(max);
        let (mut receiver, _) = connected(max);
        sender.take_output();
        receiver.subscribe(b"big").unwrap();

        sender
            .publish(b"big", None, Bytes::from(vec![7u8; 2 * max]))
            .unwrap();
        let wire = sender.take_output();

        // Deliver only the first fragment
        let mut parser = FrameParser::with_limits(max, 1024);
        let mut buf = BytesMut::from(&wire[..]);
        let Some(Frame::Pub { payload, .. }) = parser.parse(&mut buf).unwrap() else {
            panic!("expected PUB");
        };
        let mut msg = BytesMut::new();
        encoder::write_msg(&mut msg, b"big", b"1", None, &payload);

        assert!(feed(&mut receiver, &msg).is_empty());
        assert_eq!(receiver.pending_fragments(), 1);

        assert!(receiver.close());
        assert_eq!(receiver.pending_fragments(), 0);
        assert_eq!(receiver.stats().fragments_dropped, 1);
        assert!(!receiver.close());
    }
}
