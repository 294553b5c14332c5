//! Incremental frame parser
//!
//! Two states: `Header` scans for a `\n`-terminated control line, `Payload`
//! waits for the byte count announced by the preceding `PUB`/`MSG` line.
//!
//! ```text
//!             line w/o payload
//!            ┌──────────────┐
//!            ▼              │
//!        [Header] ──────────┘
//!            │  ▲
//!  PUB / MSG │  │ size bytes consumed
//!            ▼  │
//!        [Payload]
//! ```
//!
//! Bytes are consumed from the caller's `BytesMut` only once a full record
//! is available, so a frame split at any byte boundary parses the same as
//! a whole one.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::constants::{DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD};
use crate::protocol::message::Frame;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    Header,
    Payload(PendingPayload),
}

/// Header fields waiting for their payload
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingPayload {
    Pub {
        subject: Bytes,
        reply: Option<Bytes>,
        size: usize,
    },
    Msg {
        subject: Bytes,
        sid: Bytes,
        reply: Option<Bytes>,
        size: usize,
    },
    /// Oversized payload being thrown away
    Skip { remaining: usize },
}

/// Per-connection frame parser
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    max_payload: usize,
    max_control_line: usize,
}

impl FrameParser {
    /// Create a parser with default limits
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_CONTROL_LINE)
    }

    /// Create a parser with explicit payload and control line limits
    pub fn with_limits(max_payload: usize, max_control_line: usize) -> Self {
        Self {
            state: ParseState::Header,
            max_payload,
            max_control_line,
        }
    }

    /// Change the payload limit (client adopts the server's)
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// True while waiting for payload bytes
    pub fn in_payload(&self) -> bool {
        matches!(self.state, ParseState::Payload(_))
    }

    /// Parse the next frame out of `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `buf`; partial records are left in place.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match &mut self.state {
                ParseState::Header => {
                    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                        if buf.len() > self.max_control_line {
                            let len = buf.len();
                            buf.clear();
                            return Err(ProtocolError::LineTooLong {
                                len,
                                max: self.max_control_line,
                            });
                        }
                        return Ok(None);
                    };
                    let line = buf.split_to(pos + 1).freeze();
                    let line = line.slice(..trim_end(&line));
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(frame) = self.parse_line(line)? {
                        return Ok(Some(frame));
                    }
                }
                ParseState::Payload(PendingPayload::Skip { remaining }) => {
                    let n = (*remaining).min(buf.len());
                    let _ = buf.split_to(n);
                    *remaining -= n;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    self.state = ParseState::Header;
                }
                ParseState::Payload(pending) => {
                    let size = match pending {
                        PendingPayload::Pub { size, .. } | PendingPayload::Msg { size, .. } => {
                            *size
                        }
                        PendingPayload::Skip { .. } => 0,
                    };
                    if buf.len() < size {
                        return Ok(None);
                    }
                    let payload = buf.split_to(size).freeze();
                    // Trailing CRLF is skipped as an empty line in Header state
                    let ParseState::Payload(pending) =
                        std::mem::replace(&mut self.state, ParseState::Header)
                    else {
                        continue;
                    };
                    let frame = match pending {
                        PendingPayload::Pub { subject, reply, .. } => Frame::Pub {
                            subject,
                            reply,
                            payload,
                        },
                        PendingPayload::Msg {
                            subject, sid, reply, ..
                        } => Frame::Msg {
                            subject,
                            sid,
                            reply,
                            payload,
                        },
                        PendingPayload::Skip { .. } => continue,
                    };
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Decode one control line; `Ok(None)` for ignored lines and for lines
    /// that switch to payload state
    fn parse_line(&mut self, line: Bytes) -> Result<Option<Frame>, ProtocolError> {
        let kw_end = line
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(line.len());
        let keyword = &line[..kw_end];
        let rest = line.slice(kw_end..);

        let kw = match keyword.len() {
            3..=7 => {
                let mut upper = [0u8; 7];
                upper[..keyword.len()].copy_from_slice(keyword);
                upper.make_ascii_uppercase();
                upper
            }
            _ => {
                tracing::debug!(len = line.len(), "Ignoring unknown protocol line");
                return Ok(None);
            }
        };

        match &kw[..keyword.len()] {
            b"PUB" => {
                let (args, size) = split_size(&rest, "PUB")?;
                let toks = self.payload_tokens(&args, 2, "PUB", size)?;
                let mut toks = toks.into_iter();
                let (Some(subject), reply) = (toks.next(), toks.next()) else {
                    return Err(ProtocolError::ArgumentCount {
                        keyword: "PUB",
                        got: 0,
                    });
                };
                self.begin_payload(PendingPayload::Pub {
                    subject,
                    reply,
                    size,
                })?;
                Ok(None)
            }
            b"MSG" => {
                let (args, size) = split_size(&rest, "MSG")?;
                let toks = self.payload_tokens(&args, 3, "MSG", size)?;
                let got = toks.len();
                let mut toks = toks.into_iter();
                let (subject, sid, reply) = match (toks.next(), toks.next(), toks.next()) {
                    (Some(subject), Some(sid), reply) => (subject, sid, reply),
                    _ => {
                        self.state = ParseState::Payload(PendingPayload::Skip { remaining: size });
                        return Err(ProtocolError::ArgumentCount {
                            keyword: "MSG",
                            got,
                        });
                    }
                };
                self.begin_payload(PendingPayload::Msg {
                    subject,
                    sid,
                    reply,
                    size,
                })?;
                Ok(None)
            }
            b"SUB" => {
                let toks = tokens(&rest, 3, "SUB")?;
                let got = toks.len();
                let mut toks = toks.into_iter();
                let frame = match (toks.next(), toks.next(), toks.next()) {
                    (Some(subject), Some(sid), None) => Frame::Sub {
                        subject,
                        queue: None,
                        sid,
                    },
                    (Some(subject), Some(queue), Some(sid)) => Frame::Sub {
                        subject,
                        queue: Some(queue),
                        sid,
                    },
                    _ => {
                        return Err(ProtocolError::ArgumentCount {
                            keyword: "SUB",
                            got,
                        })
                    }
                };
                Ok(Some(frame))
            }
            b"UNSUB" => {
                let toks = tokens(&rest, 2, "UNSUB")?;
                let got = toks.len();
                let mut toks = toks.into_iter();
                match (toks.next(), toks.next()) {
                    (Some(sid), max) => {
                        let max_msgs = match max {
                            Some(m) => parse_decimal(&m).ok_or(ProtocolError::BadNumber("max_msgs"))?,
                            None => 0,
                        };
                        Ok(Some(Frame::Unsub { sid, max_msgs }))
                    }
                    _ => Err(ProtocolError::ArgumentCount {
                        keyword: "UNSUB",
                        got,
                    }),
                }
            }
            b"PING" => Ok(Some(Frame::Ping)),
            b"PONG" => Ok(Some(Frame::Pong)),
            b"+OK" => Ok(Some(Frame::Ok)),
            b"-ERR" => {
                let text = trim_ws(&rest);
                let text = text
                    .strip_prefix(b"'")
                    .and_then(|t| t.strip_suffix(b"'"))
                    .unwrap_or(text);
                Ok(Some(Frame::Err(String::from_utf8_lossy(text).into_owned())))
            }
            b"INFO" => Ok(Some(Frame::Info(rest.slice_ref(trim_ws(&rest))))),
            b"CONNECT" => Ok(Some(Frame::Connect(rest.slice_ref(trim_ws(&rest))))),
            _ => {
                tracing::debug!(
                    keyword = %String::from_utf8_lossy(keyword),
                    "Ignoring unknown protocol line"
                );
                Ok(None)
            }
        }
    }

    /// Tokenize a `PUB`/`MSG` line; on error the announced payload is skipped
    fn payload_tokens(
        &mut self,
        args: &Bytes,
        max: usize,
        keyword: &'static str,
        size: usize,
    ) -> Result<Vec<Bytes>, ProtocolError> {
        tokens(args, max, keyword).inspect_err(|_| {
            self.state = ParseState::Payload(PendingPayload::Skip { remaining: size });
        })
    }

    fn begin_payload(&mut self, pending: PendingPayload) -> Result<(), ProtocolError> {
        let size = match &pending {
            PendingPayload::Pub { size, .. } | PendingPayload::Msg { size, .. } => *size,
            PendingPayload::Skip { remaining } => *remaining,
        };
        if size > self.max_payload {
            self.state = ParseState::Payload(PendingPayload::Skip { remaining: size });
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        self.state = ParseState::Payload(pending);
        Ok(())
    }

    /// Drop any partial state
    pub fn reset(&mut self) {
        self.state = ParseState::Header;
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of `line` without trailing whitespace and CR/LF
fn trim_end(line: &[u8]) -> usize {
    line.iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1)
}

fn trim_ws(b: &[u8]) -> &[u8] {
    let start = b
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(b.len());
    let b = &b[start..];
    &b[..trim_end(b)]
}

/// Split the trailing byte count off a `PUB`/`MSG` argument list
///
/// Scans backward from the end over decimal digits; the rest is returned
/// for tokenizing.
fn split_size(rest: &Bytes, keyword: &'static str) -> Result<(Bytes, usize), ProtocolError> {
    let end = trim_end(rest);
    let start = rest[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map_or(0, |p| p + 1);
    if start == end {
        return Err(ProtocolError::BadNumber("size"));
    }
    // Digits must form their own token
    if start > 0 && !rest[start - 1].is_ascii_whitespace() {
        return Err(ProtocolError::BadNumber("size"));
    }
    let size = parse_decimal(&rest[start..end]).ok_or(ProtocolError::BadNumber("size"))?;
    let size = usize::try_from(size).map_err(|_| ProtocolError::BadNumber("size"))?;
    if start == 0 {
        return Err(ProtocolError::ArgumentCount { keyword, got: 0 });
    }
    Ok((rest.slice(..start), size))
}

/// Split on whitespace runs, failing past `max` tokens
fn tokens(args: &Bytes, max: usize, keyword: &'static str) -> Result<Vec<Bytes>, ProtocolError> {
    let mut out = Vec::with_capacity(max);
    let mut i = 0;
    while i < args.len() {
        if args[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        while i < args.len() && !args[i].is_ascii_whitespace() {
            i += 1;
        }
        if out.len() == max {
            return Err(ProtocolError::ArgumentCount {
                keyword,
                got: max + 1,
            });
        }
        out.push(args.slice(start..i));
    }
    if out.is_empty() {
        return Err(ProtocolError::ArgumentCount { keyword, got: 0 });
    }
    Ok(out)
}

/// Decimal with overflow checking
pub(crate) fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, &d| {
        if !d.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add((d - b'0') as u64)
    })
}
