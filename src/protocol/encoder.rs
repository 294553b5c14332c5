//! Frame encoding
//!
//! Writers append complete control lines (and payloads) to an output
//! buffer. Nothing here fails except JSON serialization of INFO/CONNECT.

use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};

use crate::protocol::constants::{CRLF, OK_REPLY, PING_LINE, PONG_LINE};
use crate::protocol::message::{ConnectOptions, Frame, ServerInfo};

fn put_decimal(out: &mut BytesMut, n: u64) {
    // fmt::Write for BytesMut never fails
    let _ = write!(out, "{}", n);
}

/// `PUB <subject> [reply] <size>\r\n<payload>\r\n`
pub fn write_pub(out: &mut BytesMut, subject: &[u8], reply: Option<&[u8]>, payload: &[u8]) {
    out.reserve(subject.len() + payload.len() + 32);
    out.put_slice(b"PUB ");
    out.put_slice(subject);
    out.put_u8(b' ');
    if let Some(reply) = reply {
        out.put_slice(reply);
        out.put_u8(b' ');
    }
    put_decimal(out, payload.len() as u64);
    out.put_slice(CRLF);
    out.put_slice(payload);
    out.put_slice(CRLF);
}

/// `MSG <subject> <sid> [reply] <size>\r\n<payload>\r\n`
pub fn write_msg(
    out: &mut BytesMut,
    subject: &[u8],
    sid: &[u8],
    reply: Option<&[u8]>,
    payload: &[u8],
) {
    out.reserve(subject.len() + sid.len() + payload.len() + 32);
    out.put_slice(b"MSG ");
    out.put_slice(subject);
    out.put_u8(b' ');
    out.put_slice(sid);
    out.put_u8(b' ');
    if let Some(reply) = reply {
        out.put_slice(reply);
        out.put_u8(b' ');
    }
    put_decimal(out, payload.len() as u64);
    out.put_slice(CRLF);
    out.put_slice(payload);
    out.put_slice(CRLF);
}

/// `SUB <subject> [queue] <sid>\r\n`
pub fn write_sub(out: &mut BytesMut, subject: &[u8], queue: Option<&[u8]>, sid: &[u8]) {
    out.put_slice(b"SUB ");
    out.put_slice(subject);
    out.put_u8(b' ');
    if let Some(queue) = queue {
        out.put_slice(queue);
        out.put_u8(b' ');
    }
    out.put_slice(sid);
    out.put_slice(CRLF);
}

/// `UNSUB <sid> [max_msgs]\r\n`
pub fn write_unsub(out: &mut BytesMut, sid: &[u8], max_msgs: u64) {
    out.put_slice(b"UNSUB ");
    out.put_slice(sid);
    if max_msgs != 0 {
        out.put_u8(b' ');
        put_decimal(out, max_msgs);
    }
    out.put_slice(CRLF);
}

/// `-ERR '<text>'\r\n`
pub fn write_err(out: &mut BytesMut, text: &str) {
    out.put_slice(b"-ERR '");
    out.put_slice(text.as_bytes());
    out.put_slice(b"'\r\n");
}

pub fn write_ok(out: &mut BytesMut) {
    out.put_slice(OK_REPLY);
}

pub fn write_ping(out: &mut BytesMut) {
    out.put_slice(PING_LINE);
}

pub fn write_pong(out: &mut BytesMut) {
    out.put_slice(PONG_LINE);
}

/// `INFO {json}\r\n`
pub fn write_info(out: &mut BytesMut, info: &ServerInfo) -> Result<(), serde_json::Error> {
    let json = serde_json::to_vec(info)?;
    out.put_slice(b"INFO ");
    out.put_slice(&json);
    out.put_slice(CRLF);
    Ok(())
}

/// `CONNECT {json}\r\n`
pub fn write_connect(out: &mut BytesMut, opts: &ConnectOptions) -> Result<(), serde_json::Error> {
    let json = serde_json::to_vec(opts)?;
    out.put_slice(b"CONNECT ");
    out.put_slice(&json);
    out.put_slice(CRLF);
    Ok(())
}

impl Frame {
    /// Append the wire form of this frame
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Frame::Sub {
                subject,
                queue,
                sid,
            } => write_sub(out, subject, queue.as_deref(), sid),
            Frame::Unsub { sid, max_msgs } => write_unsub(out, sid, *max_msgs),
            Frame::Pub {
                subject,
                reply,
                payload,
            } => write_pub(out, subject, reply.as_deref(), payload),
            Frame::Msg {
                subject,
                sid,
                reply,
                payload,
            } => write_msg(out, subject, sid, reply.as_deref(), payload),
            Frame::Ping => write_ping(out),
            Frame::Pong => write_pong(out),
            Frame::Ok => write_ok(out),
            Frame::Err(text) => write_err(out, text),
            Frame::Info(json) => {
                out.put_slice(b"INFO ");
                out.put_slice(json);
                out.put_slice(CRLF);
            }
            Frame::Connect(json) => {
                out.put_slice(b"CONNECT ");
                out.put_slice(json);
                out.put_slice(CRLF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::parser::FrameParser;

    #[test]
    fn test_write_msg() {
        let mut out = BytesMut::new();
        write_msg(&mut out, b"foo.bar", b"7", None, b"hello");
        assert_eq!(&out[..], b"MSG foo.bar 7 5\r\nhello\r\n");

        out.clear();
        write_msg(&mut out, b"foo", b"7", Some(b"inbox"), b"");
        assert_eq!(&out[..], b"MSG foo 7 inbox 0\r\n\r\n");
    }

    #[test]
    fn test_write_sub_unsub() {
        let mut out = BytesMut::new();
        write_sub(&mut out, b"A.>", Some(b"q"), b"-3");
        write_unsub(&mut out, b"-3", 0);
        write_unsub(&mut out, b"4", 10);
        assert_eq!(&out[..], b"SUB A.> q -3\r\nUNSUB -3\r\nUNSUB 4 10\r\n");
    }

    #[test]
    fn test_write_err() {
        let mut out = BytesMut::new();
        write_err(&mut out, "Maximum Payload Violation");
        assert_eq!(&out[..], b"-ERR 'Maximum Payload Violation'\r\n");
    }

    #[test]
    fn test_write_connect() {
        let mut out = BytesMut::new();
        let opts = ConnectOptions {
            verbose: false,
            ..Default::default()
        };
        write_connect(&mut out, &opts).unwrap();
        assert!(out.starts_with(b"CONNECT {"));
        assert!(out.ends_with(b"}\r\n"));

        let mut parser = FrameParser::new();
        let Ok(Some(Frame::Connect(json))) = parser.parse(&mut out) else {
            panic!("expected CONNECT");
        };
        assert_eq!(ConnectOptions::parse(&json), opts);
    }

    #[test]
    fn test_encode_parses_back() {
        let frames = vec![
            Frame::Sub {
                subject: Bytes::from_static(b"a.*"),
                queue: None,
                sid: Bytes::from_static(b"1"),
            },
            Frame::Pub {
                subject: Bytes::from_static(b"a.b"),
                reply: Some(Bytes::from_static(b"r")),
                payload: Bytes::from_static(b"x\r\ny"),
            },
            Frame::Err("boom".into()),
            Frame::Pong,
        ];
        let mut out = BytesMut::new();
        for f in &frames {
            f.encode(&mut out);
        }

        let mut parser = FrameParser::new();
        let mut decoded = Vec::new();
        while let Ok(Some(f)) = parser.parse(&mut out) {
            decoded.push(f);
        }
        assert_eq!(decoded, frames);
    }
}
