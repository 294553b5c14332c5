//! Payload fragmentation and reassembly
//!
//! A payload larger than the negotiated maximum is sent as several frames
//! on the same subject. Each frame carries a chunk of the payload followed
//! by a 32-byte little-endian trailer:
//!
//! ```text
//! +--------+----------+--------+-------+--------------+-------+
//! | src_id | src_time | offset | total | subject_hash | magic |
//! |  u64   |   u64    |  u32   |  u32  |     u32      |  u32  |
//! +--------+----------+--------+-------+--------------+-------+
//! ```
//!
//! Fragments must arrive in order. A gap or repeat drops the whole group
//! without telling the sender. At most `MAX_PENDING_GROUPS` groups are held
//! at once, and buffers grow with the bytes received rather than the
//! announced total.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FragmentError;
use crate::protocol::constants::{MAX_PENDING_GROUPS, TRAILER_MAGIC, TRAILER_SIZE};

/// Fragment trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub src_id: u64,
    pub src_time: u64,
    pub offset: u32,
    pub total: u32,
    pub subject_hash: u32,
    pub magic: u32,
}

impl Trailer {
    /// Append the encoded trailer
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u64_le(self.src_id);
        out.put_u64_le(self.src_time);
        out.put_u32_le(self.offset);
        out.put_u32_le(self.total);
        out.put_u32_le(self.subject_hash);
        out.put_u32_le(self.magic);
    }

    /// Decode the last `TRAILER_SIZE` bytes of a payload
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < TRAILER_SIZE {
            return None;
        }
        let mut b = &payload[payload.len() - TRAILER_SIZE..];
        Some(Self {
            src_id: b.get_u64_le(),
            src_time: b.get_u64_le(),
            offset: b.get_u32_le(),
            total: b.get_u32_le(),
            subject_hash: b.get_u32_le(),
            magic: b.get_u32_le(),
        })
    }
}

/// Return the trailer if `payload` is a fragment of a larger message on a
/// subject hashing to `subject_hash`
pub fn is_fragment(payload: &[u8], subject_hash: u32, max_payload: usize) -> Option<Trailer> {
    let t = Trailer::decode(payload)?;
    let valid = t.magic == TRAILER_MAGIC
        && t.subject_hash == subject_hash
        && t.offset < t.total
        && t.total as usize > max_payload;
    valid.then_some(t)
}

/// Splits oversized payloads into trailer-tagged fragments
#[derive(Debug)]
pub struct Fragmenter {
    src_id: u64,
    last_time: u64,
}

impl Fragmenter {
    /// Create a fragmenter tagging its groups with `src_id`
    pub fn new(src_id: u64) -> Self {
        Self {
            src_id,
            last_time: 0,
        }
    }

    /// Strictly increasing nanosecond timestamp
    fn next_time(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.last_time = now.max(self.last_time + 1);
        self.last_time
    }

    /// Split `payload` into frames of at most `max_payload` bytes each
    ///
    /// Payloads that already fit are returned as a single untouched frame.
    pub fn split(&mut self, payload: &Bytes, subject_hash: u32, max_payload: usize) -> Vec<Bytes> {
        if payload.len() <= max_payload || max_payload <= TRAILER_SIZE {
            return vec![payload.clone()];
        }
        let chunk = max_payload - TRAILER_SIZE;
        let src_time = self.next_time();
        let total = payload.len() as u32;

        payload
            .chunks(chunk)
            .enumerate()
            .map(|(i, body)| {
                let mut frag = BytesMut::with_capacity(body.len() + TRAILER_SIZE);
                frag.put_slice(body);
                Trailer {
                    src_id: self.src_id,
                    src_time,
                    offset: (i * chunk) as u32,
                    total,
                    subject_hash,
                    magic: TRAILER_MAGIC,
                }
                .encode(&mut frag);
                frag.freeze()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupKey {
    src_id: u64,
    src_time: u64,
    subject_hash: u32,
    total: u32,
}

#[derive(Debug)]
struct PendingGroup {
    key: GroupKey,
    buf: BytesMut,
}

/// Rejoins fragments into whole payloads
#[derive(Debug)]
pub struct Reassembler {
    /// Oldest group first
    pending: Vec<PendingGroup>,
    max_payload: usize,
    max_groups: usize,
    /// Groups evicted since the last `take_evicted`
    evicted: usize,
}

impl Reassembler {
    pub fn new(max_payload: usize) -> Self {
        Self::with_max_groups(max_payload, MAX_PENDING_GROUPS)
    }

    /// Reassembler holding at most `max_groups` partial groups
    pub fn with_max_groups(max_payload: usize, max_groups: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_payload,
            max_groups: max_groups.max(1),
            evicted: 0,
        }
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Pass a received payload through reassembly
    ///
    /// Non-fragments come straight back. A fragment returns `Ok(None)` until
    /// its group completes.
    pub fn accept(
        &mut self,
        subject_hash: u32,
        payload: Bytes,
    ) -> Result<Option<Bytes>, FragmentError> {
        // Every fragment but the last fills the frame exactly
        if payload.len() != self.max_payload && self.pending.is_empty() {
            return Ok(Some(payload));
        }
        match is_fragment(&payload, subject_hash, self.max_payload) {
            Some(trailer) => self.merge(&trailer, &payload[..payload.len() - TRAILER_SIZE]),
            None => Ok(Some(payload)),
        }
    }

    /// Add one fragment body to its group
    pub fn merge(&mut self, trailer: &Trailer, body: &[u8]) -> Result<Option<Bytes>, FragmentError> {
        let key = GroupKey {
            src_id: trailer.src_id,
            src_time: trailer.src_time,
            subject_hash: trailer.subject_hash,
            total: trailer.total,
        };

        let idx = match self.pending.iter().position(|g| g.key == key) {
            Some(idx) => {
                let have = self.pending[idx].buf.len();
                if have != trailer.offset as usize {
                    self.pending.remove(idx);
                    tracing::debug!(
                        expected = have,
                        got = trailer.offset,
                        "Fragment out of order, group dropped"
                    );
                    return Err(FragmentError::OutOfOrder {
                        expected: have as u32,
                        got: trailer.offset,
                    });
                }
                idx
            }
            None => {
                if trailer.offset != 0 {
                    return Err(FragmentError::NotAtHead {
                        offset: trailer.offset,
                    });
                }
                if trailer.total as usize <= self.max_payload {
                    return Err(FragmentError::TooSmall {
                        total: trailer.total,
                        max: self.max_payload,
                    });
                }
                if self.pending.len() >= self.max_groups {
                    let oldest = self.pending.remove(0);
                    self.evicted += 1;
                    tracing::debug!(
                        received = oldest.buf.len(),
                        total = oldest.key.total,
                        "Pending fragment limit reached, oldest group dropped"
                    );
                }
                let capacity = (trailer.total as usize).min(4 * self.max_payload);
                self.pending.push(PendingGroup {
                    key,
                    buf: BytesMut::with_capacity(capacity),
                });
                self.pending.len() - 1
            }
        };

        let group = &mut self.pending[idx];
        let end = group.buf.len() + body.len();
        if end > trailer.total as usize {
            self.pending.remove(idx);
            return Err(FragmentError::Overrun {
                end,
                total: trailer.total,
            });
        }
        group.buf.put_slice(body);

        if end == trailer.total as usize {
            let group = self.pending.remove(idx);
            return Ok(Some(group.buf.freeze()));
        }
        Ok(None)
    }

    /// Groups still waiting for fragments
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Groups evicted by the pending limit since the last call
    pub fn take_evicted(&mut self) -> usize {
        std::mem::take(&mut self.evicted)
    }

    /// Discard every partial group
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
