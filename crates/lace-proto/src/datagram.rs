//! Integrity-checked datagram framing.
//!
//! A datagram is `[32-byte SHA-256 of the rest][body]`. Bodies too large for
//! one datagram are split into pieces:
//!
//! ```text
//! [hash]"splinter"[16-byte group id][u16 piece count][u16 piece index][chunk]
//! ```
//!
//! all integers big-endian. The receiver collects pieces per group id and
//! emits the payload once every piece has arrived. Corrupt datagrams fail
//! the checksum and are reported as errors for the caller to drop.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Length of the integrity prefix.
pub const CHECKSUM_LEN: usize = 32;

/// Largest payload sent as a single datagram.
pub const MAX_WHOLE: usize = 40_000;

/// Payload bytes carried by each piece of a fragmented message.
pub const PIECE_LEN: usize = 20_000;

const MAGIC: &[u8; 8] = b"splinter";
const PIECE_HEADER_LEN: usize = MAGIC.len() + 16 + 2 + 2;

/// A checked datagram body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete payload.
    Whole(Bytes),
    /// One piece of a fragmented payload.
    Piece {
        /// Group shared by every piece of one payload.
        group: Uuid,
        /// Number of pieces in the group.
        count: u16,
        /// Position of this piece.
        index: u16,
        /// Payload bytes.
        chunk: Bytes,
    },
}

fn seal(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(CHECKSUM_LEN + body.len());
    out.put_slice(&Sha256::digest(body));
    out.put_slice(body);
    out.freeze()
}

/// Frame a payload into one or more datagrams.
pub fn encode(payload: &[u8]) -> Result<Vec<Bytes>> {
    if payload.len() <= MAX_WHOLE {
        return Ok(vec![seal(payload)]);
    }
    let count = payload.len().div_ceil(PIECE_LEN);
    let count = u16::try_from(count).map_err(|_| ProtocolError::Fragment("payload too large"))?;
    let group = Uuid::new_v4();
    let mut out = Vec::with_capacity(usize::from(count));
    for (index, chunk) in payload.chunks(PIECE_LEN).enumerate() {
        let mut body = BytesMut::with_capacity(PIECE_HEADER_LEN + chunk.len());
        body.put_slice(MAGIC);
        body.put_slice(group.as_bytes());
        body.put_u16(count);
        // `index < count` and `count` fits in u16.
        body.put_u16(index as u16);
        body.put_slice(chunk);
        out.push(seal(&body));
    }
    Ok(out)
}

/// Verify and parse one datagram.
pub fn decode(datagram: &[u8]) -> Result<Frame> {
    if datagram.len() < CHECKSUM_LEN {
        return Err(ProtocolError::Truncated {
            len: datagram.len(),
        });
    }
    let (sum, body) = datagram.split_at(CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != sum {
        return Err(ProtocolError::Checksum);
    }
    if !body.starts_with(MAGIC) {
        return Ok(Frame::Whole(Bytes::copy_from_slice(body)));
    }
    if body.len() < PIECE_HEADER_LEN {
        return Err(ProtocolError::Fragment("short piece header"));
    }
    let mut group = [0u8; 16];
    group.copy_from_slice(&body[8..24]);
    let count = u16::from_be_bytes([body[24], body[25]]);
    let index = u16::from_be_bytes([body[26], body[27]]);
    if count == 0 {
        return Err(ProtocolError::Fragment("zero piece count"));
    }
    if index >= count {
        return Err(ProtocolError::Fragment("piece index out of range"));
    }
    Ok(Frame::Piece {
        group: Uuid::from_bytes(group),
        count,
        index,
        chunk: Bytes::copy_from_slice(&body[PIECE_HEADER_LEN..]),
    })
}

#[derive(Debug)]
struct Partial {
    count: u16,
    pieces: BTreeMap<u16, Bytes>,
    opened: u64,
}

/// Collects pieces of fragmented payloads.
///
/// Holds at most `capacity` incomplete groups; opening one more evicts the
/// group that was opened first.
#[derive(Debug)]
pub struct Reassembler {
    groups: HashMap<Uuid, Partial>,
    capacity: usize,
    clock: u64,
}

impl Reassembler {
    /// Create a reassembler bounded to `capacity` incomplete groups.
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Number of incomplete groups currently held.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Feed a checked frame; returns a payload once one is complete.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Bytes>> {
        let (group, count, index, chunk) = match frame {
            Frame::Whole(payload) => return Ok(Some(payload)),
            Frame::Piece {
                group,
                count,
                index,
                chunk,
            } => (group, count, index, chunk),
        };

        if count == 1 {
            return Ok(Some(chunk));
        }

        if !self.groups.contains_key(&group) {
            if self.groups.len() >= self.capacity {
                self.evict_oldest();
            }
            self.clock += 1;
            self.groups.insert(
                group,
                Partial {
                    count,
                    pieces: BTreeMap::new(),
                    opened: self.clock,
                },
            );
        }

        let Some(partial) = self.groups.get_mut(&group) else {
            return Ok(None);
        };
        if partial.count != count {
            return Err(ProtocolError::Fragment("piece count changed within group"));
        }
        partial.pieces.insert(index, chunk);
        if partial.pieces.len() < usize::from(partial.count) {
            return Ok(None);
        }

        let Some(partial) = self.groups.remove(&group) else {
            return Ok(None);
        };
        let total = partial.pieces.values().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total);
        for piece in partial.pieces.values() {
            payload.put_slice(piece);
        }
        Ok(Some(payload.freeze()))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, p)| p.opened)
            .map(|(g, _)| *g);
        if let Some(group) = oldest {
            self.groups.remove(&group);
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(64)
    }
}
