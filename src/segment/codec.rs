//! Segment binary encoding: the bytes carried inside a DNS label sequence or
//! TXT string set, before/after the outer tunnel-label framing in
//! [`super::label_codec`].

use serde::{Deserialize, Serialize};

/// Flag bits a segment can carry. More than one may be set (e.g. `Data`
/// combined with an implicit ack, which is always present).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags(u8);

impl SegmentFlags {
    pub const HANDSHAKE: SegmentFlags = SegmentFlags(0b0000_0001);
    pub const HANDSHAKE_ACK: SegmentFlags = SegmentFlags(0b0000_0010);
    pub const ACK_ONLY: SegmentFlags = SegmentFlags(0b0000_0100);
    pub const KEEP_ALIVE: SegmentFlags = SegmentFlags(0b0000_1000);
    pub const DATA: SegmentFlags = SegmentFlags(0b0001_0000);
    pub const RESET_TERMINATE: SegmentFlags = SegmentFlags(0b0010_0000);
    /// Never set by an encoder; set by the decoder on a CRC/length failure so
    /// the receiver treats the segment as "no data this round" instead of an
    /// error.
    pub const MALFORMED: SegmentFlags = SegmentFlags(0b0100_0000);

    pub const fn empty() -> Self {
        SegmentFlags(0)
    }

    pub fn contains(self, other: SegmentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SegmentFlags) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        SegmentFlags(bits)
    }
}

impl std::ops::BitOr for SegmentFlags {
    type Output = SegmentFlags;
    fn bitor(self, rhs: SegmentFlags) -> SegmentFlags {
        SegmentFlags(self.0 | rhs.0)
    }
}

/// The tunnel protocol data unit. Sequence/ack numbers count bytes, not
/// segments — see §3 invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub conn_id: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: SegmentFlags,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(conn_id: u16, seq: u32, ack: u32, flags: SegmentFlags, payload: Vec<u8>) -> Self {
        Self {
            conn_id,
            seq,
            ack,
            flags,
            payload,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.flags.contains(SegmentFlags::MALFORMED)
    }

    /// Encode the header + payload + CRC32 trailer. This is the byte string
    /// that gets base32-framed into labels or TXT strings.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        out.extend_from_slice(&self.conn_id.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.flags.bits());
        let payload_len: u16 = self.payload.len().min(u16::MAX as usize) as u16;
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Decode a raw byte string back into a segment. Never errors: on any
    /// structural problem (too short, bad declared length, CRC mismatch) the
    /// `Malformed` flag is set on an otherwise-zeroed segment so callers can
    /// treat it uniformly as "no data this round" (§4.2).
    pub fn decode(raw: &[u8]) -> Segment {
        if raw.len() < HEADER_LEN + CRC_LEN {
            return Segment::malformed(0);
        }
        let body_len = raw.len() - CRC_LEN;
        let (body, trailer) = raw.split_at(body_len);
        let expected_crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual_crc = crc32fast::hash(body);
        if actual_crc != expected_crc {
            return Segment::malformed(0);
        }

        let conn_id = u16::from_be_bytes([body[0], body[1]]);
        let seq = u32::from_be_bytes([body[2], body[3], body[4], body[5]]);
        let ack = u32::from_be_bytes([body[6], body[7], body[8], body[9]]);
        let flags = SegmentFlags::from_bits(body[10]);
        let payload_len = u16::from_be_bytes([body[11], body[12]]) as usize;

        let declared_end = HEADER_LEN + payload_len;
        if declared_end > body.len() {
            return Segment::malformed(conn_id);
        }
        let payload = body[HEADER_LEN..declared_end].to_vec();

        Segment {
            conn_id,
            seq,
            ack,
            flags,
            payload,
        }
    }

    fn malformed(conn_id: u16) -> Segment {
        let mut flags = SegmentFlags::empty();
        flags.insert(SegmentFlags::MALFORMED);
        Segment {
            conn_id,
            seq: 0,
            ack: 0,
            flags,
            payload: Vec::new(),
        }
    }
}

/// `conn_id(2) + seq(4) + ack(4) + flags(1) + payload_len(2)`.
const HEADER_LEN: usize = 13;
const CRC_LEN: usize = 4;

/// Tunable constants for the upstream label / downstream TXT capacity
/// computation. Both are empirical per §9 Open Questions, so they are
/// configuration rather than hard-coded literals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentCodecConfig {
    /// Fraction of the raw label budget that survives base32 framing.
    pub upstream_efficiency: f64,
    /// Total octets available in a downstream TXT answer; the segment's
    /// share is this minus whatever the upstream direction used.
    pub downstream_txt_capacity: usize,
}

impl Default for SegmentCodecConfig {
    fn default() -> Self {
        Self {
            upstream_efficiency: 0.61,
            downstream_txt_capacity: 820,
        }
    }
}

impl SegmentCodecConfig {
    /// Usable upstream payload length for one query against `dns_hostname`,
    /// per §4.2: `floor((253 − 2 − 4 − len(dnsHostName)) × efficiency)`.
    pub fn upstream_payload_len(&self, dns_hostname_len: usize) -> usize {
        let budget = 253isize - 2 - 4 - dns_hostname_len as isize;
        if budget <= 0 {
            return 0;
        }
        (budget as f64 * self.upstream_efficiency).floor() as usize
    }

    /// Usable downstream TXT payload length once `upstream_capacity` octets
    /// of the 820-octet budget are spoken for.
    pub fn downstream_txt_payload_len(&self, upstream_capacity: usize) -> usize {
        self.downstream_txt_capacity.saturating_sub(upstream_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let mut flags = SegmentFlags::empty();
        flags.insert(SegmentFlags::DATA);
        let seg = Segment::new(42, 100, 7, flags, b"hello tunnel".to_vec());
        let decoded = Segment::decode(&seg.encode());
        assert_eq!(decoded, seg);
        assert!(!decoded.is_malformed());
    }

    #[test]
    fn corrupted_crc_sets_malformed_flag() {
        let seg = Segment::new(1, 0, 0, SegmentFlags::ACK_ONLY, Vec::new());
        let mut encoded = seg.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let decoded = Segment::decode(&encoded);
        assert!(decoded.is_malformed());
    }

    #[test]
    fn truncated_input_is_malformed_not_a_panic() {
        let decoded = Segment::decode(&[1, 2, 3]);
        assert!(decoded.is_malformed());
    }

    #[test]
    fn upstream_payload_len_matches_formula() {
        let config = SegmentCodecConfig::default();
        let expected = ((253.0 - 2.0 - 4.0 - 20.0) * 0.61f64).floor() as usize;
        assert_eq!(config.upstream_payload_len(20), expected);
    }

    #[test]
    fn downstream_capacity_subtracts_upstream_share() {
        let config = SegmentCodecConfig::default();
        assert_eq!(config.downstream_txt_payload_len(300), 520);
    }
}
