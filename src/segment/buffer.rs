//! Outbound segment staging (§4.4): a small ordered backlog the send task
//! drains, with merge rules applied at insertion so keep-alives and acks
//! never pile up behind real data.

use super::codec::{Segment, SegmentFlags};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct SegmentBuffer {
    queue: VecDeque<Segment>,
    max_segment_len: usize,
    debug: bool,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            max_segment_len: usize::MAX,
            debug: false,
        }
    }

    /// Applied after handshake, once both sides have agreed on segment
    /// sizing.
    pub fn set_parameters(&mut self, max_segment_len: usize, debug: bool) {
        self.max_segment_len = max_segment_len;
        self.debug = debug;
    }

    pub fn max_segment_len(&self) -> usize {
        self.max_segment_len
    }

    /// Insert `seg` applying the merge rules: a trailing `AckOnly` or
    /// `KeepAlive` segment is replaced outright (it carried no information
    /// worth keeping once something newer exists); an incoming segment
    /// identical to the tail is dropped instead of duplicated on the wire.
    pub fn absorb(&mut self, seg: Segment) {
        if let Some(tail) = self.queue.back() {
            if *tail == seg {
                return;
            }
            if tail.flags.contains(SegmentFlags::ACK_ONLY) || tail.flags.contains(SegmentFlags::KEEP_ALIVE) {
                *self.queue.back_mut().unwrap() = seg;
                return;
            }
        }
        if self.debug {
            log::trace!("segment buffer: absorbing seq={} flags={:#x}", seg.seq, seg.flags.bits());
        }
        self.queue.push_back(seg);
    }

    pub fn pop(&mut self) -> Option<Segment> {
        self.queue.pop_front()
    }

    pub fn first(&self) -> Option<&Segment> {
        self.queue.front()
    }

    pub fn latest(&self) -> Option<&Segment> {
        self.queue.back()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u32, payload: &[u8]) -> Segment {
        Segment::new(1, seq, 0, SegmentFlags::DATA, payload.to_vec())
    }

    fn keepalive(seq: u32) -> Segment {
        Segment::new(1, seq, 0, SegmentFlags::KEEP_ALIVE, Vec::new())
    }

    #[test]
    fn data_segment_replaces_trailing_keepalive() {
        let mut buf = SegmentBuffer::new();
        buf.absorb(keepalive(10));
        buf.absorb(data(11, b"hi"));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.first().unwrap().seq, 11);
    }

    #[test]
    fn identical_tail_segment_is_dropped() {
        let mut buf = SegmentBuffer::new();
        buf.absorb(data(1, b"x"));
        buf.absorb(data(1, b"x"));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn distinct_data_segments_both_queue() {
        let mut buf = SegmentBuffer::new();
        buf.absorb(data(1, b"a"));
        buf.absorb(data(2, b"b"));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.pop().unwrap().seq, 1);
        assert_eq!(buf.pop().unwrap().seq, 2);
        assert!(buf.pop().is_none());
    }
}
