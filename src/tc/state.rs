//! TC state machine states and handshake configuration (§4.3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// The initiator's first-segment preamble: it controls both directions'
/// segment sizing unless the responder overrides downstream length.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InitiatorConfig {
    pub max_segment_len: u16,
    pub ack_delay_ms: u32,
    pub retransmission_interval_ms: u32,
    pub sliding_window_wait_ms: u32,
    pub keepalive_interval_ms: u32,
    pub debug: bool,
}

const WIRE_LEN: usize = 2 + 4 + 4 + 4 + 4 + 1;

impl InitiatorConfig {
    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[0..2].copy_from_slice(&self.max_segment_len.to_be_bytes());
        out[2..6].copy_from_slice(&self.ack_delay_ms.to_be_bytes());
        out[6..10].copy_from_slice(&self.retransmission_interval_ms.to_be_bytes());
        out[10..14].copy_from_slice(&self.sliding_window_wait_ms.to_be_bytes());
        out[14..18].copy_from_slice(&self.keepalive_interval_ms.to_be_bytes());
        out[18] = self.debug as u8;
        out
    }

    pub fn decode(buf: &[u8]) -> Option<(InitiatorConfig, &[u8])> {
        if buf.len() < WIRE_LEN {
            return None;
        }
        let config = InitiatorConfig {
            max_segment_len: u16::from_be_bytes([buf[0], buf[1]]),
            ack_delay_ms: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            retransmission_interval_ms: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            sliding_window_wait_ms: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            keepalive_interval_ms: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            debug: buf[18] != 0,
        };
        Some((config, &buf[WIRE_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_config_round_trips_with_trailing_payload() {
        let config = InitiatorConfig {
            max_segment_len: 200,
            ack_delay_ms: 100,
            retransmission_interval_ms: 1500,
            sliding_window_wait_ms: 300,
            keepalive_interval_ms: 5000,
            debug: true,
        };
        let mut buf = config.encode().to_vec();
        buf.extend_from_slice(b"trailing payload");
        let (decoded, rest) = InitiatorConfig::decode(&buf).unwrap();
        assert_eq!(decoded.max_segment_len, 200);
        assert!(decoded.debug);
        assert_eq!(rest, b"trailing payload");
    }
}
