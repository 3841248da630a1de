//! Proxy request header (§3, §6): the initiator's first-segment payload —
//! a fixed-width [`InitiatorConfig`] block followed by a JSON connect record.

use crate::tc::InitiatorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `{"n":<network>,"p":<port>,"a":<address>,"t":<totp>}`. Empty `n` means
/// "tcp" and the dial target is `address:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    #[serde(default, rename = "n")]
    pub network: String,
    #[serde(rename = "p")]
    pub port: u16,
    #[serde(rename = "a")]
    pub address: String,
    #[serde(rename = "t")]
    pub totp: u32,
}

#[derive(Debug, Error)]
pub enum ProxyRequestError {
    #[error("first segment payload shorter than the initiator-config header")]
    MissingConfigPrefix,
    #[error("connect request body is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
}

impl ProxyRequest {
    pub fn network_label(&self) -> &str {
        if self.network.is_empty() {
            "tcp"
        } else {
            &self.network
        }
    }

    /// The `address:port` dial target, or `address` verbatim when a network
    /// was specified explicitly (e.g. an already-bracketed IPv6 literal).
    pub fn dial_target(&self) -> String {
        if self.network.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            self.address.clone()
        }
    }
}

/// Split the initiator's first-segment payload into `(config, connect-request
/// bytes)`, then parse the latter as JSON.
pub fn parse_first_segment(payload: &[u8]) -> Result<(InitiatorConfig, ProxyRequest), ProxyRequestError> {
    let (config, rest) = InitiatorConfig::decode(payload).ok_or(ProxyRequestError::MissingConfigPrefix)?;
    let request: ProxyRequest = serde_json::from_slice(rest)?;
    Ok((config, request))
}

/// Build the wire bytes for the initiator's first segment: config followed
/// by the JSON connect record.
pub fn build_first_segment(config: &InitiatorConfig, request: &ProxyRequest) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = config.encode().to_vec();
    out.extend_from_slice(&serde_json::to_vec(request)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> InitiatorConfig {
        InitiatorConfig {
            max_segment_len: 180,
            ack_delay_ms: 100,
            retransmission_interval_ms: 500,
            sliding_window_wait_ms: 50,
            keepalive_interval_ms: 2000,
            debug: false,
        }
    }

    #[test]
    fn round_trips_through_first_segment_bytes() {
        let request = ProxyRequest {
            network: String::new(),
            port: 443,
            address: "93.184.216.34".to_string(),
            totp: 123456,
        };
        let bytes = build_first_segment(&sample_config(), &request).unwrap();
        let (config, decoded) = parse_first_segment(&bytes).unwrap();
        assert_eq!(config.max_segment_len, 180);
        assert_eq!(decoded.network_label(), "tcp");
        assert_eq!(decoded.dial_target(), "93.184.216.34:443");
    }

    #[test]
    fn empty_network_defaults_to_tcp_and_concatenates_address_port() {
        let request = ProxyRequest {
            network: String::new(),
            port: 80,
            address: "10.0.0.5".to_string(),
            totp: 1,
        };
        assert_eq!(request.network_label(), "tcp");
        assert_eq!(request.dial_target(), "10.0.0.5:80");
    }

    #[test]
    fn explicit_network_uses_address_verbatim() {
        let request = ProxyRequest {
            network: "tcp".to_string(),
            port: 0,
            address: "[2001:db8::1]:443".to_string(),
            totp: 1,
        };
        assert_eq!(request.dial_target(), "[2001:db8::1]:443");
    }

    #[test]
    fn rejects_payload_without_config_prefix() {
        let err = parse_first_segment(b"x").unwrap_err();
        assert!(matches!(err, ProxyRequestError::MissingConfigPrefix));
    }

    #[test]
    fn hostname_destination_is_left_to_the_dialer_to_resolve() {
        let request = ProxyRequest {
            network: String::new(),
            port: 80,
            address: "neverssl.com".to_string(),
            totp: 1,
        };
        assert_eq!(request.dial_target(), "neverssl.com:80");
    }
}
