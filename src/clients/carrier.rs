//! The DNS-query carrier (§4.10): drives a [`TransmissionControl`] by turning
//! each outbound segment into a real DNS query against a configured resolver,
//! decoding the CNAME-or-TXT reply back into a segment, and feeding it to the
//! TC. Both tunnel clients (`http_proxy`, `dns_relay`) sit on top of this —
//! neither one talks to a socket directly.

use crate::error::DaemonError;
use crate::segment::{label_codec, Segment};
use crate::tc::TransmissionControl;
use crate::wire::{self, DecodedAnswer};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const QUERY_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CarrierConfig {
    pub resolver: SocketAddr,
    pub tunnel_domain: String,
    pub tunnel_prefix: char,
    /// `true` asks for TXT downstream segments instead of CNAME chains.
    pub use_txt_downstream: bool,
}

/// Drive `tc` until it closes or `cancel` fires: pop its next outbound
/// segment, carry it as one DNS query/response round trip, and deliver
/// whatever comes back (or a malformed placeholder on transport failure, so
/// the TC's adaptive timing backs off the way a dropped UDP reply would).
pub async fn run(tc: Arc<TransmissionControl>, config: CarrierConfig, cancel: CancellationToken) {
    loop {
        let seg = tokio::select! {
            seg = tc.next_outbound() => seg,
            _ = cancel.cancelled() => return,
        };
        let Some(seg) = seg else { return };

        match carry(&seg, &config).await {
            Ok(Some(reply)) => tc.deliver_segment(reply),
            Ok(None) => {}
            Err(_) => tc.deliver_segment(Segment::decode(&[])),
        }
    }
}

/// One query/response round trip for a single outbound segment.
async fn carry(seg: &Segment, config: &CarrierConfig) -> Result<Option<Segment>, DaemonError> {
    let raw = seg.encode();
    let name = label_codec::encode_upstream(&raw, &config.tunnel_domain, config.tunnel_prefix)
        .map_err(|e| DaemonError::malformed(e.to_string()))?;
    let qtype = if config.use_txt_downstream { wire::QTYPE_TXT } else { wire::QTYPE_CNAME };
    let query = build_query(&name, qtype);

    let local_addr = if config.resolver.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local_addr)
        .await
        .map_err(|e| DaemonError::transport(e.to_string()))?;
    socket
        .connect(config.resolver)
        .await
        .map_err(|e| DaemonError::transport(e.to_string()))?;

    timeout(QUERY_DEADLINE, socket.send(&query))
        .await
        .map_err(|_| DaemonError::transport("query send deadline exceeded"))?
        .map_err(|e| DaemonError::transport(e.to_string()))?;

    let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
    let n = timeout(QUERY_DEADLINE, socket.recv(&mut buf))
        .await
        .map_err(|_| DaemonError::transport("query read deadline exceeded"))?
        .map_err(|e| DaemonError::transport(e.to_string()))?;
    buf.truncate(n);

    let answer = wire::parse_first_answer(&buf).map_err(|e| DaemonError::malformed(e.to_string()))?;
    let reply_bytes = match answer {
        Some(DecodedAnswer::Cname(target)) => {
            label_codec::decode_downstream_cname(&target, &config.tunnel_domain).map_err(|e| DaemonError::malformed(e.to_string()))?
        }
        Some(DecodedAnswer::Txt(strings)) => {
            label_codec::decode_downstream_txt(&strings).map_err(|e| DaemonError::malformed(e.to_string()))?
        }
        None => return Ok(None),
    };
    Ok(Some(Segment::decode(&reply_bytes)))
}

fn build_query(name: &str, qtype: u16) -> Vec<u8> {
    let id: u16 = rand::thread_rng().gen();
    let mut buf = Vec::with_capacity(name.len() + 16);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // ancount/nscount/arcount
    buf.extend(crate::wire::message::encode_name(name).unwrap_or_else(|_| vec![0]));
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&wire::QCLASS_IN.to_be_bytes());
    buf
}
