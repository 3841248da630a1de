//! Query dispatcher (§4.6): classifies each parsed question and builds the
//! response, enforcing per-IP limits along the way.

use crate::blocklist::Blocklist;
use crate::forwarder::RecursiveForwarder;
use crate::memoizer::ResponseMemoizer;
use crate::publicip::PublicIpCache;
use crate::rate_limit::RateLimiter;
use crate::segment::label_codec;
use crate::segment::{Segment, SegmentCodecConfig, SegmentFlags};
use crate::toolbox::{decode_dtmf, split_txt_response, ToolboxBridge};
use crate::totp;
use crate::wire::{self, build_response, parse_message, Answer, RecordData};
use crate::zone::ZoneStore;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::net::IpAddr;
use std::sync::Arc;

/// The proxy server's view of one inbound tunnel segment: hand it to the
/// connection table, wait for (up to) the first outbound reply segment.
/// Implemented by `proxy::server::ProxyServer`.
#[async_trait]
pub trait TunnelSink: Send + Sync {
    async fn receive(&self, seg: Segment) -> Segment;
}

pub struct DispatcherConfig {
    pub tunnel_domain: String,
    pub tunnel_prefix: char,
    pub use_txt_downstream: bool,
    pub totp_seed: String,
    pub totp_step_secs: u64,
}

pub struct Dispatcher {
    pub zones: ZoneStore,
    pub blocklist: Arc<Blocklist>,
    pub rate_limiter: Arc<RateLimiter>,
    pub memoizer: ResponseMemoizer,
    pub forwarder: Arc<RecursiveForwarder>,
    pub toolbox: Option<Arc<ToolboxBridge>>,
    pub public_ip: Arc<PublicIpCache>,
    pub tunnel: Option<Arc<dyn TunnelSink>>,
    pub segment_codec: SegmentCodecConfig,
    pub config: DispatcherConfig,
}

impl Dispatcher {
    /// Classify and answer one inbound DNS packet. `prefer_tcp` tells the
    /// recursive forwarder which substrate the listener used. Returns
    /// `None` when the decision table says "drop" (including all malformed
    /// input, per invariant 1's no-error-reply rule).
    pub async fn dispatch(&self, raw: &[u8], source_ip: IpAddr, prefer_tcp: bool) -> Option<Vec<u8>> {
        let parsed = parse_message(raw).ok()?;
        let question = &parsed.question;
        let canonical_name = crate::zone::canonicalize(&question.name);
        let first_label = question.name.split('.').next().unwrap_or("");

        // Toolbox path bypasses neither limit; it's a normal query.
        if question.qtype == wire::QTYPE_TXT && first_label.starts_with('_') {
            if let Some(result) = self.try_toolbox(&parsed, first_label, source_ip).await {
                return Some(result);
            }
            // PIN failure: fall through to the rest of the table.
        }

        if first_label.to_ascii_lowercase().starts_with(self.config.tunnel_prefix) {
            return self.try_tunnel(&parsed, &question.name, source_ip).await;
        }

        if !self.rate_limiter.allow_query(source_ip) {
            return None;
        }

        let matched_domain = self.zones.match_domain(&question.name).map(str::to_string);

        if let Some(domain) = &matched_domain {
            if let Some(record) = self.zones.custom_record(&question.name) {
                if let Some(packet) = self.build_custom_record_response(&parsed, record) {
                    return Some(packet);
                }
            }

            if matches!(question.qtype, t if t == wire::QTYPE_NS || t == wire::QTYPE_SOA || t == wire::QTYPE_MX) {
                return self.build_synthesized_response(&parsed, domain);
            }

            if matches!(question.qtype, t if t == wire::QTYPE_A || t == wire::QTYPE_AAAA) {
                return self.build_public_ip_response(&parsed).await;
            }

            return None;
        }

        if self.blocklist.is_blocked(&canonical_name.trim_start_matches('.')) {
            crate::json_logger::JsonLogger::blocklist_hit(&question.name, &canonical_name, &source_ip.to_string());
            return self.build_black_hole_response(&parsed);
        }

        match self.forwarder.forward(raw, prefer_tcp).await {
            Ok(reply) => Some(reply),
            Err(_) => None,
        }
    }

    async fn try_toolbox(&self, parsed: &wire::ParsedQuery<'_>, first_label: &str, _source_ip: IpAddr) -> Option<Vec<u8>> {
        let toolbox = self.toolbox.as_ref()?;
        let body = first_label.strip_prefix('_')?;
        if body.len() < 6 {
            return None;
        }
        let (pin_str, rest) = body.split_at(6);
        let pin: u32 = pin_str.parse().ok()?;
        if !totp::verify(&self.config.totp_seed, self.config.totp_step_secs, pin).unwrap_or(false) {
            return None;
        }

        let other_labels: String = parsed.question.name.split('.').skip(1).collect::<Vec<_>>().join("");
        let command_text = decode_dtmf(&format!("{}{}", rest, other_labels));
        let output = toolbox.run(&command_text).await.ok()?;
        let strings = split_txt_response(&output, 200);
        let answers = vec![Answer::new(wire::TTL_TOOLBOX, RecordData::Txt(strings))];
        build_response(&parsed.header, parsed.raw_question, true, true, &answers).ok()
    }

    async fn try_tunnel(&self, parsed: &wire::ParsedQuery<'_>, qname: &str, source_ip: IpAddr) -> Option<Vec<u8>> {
        if let Some(cached) = self.memoizer.peek(qname) {
            return Some(cached);
        }

        let tunnel = self.tunnel.as_ref()?;
        let inbound_bytes = label_codec::decode_upstream(qname, &self.config.tunnel_domain, self.config.tunnel_prefix).ok()?;
        let inbound_segment = Segment::decode(&inbound_bytes);

        // Only a connection's handshake segment spends the per-IP connection
        // budget; its data/ack/keep-alive segments for an already-admitted
        // connection must not, or any real transfer would stall once the
        // interval's connection limit is reached (§4.14).
        if inbound_segment.flags.contains(SegmentFlags::HANDSHAKE) && !self.rate_limiter.allow_connection(source_ip, inbound_segment.conn_id) {
            return None;
        }

        let reply_segment = tunnel.receive(inbound_segment).await;

        let response = if self.config.use_txt_downstream && parsed.question.qtype == wire::QTYPE_TXT {
            let strings = label_codec::encode_downstream_txt(&reply_segment.encode());
            let answers = vec![Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Txt(strings))];
            build_response(&parsed.header, parsed.raw_question, true, true, &answers).ok()?
        } else {
            let target = label_codec::encode_downstream_cname(&reply_segment.encode(), &self.config.tunnel_domain).ok()?;
            let answers = vec![Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Cname(target))];
            build_response(&parsed.header, parsed.raw_question, true, true, &answers).ok()?
        };

        self.memoizer.set(qname, response.clone());
        Some(response)
    }

    fn build_custom_record_response(&self, parsed: &wire::ParsedQuery<'_>, record: &crate::config::CustomRecord) -> Option<Vec<u8>> {
        let mut answers = Vec::new();
        match parsed.question.qtype {
            t if t == wire::QTYPE_A => {
                let mut addrs = record.a.clone();
                addrs.shuffle(&mut rand::thread_rng());
                answers.extend(addrs.into_iter().map(|a| Answer::new(wire::TTL_AUTHORITATIVE, RecordData::A(a))));
            }
            t if t == wire::QTYPE_AAAA => {
                let mut addrs = record.aaaa.clone();
                addrs.shuffle(&mut rand::thread_rng());
                answers.extend(addrs.into_iter().map(|a| Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Aaaa(a))));
            }
            t if t == wire::QTYPE_TXT && !record.txt.is_empty() => {
                answers.push(Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Txt(record.txt.clone())));
            }
            t if t == wire::QTYPE_MX => {
                answers.extend(record.mx.iter().map(|(pref, host)| {
                    Answer::new(
                        wire::TTL_AUTHORITATIVE,
                        RecordData::Mx {
                            preference: *pref,
                            exchange: host.clone(),
                        },
                    )
                }));
            }
            t if t == wire::QTYPE_NS && !record.ns.is_empty() => {
                answers.extend(
                    record
                        .ns
                        .iter()
                        .map(|ns| Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Ns(ns.clone()))),
                );
            }
            t if t == wire::QTYPE_CNAME => {
                if let Some(target) = &record.cname {
                    answers.push(Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Cname(target.clone())));
                }
            }
            _ => {}
        }

        if answers.is_empty() {
            return None;
        }
        build_response(&parsed.header, parsed.raw_question, true, true, &answers).ok()
    }

    fn build_synthesized_response(&self, parsed: &wire::ParsedQuery<'_>, domain_canonical: &str) -> Option<Vec<u8>> {
        let domain = domain_canonical.trim_start_matches('.');
        let answers = match parsed.question.qtype {
            t if t == wire::QTYPE_NS => (1..=3)
                .map(|i| Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Ns(format!("ns{}.{}", i, domain))))
                .collect(),
            t if t == wire::QTYPE_MX => vec![Answer::new(
                wire::TTL_AUTHORITATIVE,
                RecordData::Mx {
                    preference: 10,
                    exchange: format!("mx.{}", domain),
                },
            )],
            t if t == wire::QTYPE_SOA => vec![Answer::new(
                wire::TTL_AUTHORITATIVE,
                RecordData::Soa {
                    mname: format!("ns1.{}", domain),
                    rname: format!("admin.{}", domain),
                    serial: 1,
                    refresh: 3600,
                    retry: 300,
                    expire: 259_200,
                    minimum: 60,
                },
            )],
            _ => return None,
        };
        build_response(&parsed.header, parsed.raw_question, true, true, &answers).ok()
    }

    async fn build_public_ip_response(&self, parsed: &wire::ParsedQuery<'_>) -> Option<Vec<u8>> {
        let addr = self.public_ip.get().await?;
        let answer = match (parsed.question.qtype, addr) {
            (t, IpAddr::V4(v4)) if t == wire::QTYPE_A => Answer::new(wire::TTL_AUTHORITATIVE, RecordData::A(v4)),
            (t, IpAddr::V6(v6)) if t == wire::QTYPE_AAAA => Answer::new(wire::TTL_AUTHORITATIVE, RecordData::Aaaa(v6)),
            _ => return None,
        };
        build_response(&parsed.header, parsed.raw_question, true, true, &[answer]).ok()
    }

    fn build_black_hole_response(&self, parsed: &wire::ParsedQuery<'_>) -> Option<Vec<u8>> {
        let answer = match parsed.question.qtype {
            t if t == wire::QTYPE_A => Answer::new(wire::TTL_BLACKHOLE, RecordData::A(std::net::Ipv4Addr::UNSPECIFIED)),
            t if t == wire::QTYPE_AAAA => Answer::new(wire::TTL_BLACKHOLE, RecordData::Aaaa(std::net::Ipv6Addr::LOCALHOST)),
            _ => return None,
        };
        build_response(&parsed.header, parsed.raw_question, false, true, &[answer]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;
    use crate::wire::message::encode_name;

    fn build_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[0] = 0xAA;
        buf[1] = 0xBB;
        buf[5] = 1;
        buf.extend(encode_name(name).unwrap());
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf
    }

    fn make_dispatcher(zones: Vec<ZoneConfig>) -> Dispatcher {
        Dispatcher {
            zones: ZoneStore::from_config(&zones),
            blocklist: Arc::new(Blocklist::new()),
            rate_limiter: Arc::new(RateLimiter::new(1000, 1000, std::time::Duration::from_secs(60), Vec::new())),
            memoizer: ResponseMemoizer::new(),
            forwarder: Arc::new(RecursiveForwarder::new(Vec::new(), None)),
            toolbox: None,
            public_ip: Arc::new(PublicIpCache::new(Arc::new(NullIpSource))),
            tunnel: None,
            segment_codec: SegmentCodecConfig::default(),
            config: DispatcherConfig {
                tunnel_domain: "tunnel.example.com".to_string(),
                tunnel_prefix: 't',
                use_txt_downstream: false,
                totp_seed: "JBSWY3DPEHPK3PXP".to_string(),
                totp_step_secs: 30,
            },
        }
    }

    struct NullIpSource;

    #[async_trait]
    impl crate::publicip::PublicIpSource for NullIpSource {
        async fn discover(&self) -> Option<IpAddr> {
            Some("198.51.100.7".parse().unwrap())
        }
    }

    struct EchoSink;

    #[async_trait]
    impl TunnelSink for EchoSink {
        async fn receive(&self, seg: Segment) -> Segment {
            Segment::new(seg.conn_id, 0, 0, SegmentFlags::ACK_ONLY, Vec::new())
        }
    }

    fn make_dispatcher_with_tunnel(max_connections_per_interval: u32) -> Dispatcher {
        let mut dispatcher = make_dispatcher(Vec::new());
        dispatcher.rate_limiter = Arc::new(RateLimiter::new(1000, max_connections_per_interval, std::time::Duration::from_secs(60), Vec::new()));
        dispatcher.tunnel = Some(Arc::new(EchoSink));
        dispatcher
    }

    fn tunnel_query(conn_id: u16, seq: u32, flags: SegmentFlags) -> Vec<u8> {
        let segment = Segment::new(conn_id, seq, 0, flags, Vec::new());
        let name = label_codec::encode_upstream(&segment.encode(), "tunnel.example.com", 't').unwrap();
        build_query(&name, wire::QTYPE_CNAME)
    }

    #[tokio::test]
    async fn synthesizes_public_ip_for_bare_authoritative_domain() {
        let dispatcher = make_dispatcher(vec![ZoneConfig {
            domain: "example.com".to_string(),
            records: Default::default(),
        }]);
        let query = build_query("example.com", wire::QTYPE_A);
        let reply = dispatcher
            .dispatch(&query, "203.0.113.5".parse().unwrap(), false)
            .await
            .expect("authoritative A reply");
        assert_eq!(&reply[0..2], &[0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn blocked_name_gets_black_hole_answer() {
        let dispatcher = make_dispatcher(Vec::new());
        dispatcher.blocklist.replace(["ads.example.com".to_string()].into_iter().collect());
        let query = build_query("x.ads.example.com", wire::QTYPE_A);
        let reply = dispatcher
            .dispatch(&query, "203.0.113.5".parse().unwrap(), false)
            .await
            .expect("black hole reply");
        assert!(reply.len() > 12);
    }

    #[tokio::test]
    async fn synthesizes_default_ns_records() {
        let dispatcher = make_dispatcher(vec![ZoneConfig {
            domain: "example.com".to_string(),
            records: Default::default(),
        }]);
        let query = build_query("example.com", wire::QTYPE_NS);
        let reply = dispatcher
            .dispatch(&query, "203.0.113.5".parse().unwrap(), false)
            .await
            .expect("NS reply");
        let ancount = u16::from_be_bytes([reply[6], reply[7]]);
        assert_eq!(ancount, 3);
    }

    #[tokio::test]
    async fn a_second_handshake_is_dropped_once_the_connection_limit_is_reached() {
        let dispatcher = make_dispatcher_with_tunnel(1);
        let source_ip = "203.0.113.5".parse().unwrap();

        let first = tunnel_query(1, 0, SegmentFlags::HANDSHAKE);
        assert!(dispatcher.dispatch(&first, source_ip, false).await.is_some());

        let second = tunnel_query(2, 0, SegmentFlags::HANDSHAKE);
        assert!(dispatcher.dispatch(&second, source_ip, false).await.is_none());
    }

    #[tokio::test]
    async fn data_segments_bypass_the_connection_limit_once_admitted() {
        let dispatcher = make_dispatcher_with_tunnel(1);
        let source_ip = "203.0.113.6".parse().unwrap();

        let handshake = tunnel_query(9, 0, SegmentFlags::HANDSHAKE);
        assert!(dispatcher.dispatch(&handshake, source_ip, false).await.is_some());

        // Same connection's data/ack/keep-alive segments must keep flowing
        // well past the connection-count budget the handshake already spent.
        for seq in 1..50 {
            let data = tunnel_query(9, seq, SegmentFlags::DATA);
            assert!(dispatcher.dispatch(&data, source_ip, false).await.is_some());
        }
    }
}
