//! End-to-end scenarios against [`Dispatcher`], exercising the decision
//! table the way a real client would: an authoritative custom record, a
//! blocklist hit, and a tunnel segment carried in through a query name.

use dns_tunnel_suite::config::{CustomRecord, ZoneConfig};
use dns_tunnel_suite::dispatcher::{Dispatcher, DispatcherConfig, TunnelSink};
use dns_tunnel_suite::segment::label_codec;
use dns_tunnel_suite::segment::{Segment, SegmentCodecConfig, SegmentFlags};
use dns_tunnel_suite::wire::message::encode_name;
use dns_tunnel_suite::wire::{self};
use dns_tunnel_suite::{Blocklist, PublicIpCache, RateLimiter, RecursiveForwarder, ResponseMemoizer, ZoneStore};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

fn build_query(name: &str, qtype: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[0] = 0x12;
    buf[1] = 0x34;
    buf[5] = 1;
    buf.extend(encode_name(name).unwrap());
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf
}

struct NullIpSource;

#[async_trait]
impl dns_tunnel_suite::publicip::PublicIpSource for NullIpSource {
    async fn discover(&self) -> Option<IpAddr> {
        None
    }
}

/// A tunnel sink that always answers with a fixed ACK segment, enough to
/// exercise the label codec round trip without a real proxy server behind it.
struct EchoSink;

#[async_trait]
impl TunnelSink for EchoSink {
    async fn receive(&self, seg: Segment) -> Segment {
        Segment::new(seg.conn_id, seg.ack, seg.seq + seg.payload.len() as u32, SegmentFlags::ACK_ONLY, Vec::new())
    }
}

fn make_dispatcher(zones: Vec<ZoneConfig>, tunnel: Option<Arc<dyn TunnelSink>>) -> Dispatcher {
    Dispatcher {
        zones: ZoneStore::from_config(&zones),
        blocklist: Arc::new(Blocklist::new()),
        rate_limiter: Arc::new(RateLimiter::new(1000, 1000, std::time::Duration::from_secs(60), Vec::new())),
        memoizer: ResponseMemoizer::new(),
        forwarder: Arc::new(RecursiveForwarder::new(Vec::new(), None)),
        toolbox: None,
        public_ip: Arc::new(PublicIpCache::new(Arc::new(NullIpSource))),
        tunnel,
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

#[tokio::test]
async fn custom_a_record_answers_with_configured_address() {
    let mut records = std::collections::HashMap::new();
    records.insert(
        "www.example.com".to_string(),
        CustomRecord {
            a: vec!["203.0.113.9".parse().unwrap()],
            aaaa: Vec::new(),
            cname: None,
            txt: Vec::new(),
            mx: Vec::new(),
            ns: Vec::new(),
        },
    );
    let dispatcher = make_dispatcher(
        vec![ZoneConfig {
            domain: "example.com".to_string(),
            records,
        }],
        None,
    );

    let query = build_query("www.example.com", wire::QTYPE_A);
    let reply = dispatcher
        .dispatch(&query, "198.51.100.4".parse().unwrap(), false)
        .await
        .expect("custom A record reply");

    assert_eq!(&reply[0..2], &[0x12, 0x34]);
    let ancount = u16::from_be_bytes([reply[6], reply[7]]);
    assert_eq!(ancount, 1);
}

#[tokio::test]
async fn blocked_subdomain_gets_a_black_hole_instead_of_a_forward() {
    let dispatcher = make_dispatcher(Vec::new(), None);
    dispatcher.blocklist.replace(["tracker.example.net".to_string()].into_iter().collect());

    let query = build_query("beacon.tracker.example.net", wire::QTYPE_A);
    let reply = dispatcher
        .dispatch(&query, "198.51.100.4".parse().unwrap(), false)
        .await
        .expect("black hole reply for blocked name");

    let ancount = u16::from_be_bytes([reply[6], reply[7]]);
    assert_eq!(ancount, 1);
}

#[tokio::test]
async fn tunnel_prefixed_query_round_trips_a_segment_through_the_sink() {
    let dispatcher = make_dispatcher(Vec::new(), Some(Arc::new(EchoSink)));

    let outbound = Segment::new(7, 0, 0, SegmentFlags::DATA, b"hello".to_vec());
    let name = label_codec::encode_upstream(&outbound.encode(), "tunnel.example.com", 't').unwrap();

    let query = build_query(&name, wire::QTYPE_CNAME);
    let reply = dispatcher
        .dispatch(&query, "198.51.100.4".parse().unwrap(), false)
        .await
        .expect("tunnel reply");

    let decoded = wire::parse_first_answer(&reply).unwrap().expect("a CNAME answer");
    let wire::DecodedAnswer::Cname(target) = decoded else {
        panic!("expected a CNAME answer carrying the reply segment");
    };
    let reply_raw = label_codec::decode_downstream_cname(&target, "tunnel.example.com").unwrap();
    let reply_segment = Segment::decode(&reply_raw);
    assert_eq!(reply_segment.conn_id, 7);
    assert!(reply_segment.flags.contains(SegmentFlags::ACK_ONLY));
}
