//! A DNS server that answers authoritatively for configured zones, forwards
//! everything else recursively, and — for queries carrying a recognized
//! tunnel prefix — carries a reliable TCP-over-DNS proxy connection inside
//! the query/response stream itself.
//!
//! The three binaries built from this crate:
//!
//! - `dnsproxyd`: the server daemon (authoritative + forwarding + tunnel
//!   responder + proxy dialer).
//! - `dns-tunnel-client`: a local HTTP proxy that carries CONNECT/plain HTTP
//!   traffic over the tunnel.
//! - `dns-relay`: a local DNS listener that carries ordinary DNS queries
//!   over the tunnel to the server's recursive forwarder.

pub mod blocklist;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod json_logger;
pub mod memoizer;
pub mod proxy;
pub mod publicip;
pub mod rate_limit;
pub mod segment;
pub mod tc;
pub mod toolbox;
pub mod totp;
pub mod wire;
pub mod zone;

pub use blocklist::Blocklist;
pub use clients::{CarrierConfig, DnsRelayClientConfig, HttpProxyClientConfig};
pub use config::AppConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig, TunnelSink};
pub use error::{DaemonError, DaemonResult};
pub use forwarder::{RecursiveForwarder, RelaySubstrate};
pub use memoizer::ResponseMemoizer;
pub use proxy::{ProxyRequest, ProxyServer, ProxyServerConfig};
pub use publicip::PublicIpCache;
pub use rate_limit::RateLimiter;
pub use segment::{Segment, SegmentCodecConfig, SegmentFlags};
pub use tc::{InitiatorConfig, Role, TcState, TimingConfig, TransmissionControl};
pub use toolbox::ToolboxBridge;
pub use zone::ZoneStore;
