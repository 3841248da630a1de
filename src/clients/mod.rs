//! The tunnel clients (§4.10, §4.11): everything that drives a TC by
//! carrying its segments over real DNS queries, rather than receiving them
//! off a listening socket the way [`crate::proxy::server`] does.

pub mod carrier;
pub mod dns_relay;
pub mod http_proxy;

pub use carrier::CarrierConfig;
pub use dns_relay::{serve as serve_dns_relay, DnsRelayClientConfig};
pub use http_proxy::{serve as serve_http_proxy, HttpProxyClientConfig};
