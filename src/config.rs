//! Daemon configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables for secrets, then overridden again by CLI flags — the same
//! three-layer precedence the teacher crate used for its private key.

use crate::segment::codec::SegmentCodecConfig;
use crate::tc::timing::TimingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which role this process plays.
    pub mode: DaemonMode,

    /// Authoritative zones this daemon answers for.
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,

    /// Upstream recursive resolvers, tried at random.
    #[serde(default = "default_resolvers")]
    pub resolvers: Vec<SocketAddr>,

    /// Blocklist ingest configuration.
    #[serde(default)]
    pub blocklist: BlocklistConfig,

    /// Per-IP rate limiting knobs.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Default TC timing parameters (negotiable per-handshake).
    #[serde(default)]
    pub tc_timing: TimingConfig,

    /// Segment codec tuning (label/TXT capacity constants).
    #[serde(default)]
    pub segment_codec: SegmentCodecConfig,

    /// Proxy server / client shared secret for TOTP access control.
    pub totp: TotpConfig,

    /// Server-mode listen address (authoritative + tunnel).
    pub server: Option<ServerConfig>,

    /// Proxy client (HTTP CONNECT) configuration.
    pub http_proxy: Option<HttpProxyClientConfig>,

    /// DNS relay client configuration.
    pub dns_relay: Option<DnsRelayClientConfig>,

    /// Logging verbosity / format knobs.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_resolvers() -> Vec<SocketAddr> {
    vec![
        "8.8.8.8:53".parse().unwrap(),
        "1.1.1.1:53".parse().unwrap(),
        "9.9.9.9:53".parse().unwrap(),
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: DaemonMode::Server,
            zones: Vec::new(),
            resolvers: default_resolvers(),
            blocklist: BlocklistConfig::default(),
            rate_limit: RateLimitConfig::default(),
            tc_timing: TimingConfig::default(),
            segment_codec: SegmentCodecConfig::default(),
            totp: TotpConfig::default(),
            server: None,
            http_proxy: None,
            dns_relay: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Operating mode for the `dnsproxyd` binary; the two client binaries
/// (`dns-tunnel-client`, `dns-relay`) are always in `Client`/`Relay` shape
/// regardless of this field, which only gates what `dnsproxyd` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMode {
    Server,
    Client,
    Relay,
}

/// One authoritative zone / custom-record set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Fully-qualified domain this daemon is authoritative for, without a
    /// leading dot (e.g. `"example.com"`).
    pub domain: String,

    /// Custom records keyed by full lower-case name (e.g.
    /// `"www.example.com"`). Populated at load time into the zone store's
    /// longest-suffix-first index.
    #[serde(default)]
    pub records: HashMap<String, CustomRecord>,
}

/// A custom record attached to one name within a zone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomRecord {
    #[serde(default)]
    pub a: Vec<std::net::Ipv4Addr>,
    #[serde(default)]
    pub aaaa: Vec<std::net::Ipv6Addr>,
    pub cname: Option<String>,
    #[serde(default)]
    pub txt: Vec<String>,
    #[serde(default)]
    pub mx: Vec<(u16, String)>,
    #[serde(default)]
    pub ns: Vec<String>,
}

/// Blocklist source + ingest knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistConfig {
    /// "hosts" format file URLs fetched by the (out-of-scope) downloader;
    /// kept here only so the ingest side has a place to read the last
    /// fetched path from.
    #[serde(default)]
    pub source_urls: Vec<String>,

    /// Local path the downloader writes merged blocklist text to.
    pub local_path: Option<PathBuf>,

    /// How often the background refresh task re-ingests `local_path`.
    #[serde(with = "humantime_serde", default = "default_blocklist_refresh")]
    pub refresh_interval: std::time::Duration,
}

fn default_blocklist_refresh() -> std::time::Duration {
    std::time::Duration::from_secs(3600)
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            source_urls: Vec::new(),
            local_path: None,
            refresh_interval: default_blocklist_refresh(),
        }
    }
}

/// Per-IP rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Max non-tunnel queries per IP per `reset_interval`.
    pub max_queries_per_interval: u32,
    /// Max distinct tunnel connection IDs per IP per `reset_interval`.
    pub max_connections_per_interval: u32,
    #[serde(with = "humantime_serde")]
    pub reset_interval: std::time::Duration,
    /// CIDRs exempt from all rate limiting (the later, CIDR-based shape;
    /// see SPEC_FULL.md Open Questions).
    #[serde(default)]
    pub allow_from: Vec<ipnet::IpNet>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_queries_per_interval: 200,
            max_connections_per_interval: 20,
            reset_interval: std::time::Duration::from_secs(60),
            allow_from: Vec::new(),
        }
    }
}

/// TOTP shared-secret configuration for proxy connection auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpConfig {
    /// Base32-encoded shared secret. Loaded from the `DNS_TUNNEL_TOTP_SEED`
    /// environment variable when present, overriding the file value, the
    /// way the teacher crate let `NOOSHDAROO_PRIVATE_KEY` override its
    /// config file key.
    pub seed_base32: String,
    /// Step size, RFC 6238 default 30s.
    #[serde(with = "humantime_serde", default = "default_totp_step")]
    pub step: std::time::Duration,
}

fn default_totp_step() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            seed_base32: String::new(),
            step: default_totp_step(),
        }
    }
}

/// Server-mode listen configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// `false` disables UDP and listens on TCP only (e.g. for testing).
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// HTTP proxy client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProxyClientConfig {
    pub listen_addr: SocketAddr,
    pub dns_resolver: SocketAddr,
    pub tunnel_domain: String,
    /// `true` carries downstream segments in TXT strings instead of CNAME
    /// chains.
    #[serde(default)]
    pub use_txt_downstream: bool,
}

/// DNS relay client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRelayClientConfig {
    pub tcp_listen_addr: SocketAddr,
    pub udp_listen_addr: SocketAddr,
    pub dns_resolver: SocketAddr,
    pub tunnel_domain: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also emit one JSON line per structured event (connection, TC state
    /// transition, proxy open/close) in addition to the human `env_logger`
    /// stream.
    #[serde(default)]
    pub json_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { json_events: false }
    }
}

impl AppConfig {
    /// Load from a TOML file, then apply environment variable overrides.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take precedence over the file for secrets,
    /// matching the teacher's `NOOSHDAROO_PRIVATE_KEY` precedent.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(seed) = std::env::var("DNS_TUNNEL_TOTP_SEED") {
            self.totp.seed_base32 = seed;
        }
    }

    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate cross-field invariants not expressible in the type alone.
    pub fn validate(&self) -> Result<(), String> {
        if self.mode == DaemonMode::Server && self.server.is_none() {
            return Err("server configuration required in server mode".to_string());
        }
        if self.totp.seed_base32.is_empty() {
            return Err("totp.seed_base32 must be set (or DNS_TUNNEL_TOTP_SEED)".to_string());
        }
        for zone in &self.zones {
            if zone.domain.is_empty() {
                return Err("zone domain must not be empty".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_server_mode() {
        let config = AppConfig::default();
        assert_eq!(config.mode, DaemonMode::Server);
        assert!(!config.resolvers.is_empty());
    }

    #[test]
    fn validate_requires_server_config_in_server_mode() {
        let mut config = AppConfig::default();
        config.totp.seed_base32 = "JBSWY3DPEHPK3PXP".to_string();
        assert!(config.validate().is_err());

        config.server = Some(ServerConfig {
            listen_addr: "0.0.0.0:53".parse().unwrap(),
            udp_enabled: true,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_totp_seed() {
        let mut config = AppConfig::default();
        config.mode = DaemonMode::Relay;
        assert!(config.validate().is_err());
        config.totp.seed_base32 = "ABC".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_override_replaces_totp_seed() {
        std::env::set_var("DNS_TUNNEL_TOTP_SEED", "OVERRIDDEN");
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.totp.seed_base32, "OVERRIDDEN");
        std::env::remove_var("DNS_TUNNEL_TOTP_SEED");
    }
}
