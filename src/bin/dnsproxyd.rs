//! `dnsproxyd`: the server daemon — authoritative + forwarding DNS answers,
//! the tunnel's responder side, and the proxy dialer that serves requests
//! carried inside it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dns_tunnel_suite::config::AppConfig;
use dns_tunnel_suite::dispatcher::{Dispatcher, DispatcherConfig};
use dns_tunnel_suite::publicip::PublicIpSource;
use dns_tunnel_suite::{Blocklist, ProxyServer, ProxyServerConfig, PublicIpCache, RateLimiter, RecursiveForwarder, ResponseMemoizer, ZoneStore};
use log::{info, warn};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dnsproxyd")]
#[command(about = "Authoritative + forwarding DNS server with a built-in TCP-over-DNS tunnel", long_about = None)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Determines this host's public IP by asking the OS which local address it
/// would use to reach an internet host, with no outbound traffic beyond the
/// routing lookup itself. A stand-in for whatever external service a
/// deployment actually wants (§1: out of scope).
struct LocalRouteIpSource;

#[async_trait]
impl PublicIpSource for LocalRouteIpSource {
    async fn discover(&self) -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("1.1.1.1:80").await.ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AppConfig::from_file(&cli.config).context("loading configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;
    let server = config.server.clone().context("server configuration required")?;

    let zones = ZoneStore::from_config(&config.zones);
    let blocklist = Arc::new(Blocklist::new());
    if let Some(path) = &config.blocklist.local_path {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let names = contents.lines().map(|l| l.trim().to_ascii_lowercase()).filter(|l| !l.is_empty()).collect();
            blocklist.replace(names);
            info!("loaded {} blocklist entries from {}", blocklist.len(), path.display());
        }
    }
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_queries_per_interval,
        config.rate_limit.max_connections_per_interval,
        config.rate_limit.reset_interval,
        config.rate_limit.allow_from.clone(),
    ));
    let forwarder = Arc::new(RecursiveForwarder::new(config.resolvers.clone(), None));
    let public_ip = Arc::new(PublicIpCache::new(Arc::new(LocalRouteIpSource)));

    let root_cancel = CancellationToken::new();
    let proxy_server = ProxyServer::new(
        Arc::clone(&blocklist),
        ProxyServerConfig {
            totp_seed: config.totp.seed_base32.clone(),
            totp_step_secs: config.totp.step.as_secs(),
            default_timing: config.tc_timing,
        },
        root_cancel.clone(),
    );

    let dispatcher = Arc::new(Dispatcher {
        zones,
        blocklist,
        rate_limiter,
        memoizer: ResponseMemoizer::new(),
        forwarder,
        toolbox: None,
        public_ip,
        tunnel: Some(proxy_server.clone() as Arc<dyn dns_tunnel_suite::dispatcher::TunnelSink>),
        segment_codec: config.segment_codec,
        config: DispatcherConfig {
            tunnel_domain: config.zones.first().map(|z| z.domain.clone()).unwrap_or_default(),
            tunnel_prefix: 't',
            use_txt_downstream: false,
            totp_seed: config.totp.seed_base32.clone(),
            totp_step_secs: config.totp.step.as_secs(),
        },
    });

    {
        let sweep_server = Arc::clone(&proxy_server);
        let sweep_cancel = root_cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => sweep_server.sweep_lingering().await,
                    _ = sweep_cancel.cancelled() => return,
                }
            }
        });
    }

    if server.udp_enabled {
        let udp_dispatcher = Arc::clone(&dispatcher);
        let udp_cancel = root_cancel.child_token();
        let listen_addr = server.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = serve_udp(listen_addr, udp_dispatcher, udp_cancel).await {
                warn!("udp listener stopped: {}", e);
            }
        });
    }

    info!("dnsproxyd listening on {}", server.listen_addr);
    serve_tcp(server.listen_addr, dispatcher, root_cancel).await
}

async fn serve_udp(listen_addr: std::net::SocketAddr, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Result<()> {
    let socket = Arc::new(UdpSocket::bind(listen_addr).await?);
    let mut buf = vec![0u8; dns_tunnel_suite::wire::MAX_UDP_PAYLOAD];
    loop {
        let (n, peer) = tokio::select! {
            result = socket.recv_from(&mut buf) => result?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let query = buf[..n].to_vec();
        let dispatcher = Arc::clone(&dispatcher);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Some(reply) = dispatcher.dispatch(&query, peer.ip(), false).await {
                let _ = socket.send_to(&reply, peer).await;
            }
        });
    }
}

async fn serve_tcp(listen_addr: std::net::SocketAddr, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = serve_tcp_connection(stream, peer.ip(), dispatcher).await {
                        warn!("tcp connection from {} ended: {}", peer, e);
                    }
                });
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn serve_tcp_connection(mut stream: TcpStream, peer_ip: IpAddr, dispatcher: Arc<Dispatcher>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        let Some(reply) = dispatcher.dispatch(&query, peer_ip, true).await else {
            continue;
        };
        let reply_len = (reply.len() as u16).to_be_bytes();
        stream.write_all(&reply_len).await?;
        stream.write_all(&reply).await?;
    }
}
