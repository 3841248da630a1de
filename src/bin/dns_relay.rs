//! `dns-relay`: a local DNS listener backed by one long-lived tunnel
//! connection, so any resolver pointed at this process gets its queries
//! carried to the server's recursive forwarder.

use anyhow::{Context, Result};
use clap::Parser;
use dns_tunnel_suite::clients::{serve_dns_relay, CarrierConfig, DnsRelayClientConfig};
use dns_tunnel_suite::config::AppConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dns-relay")]
#[command(about = "Local DNS listener that carries queries over the tunnel", long_about = None)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
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

    let app_config = AppConfig::from_file(&cli.config).context("loading configuration")?;
    app_config.validate().map_err(anyhow::Error::msg)?;
    let dns_relay = app_config.dns_relay.context("dns_relay configuration required")?;

    let client_config = Arc::new(DnsRelayClientConfig {
        tcp_listen_addr: dns_relay.tcp_listen_addr,
        udp_listen_addr: dns_relay.udp_listen_addr,
        carrier: CarrierConfig {
            resolver: dns_relay.dns_resolver,
            tunnel_domain: dns_relay.tunnel_domain,
            tunnel_prefix: 't',
            use_txt_downstream: false,
        },
        totp_seed: app_config.totp.seed_base32,
        totp_step: app_config.totp.step,
        timing: app_config.tc_timing,
    });

    log::info!(
        "dns-relay listening on tcp {} / udp {}",
        client_config.tcp_listen_addr,
        client_config.udp_listen_addr
    );
    serve_dns_relay(client_config, CancellationToken::new())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}
