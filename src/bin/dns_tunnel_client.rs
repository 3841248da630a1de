//! `dns-tunnel-client`: a local HTTP proxy that carries CONNECT and plain
//! HTTP traffic over the DNS tunnel, one TC per accepted connection.

use anyhow::{Context, Result};
use clap::Parser;
use dns_tunnel_suite::clients::{serve_http_proxy, CarrierConfig, HttpProxyClientConfig};
use dns_tunnel_suite::config::AppConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dns-tunnel-client")]
#[command(about = "Local HTTP proxy that tunnels traffic over DNS", long_about = None)]
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
    let http_proxy = app_config.http_proxy.context("http_proxy configuration required")?;

    let client_config = Arc::new(HttpProxyClientConfig {
        listen_addr: http_proxy.listen_addr,
        carrier: CarrierConfig {
            resolver: http_proxy.dns_resolver,
            tunnel_domain: http_proxy.tunnel_domain,
            tunnel_prefix: 't',
            use_txt_downstream: http_proxy.use_txt_downstream,
        },
        totp_seed: app_config.totp.seed_base32,
        totp_step: app_config.totp.step,
        timing: app_config.tc_timing,
    });

    log::info!("dns-tunnel-client listening on {}", client_config.listen_addr);
    serve_http_proxy(client_config, CancellationToken::new())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}
