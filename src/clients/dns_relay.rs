//! DNS relay client (§4.11): a local TCP/UDP DNS listener backed by one
//! long-lived TC, so an ordinary resolver pointed at this process gets its
//! queries carried through the tunnel to the server's recursive forwarder.

use crate::clients::carrier::{self, CarrierConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::forwarder::RelaySubstrate;
use crate::json_logger::JsonLogger;
use crate::proxy::request::ProxyRequest;
use crate::tc::{InitiatorConfig, Role, TimingConfig, TransmissionControl};
use crate::totp;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const MAX_UDP_REPLY: usize = 9038;
/// Bounded auto-reconnect (§4.11): give up this many consecutive handshake
/// attempts before treating the relay as down for this round.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

pub struct DnsRelayClientConfig {
    pub tcp_listen_addr: SocketAddr,
    pub udp_listen_addr: SocketAddr,
    pub carrier: CarrierConfig,
    pub totp_seed: String,
    pub totp_step: std::time::Duration,
    pub timing: TimingConfig,
}

/// Holds the current relay substrate, swapped out by `reconnect` whenever
/// the underlying TC dies.
struct RelayHandle {
    substrate: RwLock<Option<Arc<RelaySubstrate>>>,
}

/// Run the TCP and UDP DNS listeners plus the reconnect loop until `cancel`
/// fires.
pub async fn serve(config: Arc<DnsRelayClientConfig>, cancel: CancellationToken) -> DaemonResult<()> {
    let handle = Arc::new(RelayHandle {
        substrate: RwLock::new(None),
    });

    reconnect(&config, &handle, cancel.child_token()).await?;

    let tcp_listener = TcpListener::bind(config.tcp_listen_addr)
        .await
        .map_err(|e| DaemonError::transport(e.to_string()))?;
    let udp_socket = Arc::new(
        UdpSocket::bind(config.udp_listen_addr)
            .await
            .map_err(|e| DaemonError::transport(e.to_string()))?,
    );

    let udp_task = {
        let handle = Arc::clone(&handle);
        let udp_socket = Arc::clone(&udp_socket);
        let cancel = cancel.clone();
        tokio::spawn(async move { serve_udp(udp_socket, handle, cancel).await })
    };

    loop {
        tokio::select! {
            accepted = tcp_listener.accept() => {
                let (stream, _) = accepted.map_err(|e| DaemonError::transport(e.to_string()))?;
                let handle = Arc::clone(&handle);
                tokio::spawn(async move {
                    let _ = serve_tcp_connection(stream, handle).await;
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
    let _ = udp_task.await;
    Ok(())
}

async fn serve_udp(socket: Arc<UdpSocket>, handle: Arc<RelayHandle>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_UDP_REPLY];
    loop {
        let (n, peer) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(_) => continue,
            },
            _ = cancel.cancelled() => return,
        };
        let query = buf[..n].to_vec();
        let socket = Arc::clone(&socket);
        let substrate = handle.substrate.read().await.clone();
        tokio::spawn(async move {
            if let Some(substrate) = substrate {
                if let Ok(reply) = substrate_forward(&substrate, &query).await {
                    let _ = socket.send_to(&reply, peer).await;
                }
            }
        });
    }
}

async fn serve_tcp_connection(mut stream: TcpStream, handle: Arc<RelayHandle>) -> DaemonResult<()> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DaemonError::transport(e.to_string()))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut query = vec![0u8; len];
    stream
        .read_exact(&mut query)
        .await
        .map_err(|e| DaemonError::transport(e.to_string()))?;

    let substrate = handle
        .substrate
        .read()
        .await
        .clone()
        .ok_or_else(|| DaemonError::upstream("relay tunnel is down"))?;
    let reply = substrate_forward(&substrate, &query).await?;

    let reply_len = (reply.len() as u16).to_be_bytes();
    stream.write_all(&reply_len).await.map_err(|e| DaemonError::transport(e.to_string()))?;
    stream.write_all(&reply).await.map_err(|e| DaemonError::transport(e.to_string()))?;
    Ok(())
}

async fn substrate_forward(substrate: &Arc<RelaySubstrate>, query: &[u8]) -> DaemonResult<Vec<u8>> {
    substrate.forward(query).await
}

/// Negotiate a fresh TC against the server's relay proxy slot and install it
/// as the active substrate, retrying up to [`MAX_RECONNECT_ATTEMPTS`] times.
async fn reconnect(config: &Arc<DnsRelayClientConfig>, handle: &Arc<RelayHandle>, cancel: CancellationToken) -> DaemonResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match open_relay_tunnel(config).await {
            Ok(tc) => {
                let substrate = Arc::new(RelaySubstrate::new(tc));
                *handle.substrate.write().await = Some(substrate);
                spawn_watchdog(Arc::clone(config), Arc::clone(handle), cancel);
                return Ok(());
            }
            Err(e) if attempt < MAX_RECONNECT_ATTEMPTS => {
                JsonLogger::warn("dns_relay_client", format!("relay handshake attempt {} failed: {}", attempt, e));
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Once the active TC closes, try to reconnect in the background so the
/// listeners keep accepting without the caller noticing a blip.
fn spawn_watchdog(config: Arc<DnsRelayClientConfig>, handle: Arc<RelayHandle>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let substrate = handle.substrate.read().await.clone();
            let Some(substrate) = substrate else { return };
            while !substrate.tc_is_closed().await {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            *handle.substrate.write().await = None;
            if cancel.is_cancelled() {
                return;
            }
            if reconnect(&config, &handle, cancel.clone()).await.is_err() {
                JsonLogger::error("dns_relay_client", "giving up on relay reconnect after max attempts");
                return;
            }
        }
    });
}

async fn open_relay_tunnel(config: &DnsRelayClientConfig) -> DaemonResult<Arc<TransmissionControl>> {
    let conn_id: u16 = rand::thread_rng().gen();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let code = totp::generate(&config.totp_seed, config.totp_step.as_secs(), now).map_err(|e| DaemonError::internal(e.to_string()))?;
    let request = ProxyRequest {
        network: "relay".to_string(),
        port: 0,
        address: String::new(),
        totp: code,
    };
    let app_payload = serde_json::to_vec(&request).map_err(|e| DaemonError::internal(e.to_string()))?;

    let initiator_config = InitiatorConfig {
        max_segment_len: 180,
        ack_delay_ms: config.timing.ack_delay.as_millis() as u32,
        retransmission_interval_ms: config.timing.retransmission_interval.as_millis() as u32,
        sliding_window_wait_ms: config.timing.sliding_window_wait.as_millis() as u32,
        keepalive_interval_ms: config.timing.keepalive_interval.as_millis() as u32,
        debug: false,
    };

    let cancel = CancellationToken::new();
    let tc = TransmissionControl::spawn(conn_id, Role::Initiator, config.timing, cancel.clone());
    tokio::spawn(carrier::run(Arc::clone(&tc), config.carrier.clone(), cancel));
    tc.begin_initiator(initiator_config, app_payload).await?;
    Ok(tc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_relay_fails_clearly_with_no_substrate_installed() {
        let handle = Arc::new(RelayHandle {
            substrate: RwLock::new(None),
        });
        assert!(handle.substrate.read().await.is_none());
    }
}
