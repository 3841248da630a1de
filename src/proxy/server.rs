//! Proxy server (§4.9): the responder side of the tunnel. On the first
//! segment for an unknown connection ID, authenticates, dials the
//! destination, and pairs a TC to the resulting TCP socket. Implements
//! [`TunnelSink`] so the dispatcher can hand it inbound segments without
//! knowing anything about connection bookkeeping.

use crate::blocklist::Blocklist;
use crate::dispatcher::TunnelSink;
use crate::error::DaemonError;
use crate::json_logger::JsonLogger;
use crate::proxy::request::parse_first_segment;
use crate::segment::{Segment, SegmentFlags};
use crate::tc::{Role, TcState, TimingConfig, TransmissionControl};
use crate::totp;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const LINGER: Duration = Duration::from_secs(60);

struct ProxyConnection {
    tc: Arc<TransmissionControl>,
    cancel: CancellationToken,
    closed_at: SyncMutex<Option<Instant>>,
}

pub struct ProxyServerConfig {
    pub totp_seed: String,
    pub totp_step_secs: u64,
    pub default_timing: TimingConfig,
}

/// The table of in-flight tunnel connections, keyed by the 16-bit connection
/// ID carried in every segment.
pub struct ProxyServer {
    connections: tokio::sync::Mutex<HashMap<u16, Arc<ProxyConnection>>>,
    blocklist: Arc<Blocklist>,
    config: ProxyServerConfig,
    root_cancel: CancellationToken,
}

impl ProxyServer {
    pub fn new(blocklist: Arc<Blocklist>, config: ProxyServerConfig, root_cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            connections: tokio::sync::Mutex::new(HashMap::new()),
            blocklist,
            config,
            root_cancel,
        })
    }

    /// Reap connections that have lingered past `LINGER` since their TC
    /// closed. Intended to run on a periodic background task.
    pub async fn sweep_lingering(&self) {
        let mut connections = self.connections.lock().await;
        connections.retain(|_, conn| match *conn.closed_at.lock() {
            Some(closed_at) => closed_at.elapsed() < LINGER,
            None => true,
        });
    }

    async fn get_or_create(&self, conn_id: u16, first_payload: &[u8]) -> Option<Arc<ProxyConnection>> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&conn_id) {
            return Some(Arc::clone(conn));
        }

        let (initiator_config, request) = match parse_first_segment(first_payload) {
            Ok(pair) => pair,
            Err(e) => {
                JsonLogger::debug("proxy_server", format!("rejecting first segment for conn {}: {}", conn_id, e));
                return None;
            }
        };

        if !totp::verify(&self.config.totp_seed, self.config.totp_step_secs, request.totp).unwrap_or(false) {
            JsonLogger::warn("proxy_server", format!("TOTP rejected for conn {}", conn_id));
            return None;
        }

        let dial_target = request.dial_target();
        if self.blocklist.is_blocked(dial_target.split(':').next().unwrap_or(&dial_target)) {
            JsonLogger::warn("proxy_server", format!("dial target blocked for conn {}: {}", conn_id, dial_target));
            return None;
        }

        // `TcpStream::connect` resolves a `host:port` string itself (tokio's
        // `ToSocketAddrs` for `&str` does real DNS resolution), so named
        // destinations dial correctly rather than only literal IPs.
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&dial_target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                JsonLogger::warn("proxy_server", format!("dial failed for conn {}: {}", conn_id, e));
                return None;
            }
            Err(_) => {
                JsonLogger::warn("proxy_server", format!("dial timed out for conn {}", conn_id));
                return None;
            }
        };

        let cancel = self.root_cancel.child_token();
        let timing = TimingConfig {
            ack_delay: Duration::from_millis(initiator_config.ack_delay_ms as u64),
            retransmission_interval: Duration::from_millis(initiator_config.retransmission_interval_ms as u64),
            sliding_window_wait: Duration::from_millis(initiator_config.sliding_window_wait_ms as u64),
            keepalive_interval: Duration::from_millis(initiator_config.keepalive_interval_ms as u64),
            ..self.config.default_timing.clone()
        };
        let tc = TransmissionControl::spawn(conn_id, Role::Responder, timing, cancel.clone());
        tc.deliver_segment(Segment::new(conn_id, 0, 0, SegmentFlags::HANDSHAKE, first_payload.to_vec()));

        let connection = Arc::new(ProxyConnection {
            tc: Arc::clone(&tc),
            cancel: cancel.clone(),
            closed_at: SyncMutex::new(None),
        });
        connections.insert(conn_id, Arc::clone(&connection));
        drop(connections);

        JsonLogger::proxy_connection_opened(conn_id, &dial_target, request.network_label());
        spawn_pipe(Arc::clone(&connection), stream, conn_id);
        Some(connection)
    }
}

/// Wire the dialed TCP socket to the TC in both directions, and mark the
/// connection's linger clock once the TC closes.
fn spawn_pipe(connection: Arc<ProxyConnection>, stream: TcpStream, conn_id: u16) {
    let (mut read_half, mut write_half) = stream.into_split();
    let tc_for_read = Arc::clone(&connection.tc);
    let cancel = connection.cancel.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tc_for_read.write(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        tc_for_read.close().await;
    });

    let tc_for_write = Arc::clone(&connection.tc);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let mut bytes_sent = 0u64;
        loop {
            match tc_for_write.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    bytes_sent += n as u64;
                    if write_half.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        *connection.closed_at.lock() = Some(Instant::now());
        JsonLogger::proxy_connection_closed(conn_id, bytes_sent, 0, "tc closed");
    });
}

#[async_trait]
impl TunnelSink for ProxyServer {
    async fn receive(&self, seg: Segment) -> Segment {
        if seg.is_malformed() {
            return Segment::new(seg.conn_id, 0, 0, SegmentFlags::MALFORMED, Vec::new());
        }

        let connection = if seg.flags.contains(SegmentFlags::HANDSHAKE) {
            self.get_or_create(seg.conn_id, &seg.payload).await
        } else {
            let connections = self.connections.lock().await;
            connections.get(&seg.conn_id).cloned()
        };

        let Some(connection) = connection else {
            return Segment::new(seg.conn_id, 0, 0, SegmentFlags::MALFORMED, Vec::new());
        };

        if !seg.flags.contains(SegmentFlags::HANDSHAKE) {
            connection.tc.deliver_segment(seg.clone());
        }

        let wait = self.config.default_timing.ack_delay.mul_f64(8.0 / 7.0);
        let outbound = timeout(wait, connection.tc.next_outbound()).await;
        match outbound {
            Ok(Some(reply)) => reply,
            _ => {
                let ack = 0;
                Segment::new(seg.conn_id, 0, ack, SegmentFlags::ACK_ONLY, Vec::new())
            }
        }
    }
}

#[allow(dead_code)]
fn connection_state_label(state: TcState) -> &'static str {
    match state {
        TcState::Closed => "closed",
        TcState::SynSent => "syn_sent",
        TcState::SynReceived => "syn_received",
        TcState::Established => "established",
        TcState::Closing => "closing",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::{build_first_segment, ProxyRequest};
    use crate::tc::InitiatorConfig;
    use std::net::TcpListener as StdTcpListener;

    fn sample_initiator_config() -> InitiatorConfig {
        InitiatorConfig {
            max_segment_len: 180,
            ack_delay_ms: 50,
            retransmission_interval_ms: 200,
            sliding_window_wait_ms: 50,
            keepalive_interval_ms: 1000,
            debug: false,
        }
    }

    #[tokio::test]
    async fn rejects_bad_totp_without_creating_a_connection() {
        let server = ProxyServer::new(
            Arc::new(Blocklist::new()),
            ProxyServerConfig {
                totp_seed: "JBSWY3DPEHPK3PXP".to_string(),
                totp_step_secs: 30,
                default_timing: TimingConfig::default(),
            },
            CancellationToken::new(),
        );

        let request = ProxyRequest {
            network: String::new(),
            port: 80,
            address: "127.0.0.1".to_string(),
            totp: 0,
        };
        let payload = build_first_segment(&sample_initiator_config(), &request).unwrap();
        let seg = Segment::new(42, 0, 0, SegmentFlags::HANDSHAKE, payload);
        let reply = server.receive(seg).await;
        assert!(reply.is_malformed());
    }

    #[tokio::test]
    async fn establishes_tunnel_to_a_listening_destination() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let tokio_listener = tokio::net::TcpListener::from_std(listener).unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = tokio_listener.accept().await {
                let mut buf = [0u8; 16];
                if let Ok(n) = stream.read(&mut buf).await {
                    let _ = stream.write_all(&buf[..n]).await;
                }
            }
        });

        let seed = "JBSWY3DPEHPK3PXP";
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let code = totp::generate(seed, 30, now).unwrap();
        let server = ProxyServer::new(
            Arc::new(Blocklist::new()),
            ProxyServerConfig {
                totp_seed: seed.to_string(),
                totp_step_secs: 30,
                default_timing: TimingConfig::default(),
            },
            CancellationToken::new(),
        );

        let request = ProxyRequest {
            network: String::new(),
            port: addr.port(),
            address: addr.ip().to_string(),
            totp: code,
        };
        let payload = build_first_segment(&sample_initiator_config(), &request).unwrap();
        let seg = Segment::new(99, 0, 0, SegmentFlags::HANDSHAKE, payload);
        let reply = server.receive(seg).await;
        assert!(reply.flags.contains(SegmentFlags::HANDSHAKE_ACK));
    }
}
