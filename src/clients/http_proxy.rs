//! HTTP proxy client (§4.10): a local HTTP listener that tunnels CONNECT
//! and plain-request traffic over the DNS carrier, one TC per accepted
//! connection.

use crate::clients::carrier::{self, CarrierConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::json_logger::JsonLogger;
use crate::proxy::request::ProxyRequest;
use crate::tc::{InitiatorConfig, Role, TimingConfig, TransmissionControl};
use crate::totp;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub struct HttpProxyClientConfig {
    pub listen_addr: SocketAddr,
    pub carrier: CarrierConfig,
    pub totp_seed: String,
    pub totp_step: std::time::Duration,
    pub timing: TimingConfig,
}

/// Accept loop: one TC per connection, run until `cancel` fires.
pub async fn serve(config: Arc<HttpProxyClientConfig>, cancel: CancellationToken) -> DaemonResult<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| DaemonError::transport(e.to_string()))?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| DaemonError::transport(e.to_string()))?;
                let config = Arc::clone(&config);
                let child = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, config, child).await {
                        JsonLogger::debug("http_proxy_client", format!("session with {} ended: {}", peer, e));
                    }
                });
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn handle_client(mut stream: TcpStream, config: Arc<HttpProxyClientConfig>, cancel: CancellationToken) -> DaemonResult<()> {
    let (method, target, headers) = {
        let mut reader = BufReader::new(&mut stream);
        read_request_head(&mut reader).await?
    };

    let host_header = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.clone());

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let default_port = if is_connect { 443 } else { 80 };
    let authority = if is_connect {
        target.clone()
    } else {
        resolve_origin_form(&target, host_header.as_deref())
            .ok_or_else(|| DaemonError::malformed("could not determine a dial target from the request"))?
    };
    let (host, port) = split_host_port(&authority, default_port);

    let tc = establish_tunnel(&config, &host, port).await?;

    if is_connect {
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .map_err(|e| DaemonError::transport(e.to_string()))?;
    } else {
        let mut head = format!("{} {} HTTP/1.1\r\n", method, path_only(&target));
        for (name, value) in &headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        tc.write(head.as_bytes()).await.map_err(|e| DaemonError::transport(e.to_string()))?;
    }

    pump(stream, tc, cancel).await;
    Ok(())
}

/// Read the request line and headers off a freshly accepted connection,
/// stopping at the blank line. Returns `(method, target, headers)`.
async fn read_request_head<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> DaemonResult<(String, String, Vec<(String, String)>)> {
    let mut request_line = String::new();
    let n = reader
        .read_line(&mut request_line)
        .await
        .map_err(|e| DaemonError::transport(e.to_string()))?;
    if n == 0 {
        return Err(DaemonError::transport("client closed before sending a request"));
    }
    let mut parts = request_line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| DaemonError::transport(e.to_string()))?;
        let trimmed = line.trim_end();
        if n == 0 || trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok((method, target, headers))
}

/// Open a new tunnel connection to `host:port`: allocate a connection ID,
/// negotiate a live TOTP code, and drive the handshake over the carrier.
async fn establish_tunnel(config: &HttpProxyClientConfig, host: &str, port: u16) -> DaemonResult<Arc<TransmissionControl>> {
    let conn_id: u16 = rand::thread_rng().gen();
    let code = totp::generate(&config.totp_seed, config.totp_step.as_secs(), unix_now())
        .map_err(|e| DaemonError::internal(e.to_string()))?;
    let request = ProxyRequest {
        network: String::new(),
        port,
        address: host.to_string(),
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

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Copy bytes in both directions between the accepted socket and the TC
/// until either side closes.
async fn pump(stream: TcpStream, tc: Arc<TransmissionControl>, cancel: CancellationToken) {
    let (mut read_half, mut write_half) = stream.into_split();
    let tc_for_read = Arc::clone(&tc);
    let read_cancel = cancel.clone();
    let read_task = tokio::spawn(async move {
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
                _ = read_cancel.cancelled() => break,
            }
        }
        tc_for_read.close().await;
    });

    let tc_for_write = Arc::clone(&tc);
    let write_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match tc_for_write.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if write_half.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let _ = tokio::join!(read_task, write_task);
    cancel.cancel();
}

/// Pull an authority (`host:port` or bare host) out of an absolute-form
/// target, or fall back to the `Host` header for origin-form requests.
fn resolve_origin_form(target: &str, host_header: Option<&str>) -> Option<String> {
    if let Some(rest) = target.strip_prefix("http://").or_else(|| target.strip_prefix("https://")) {
        let authority = rest.split('/').next()?;
        return Some(authority.to_string());
    }
    host_header.map(|h| h.to_string())
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = authority.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (authority.to_string(), default_port)
}

/// The request-target's path component, for re-synthesizing the request
/// line against the origin server once an absolute-form URI is stripped down
/// to an authority for dialing.
fn path_only(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("http://").or_else(|| target.strip_prefix("https://")) {
        match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        }
    } else {
        target.to_string()
    }
}
