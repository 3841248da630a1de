//! Recursive forwarder (§4.7): hand a raw query to a randomly chosen
//! upstream resolver over UDP or TCP, or — when a local DNS relay's TC is
//! available — through that tunnel instead.

use crate::error::{DaemonError, DaemonResult};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::tc::TransmissionControl;

const UDP_DEADLINE: Duration = Duration::from_secs(2);
const MAX_UDP_REPLY: usize = 9038;

/// A relay substrate: the DNS relay client's single long-lived TC, guarded
/// by a transaction mutex so request/response pairs don't interleave on the
/// one connection (§4.7, §4.11).
pub struct RelaySubstrate {
    tc: Arc<TransmissionControl>,
    transaction: Mutex<()>,
}

impl RelaySubstrate {
    pub fn new(tc: Arc<TransmissionControl>) -> Self {
        Self {
            tc,
            transaction: Mutex::new(()),
        }
    }

    /// Whether the underlying TC has closed, so a client can tell when to
    /// reconnect instead of forwarding into a dead substrate.
    pub async fn tc_is_closed(&self) -> bool {
        self.tc.is_closed().await
    }

    pub async fn forward(&self, query: &[u8]) -> DaemonResult<Vec<u8>> {
        let _guard = self.transaction.lock().await;
        let len = (query.len() as u16).to_be_bytes();
        self.tc
            .write(&len)
            .await
            .map_err(|e| DaemonError::transport(e.to_string()))?;
        self.tc
            .write(query)
            .await
            .map_err(|e| DaemonError::transport(e.to_string()))?;

        let mut len_buf = [0u8; 2];
        read_exact_tc(&self.tc, &mut len_buf).await?;
        let reply_len = u16::from_be_bytes(len_buf) as usize;
        let mut reply = vec![0u8; reply_len];
        read_exact_tc(&self.tc, &mut reply).await?;
        Ok(reply)
    }
}

async fn read_exact_tc(tc: &TransmissionControl, buf: &mut [u8]) -> DaemonResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = tc
            .read(&mut buf[filled..])
            .await
            .map_err(|e| DaemonError::transport(e.to_string()))?;
        if n == 0 {
            return Err(DaemonError::terminal("relay TC closed mid-response"));
        }
        filled += n;
    }
    Ok(())
}

pub struct RecursiveForwarder {
    resolvers: Vec<SocketAddr>,
    relay: Option<Arc<RelaySubstrate>>,
}

impl RecursiveForwarder {
    pub fn new(resolvers: Vec<SocketAddr>, relay: Option<Arc<RelaySubstrate>>) -> Self {
        Self { resolvers, relay }
    }

    /// Forward `query` (the raw DNS message bytes) and return the raw reply.
    /// Picks a random upstream; if a local relay is configured, TCP-shaped
    /// forwards go through its TC instead of opening a direct socket.
    pub async fn forward(&self, query: &[u8], prefer_tcp: bool) -> DaemonResult<Vec<u8>> {
        if let Some(relay) = &self.relay {
            if prefer_tcp {
                return relay.forward(query).await;
            }
        }

        let upstream = self
            .resolvers
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| DaemonError::upstream("no resolvers configured"))?;

        if prefer_tcp {
            self.forward_tcp(upstream, query).await
        } else {
            self.forward_udp(upstream, query).await
        }
    }

    async fn forward_udp(&self, upstream: SocketAddr, query: &[u8]) -> DaemonResult<Vec<u8>> {
        let local_addr = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|e| DaemonError::upstream(e.to_string()))?;
        socket
            .connect(upstream)
            .await
            .map_err(|e| DaemonError::upstream(e.to_string()))?;

        timeout(UDP_DEADLINE, socket.send(query))
            .await
            .map_err(|_| DaemonError::upstream("write deadline exceeded"))?
            .map_err(|e| DaemonError::upstream(e.to_string()))?;

        let mut buf = vec![0u8; MAX_UDP_REPLY];
        let n = timeout(UDP_DEADLINE, socket.recv(&mut buf))
            .await
            .map_err(|_| DaemonError::upstream("read deadline exceeded"))?
            .map_err(|e| DaemonError::upstream(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn forward_tcp(&self, upstream: SocketAddr, query: &[u8]) -> DaemonResult<Vec<u8>> {
        let mut stream = TcpStream::connect(upstream)
            .await
            .map_err(|e| DaemonError::upstream(e.to_string()))?;

        let len = (query.len() as u16).to_be_bytes();
        stream.write_all(&len).await.map_err(|e| DaemonError::upstream(e.to_string()))?;
        stream.write_all(query).await.map_err(|e| DaemonError::upstream(e.to_string()))?;

        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| DaemonError::upstream(e.to_string()))?;
        let reply_len = u16::from_be_bytes(len_buf) as usize;
        let mut reply = vec![0u8; reply_len];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| DaemonError::upstream(e.to_string()))?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forward_fails_clearly_with_no_resolvers() {
        let forwarder = RecursiveForwarder::new(Vec::new(), None);
        let err = forwarder.forward(b"query", false).await.unwrap_err();
        assert!(matches!(err, DaemonError::Upstream(_)));
    }
}
