//! The transmission control state machine (§4.3): a reliable, ordered,
//! flow-controlled byte stream over a segment-exchange substrate where each
//! segment transit is one DNS transaction.
//!
//! Two background tasks run per TC, matching §5's concurrency model: one
//! forms and (re)transmits outbound segments on a timer, the other drains
//! inbound segments handed in by [`TransmissionControl::deliver_segment`]
//! and applies them to the state machine. Everything else (`read`, `write`,
//! `next_outbound`) is a thin, lock-guarded wait on top of that state.

use super::state::{InitiatorConfig, Role, TcState};
use super::timing::TimingConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::segment::{Segment, SegmentBuffer, SegmentFlags};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outbound bytes written but not yet acked are capped at this many octets;
/// `write()` blocks past it (§5: "TC.Write blocks when the outbound ring is
/// full").
const OUTBOUND_WINDOW: usize = 64 * 1024;

struct Inner {
    role: Role,
    state: TcState,
    send_next: u32,
    send_unacked: u32,
    receive_next: u32,
    /// Bytes from `send_unacked` onward: the prefix up to `send_next -
    /// send_unacked` has already gone out at least once and is retained for
    /// retransmission; the suffix is still unsent.
    unacked: VecDeque<u8>,
    inbound_ready: VecDeque<u8>,
    timing: TimingConfig,
    max_segment_len: usize,
    transport_errors: u32,
    retransmit_count: u32,
    last_send_at: Option<Instant>,
    started_at: Instant,
    closed_reason: Option<DaemonError>,
    handshake_payload: Option<(InitiatorConfig, Vec<u8>)>,
}

impl Inner {
    fn new(role: Role, timing: TimingConfig) -> Self {
        Self {
            role,
            state: TcState::Closed,
            send_next: 0,
            send_unacked: 0,
            receive_next: 0,
            unacked: VecDeque::new(),
            inbound_ready: VecDeque::new(),
            timing,
            max_segment_len: 180,
            transport_errors: 0,
            retransmit_count: 0,
            last_send_at: None,
            started_at: Instant::now(),
            closed_reason: None,
            handshake_payload: None,
        }
    }

    fn unsent_len(&self) -> usize {
        self.unacked.len() - (self.send_next - self.send_unacked) as usize
    }

    fn close(&mut self, reason: DaemonError) {
        if self.closed_reason.is_none() {
            self.closed_reason = Some(reason);
        }
        self.state = TcState::Closed;
    }
}

pub struct TransmissionControl {
    pub conn_id: u16,
    inner: Mutex<Inner>,
    outbound: Mutex<SegmentBuffer>,
    read_notify: Notify,
    write_notify: Notify,
    established_notify: Notify,
    input_tx: mpsc::UnboundedSender<Segment>,
    cancel: CancellationToken,
}

impl TransmissionControl {
    /// Construct and spawn the two background tasks. `cancel` roots this
    /// TC's lifetime: cancelling it forces the state to `Closed`.
    pub fn spawn(conn_id: u16, role: Role, timing: TimingConfig, cancel: CancellationToken) -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let tc = Arc::new(Self {
            conn_id,
            inner: Mutex::new(Inner::new(role, timing)),
            outbound: Mutex::new(SegmentBuffer::new()),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
            established_notify: Notify::new(),
            input_tx,
            cancel,
        });
        tokio::spawn(Self::send_task(Arc::clone(&tc)));
        tokio::spawn(Self::receive_task(Arc::clone(&tc), input_rx));
        tc
    }

    /// Feed one inbound segment (decoded from an arriving DNS query or
    /// response) to the reassembler task. Never blocks.
    pub fn deliver_segment(&self, seg: Segment) {
        let _ = self.input_tx.send(seg);
    }

    /// Begin the handshake as initiator: sends a `Handshake` segment
    /// carrying `config` followed by `app_payload`, then waits for the
    /// responder's `HandshakeAck`.
    pub async fn begin_initiator(&self, config: InitiatorConfig, app_payload: Vec<u8>) -> DaemonResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = TcState::SynSent;
            inner.max_segment_len = config.max_segment_len as usize;
            let mut payload = config.encode().to_vec();
            payload.extend_from_slice(&app_payload);
            let len = payload.len() as u32;
            let seg = Segment::new(self.conn_id, 0, 0, SegmentFlags::HANDSHAKE, payload);
            inner.send_next = len;
            self.outbound.lock().await.absorb(seg);
        }

        let deadline = tokio::time::sleep(self.inner.lock().await.timing.max_lifetime);
        tokio::pin!(deadline);
        loop {
            if self.state().await == TcState::Established {
                return Ok(());
            }
            if self.is_closed().await {
                return Err(DaemonError::terminal("handshake failed before establishment"));
            }
            tokio::select! {
                _ = self.established_notify.notified() => {}
                _ = &mut deadline => {
                    return Err(DaemonError::terminal("handshake timed out"));
                }
                _ = self.cancel.cancelled() => {
                    return Err(DaemonError::terminal("cancelled"));
                }
            }
        }
    }

    /// Responder-side: the initial segment for a fresh connection ID has
    /// already been delivered via `deliver_segment`; this waits for it to be
    /// parsed and returns the negotiated config plus the initiator's
    /// opaque application payload (in the proxy, the JSON connect request).
    pub async fn accept_handshake(&self) -> DaemonResult<(InitiatorConfig, Vec<u8>)> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(pair) = inner.handshake_payload.take() {
                    return Ok(pair);
                }
            }
            tokio::select! {
                _ = self.read_notify.notified() => {}
                _ = self.cancel.cancelled() => {
                    return Err(DaemonError::terminal("cancelled"));
                }
            }
        }
    }

    pub async fn state(&self) -> TcState {
        self.inner.lock().await.state
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == TcState::Closed
    }

    /// Append bytes to the outbound stream, blocking while the unacked
    /// window is full.
    pub async fn write(&self, data: &[u8]) -> DaemonResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            loop {
                let mut inner = self.inner.lock().await;
                if inner.closed_reason.is_some() {
                    return Err(DaemonError::terminal("write on closed transmission control"));
                }
                if inner.unacked.len() < OUTBOUND_WINDOW {
                    let take = (OUTBOUND_WINDOW - inner.unacked.len()).min(data.len() - offset);
                    inner.unacked.extend(&data[offset..offset + take]);
                    offset += take;
                    break;
                }
                drop(inner);
                tokio::select! {
                    _ = self.write_notify.notified() => {}
                    _ = self.cancel.cancelled() => {
                        return Err(DaemonError::terminal("cancelled"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Read reassembled bytes into `buf`, blocking until at least one byte
    /// is available or the TC closes. Returns `0` on a closed, drained TC
    /// (end-of-stream).
    pub async fn read(&self, buf: &mut [u8]) -> DaemonResult<usize> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.inbound_ready.is_empty() {
                    let n = inner.inbound_ready.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = inner.inbound_ready.pop_front().unwrap();
                    }
                    return Ok(n);
                }
                if inner.closed_reason.is_some() {
                    return Ok(0);
                }
            }
            tokio::select! {
                _ = self.read_notify.notified() => {}
                _ = self.cancel.cancelled() => {
                    return Ok(0);
                }
            }
        }
    }

    /// Issue a `ResetTerminate` once the outbound ring drains, then mark
    /// closed.
    pub async fn close(&self) {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.unsent_len() == 0 {
                    let ack = inner.receive_next;
                    let seg = Segment::new(self.conn_id, inner.send_next, ack, SegmentFlags::RESET_TERMINATE, Vec::new());
                    self.outbound.lock().await.absorb(seg);
                    inner.close(DaemonError::terminal("closed locally"));
                    self.read_notify.notify_waiters();
                    self.write_notify.notify_waiters();
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Pop the next segment destined for the wire (used by whatever is
    /// driving DNS queries/answers for this TC). Waits for one to exist or
    /// the TC to close.
    pub async fn next_outbound(&self) -> Option<Segment> {
        loop {
            if let Some(seg) = self.outbound.lock().await.pop() {
                return Some(seg);
            }
            if self.is_closed().await {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    async fn receive_task(tc: Arc<Self>, mut input_rx: mpsc::UnboundedReceiver<Segment>) {
        loop {
            tokio::select! {
                seg = input_rx.recv() => {
                    match seg {
                        Some(seg) => tc.apply_inbound(seg).await,
                        None => return,
                    }
                }
                _ = tc.cancel.cancelled() => return,
            }
        }
    }

    async fn apply_inbound(&self, seg: Segment) {
        let mut inner = self.inner.lock().await;

        if seg.is_malformed() {
            inner.timing.increase();
            return;
        }

        if seg.flags.contains(SegmentFlags::RESET_TERMINATE) {
            inner.close(DaemonError::terminal("peer reset"));
            drop(inner);
            self.read_notify.notify_waiters();
            self.write_notify.notify_waiters();
            return;
        }

        if seg.flags.contains(SegmentFlags::HANDSHAKE) {
            if let Some((config, app_payload)) = InitiatorConfig::decode(&seg.payload)
                .map(|(c, rest)| (c, rest.to_vec()))
            {
                inner.max_segment_len = config.max_segment_len as usize;
                inner.receive_next = seg.seq + (config.encode().len() + app_payload.len()) as u32;
                inner.handshake_payload = Some((config, app_payload));
                inner.state = TcState::SynReceived;
                let ack = inner.receive_next;
                let synack = Segment::new(self.conn_id, inner.send_next, ack, SegmentFlags::HANDSHAKE_ACK, Vec::new());
                drop(inner);
                self.outbound.lock().await.absorb(synack);
                self.read_notify.notify_waiters();
                self.inner.lock().await.state = TcState::Established;
                self.established_notify.notify_waiters();
            }
            return;
        }

        if seg.flags.contains(SegmentFlags::HANDSHAKE_ACK) {
            inner.state = TcState::Established;
            Self::apply_ack(&mut inner, seg.ack);
            drop(inner);
            self.established_notify.notify_waiters();
            self.write_notify.notify_waiters();
            return;
        }

        // Data / AckOnly / KeepAlive: apply the ack, then any new payload.
        let had_new_data = if !seg.payload.is_empty() && seg.seq == inner.receive_next {
            inner.inbound_ready.extend(&seg.payload);
            inner.receive_next = inner.receive_next.wrapping_add(seg.payload.len() as u32);
            true
        } else {
            false
        };

        let progressed = Self::apply_ack(&mut inner, seg.ack);

        if had_new_data {
            inner.timing.decrease();
            inner.retransmit_count = 0;
        } else if seg.flags.contains(SegmentFlags::KEEP_ALIVE) || seg.flags.contains(SegmentFlags::ACK_ONLY) {
            inner.timing.increase();
        }
        let _ = progressed;

        drop(inner);
        if had_new_data {
            self.read_notify.notify_waiters();
        }
        self.write_notify.notify_waiters();
    }

    /// Release acked bytes from the unacked ring. Returns whether the ack
    /// advanced `send_unacked`.
    fn apply_ack(inner: &mut Inner, ack: u32) -> bool {
        if ack <= inner.send_unacked {
            return false;
        }
        let advanced = (ack - inner.send_unacked) as usize;
        let drain = advanced.min(inner.unacked.len());
        inner.unacked.drain(0..drain);
        inner.send_unacked = ack;
        inner.send_next = inner.send_next.max(ack);
        true
    }

    async fn send_task(tc: Arc<Self>) {
        loop {
            let wait = {
                let inner = tc.inner.lock().await;
                if inner.state == TcState::Closed {
                    return;
                }
                inner.timing.ack_delay
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = tc.cancel.cancelled() => return,
            }
            tc.tick_send().await;
        }
    }

    async fn tick_send(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == TcState::Closed {
            return;
        }
        if inner.started_at.elapsed() > inner.timing.max_lifetime {
            inner.close(DaemonError::terminal("max lifetime exceeded"));
            drop(inner);
            self.read_notify.notify_waiters();
            self.write_notify.notify_waiters();
            return;
        }

        let unsent = inner.unsent_len();
        let due_for_retransmit = inner.unacked.len() > (inner.send_next - inner.send_unacked) as usize
            || inner
                .last_send_at
                .map(|t| t.elapsed() >= inner.timing.retransmission_interval)
                .unwrap_or(false);

        if unsent > 0 {
            let max_len = inner.max_segment_len.max(1);
            let start = (inner.send_next - inner.send_unacked) as usize;
            let take = unsent.min(max_len);
            let payload: Vec<u8> = inner.unacked.iter().skip(start).take(take).copied().collect();
            let seq = inner.send_next;
            inner.send_next += payload.len() as u32;
            let ack = inner.receive_next;
            inner.last_send_at = Some(Instant::now());
            drop(inner);
            let seg = Segment::new(self.conn_id, seq, ack, SegmentFlags::DATA, payload);
            self.outbound.lock().await.absorb(seg);
            return;
        }

        if due_for_retransmit && (inner.send_next - inner.send_unacked) > 0 {
            inner.retransmit_count += 1;
            if inner.retransmit_count > inner.timing.max_retransmissions {
                inner.close(DaemonError::terminal("max retransmissions exceeded"));
                drop(inner);
                self.read_notify.notify_waiters();
                self.write_notify.notify_waiters();
                return;
            }
            inner.timing.increase();
            let payload: Vec<u8> = inner.unacked.iter().take((inner.send_next - inner.send_unacked) as usize).copied().collect();
            let seq = inner.send_unacked;
            let ack = inner.receive_next;
            inner.last_send_at = Some(Instant::now());
            drop(inner);
            let seg = Segment::new(self.conn_id, seq, ack, SegmentFlags::DATA, payload);
            self.outbound.lock().await.absorb(seg);
            return;
        }

        // Nothing to send or retransmit: emit a keep-alive so the peer's
        // receive window stays warm.
        let seq = inner.send_next;
        let ack = inner.receive_next;
        drop(inner);
        let seg = Segment::new(self.conn_id, seq, ack, SegmentFlags::KEEP_ALIVE, Vec::new());
        self.outbound.lock().await.absorb(seg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_initiator_config() -> InitiatorConfig {
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
    async fn handshake_establishes_both_sides() {
        let cancel = CancellationToken::new();
        let initiator = TransmissionControl::spawn(7, Role::Initiator, TimingConfig::default(), cancel.clone());
        let responder = TransmissionControl::spawn(7, Role::Responder, TimingConfig::default(), cancel.clone());

        let initiator_clone = Arc::clone(&initiator);
        let handshake = tokio::spawn(async move {
            initiator_clone.begin_initiator(default_initiator_config(), b"hello".to_vec()).await
        });

        // Pump the initiator's SYN into the responder, and the responder's
        // SYN-ACK back into the initiator, the way a DNS query/response pair
        // would carry them.
        let syn = initiator.next_outbound().await.expect("syn segment");
        responder.deliver_segment(syn);
        let (config, payload) = responder.accept_handshake().await.unwrap();
        assert_eq!(config.max_segment_len, 180);
        assert_eq!(payload, b"hello");

        let synack = responder.next_outbound().await.expect("syn-ack segment");
        initiator.deliver_segment(synack);

        handshake.await.unwrap().unwrap();
        assert_eq!(initiator.state().await, TcState::Established);
        cancel.cancel();
    }
}
