//! Per-IP rate limiting (§4.6, §5 shared state item v): query-rate and
//! connection-count counters reset on a configurable interval, with a
//! CIDR-based exemption list (the later, `ipnet`-typed shape per SPEC_FULL's
//! Open Questions resolution — not the older prefix-string form).

use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    queries: u32,
    /// Distinct tunnel connection IDs admitted this interval, not a raw call
    /// count — a connection's data/ack/keep-alive segments must not consume
    /// this budget once its handshake has been admitted (§4.14).
    connections: HashSet<u16>,
}

pub struct RateLimiter {
    max_queries_per_interval: u32,
    max_connections_per_interval: u32,
    reset_interval: Duration,
    allow_from: Vec<IpNet>,
    counters: Mutex<HashMap<IpAddr, Counters>>,
    window_started_at: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(
        max_queries_per_interval: u32,
        max_connections_per_interval: u32,
        reset_interval: Duration,
        allow_from: Vec<IpNet>,
    ) -> Self {
        Self {
            max_queries_per_interval,
            max_connections_per_interval,
            reset_interval,
            allow_from,
            counters: Mutex::new(HashMap::new()),
            window_started_at: Mutex::new(Instant::now()),
        }
    }

    fn is_allow_listed(&self, addr: IpAddr) -> bool {
        self.allow_from.iter().any(|net| net.contains(&addr))
    }

    fn maybe_reset_window(&self) {
        let mut started = self.window_started_at.lock();
        if started.elapsed() >= self.reset_interval {
            self.counters.lock().clear();
            *started = Instant::now();
        }
    }

    /// Record one non-tunnel query from `addr`; returns `false` if the
    /// per-interval query limit is exceeded.
    pub fn allow_query(&self, addr: IpAddr) -> bool {
        if self.is_allow_listed(addr) {
            return true;
        }
        self.maybe_reset_window();
        let mut counters = self.counters.lock();
        let entry = counters.entry(addr).or_default();
        entry.queries += 1;
        entry.queries <= self.max_queries_per_interval
    }

    /// Admit a tunnel connection's handshake segment from `addr`/`conn_id`;
    /// returns `false` if the per-interval distinct-connection limit is
    /// already reached. A `conn_id` already admitted this interval (a
    /// retransmitted handshake) is let through again without re-counting.
    /// Only call this for handshake-flagged segments — data/ack/keep-alive
    /// segments of an admitted connection bypass the limiter entirely (§4.6,
    /// §4.14), since the dispatcher has no per-segment call budget to spend.
    pub fn allow_connection(&self, addr: IpAddr, conn_id: u16) -> bool {
        if self.is_allow_listed(addr) {
            return true;
        }
        self.maybe_reset_window();
        let mut counters = self.counters.lock();
        let entry = counters.entry(addr).or_default();
        if entry.connections.contains(&conn_id) {
            return true;
        }
        if entry.connections.len() as u32 >= self.max_connections_per_interval {
            return false;
        }
        entry.connections.insert(conn_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_once_query_limit_exceeded() {
        let limiter = RateLimiter::new(2, 10, Duration::from_secs(60), Vec::new());
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow_query(addr));
        assert!(limiter.allow_query(addr));
        assert!(!limiter.allow_query(addr));
    }

    #[test]
    fn allow_listed_cidr_is_never_limited() {
        let allow_from = vec!["10.0.0.0/8".parse().unwrap()];
        let limiter = RateLimiter::new(1, 1, Duration::from_secs(60), allow_from);
        let addr: IpAddr = "10.1.2.3".parse().unwrap();
        for _ in 0..50 {
            assert!(limiter.allow_query(addr));
        }
    }

    #[test]
    fn connection_and_query_counters_are_independent() {
        let limiter = RateLimiter::new(1, 1, Duration::from_secs(60), Vec::new());
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(limiter.allow_query(addr));
        assert!(limiter.allow_connection(addr, 1));
        assert!(!limiter.allow_query(addr));
        assert!(!limiter.allow_connection(addr, 2));
    }

    #[test]
    fn same_connection_id_is_not_recounted() {
        let limiter = RateLimiter::new(10, 1, Duration::from_secs(60), Vec::new());
        let addr: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(limiter.allow_connection(addr, 7));
        for _ in 0..50 {
            assert!(limiter.allow_connection(addr, 7));
        }
        assert!(!limiter.allow_connection(addr, 8));
    }
}
