//! Public-IP cache (§9 Global state): a single refreshing slot with a
//! ~15-minute interval. Readers always see a consistent snapshot rather than
//! racing a live lookup on every A/AAAA answer.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Out of scope per §1 ("public-IP discovery" is an external collaborator);
/// this trait is the seam the core depends on.
#[async_trait]
pub trait PublicIpSource: Send + Sync {
    async fn discover(&self) -> Option<IpAddr>;
}

pub struct PublicIpCache {
    source: Arc<dyn PublicIpSource>,
    current: Mutex<Option<IpAddr>>,
    last_refreshed_unix: AtomicU64,
    refresh_interval: Duration,
}

impl PublicIpCache {
    pub fn new(source: Arc<dyn PublicIpSource>) -> Self {
        Self::with_interval(source, Duration::from_secs(15 * 60))
    }

    pub fn with_interval(source: Arc<dyn PublicIpSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            current: Mutex::new(None),
            last_refreshed_unix: AtomicU64::new(0),
            refresh_interval,
        }
    }

    /// Current snapshot, refreshing first if the interval has elapsed.
    pub async fn get(&self) -> Option<IpAddr> {
        if self.is_stale() {
            if let Some(addr) = self.source.discover().await {
                *self.current.lock().unwrap() = Some(addr);
                self.last_refreshed_unix.store(now_unix(), Ordering::Relaxed);
            }
        }
        *self.current.lock().unwrap()
    }

    fn is_stale(&self) -> bool {
        let last = self.last_refreshed_unix.load(Ordering::Relaxed);
        let elapsed = now_unix().saturating_sub(last);
        elapsed >= self.refresh_interval.as_secs()
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
