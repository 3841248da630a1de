//! Response memoizer (§4.5): maps the incoming encoded query label string to
//! the most recently produced outbound reply bytes, so a recursive
//! resolver's retransmit of the exact same question doesn't drive the
//! tunnel (pop a second segment) twice.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_EXPIRY: Duration = Duration::from_secs(5);
/// Sweep stale entries once every this many calls rather than on a timer —
/// cheap and needs no background task.
const SWEEP_EVERY: u64 = 64;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

pub struct ResponseMemoizer {
    entries: Mutex<HashMap<String, Entry>>,
    calls: std::sync::atomic::AtomicU64,
    expiry: Duration,
}

impl ResponseMemoizer {
    pub fn new() -> Self {
        Self::with_expiry(DEFAULT_EXPIRY)
    }

    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            calls: std::sync::atomic::AtomicU64::new(0),
            expiry,
        }
    }

    /// Return the memoized value for `name` if still fresh; otherwise call
    /// `produce` once, store its result, and return that.
    pub fn get_or_set(&self, name: &str, produce: impl FnOnce() -> Vec<u8>) -> Vec<u8> {
        let now = Instant::now();
        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(name) {
                if entry.expires_at > now {
                    return entry.value.clone();
                }
            }
        }

        let value = produce();
        let mut entries = self.entries.lock();
        entries.insert(
            name.to_string(),
            Entry {
                value: value.clone(),
                expires_at: now + self.expiry,
            },
        );

        let calls = self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        if calls % SWEEP_EVERY == 0 {
            entries.retain(|_, entry| entry.expires_at > now);
        }

        value
    }
}

impl ResponseMemoizer {
    /// Non-blocking check for an already-memoized, still-fresh value.
    /// Paired with [`ResponseMemoizer::set`] for callers whose `produce`
    /// step is itself `async` and can't be passed as a sync closure.
    pub fn peek(&self, name: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock();
        entries
            .get(name)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, name: &str, value: Vec<u8>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.insert(
            name.to_string(),
            Entry {
                value,
                expires_at: now + self.expiry,
            },
        );
    }
}

impl Default for ResponseMemoizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn repeated_lookups_within_expiry_do_not_reinvoke_produce() {
        let memoizer = ResponseMemoizer::with_expiry(Duration::from_millis(200));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let first = memoizer.get_or_set("abc.example.com", move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            vec![1, 2, 3]
        });
        let calls_clone = Arc::clone(&calls);
        let second = memoizer.get_or_set("abc.example.com", move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            vec![9, 9, 9]
        });

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiry_allows_a_fresh_value() {
        let memoizer = ResponseMemoizer::with_expiry(Duration::from_millis(10));
        let _ = memoizer.get_or_set("abc.example.com", || vec![1]);
        std::thread::sleep(Duration::from_millis(30));
        let second = memoizer.get_or_set("abc.example.com", || vec![2]);
        assert_eq!(second, vec![2]);
    }
}
