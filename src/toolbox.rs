//! Toolbox bridge (§4.12, §6 "Toolbox command framing"): decodes a DTMF-style
//! digit sequence embedded in a TXT query's labels into command text, and
//! executes it through an out-of-scope (§1) executor with single-flight
//! de-duplication.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Command execution is an external collaborator (§1): this is the only
/// seam the dispatcher depends on.
#[async_trait]
pub trait ToolboxExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String, ToolboxError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolboxError {
    #[error("command execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timed out waiting on an in-flight duplicate command")]
    Busy,
}

/// Longest-match-first digit-sequence-to-punctuation table.
const DTMF_TABLE: &[(&str, char)] = &[
    ("142", '.'),
    ("911", '@'),
    ("000", '_'),
    ("00", '-'),
    ("11", '!'),
    ("12", '?'),
    ("13", ','),
    ("0", ' '),
    ("1", '.'),
];

/// Decode a DTMF-style digit sequence: digit runs are matched against
/// [`DTMF_TABLE`] greedily (3, then 2, then 1 digits), non-digit characters
/// pass through unchanged.
pub fn decode_dtmf(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let mut matched = false;
            for width in (1..=3).rev() {
                if i + width > chars.len() {
                    continue;
                }
                let window: String = chars[i..i + width].iter().collect();
                if let Some((_, replacement)) = DTMF_TABLE.iter().find(|(code, _)| *code == window) {
                    out.push(*replacement);
                    i += width;
                    matched = true;
                    break;
                }
            }
            if !matched {
                out.push(chars[i]);
                i += 1;
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

enum Slot {
    InFlight,
    Done(String),
}

/// Single-flight cache over command text: while a command is executing, a
/// sentinel marks its slot and concurrent duplicate queries busy-wait for
/// the result rather than re-invoking the executor (§5 shared state item iv).
pub struct ToolboxBridge {
    executor: std::sync::Arc<dyn ToolboxExecutor>,
    cache: Mutex<HashMap<String, Slot>>,
}

const BUSY_WAIT_POLL: Duration = Duration::from_millis(20);
const BUSY_WAIT_MAX_POLLS: u32 = 250; // ~5s

impl ToolboxBridge {
    pub fn new(executor: std::sync::Arc<dyn ToolboxExecutor>) -> Self {
        Self {
            executor,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, command: &str) -> Result<String, ToolboxError> {
        loop {
            {
                let mut cache = self.cache.lock();
                match cache.get(command) {
                    Some(Slot::Done(result)) => return Ok(result.clone()),
                    Some(Slot::InFlight) => {}
                    None => {
                        cache.insert(command.to_string(), Slot::InFlight);
                        drop(cache);
                        return self.execute_and_store(command).await;
                    }
                }
            }

            for _ in 0..BUSY_WAIT_MAX_POLLS {
                tokio::time::sleep(BUSY_WAIT_POLL).await;
                if let Some(Slot::Done(result)) = self.cache.lock().get(command) {
                    return Ok(result.clone());
                }
            }
            return Err(ToolboxError::Busy);
        }
    }

    async fn execute_and_store(&self, command: &str) -> Result<String, ToolboxError> {
        let result = self.executor.execute(command).await;
        let mut cache = self.cache.lock();
        match &result {
            Ok(output) => {
                cache.insert(command.to_string(), Slot::Done(output.clone()));
            }
            Err(_) => {
                cache.remove(command);
            }
        }
        result
    }
}

/// Split `text` into TXT strings of at most `max_len` octets each, per §6:
/// toolbox responses are one or more TXT strings each ≤ 200 octets.
pub fn split_txt_response(text: &str, max_len: usize) -> Vec<String> {
    text.as_bytes()
        .chunks(max_len.max(1))
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl ToolboxExecutor for EchoExecutor {
        async fn execute(&self, command: &str) -> Result<String, ToolboxError> {
            Ok(format!("echo:{}", command))
        }
    }

    fn echo_bridge() -> ToolboxBridge {
        ToolboxBridge::new(std::sync::Arc::new(EchoExecutor))
    }

    #[test]
    fn decodes_published_example() {
        assert_eq!(decode_dtmf("142s0date"), ".s date");
    }

    #[test]
    fn unmatched_digits_pass_through() {
        assert_eq!(decode_dtmf("abc5xyz"), "abc5xyz");
    }

    #[tokio::test]
    async fn single_flight_caches_result() {
        let bridge = echo_bridge();
        let first = bridge.run("date").await.unwrap();
        let second = bridge.run("date").await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn splits_long_response_into_200_octet_strings() {
        let text = "x".repeat(450);
        let chunks = split_txt_response(&text, 200);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 200);
        assert_eq!(chunks[2].len(), 50);
    }
}
