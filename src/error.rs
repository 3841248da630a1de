//! Crate-wide error kinds.
//!
//! Every boundary in the system (wire parsing, segment decoding, the TC state
//! machine, the proxy plane) narrows its failures down to one of these kinds so
//! the dispatcher and the TC can apply the propagation rules uniformly instead
//! of matching on ad-hoc string messages.

use thiserror::Error;

/// A classified failure. Kept small and `Copy`-free but cheap to construct;
/// callers attach context with `.context()` via `anyhow` only at the binary
/// boundary, not inside the library.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Wire or segment parse/decode failed.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// CIDR, TOTP, or toolbox PIN check failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Per-IP rate or connection limit exceeded.
    #[error("rate limited")]
    RateLimited,

    /// Name matched the blocklist.
    #[error("blocked")]
    Blocked,

    /// Upstream resolver unreachable or returned garbage.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// TC-level IO failure (one retry-able transport error).
    #[error("transport error: {0}")]
    Transport(String),

    /// The TC (or a stream built on it) has permanently closed.
    #[error("terminal: {0}")]
    Terminal(String),

    /// Invariant violated inside a response builder; never expected in
    /// production but kept distinct from `Malformed` because it indicates a
    /// bug here rather than bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this kind should ever reach a DNS client as a synthesized
    /// answer, as opposed to silent drop. Only `Blocked` does (see §7).
    pub fn synthesizes_response(&self) -> bool {
        matches!(self, DaemonError::Blocked)
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;
