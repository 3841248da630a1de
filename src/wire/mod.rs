//! DNS wire codec (RFC 1035 message format, plus EDNS(0) OPT).
//!
//! Parsing is intentionally shallow: the dispatcher only ever looks at the
//! first question, so `parse_message` stops there and hands back the raw
//! bytes of the question section verbatim. Every response builder copies
//! those bytes back unmodified, which is what makes invariant 1
//! ("the question section is byte-identical") trivially true instead of
//! something we have to prove about a round-trip name encoder.

pub mod message;
pub mod records;

pub use message::{parse_message, DnsHeader, ParsedQuery, Question};
pub use records::{build_response, parse_first_answer, Answer, DecodedAnswer, RecordData};

/// Errors raised while parsing or building wire-format messages. The codec
/// never panics; every failure is one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet shorter than the 14-octet minimum accepted query size")]
    TooShort,
    #[error("packet exceeds the 9038-octet maximum accepted size")]
    TooLong,
    #[error("truncated name or record while parsing")]
    Truncated,
    #[error("name exceeds 253 octets")]
    NameTooLong,
    #[error("label exceeds 63 octets")]
    LabelTooLong,
    #[error("question count is not exactly one")]
    UnexpectedQuestionCount,
    #[error("invalid UTF-8 in a label")]
    InvalidLabel,
}

pub const MIN_QUERY_LEN: usize = 14;
pub const MAX_UDP_PAYLOAD: usize = 9038;
pub const MAX_NAME_LEN: usize = 253;
pub const MAX_LABEL_LEN: usize = 63;
pub const EDNS_BUFFER_SIZE: u16 = 1232;

pub const TTL_AUTHORITATIVE: u32 = 60;
pub const TTL_BLACKHOLE: u32 = 600;
pub const TTL_TOOLBOX: u32 = 30;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_NS: u16 = 2;
pub const QTYPE_CNAME: u16 = 5;
pub const QTYPE_SOA: u16 = 6;
pub const QTYPE_MX: u16 = 15;
pub const QTYPE_TXT: u16 = 16;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_OPT: u16 = 41;
pub const QCLASS_IN: u16 = 1;
