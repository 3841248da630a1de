//! Answer-record builders.
//!
//! Every builder here assembles one self-contained response packet: header,
//! the verbatim question bytes handed back by [`super::message::parse_message`],
//! zero or more answer RRs, and (for authoritative/black-hole answers) one
//! EDNS(0) OPT RR in the additional section.

use super::message::DnsHeader;
use super::{encode_name, WireError, EDNS_BUFFER_SIZE, QCLASS_IN, QTYPE_OPT};
use std::net::{Ipv4Addr, Ipv6Addr};

/// One answer record's type-specific payload.
#[derive(Debug, Clone)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    /// TXT strings, each already ≤ 255 octets (callers split longer text
    /// before constructing this — see `crate::toolbox` and the tunnel
    /// downstream encoder).
    Txt(Vec<String>),
    Ns(String),
    Mx { preference: u16, exchange: String },
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
}

impl RecordData {
    fn rtype(&self) -> u16 {
        match self {
            RecordData::A(_) => super::QTYPE_A,
            RecordData::Aaaa(_) => super::QTYPE_AAAA,
            RecordData::Cname(_) => super::QTYPE_CNAME,
            RecordData::Txt(_) => super::QTYPE_TXT,
            RecordData::Ns(_) => super::QTYPE_NS,
            RecordData::Mx { .. } => super::QTYPE_MX,
            RecordData::Soa { .. } => super::QTYPE_SOA,
        }
    }

    fn encode_rdata(&self) -> Result<Vec<u8>, WireError> {
        Ok(match self {
            RecordData::A(addr) => addr.octets().to_vec(),
            RecordData::Aaaa(addr) => addr.octets().to_vec(),
            RecordData::Cname(target) => encode_name(target)?,
            RecordData::Ns(target) => encode_name(target)?,
            RecordData::Txt(strings) => {
                let mut out = Vec::new();
                for s in strings {
                    if s.len() > 255 {
                        return Err(WireError::LabelTooLong);
                    }
                    out.push(s.len() as u8);
                    out.extend_from_slice(s.as_bytes());
                }
                out
            }
            RecordData::Mx { preference, exchange } => {
                let mut out = preference.to_be_bytes().to_vec();
                out.extend(encode_name(exchange)?);
                out
            }
            RecordData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                let mut out = encode_name(mname)?;
                out.extend(encode_name(rname)?);
                out.extend_from_slice(&serial.to_be_bytes());
                out.extend_from_slice(&refresh.to_be_bytes());
                out.extend_from_slice(&retry.to_be_bytes());
                out.extend_from_slice(&expire.to_be_bytes());
                out.extend_from_slice(&minimum.to_be_bytes());
                out
            }
        })
    }
}

/// An answer RR for the queried name (always written as a compression
/// pointer to offset 12, which is valid because every builder in this crate
/// only ever answers under the name that was queried).
#[derive(Debug, Clone)]
pub struct Answer {
    pub ttl: u32,
    pub data: RecordData,
}

impl Answer {
    pub fn new(ttl: u32, data: RecordData) -> Self {
        Self { ttl, data }
    }
}

/// Build a complete response packet.
///
/// `authoritative` sets the AA flag (and implies the EDNS(0) OPT is
/// appended, per §4.1: "All authoritative responses ... append an EDNS(0)
/// OPT"). Black-hole and forwarded-passthrough answers also request an OPT
/// via `with_edns` independent of `authoritative`.
pub fn build_response(
    query_header: &DnsHeader,
    raw_question: &[u8],
    authoritative: bool,
    with_edns: bool,
    answers: &[Answer],
) -> Result<Vec<u8>, WireError> {
    let arcount: u16 = if with_edns { 1 } else { 0 };
    let ancount: u16 = answers
        .len()
        .try_into()
        .map_err(|_| WireError::NameTooLong)?;

    let mut flags: u16 = 0x8000; // QR = response
    if authoritative {
        flags |= 0x0400;
    }
    if query_header.recursion_desired {
        flags |= 0x0100;
    }

    let mut out = Vec::with_capacity(raw_question.len() + 64);
    out.extend_from_slice(&query_header.id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&arcount.to_be_bytes());
    out.extend_from_slice(raw_question);

    for answer in answers {
        out.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        out.extend_from_slice(&answer.data.rtype().to_be_bytes());
        out.extend_from_slice(&QCLASS_IN.to_be_bytes());
        out.extend_from_slice(&answer.ttl.to_be_bytes());
        let rdata = answer.data.encode_rdata()?;
        let rdlength: u16 = rdata.len().try_into().map_err(|_| WireError::NameTooLong)?;
        out.extend_from_slice(&rdlength.to_be_bytes());
        out.extend_from_slice(&rdata);
    }

    if with_edns {
        out.push(0); // root name
        out.extend_from_slice(&QTYPE_OPT.to_be_bytes());
        out.extend_from_slice(&EDNS_BUFFER_SIZE.to_be_bytes()); // "class" carries UDP payload size
        out.extend_from_slice(&[0, 0, 0, 0]); // extended-rcode/version/flags, all zero
        out.extend_from_slice(&0u16.to_be_bytes()); // rdlength
    }

    Ok(out)
}

/// A decoded first-answer value, for the tunnel clients reading a
/// downstream reply packet back out of the DNS response. Only the two
/// record types the tunnel ever answers with are handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedAnswer {
    Cname(String),
    Txt(Vec<String>),
}

/// Parse the first answer RR out of a complete response packet, the inverse
/// of [`build_response`] for the CNAME/TXT shapes the tunnel downstream uses.
pub fn parse_first_answer(raw: &[u8]) -> Result<Option<DecodedAnswer>, WireError> {
    let parsed = super::message::parse_message(raw)?;
    if parsed.header.ancount == 0 {
        return Ok(None);
    }

    let mut pos = 12 + parsed.raw_question.len();
    let (_, next) = super::message::decode_name(raw, pos)?;
    pos = next;
    if pos + 10 > raw.len() {
        return Err(WireError::Truncated);
    }
    let rtype = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
    pos += 8; // type(2) + class(2) + ttl(4)
    let rdlength = u16::from_be_bytes([raw[pos], raw[pos + 1]]) as usize;
    pos += 2;
    if pos + rdlength > raw.len() {
        return Err(WireError::Truncated);
    }
    let rdata = &raw[pos..pos + rdlength];

    if rtype == super::QTYPE_CNAME {
        let (name, _) = super::message::decode_name(raw, pos)?;
        return Ok(Some(DecodedAnswer::Cname(name)));
    }

    if rtype == super::QTYPE_TXT {
        let mut strings = Vec::new();
        let mut p = 0;
        while p < rdata.len() {
            let len = rdata[p] as usize;
            p += 1;
            if p + len > rdata.len() {
                return Err(WireError::Truncated);
            }
            strings.push(String::from_utf8_lossy(&rdata[p..p + len]).into_owned());
            p += len;
        }
        return Ok(Some(DecodedAnswer::Txt(strings)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::parse_message;

    fn header_with_id(id: u16) -> DnsHeader {
        let mut q = vec![0u8; 12];
        q[0] = (id >> 8) as u8;
        q[1] = (id & 0xFF) as u8;
        q[5] = 1;
        q.extend(encode_name("example.com").unwrap());
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        parse_message(&q).unwrap().header
    }

    #[test]
    fn builds_a_record_response() {
        let header = header_with_id(0xABCD);
        let mut question = encode_name("example.com").unwrap();
        question.extend_from_slice(&1u16.to_be_bytes());
        question.extend_from_slice(&1u16.to_be_bytes());

        let answers = vec![Answer::new(60, RecordData::A(Ipv4Addr::new(1, 2, 3, 4)))];
        let packet = build_response(&header, &question, true, true, &answers).unwrap();

        assert_eq!(&packet[0..2], &[0xAB, 0xCD]);
        let flags = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(flags & 0x8000, 0x8000);
        assert_eq!(flags & 0x0400, 0x0400);
        let ancount = u16::from_be_bytes([packet[6], packet[7]]);
        assert_eq!(ancount, 1);
        let arcount = u16::from_be_bytes([packet[10], packet[11]]);
        assert_eq!(arcount, 1);
    }

    #[test]
    fn txt_answer_splits_into_length_prefixed_strings() {
        let header = header_with_id(1);
        let mut question = encode_name("example.com").unwrap();
        question.extend_from_slice(&16u16.to_be_bytes());
        question.extend_from_slice(&1u16.to_be_bytes());

        let answers = vec![Answer::new(
            30,
            RecordData::Txt(vec!["hello".to_string(), "world".to_string()]),
        )];
        let packet = build_response(&header, &question, true, false, &answers).unwrap();
        assert!(packet.len() > question.len() + 12);
    }

    #[test]
    fn parses_cname_answer_back_out() {
        let header = header_with_id(7);
        let mut question = encode_name("tunnel.example.com").unwrap();
        question.extend_from_slice(&5u16.to_be_bytes());
        question.extend_from_slice(&1u16.to_be_bytes());

        let answers = vec![Answer::new(30, RecordData::Cname("abcde.tunnel.example.com".to_string()))];
        let packet = build_response(&header, &question, false, false, &answers).unwrap();

        let decoded = parse_first_answer(&packet).unwrap().unwrap();
        assert_eq!(decoded, DecodedAnswer::Cname("abcde.tunnel.example.com".to_string()));
    }

    #[test]
    fn parses_txt_answer_back_out() {
        let header = header_with_id(8);
        let mut question = encode_name("tunnel.example.com").unwrap();
        question.extend_from_slice(&16u16.to_be_bytes());
        question.extend_from_slice(&1u16.to_be_bytes());

        let answers = vec![Answer::new(
            30,
            RecordData::Txt(vec!["abcde".to_string(), "fghij".to_string()]),
        )];
        let packet = build_response(&header, &question, false, false, &answers).unwrap();

        let decoded = parse_first_answer(&packet).unwrap().unwrap();
        assert_eq!(
            decoded,
            DecodedAnswer::Txt(vec!["abcde".to_string(), "fghij".to_string()])
        );
    }

    #[test]
    fn no_answers_returns_none() {
        let header = header_with_id(9);
        let mut question = encode_name("example.com").unwrap();
        question.extend_from_slice(&1u16.to_be_bytes());
        question.extend_from_slice(&1u16.to_be_bytes());
        let packet = build_response(&header, &question, false, false, &[]).unwrap();
        assert_eq!(parse_first_answer(&packet).unwrap(), None);
    }
}
