//! DNS header and question parsing.

use super::{WireError, MAX_LABEL_LEN, MAX_NAME_LEN, MIN_QUERY_LEN};

/// The fixed 12-octet DNS header plus the flag bits the dispatcher and the
/// codec care about.
#[derive(Debug, Clone, Copy)]
pub struct DnsHeader {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    fn parse(buf: &[u8]) -> DnsHeader {
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        DnsHeader {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            rcode: (flags & 0x000F) as u8,
            qdcount: u16::from_be_bytes([buf[4], buf[5]]),
            ancount: u16::from_be_bytes([buf[6], buf[7]]),
            nscount: u16::from_be_bytes([buf[8], buf[9]]),
            arcount: u16::from_be_bytes([buf[10], buf[11]]),
        }
    }
}

/// A parsed question. `name` is the decoded, dot-joined name exactly as it
/// appeared on the wire (original case, no trailing dot added).
#[derive(Debug, Clone)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// The result of parsing an inbound packet: the header, the first question,
/// and the raw bytes spanning that question (from the first label through
/// QCLASS) so response builders can copy them back verbatim.
#[derive(Debug, Clone)]
pub struct ParsedQuery<'a> {
    pub header: DnsHeader,
    pub question: Question,
    pub raw_question: &'a [u8],
}

/// Parse a packet's header and first question. Only the first question is
/// read, matching the spec: "The dispatcher reads only the first question."
pub fn parse_message(buf: &[u8]) -> Result<ParsedQuery<'_>, WireError> {
    if buf.len() < MIN_QUERY_LEN {
        return Err(WireError::TooShort);
    }
    if buf.len() > super::MAX_UDP_PAYLOAD {
        return Err(WireError::TooLong);
    }

    let header = DnsHeader::parse(buf);
    if header.qdcount == 0 {
        return Err(WireError::UnexpectedQuestionCount);
    }

    let question_start = 12;
    let (name, mut pos) = decode_name(buf, question_start)?;
    if pos + 4 > buf.len() {
        return Err(WireError::Truncated);
    }
    let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    let qclass = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
    pos += 4;

    Ok(ParsedQuery {
        header,
        question: Question { name, qtype, qclass },
        raw_question: &buf[question_start..pos],
    })
}

/// Decode a (possibly compressed) name starting at `pos`, returning the
/// dot-joined name and the offset immediately after it.
pub fn decode_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), WireError> {
    let mut labels = Vec::new();
    let mut total_len = 0usize;
    let mut jumped = false;
    let mut end_pos = pos;
    let mut hops = 0;

    loop {
        if pos >= buf.len() {
            return Err(WireError::Truncated);
        }
        let len = buf[pos] as usize;

        if len == 0 {
            if !jumped {
                end_pos = pos + 1;
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            // Compression pointer.
            if pos + 1 >= buf.len() {
                return Err(WireError::Truncated);
            }
            if !jumped {
                end_pos = pos + 2;
            }
            let ptr = (((len & 0x3F) as usize) << 8) | buf[pos + 1] as usize;
            if ptr >= buf.len() {
                return Err(WireError::Truncated);
            }
            hops += 1;
            if hops > 32 {
                return Err(WireError::Truncated);
            }
            pos = ptr;
            jumped = true;
            continue;
        }

        if len > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong);
        }
        pos += 1;
        if pos + len > buf.len() {
            return Err(WireError::Truncated);
        }
        let label = std::str::from_utf8(&buf[pos..pos + len]).map_err(|_| WireError::InvalidLabel)?;
        labels.push(label.to_string());
        total_len += len + 1;
        if total_len > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        pos += len;
    }

    Ok((labels.join("."), end_pos))
}

/// Encode a dot-joined name as length-prefixed labels terminated by a zero
/// octet. No compression is applied — valid but slightly larger than
/// necessary, which is fine at tunnel/authoritative scale.
pub fn encode_name(name: &str) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(name.len() + 2);
    if name.is_empty() {
        out.push(0);
        return Ok(out);
    }
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    if out.len() > MAX_NAME_LEN + 1 {
        return Err(WireError::NameTooLong);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[0] = 0x12;
        buf[1] = 0x34;
        buf[5] = 1; // qdcount
        buf.extend(encode_name(name).unwrap());
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf
    }

    #[test]
    fn parses_simple_question() {
        let packet = build_minimal_query("example.com", 1);
        let parsed = parse_message(&packet).unwrap();
        assert_eq!(parsed.header.id, 0x1234);
        assert_eq!(parsed.question.name, "example.com");
        assert_eq!(parsed.question.qtype, 1);
        assert_eq!(parsed.raw_question, &packet[12..]);
    }

    #[test]
    fn rejects_short_packets() {
        let short = vec![0u8; 10];
        assert_eq!(parse_message(&short), Err(WireError::TooShort));
    }

    #[test]
    fn name_round_trips() {
        let encoded = encode_name("a.b.example.com").unwrap();
        let (decoded, end) = decode_name(&encoded, 0).unwrap();
        assert_eq!(decoded, "a.b.example.com");
        assert_eq!(end, encoded.len());
    }

    #[test]
    fn rejects_oversized_label() {
        let label = "a".repeat(64);
        assert_eq!(encode_name(&label), Err(WireError::LabelTooLong));
    }

    #[test]
    fn follows_compression_pointer() {
        let mut buf = vec![0u8; 12];
        buf.extend(encode_name("example.com").unwrap());
        let ptr_offset = 12u16;
        buf.push(0xC0 | ((ptr_offset >> 8) as u8));
        buf.push((ptr_offset & 0xFF) as u8);
        let (decoded, _) = decode_name(&buf, buf.len() - 2).unwrap();
        assert_eq!(decoded, "example.com");
    }
}
