//! Frames a segment's encoded bytes (see [`super::codec`]) into DNS labels
//! safe for any resolver on the path, and reverses the process.
//!
//! Grounded on the label-splitting shape of the old hex-in-labels tunnel
//! encoder, swapped to `z-base-32` (`data_encoding::BASE32_DNSCURVE`) so the
//! wire form survives resolvers that lower-case or otherwise mangle names —
//! the alphabet is already all-lowercase and DNSCurve-safe.

use data_encoding::BASE32_DNSCURVE;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelCodecError {
    #[error("encoded name exceeds the 253-octet DNS limit")]
    NameTooLong,
    #[error("query name does not carry the tunnel prefix")]
    MissingPrefix,
    #[error("query name does not end in the configured tunnel domain")]
    WrongDomain,
    #[error("label payload failed base32 decoding")]
    BadEncoding,
}

/// Upstream direction: pack `raw` (an encoded segment's bytes) into a
/// dot-joined name of the form `<prefix><b32>.<more-b32-labels>.<tunnel_domain>`.
pub fn encode_upstream(raw: &[u8], tunnel_domain: &str, prefix: char) -> Result<String, LabelCodecError> {
    let encoded = BASE32_DNSCURVE.encode(raw);
    let mut body = String::with_capacity(encoded.len() + 1);
    body.push(prefix);
    body.push_str(&encoded);

    let mut labels: Vec<String> = Vec::new();
    let bytes = body.as_bytes();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + MAX_LABEL_LEN).min(bytes.len());
        labels.push(String::from_utf8_lossy(&bytes[offset..end]).into_owned());
        offset = end;
    }

    let mut name = labels.join(".");
    name.push('.');
    name.push_str(tunnel_domain);

    if name.len() > MAX_NAME_LEN {
        return Err(LabelCodecError::NameTooLong);
    }
    Ok(name)
}

/// Reverse of [`encode_upstream`]: strip `tunnel_domain`, rejoin the leading
/// labels, strip `prefix`, and base32-decode. Tolerant of case changes a
/// recursive resolver may have introduced.
pub fn decode_upstream(name: &str, tunnel_domain: &str, prefix: char) -> Result<Vec<u8>, LabelCodecError> {
    let lowered = name.to_ascii_lowercase();
    let domain_suffix = format!(".{}", tunnel_domain.to_ascii_lowercase());
    let stripped = lowered
        .strip_suffix(&domain_suffix)
        .or_else(|| lowered.strip_suffix(&tunnel_domain.to_ascii_lowercase()))
        .ok_or(LabelCodecError::WrongDomain)?;

    let joined: String = stripped.split('.').collect::<Vec<_>>().join("");
    let expected_prefix = prefix.to_ascii_lowercase();
    let body = joined
        .strip_prefix(expected_prefix)
        .ok_or(LabelCodecError::MissingPrefix)?;

    BASE32_DNSCURVE
        .decode(body.as_bytes())
        .map_err(|_| LabelCodecError::BadEncoding)
}

/// Downstream direction (CNAME target): identical shape to upstream but
/// without the tunnel prefix, since the client always knows the answer is a
/// tunnel segment (it asked the question).
pub fn encode_downstream_cname(raw: &[u8], tunnel_domain: &str) -> Result<String, LabelCodecError> {
    let encoded = BASE32_DNSCURVE.encode(raw);
    let mut labels: Vec<String> = Vec::new();
    let bytes = encoded.as_bytes();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + MAX_LABEL_LEN).min(bytes.len());
        labels.push(String::from_utf8_lossy(&bytes[offset..end]).into_owned());
        offset = end;
    }
    let mut name = labels.join(".");
    name.push('.');
    name.push_str(tunnel_domain);
    if name.len() > MAX_NAME_LEN {
        return Err(LabelCodecError::NameTooLong);
    }
    Ok(name)
}

pub fn decode_downstream_cname(name: &str, tunnel_domain: &str) -> Result<Vec<u8>, LabelCodecError> {
    let lowered = name.to_ascii_lowercase();
    let domain_suffix = format!(".{}", tunnel_domain.to_ascii_lowercase());
    let stripped = lowered
        .strip_suffix(&domain_suffix)
        .or_else(|| lowered.strip_suffix(&tunnel_domain.to_ascii_lowercase()))
        .ok_or(LabelCodecError::WrongDomain)?;
    let joined: String = stripped.split('.').collect::<Vec<_>>().join("");
    BASE32_DNSCURVE
        .decode(joined.as_bytes())
        .map_err(|_| LabelCodecError::BadEncoding)
}

/// Downstream direction (TXT): the raw bytes are base32-encoded and
/// concatenated into one or more TXT strings, each ≤ 255 octets.
pub fn encode_downstream_txt(raw: &[u8]) -> Vec<String> {
    let encoded = BASE32_DNSCURVE.encode(raw);
    encoded
        .as_bytes()
        .chunks(255)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

pub fn decode_downstream_txt(strings: &[String]) -> Result<Vec<u8>, LabelCodecError> {
    let joined: String = strings.iter().map(|s| s.to_ascii_lowercase()).collect();
    BASE32_DNSCURVE
        .decode(joined.as_bytes())
        .map_err(|_| LabelCodecError::BadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_round_trips() {
        let payload = vec![1u8, 2, 3, 4, 5, 250, 251, 252];
        let name = encode_upstream(&payload, "tunnel.example.com", 't').unwrap();
        assert!(name.ends_with("tunnel.example.com"));
        let decoded = decode_upstream(&name, "tunnel.example.com", 't').unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn upstream_decode_tolerates_uppercasing() {
        let payload = vec![9u8, 8, 7, 6];
        let name = encode_upstream(&payload, "tunnel.example.com", 't').unwrap();
        let shouted = name.to_ascii_uppercase();
        let decoded = decode_upstream(&shouted, "tunnel.example.com", 't').unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn long_labels_split_at_63_octets() {
        let payload = vec![0xABu8; 200];
        let name = encode_upstream(&payload, "tunnel.example.com", 't').unwrap();
        for label in name.trim_end_matches("tunnel.example.com").trim_end_matches('.').split('.') {
            assert!(label.len() <= 63);
        }
    }

    #[test]
    fn downstream_txt_round_trips() {
        let payload = vec![42u8; 400];
        let strings = encode_downstream_txt(&payload);
        assert!(strings.len() >= 2);
        let decoded = decode_downstream_txt(&strings).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn missing_prefix_is_rejected() {
        let name = "abcdef.tunnel.example.com";
        assert_eq!(
            decode_upstream(name, "tunnel.example.com", 't'),
            Err(LabelCodecError::MissingPrefix)
        );
    }
}
