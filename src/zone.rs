//! Authoritative zone store: the daemon's own "my domains" list, sorted
//! longest-first so the deepest suffix match wins, plus the custom-record
//! overlay the dispatcher consults before synthesizing defaults.

use crate::config::{CustomRecord, ZoneConfig};
use std::collections::HashMap;

pub struct ZoneStore {
    /// Configured domains with a leading dot, longest first.
    domains: Vec<String>,
    /// Custom records keyed by full canonical name (leading dot, lower
    /// case, no trailing dot).
    records: HashMap<String, CustomRecord>,
}

/// Lowercase, strip a trailing dot, and add a leading dot — the
/// canonicalization §4.6 specifies to make suffix matching a plain
/// `ends_with`.
pub fn canonicalize(name: &str) -> String {
    let lowered = name.trim_end_matches('.').to_ascii_lowercase();
    format!(".{}", lowered)
}

impl ZoneStore {
    pub fn from_config(zones: &[ZoneConfig]) -> Self {
        let mut domains: Vec<String> = zones.iter().map(|z| canonicalize(&z.domain)).collect();
        domains.sort_by_key(|d| std::cmp::Reverse(d.len()));

        let mut records = HashMap::new();
        for zone in zones {
            for (name, record) in &zone.records {
                records.insert(canonicalize(name), record.clone());
            }
        }

        Self { domains, records }
    }

    /// Returns the matched configured (canonical, leading-dot) domain if
    /// `name` is authoritative, else `None` (recursive).
    pub fn match_domain(&self, name: &str) -> Option<&str> {
        let canonical = canonicalize(name);
        self.domains
            .iter()
            .find(|domain| canonical.ends_with(domain.as_str()))
            .map(|s| s.as_str())
    }

    pub fn custom_record(&self, name: &str) -> Option<&CustomRecord> {
        self.records.get(&canonicalize(name))
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn zones() -> Vec<ZoneConfig> {
        vec![
            ZoneConfig {
                domain: "example.com".to_string(),
                records: {
                    let mut m = StdHashMap::new();
                    m.insert("www.example.com".to_string(), CustomRecord::default());
                    m
                },
            },
            ZoneConfig {
                domain: "deep.sub.example.com".to_string(),
                records: StdHashMap::new(),
            },
        ]
    }

    #[test]
    fn longest_suffix_wins() {
        let store = ZoneStore::from_config(&zones());
        assert_eq!(store.match_domain("a.deep.sub.example.com"), Some(".deep.sub.example.com"));
        assert_eq!(store.match_domain("a.example.com"), Some(".example.com"));
        assert_eq!(store.match_domain("a.other.com"), None);
    }

    #[test]
    fn custom_record_lookup_is_case_insensitive() {
        let store = ZoneStore::from_config(&zones());
        assert!(store.custom_record("WWW.Example.Com").is_some());
        assert!(store.custom_record("nope.example.com").is_none());
    }
}
