//! Blocklist store (§4.8): a shared, read-mostly set of blocked names with
//! ancestor-match membership, swapped in wholesale on refresh.

use parking_lot::RwLock;
use std::collections::HashSet;

pub struct Blocklist {
    names: RwLock<HashSet<String>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashSet::new()),
        }
    }

    /// Replace the entire set. Built off-lock by the (out-of-scope)
    /// downloader/parser, then swapped in under a single write lock.
    pub fn replace(&self, names: HashSet<String>) {
        *self.names.write() = names;
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// True if `name` or any ancestor domain of it is blocked. Strips
    /// leading labels (`x.y.a.com` → `y.a.com` → `a.com`) until a hit is
    /// found or the remaining string drops below 4 octets.
    pub fn is_blocked(&self, name: &str) -> bool {
        let lowered = name.trim_end_matches('.').to_ascii_lowercase();
        let names = self.names.read();
        let mut candidate = lowered.as_str();
        loop {
            if names.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, rest)) if rest.len() >= 4 => candidate = rest,
                _ => return false,
            }
        }
    }

    /// Parse a "hosts" file and return the set of valid names, per §6
    /// ingest format: `<ignored-field> <name> [# comment]`; comments and
    /// blanks skipped; NUL-containing, `localhost`/`localdomain`-suffixed,
    /// or out-of-[4,253]-length names rejected.
    pub fn parse_hosts_format(text: &str) -> HashSet<String> {
        let mut names = HashSet::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let without_comment = line.split('#').next().unwrap_or("").trim();
            let mut fields = without_comment.split_whitespace();
            let _ignored_field = fields.next();
            let Some(name) = fields.next() else { continue };

            if !is_valid_blocklist_name(name) {
                continue;
            }
            names.insert(name.to_ascii_lowercase());
        }
        names
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_blocklist_name(name: &str) -> bool {
    if name.contains('\0') {
        return false;
    }
    if name.len() < 4 || name.len() > 253 {
        return false;
    }
    let lowered = name.to_ascii_lowercase();
    if lowered.ends_with("localhost") || lowered.ends_with("localdomain") {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_match_blocks_subdomains() {
        let blocklist = Blocklist::new();
        blocklist.replace(["a.com".to_string()].into_iter().collect());
        assert!(blocklist.is_blocked("a.com"));
        assert!(blocklist.is_blocked("x.a.com"));
        assert!(blocklist.is_blocked("y.x.a.com"));
        assert!(!blocklist.is_blocked("b.com"));
    }

    #[test]
    fn hosts_format_skips_comments_and_rejects_localhost() {
        let text = "# comment\n0.0.0.0 ads.example.com\n\n127.0.0.1 localhost\n0.0.0.0 bad\x00name.com\n";
        let names = Blocklist::parse_hosts_format(text);
        assert!(names.contains("ads.example.com"));
        assert!(!names.contains("localhost"));
        assert!(names.iter().all(|n| !n.contains('\0')));
    }

    #[test]
    fn short_names_are_rejected() {
        let text = "0.0.0.0 abc\n";
        let names = Blocklist::parse_hosts_format(text);
        assert!(names.is_empty());
    }
}
