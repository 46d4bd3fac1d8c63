//! Domain sets.
//!
//! Two sets drive the proxy: the hosts whose HTML gets injected and the hosts
//! whose CONNECT tunnels are intercepted. Entries are normalised once on
//! insertion so matching is a cheap suffix comparison.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalises a host for comparison.
///
/// Lowercases, strips a port, IPv6 brackets and a trailing dot.
///
/// # Examples
///
/// ```
/// use graft_core::normalize_host;
///
/// assert_eq!(normalize_host("Example.COM:8443"), "example.com");
/// assert_eq!(normalize_host("[::1]:443"), "::1");
/// assert_eq!(normalize_host("example.com."), "example.com");
/// ```
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let host = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        // Bare IPv6 literal or plain name.
        host
    };

    host.trim_end_matches('.').to_ascii_lowercase()
}

/// A set of domain patterns.
///
/// A host matches an entry when it equals the entry or is a subdomain of it.
/// Entries written as `*.example.com` match subdomains only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct DomainSet {
    entries: Vec<String>,
}

impl DomainSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from an iterator of entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for entry in entries {
            set.insert(entry.as_ref());
        }
        set
    }

    /// Parses a comma-separated list such as `example.com, *.test`.
    pub fn parse_list(raw: &str) -> Self {
        Self::from_entries(raw.split(','))
    }

    /// Adds an entry. Returns false for blanks and duplicates.
    pub fn insert(&mut self, entry: &str) -> bool {
        let entry = match entry.trim().strip_prefix("*.") {
            Some(base) => format!("*.{}", normalize_host(base)),
            None => normalize_host(entry),
        };

        if entry.is_empty() || entry == "*." || self.entries.contains(&entry) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Returns true if the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the normalised entries.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Strict membership: an empty set matches nothing.
    pub fn contains_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }
        self.entries.iter().any(|entry| entry_matches(entry, &host))
    }

    /// Membership where an empty set means "every host".
    pub fn matches_or_empty(&self, host: &str) -> bool {
        self.is_empty() || self.contains_host(host)
    }
}

fn entry_matches(entry: &str, host: &str) -> bool {
    if let Some(base) = entry.strip_prefix("*.") {
        return is_subdomain_of(host, base);
    }
    host == entry || is_subdomain_of(host, entry)
}

fn is_subdomain_of(host: &str, base: &str) -> bool {
    host.len() > base.len()
        && host.ends_with(base)
        && host.as_bytes()[host.len() - base.len() - 1] == b'.'
}

impl From<Vec<String>> for DomainSet {
    fn from(entries: Vec<String>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<DomainSet> for Vec<String> {
    fn from(set: DomainSet) -> Self {
        set.entries
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entries.join(", "))
    }
}
