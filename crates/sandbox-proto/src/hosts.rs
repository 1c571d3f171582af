//! Host allowlist patterns (spec.md §3 `HostPattern`) and matching.

use serde::{Deserialize, Serialize};

/// The default allowlist applied when a session is created without an
/// explicit one (spec.md §4.5, pinned to the original implementation's
/// `DEFAULT_ALLOWED_HOSTS` per SPEC_FULL.md §C.1).
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "pypi.org",
    "files.pythonhosted.org",
    "registry.npmjs.org",
    "github.com",
    "raw.githubusercontent.com",
    "objects.githubusercontent.com",
    "crates.io",
    "static.crates.io",
];

/// The two hosts `PipInstall` requires to be present in a session's
/// allowlist (spec.md §4.5).
pub const PYPI_HOSTS: &[&str] = &["pypi.org", "files.pythonhosted.org"];

/// A single entry in a session's allowlist: an exact host or a one-level
/// wildcard (`*.example.com`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `host` (already lowercased, port-stripped) matches this
    /// pattern. `*.example.com` matches both `sub.example.com` and
    /// `example.com` itself (spec.md §3).
    fn matches(&self, host: &str) -> bool {
        if let Some(suffix) = self.0.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == self.0
        }
    }
}

impl std::fmt::Display for HostPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered allowlist of [`HostPattern`]s, matched in order (though order
/// is irrelevant to the result — every pattern is checked).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Allowlist(Vec<HostPattern>);

impl Allowlist {
    pub fn new(patterns: Vec<HostPattern>) -> Self {
        Self(patterns)
    }

    pub fn default_registries() -> Self {
        Self(DEFAULT_ALLOWED_HOSTS.iter().map(|h| HostPattern::new(*h)).collect())
    }

    /// The canonical "no network" allowlist: present, explicitly empty.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn patterns(&self) -> &[HostPattern] {
        &self.0
    }

    /// Check a request's `Host` header (or CONNECT target) against this
    /// allowlist. Strips any port suffix and lowercases before matching,
    /// per spec.md §3.
    pub fn allows(&self, host: &str) -> bool {
        let host = strip_port(host).to_ascii_lowercase();
        self.0.iter().any(|p| p.matches(&host))
    }

    /// Whether both hosts `pip install` requires are present.
    pub fn allows_pypi(&self) -> bool {
        PYPI_HOSTS.iter().all(|h| self.allows(h))
    }

    /// Comma-joined form used in the egress token payload (spec.md §3).
    pub fn to_comma_joined(&self) -> String {
        self.0
            .iter()
            .map(HostPattern::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Inverse of [`Allowlist::to_comma_joined`]. An empty string decodes
    /// to the empty allowlist, not a one-element list containing "".
    pub fn from_comma_joined(s: &str) -> Self {
        if s.is_empty() {
            return Self::none();
        }
        Self(s.split(',').map(HostPattern::new).collect())
    }
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals (`[::1]:443`) aren't a concern here — container egress
    // targets are always hostnames, never bracketed literals.
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let list = Allowlist::new(vec![HostPattern::new("pypi.org")]);
        assert!(list.allows("pypi.org"));
        assert!(list.allows("PyPI.org"));
        assert!(!list.allows("evil.test"));
    }

    #[test]
    fn wildcard_matches_subdomain_and_apex() {
        let list = Allowlist::new(vec![HostPattern::new("*.example.com")]);
        assert!(list.allows("sub.example.com"));
        assert!(list.allows("example.com"));
        assert!(!list.allows("notexample.com"));
    }

    #[test]
    fn port_is_stripped_before_matching() {
        let list = Allowlist::new(vec![HostPattern::new("github.com")]);
        assert!(list.allows("github.com:443"));
    }

    #[test]
    fn empty_allowlist_means_no_network() {
        let list = Allowlist::none();
        assert!(list.is_empty());
        assert!(!list.allows("pypi.org"));
    }

    #[test]
    fn comma_join_round_trips() {
        let list = Allowlist::new(vec![HostPattern::new("pypi.org"), HostPattern::new("*.example.com")]);
        let joined = list.to_comma_joined();
        assert_eq!(joined, "pypi.org,*.example.com");
        assert_eq!(Allowlist::from_comma_joined(&joined), list);
    }

    #[test]
    fn empty_comma_joined_round_trips_to_none() {
        let list = Allowlist::none();
        assert_eq!(list.to_comma_joined(), "");
        assert_eq!(Allowlist::from_comma_joined(""), Allowlist::none());
    }

    #[test]
    fn pypi_gate_requires_both_hosts() {
        let partial = Allowlist::new(vec![HostPattern::new("pypi.org")]);
        assert!(!partial.allows_pypi());
        let full = Allowlist::new(vec![
            HostPattern::new("pypi.org"),
            HostPattern::new("files.pythonhosted.org"),
        ]);
        assert!(full.allows_pypi());
    }
}
