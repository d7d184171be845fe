//! Domain, path, and CIDR matching (spec §4.2 "Domain matching" /
//! "Path matching" / "CIDR containment").
//!
//! Patterns are compiled once into this enum rather than evaluated as
//! regex, so matching is pure and has no backtracking surprises.

use ipnet::IpNet;
use std::net::IpAddr;

/// A compiled domain pattern. Case-insensitive; the apex/subdomain
/// distinction between wildcard and suffix forms is the load-bearing
/// invariant (spec §8 "boundary behaviors").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    /// `foo.com` — matches only the exact name.
    Exact(String),
    /// `*.foo.com` — matches any label-prefixed subdomain, never the apex.
    Wildcard(String),
    /// `.foo.com` — matches both the apex and all subdomains.
    Suffix(String),
}

impl DomainPattern {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("*.") {
            DomainPattern::Wildcard(normalize(rest))
        } else if let Some(rest) = raw.strip_prefix('.') {
            DomainPattern::Suffix(normalize(rest))
        } else {
            DomainPattern::Exact(normalize(raw))
        }
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        match self {
            DomainPattern::Exact(pattern) => domain == *pattern,
            DomainPattern::Wildcard(pattern) => {
                domain != *pattern && is_subdomain(&domain, pattern)
            }
            DomainPattern::Suffix(pattern) => domain == *pattern || is_subdomain(&domain, pattern),
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn is_subdomain(child: &str, parent: &str) -> bool {
    !parent.is_empty() && child.ends_with(&format!(".{parent}"))
}

/// A compiled list of domain patterns, matched in no particular order
/// (spec only requires "matches any of").
#[derive(Debug, Clone, Default)]
pub struct DomainPatternSet(Vec<DomainPattern>);

impl DomainPatternSet {
    pub fn compile(patterns: &[String]) -> Self {
        Self(patterns.iter().map(|p| DomainPattern::parse(p)).collect())
    }

    pub fn is_match(&self, domain: &str) -> bool {
        self.0.iter().any(|p| p.matches(domain))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A compiled path pattern: prefix match, or a glob where `*` matches
/// any run of non-`/` characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    is_glob: bool,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Self {
        Self {
            is_glob: raw.contains('*'),
            raw: raw.to_string(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.is_glob {
            glob_match(&self.raw, path)
        } else {
            path.starts_with(&self.raw)
        }
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<&str> = pattern.split('*').collect();
    if pat.len() == 1 {
        return pattern == text;
    }

    let mut cursor = text;
    for (i, part) in pat.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !cursor.starts_with(part) {
                return false;
            }
            cursor = &cursor[part.len()..];
        } else if i == pat.len() - 1 {
            return cursor.ends_with(part);
        } else {
            match find_non_slash_run(cursor, part) {
                Some(idx) => cursor = &cursor[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Find `needle` in `haystack` without crossing a `/` boundary (glob `*`
/// only spans a single path segment run of non-`/` characters).
fn find_non_slash_run(haystack: &str, needle: &str) -> Option<usize> {
    let mut idx = 0;
    while let Some(rel) = haystack[idx..].find(needle) {
        let start = idx + rel;
        if haystack[..start].contains('/') {
            return None;
        }
        return Some(start);
    }
    None
}

/// Empty path list means "any path" (spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct PathPatternSet(Vec<PathPattern>);

impl PathPatternSet {
    pub fn compile(patterns: &[String]) -> Self {
        Self(patterns.iter().map(|p| PathPattern::parse(p)).collect())
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|p| p.matches(path))
    }
}

/// Standard CIDR containment for both IPv4 and IPv6.
pub fn cidr_contains(net: &IpNet, addr: IpAddr) -> bool {
    net.contains(&addr)
}

pub fn compile_cidrs(raw: &[String]) -> Vec<IpNet> {
    raw.iter().filter_map(|s| s.parse::<IpNet>().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_matches_only_exact() {
        let p = DomainPattern::parse("foo.com");
        assert!(p.matches("foo.com"));
        assert!(!p.matches("www.foo.com"));
        assert!(!p.matches("xfoo.com"));
    }

    #[test]
    fn wildcard_requires_label_prefix_never_apex() {
        let p = DomainPattern::parse("*.foo.com");
        assert!(!p.matches("foo.com"));
        assert!(p.matches("www.foo.com"));
        assert!(p.matches("a.b.foo.com"));
    }

    #[test]
    fn suffix_matches_apex_and_subdomains() {
        let p = DomainPattern::parse(".foo.com");
        assert!(p.matches("foo.com"));
        assert!(p.matches("sub.foo.com"));
        assert!(!p.matches("otherfoo.com"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let p = DomainPattern::parse("*.Foo.COM");
        assert!(p.matches("WWW.foo.com"));
    }

    #[test]
    fn path_prefix_match() {
        let p = PathPattern::parse("/api");
        assert!(p.matches("/api/v1/users"));
        assert!(!p.matches("/other"));
    }

    #[test]
    fn path_glob_match() {
        let p = PathPattern::parse("/api/*/users");
        assert!(p.matches("/api/v1/users"));
        assert!(!p.matches("/api/v1/v2/users"));
    }

    #[test]
    fn empty_path_set_matches_anything() {
        let set = PathPatternSet::compile(&[]);
        assert!(set.is_match("/anything"));
    }

    #[test]
    fn cidr_v4_and_v6() {
        let nets = compile_cidrs(&["192.168.1.0/24".to_string(), "fc00::/7".to_string()]);
        assert!(cidr_contains(&nets[0], "192.168.1.100".parse().unwrap()));
        assert!(!cidr_contains(&nets[0], "10.0.0.1".parse().unwrap()));
        assert!(cidr_contains(&nets[1], "fc00::1".parse().unwrap()));
    }
}
