//! Host-based rule matching: exact hostnames and domain suffixes,
//! compiled into one `RegexSet` so a lookup is a single pass instead of
//! a linear scan over each rule's own matcher.

use regex::RegexSet;

/// Matches a hostname against a list of rules in insertion order,
/// returning the first rule that matched (lowest pattern index wins,
/// since `RegexSet` reports every match and we want "first rule wins"
/// semantics, not "most specific").
pub struct HostMatcher {
    set: RegexSet,
    len: usize,
}

#[derive(Debug, Clone)]
pub enum HostRule {
    /// Matches a hostname exactly.
    Exact(String),
    /// Matches the hostname itself or any subdomain of it.
    Suffix(String),
}

impl HostMatcher {
    pub fn new(rules: &[HostRule]) -> Result<Self, regex::Error> {
        let patterns: Vec<String> = rules.iter().map(pattern_for).collect();
        let set = RegexSet::new(&patterns)?;
        Ok(Self {
            set,
            len: rules.len(),
        })
    }

    /// Index of the first matching rule, if any.
    pub fn matches(&self, host: &str) -> Option<usize> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.set.matches(&host).iter().min()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn pattern_for(rule: &HostRule) -> String {
    match rule {
        HostRule::Exact(host) => format!("^{}$", regex::escape(&host.to_ascii_lowercase())),
        HostRule::Suffix(domain) => {
            let escaped = regex::escape(&domain.to_ascii_lowercase());
            format!("^({0}|.+\\.{0})$", escaped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let m = HostMatcher::new(&[HostRule::Exact("example.com".into())]).unwrap();
        assert_eq!(m.matches("example.com"), Some(0));
        assert_eq!(m.matches("sub.example.com"), None);
    }

    #[test]
    fn test_suffix_match() {
        let m = HostMatcher::new(&[HostRule::Suffix("example.com".into())]).unwrap();
        assert_eq!(m.matches("example.com"), Some(0));
        assert_eq!(m.matches("a.b.example.com"), Some(0));
        assert_eq!(m.matches("notexample.com"), None);
    }

    #[test]
    fn test_first_match_wins() {
        let m = HostMatcher::new(&[
            HostRule::Suffix("example.com".into()),
            HostRule::Exact("foo.example.com".into()),
        ])
        .unwrap();
        assert_eq!(m.matches("foo.example.com"), Some(0));
    }

    #[test]
    fn test_case_insensitive() {
        let m = HostMatcher::new(&[HostRule::Exact("Example.COM".into())]).unwrap();
        assert_eq!(m.matches("example.com"), Some(0));
    }
}
