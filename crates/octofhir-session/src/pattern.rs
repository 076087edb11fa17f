//! Glob key patterns for bulk deletion.
//!
//! `*` is the only wildcard; every other character matches itself.

use regex::Regex;

use crate::SessionResult;
use crate::error::SessionError;

/// A compiled key pattern, anchored at both ends.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compiles a glob such as `user:*` into an anchored matcher.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the resulting regex cannot be built.
    pub fn new(glob: &str) -> SessionResult<Self> {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$")).map_err(|e| {
            SessionError::configuration(format!("invalid key pattern '{glob}': {e}"))
        })?;
        Ok(Self {
            raw: glob.to_string(),
            regex,
        })
    }

    #[inline]
    pub fn is_match(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The pattern in Redis `SCAN MATCH` syntax, with Redis' own glob
    /// metacharacters other than `*` escaped.
    pub fn as_redis_glob(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for ch in self.raw.chars() {
            if matches!(ch, '?' | '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_pattern() {
        let p = KeyPattern::new("user:*").unwrap();
        assert!(p.is_match("user:1"));
        assert!(p.is_match("user:"));
        assert!(!p.is_match("admin:1"));
        assert!(!p.is_match("xuser:1"));
    }

    #[test]
    fn test_inner_wildcard_is_anchored() {
        let p = KeyPattern::new("t:*:s").unwrap();
        assert!(p.is_match("t:acme:s"));
        assert!(!p.is_match("t:acme:s:extra"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = KeyPattern::new("a.b+(c)*").unwrap();
        assert!(p.is_match("a.b+(c)123"));
        assert!(!p.is_match("axb+(c)123"));

        let exact = KeyPattern::new("session?").unwrap();
        assert!(exact.is_match("session?"));
        assert!(!exact.is_match("sessions"));
    }

    #[test]
    fn test_redis_glob_escaping() {
        let p = KeyPattern::new("k[1]?:*").unwrap();
        assert_eq!(p.as_redis_glob(), "k\\[1\\]\\?:*");
    }
}
