//! # Key Namespace
//!
//! Every key the client touches is `"<namespace>:<caller key>"`. The
//! namespace is fixed when the client is built and never varies per call.

use crate::error::{CacheError, CacheResult};

/// Separator between the namespace and the caller key.
pub const KEY_SEPARATOR: char = ':';

/// A validated key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    name: String,
    /// `name` followed by the separator, precomputed for key building.
    prefix: String,
}

impl Namespace {
    /// Builds a namespace. An empty name is a configuration error.
    pub fn new(name: impl Into<String>) -> CacheResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CacheError::Configuration("cache namespace must not be empty".to_string()));
        }
        let mut prefix = String::with_capacity(name.len() + 1);
        prefix.push_str(&name);
        prefix.push(KEY_SEPARATOR);
        Ok(Namespace { name, prefix })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Returns the fully-qualified key for `key`.
    pub fn key(&self, key: &str) -> String {
        let mut full = String::with_capacity(self.prefix.len() + key.len());
        full.push_str(&self.prefix);
        full.push_str(key);
        full
    }

    /// Strips the namespace prefix from a stored key, or returns `None` for
    /// keys outside this namespace.
    pub fn strip<'a>(&self, full: &'a [u8]) -> Option<&'a [u8]> {
        full.strip_prefix(self.prefix.as_bytes())
    }

    /// Glob pattern matching every key in this namespace.
    ///
    /// Glob metacharacters in the name are escaped so they match literally.
    pub fn match_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + 8);
        for ch in self.name.chars() {
            if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(ch);
        }
        pattern.push(KEY_SEPARATOR);
        pattern.push('*');
        pattern
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_prefixed_keys() {
        let ns = Namespace::new("telli:dialog").unwrap();
        assert_eq!(ns.key("user:42"), "telli:dialog:user:42");
        assert_eq!(ns.key(""), "telli:dialog:");
    }

    #[test]
    fn empty_namespace_is_rejected() {
        assert!(matches!(Namespace::new(""), Err(CacheError::Configuration(_))));
    }

    #[test]
    fn strip_only_accepts_own_keys() {
        let ns = Namespace::new("ns1").unwrap();
        assert_eq!(ns.strip(b"ns1:alpha"), Some(&b"alpha"[..]));
        assert_eq!(ns.strip(b"ns10:alpha"), None);
        assert_eq!(ns.strip(b"ns2:alpha"), None);
    }

    #[test]
    fn match_pattern_escapes_glob_characters() {
        assert_eq!(Namespace::new("telli:dialog").unwrap().match_pattern(), "telli:dialog:*");
        assert_eq!(Namespace::new("a*b?[c]").unwrap().match_pattern(), "a\\*b\\?\\[c\\]:*");
    }
}
