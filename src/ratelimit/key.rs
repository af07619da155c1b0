//! Storage key generation.

use std::fmt;

/// The namespaced key under which one caller's state is stored.
///
/// Format: `[<namespace>:]<algorithm-prefix>:<user-key>`. The prefix keeps
/// algorithms that share a backend from reading each other's state.
///
/// Parts are joined without escaping, and user keys may contain `:`.
/// Namespace `fw` with user key `x` and no namespace with user key `fw:x`
/// both give `fw:fw:x`, so limiters sharing a backend should either all set
/// a namespace or none should. Namespaces themselves may not contain `:`
/// (see [`LimiterConfig::validate`](crate::config::LimiterConfig::validate)).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Build a key from an optional namespace, an algorithm prefix and the
    /// caller-supplied identity.
    pub fn new(namespace: Option<&str>, prefix: &str, user_key: &str) -> Self {
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Self(format!("{}:{}:{}", ns, prefix, user_key)),
            None => Self(format!("{}:{}", prefix, user_key)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
