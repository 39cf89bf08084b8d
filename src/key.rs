//! Cache key namespacing
//!
//! Every key a cache writes lives under `<app>:<key-prefix>:<cache-name>:`. Locks and the
//! shared membership filter live under sibling namespaces so that `clear()` on a cache name
//! can never delete them.

use crate::{CacheConfig, CacheError};

/// Separator between key segments
pub const KEY_SEPARATOR: &str = ":";

const GLOB_META: [char; 5] = ['*', '?', '[', ']', '\\'];

/// Deterministic raw-key → cache-key mapping for one cache name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    cache_name: String,
    /// `<app>:<key-prefix>:<cache-name>:`
    prefix: String,
    /// `<app>:<key-prefix>`
    root: String,
}

impl KeyNamespace {
    /// Build the namespace for `cache_name`.
    ///
    /// Cache names may not contain the separator or glob metacharacters: `a` would otherwise
    /// own the prefix of `a:b`, and prefix scans would match the wrong keys.
    pub fn new(config: &CacheConfig, cache_name: &str) -> Result<Self, CacheError> {
        if cache_name.is_empty() {
            return Err(CacheError::InvalidConfig("cache name is empty".to_owned()));
        }
        if cache_name.contains(KEY_SEPARATOR) || cache_name.contains(&GLOB_META[..]) {
            return Err(CacheError::InvalidConfig(format!(
                "cache name '{}' may not contain '{}' or glob characters",
                cache_name, KEY_SEPARATOR
            )));
        }
        if cache_name.starts_with("__") {
            return Err(CacheError::InvalidConfig(format!(
                "cache name '{}' uses the reserved '__' prefix",
                cache_name
            )));
        }
        let root = format!("{}{}{}", config.app_name, KEY_SEPARATOR, config.key_prefix);
        let prefix = format!("{}{}{}{}", root, KEY_SEPARATOR, cache_name, KEY_SEPARATOR);
        Ok(Self {
            cache_name: cache_name.to_owned(),
            prefix,
            root,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Prefix shared by every key of this cache name
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Namespaced key for a caller-supplied raw key
    pub fn cache_key(&self, raw_key: &str) -> String {
        format!("{}{}", self.prefix, raw_key)
    }

    pub fn owns(&self, cache_key: &str) -> bool {
        cache_key.starts_with(&self.prefix)
    }

    /// Glob pattern matching exactly the keys of this cache name
    pub fn scan_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.prefix))
    }

    /// Key of the cross-process lease guarding loads of `cache_key`
    pub fn lock_key(&self, cache_key: &str) -> String {
        format!("{}{}__lock__{}{}", self.root, KEY_SEPARATOR, KEY_SEPARATOR, cache_key)
    }

    /// Key of the shared membership bitmap for this cache name
    pub fn filter_key(&self) -> String {
        format!(
            "{}{}__membership__{}{}",
            self.root, KEY_SEPARATOR, KEY_SEPARATOR, self.cache_name
        )
    }
}

/// Escape Redis glob metacharacters so `s` matches only itself.
pub fn escape_glob(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if GLOB_META.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(name: &str) -> KeyNamespace {
        let config = CacheConfig {
            app_name: "shop".to_owned(),
            ..CacheConfig::default()
        };
        KeyNamespace::new(&config, name).unwrap()
    }

    #[test]
    fn test_cache_key_layout() {
        let ns = namespace("users");
        assert_eq!(ns.cache_key("42"), "shop:cache:users:42");
        assert_eq!(ns.prefix(), "shop:cache:users:");
        assert!(ns.owns("shop:cache:users:42"));
        assert!(!ns.owns("shop:cache:orders:42"));
        // Raw keys may contain the separator; they are never split
        assert_eq!(ns.cache_key("a:b"), "shop:cache:users:a:b");
    }

    #[test]
    fn test_lock_and_filter_keys_outside_prefix() {
        let ns = namespace("users");
        let ck = ns.cache_key("42");
        assert!(!ns.owns(&ns.lock_key(&ck)));
        assert!(!ns.owns(&ns.filter_key()));
        assert_eq!(ns.lock_key(&ck), "shop:cache:__lock__:shop:cache:users:42");
    }

    #[test]
    fn test_rejects_ambiguous_names() {
        let config = CacheConfig::default();
        assert!(KeyNamespace::new(&config, "").is_err());
        assert!(KeyNamespace::new(&config, "a:b").is_err());
        assert!(KeyNamespace::new(&config, "a*").is_err());
        assert!(KeyNamespace::new(&config, "__lock__").is_err());
        assert!(KeyNamespace::new(&config, "orders").is_ok());
    }

    #[test]
    fn test_scan_pattern_escapes_app_name() {
        let config = CacheConfig {
            app_name: "svc[1]".to_owned(),
            ..CacheConfig::default()
        };
        let ns = KeyNamespace::new(&config, "users").unwrap();
        assert_eq!(ns.scan_pattern(), "svc\\[1\\]:cache:users:*");
        assert_eq!(escape_glob("a*b?"), "a\\*b\\?");
    }
}
