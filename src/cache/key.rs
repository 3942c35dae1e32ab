// src/cache/key.rs
use std::hash::Hasher;
use twox_hash::XxHash64;

/// 64-bit content fingerprint of a request, compared bitwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub u64);

impl CacheKey {
    /// Fingerprint `(method, target, body)` with XXH64.
    ///
    /// The three parts are separated so e.g. `("a", "bc")` and `("ab", "c")`
    /// never collide structurally.
    pub fn from_request(method: &str, target: &str, body: &[u8]) -> Self {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(method.as_bytes());
        hasher.write(b":");
        hasher.write(target.as_bytes());
        hasher.write(b":");
        hasher.write(body);
        CacheKey(hasher.finish())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Whether a request's `Cache-Control` header opts out of caching.
pub fn should_bypass_cache(cache_control: &str) -> bool {
    if cache_control.is_empty() {
        return false;
    }
    let lower = cache_control.to_ascii_lowercase();
    lower.contains("no-cache") || lower.contains("no-store")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_requests_share_a_key() {
        let a = CacheKey::from_request("POST", "/v1/chat/completions", b"{\"model\":\"m\"}");
        let b = CacheKey::from_request("POST", "/v1/chat/completions", b"{\"model\":\"m\"}");
        assert_eq!(a, b);
    }

    #[test]
    fn any_component_changes_the_key() {
        let base = CacheKey::from_request("POST", "/v1/chat/completions", b"{}");
        assert_ne!(base, CacheKey::from_request("GET", "/v1/chat/completions", b"{}"));
        assert_ne!(base, CacheKey::from_request("POST", "/v1/other", b"{}"));
        assert_ne!(base, CacheKey::from_request("POST", "/v1/chat/completions", b"{ }"));
    }

    #[test]
    fn display_is_sixteen_hex_chars() {
        let key = CacheKey::from_request("GET", "/", b"");
        let rendered = key.to_string();
        assert_eq!(rendered.len(), 16);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn bypass_directives_are_case_insensitive() {
        assert!(should_bypass_cache("no-cache"));
        assert!(should_bypass_cache("No-Store"));
        assert!(should_bypass_cache("max-age=0, NO-CACHE"));
        assert!(!should_bypass_cache(""));
        assert!(!should_bypass_cache("max-age=60"));
    }
}
