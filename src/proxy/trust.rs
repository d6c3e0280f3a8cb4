//! Origin trust policy.

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::error::Result;

/// Origins of first-party pages allowed to share a connection.
pub const DEFAULT_TRUSTED_ORIGIN: &str = r"^https?://([\w-]+\.)*twitch\.(tv|tech)(:\d+)?/.*$";

/// Decides which origins may take part in the proxy protocol.
///
/// An origin is trusted when it parses as an `http`/`https` URL and its
/// normalized form matches one of the patterns.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    patterns: Vec<Regex>,
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self {
            patterns: Regex::new(DEFAULT_TRUSTED_ORIGIN).into_iter().collect(),
        }
    }
}

impl OriginPolicy {
    /// Compiles a policy from regex sources.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Regex`](crate::Error::Regex) if a pattern does not
    /// compile.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns `true` if `origin` is trusted.
    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        let Ok(url) = Url::parse(origin) else {
            debug!(origin, "Untrusted origin: not a URL");
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            debug!(origin, "Untrusted origin: scheme");
            return false;
        }

        let trusted = self
            .patterns
            .iter()
            .any(|pattern| pattern.is_match(url.as_str()));
        if !trusted {
            debug!(origin, "Untrusted origin");
        }
        trusted
    }

    /// Number of patterns.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns `true` if the policy trusts nothing.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = OriginPolicy::default();
        assert!(policy.allows("https://www.twitch.tv"));
        assert!(policy.allows("https://player.twitch.tv/channel?x=1"));
        assert!(policy.allows("http://dev.twitch.tech:8080/"));
        assert!(policy.allows("https://twitch.tv/"));

        assert!(!policy.allows("https://twitch.tv.evil.com/"));
        assert!(!policy.allows("https://eviltwitch.tv.com/"));
        assert!(!policy.allows("ftp://www.twitch.tv/"));
        assert!(!policy.allows("not an origin"));
    }

    #[test]
    fn test_custom_patterns() {
        let policy = OriginPolicy::new(&[r"^https://example\.com/"]).expect("compile");
        assert_eq!(policy.len(), 1);
        assert!(policy.allows("https://example.com"));
        assert!(!policy.allows("https://www.twitch.tv"));
    }

    #[test]
    fn test_empty_policy_trusts_nothing() {
        let policy = OriginPolicy::new::<&str>(&[]).expect("compile");
        assert!(policy.is_empty());
        assert!(!policy.allows("https://www.twitch.tv"));
    }

    #[test]
    fn test_invalid_pattern() {
        let result = OriginPolicy::new(&["("]);
        assert!(matches!(result, Err(crate::Error::Regex(_))));
    }
}
