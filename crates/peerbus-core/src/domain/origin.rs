//! # Origin Validator
//!
//! Allow-list decision for the origin tag carried on inbound messages.
//!
//! Exact entries are a set lookup. Wildcard entries (`scheme://*`,
//! `scheme://*.domain[:port]`) are compiled once into a scheme/host-suffix/port
//! triple and matched with plain string comparisons, so matching cost is
//! linear in the candidate length. Candidates longer than DNS allows are
//! rejected before any pattern is consulted.
//!
//! `"null"` (and a missing origin) passes only when `"null"` is listed.

use std::collections::HashSet;
use thiserror::Error;

/// Maximum DNS host length.
pub const MAX_HOST_LEN: usize = 253;

/// Maximum DNS label length.
pub const MAX_LABEL_LEN: usize = 63;

/// Ceiling on a whole origin string: scheme, `://`, host and port.
pub const MAX_ORIGIN_LEN: usize = MAX_HOST_LEN + 64;

/// The serialized origin of opaque contexts.
pub const NULL_ORIGIN: &str = "null";

/// Rejected allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid origin pattern '{pattern}': {reason}")]
pub struct OriginPatternError {
    pub pattern: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    /// `scheme://*`
    Any,
    /// `scheme://*.example.com`, stored as `".example.com"`.
    SubdomainOf(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OriginPattern {
    scheme: String,
    host: HostPattern,
    port: Option<String>,
}

impl OriginPattern {
    fn compile(pattern: &str) -> Result<Self, OriginPatternError> {
        let fail = |reason| OriginPatternError {
            pattern: pattern.to_string(),
            reason,
        };

        let lowered = pattern.to_ascii_lowercase();
        let (scheme, authority) = lowered.split_once("://").ok_or_else(|| fail("missing scheme"))?;
        if scheme.is_empty() || scheme.contains('*') {
            return Err(fail("scheme must be literal"));
        }
        let (host, port) = split_port(authority);
        if port.is_some_and(|p| p.contains('*')) {
            return Err(fail("port must be literal"));
        }

        let host = if host == "*" {
            HostPattern::Any
        } else if let Some(domain) = host.strip_prefix("*.") {
            if domain.is_empty() || domain.contains('*') {
                return Err(fail("only a single leading '*.' label is supported"));
            }
            HostPattern::SubdomainOf(format!(".{domain}"))
        } else {
            return Err(fail("wildcard must be '*' or a leading '*.' label"));
        };

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port: port.map(str::to_string),
        })
    }

    fn matches(&self, scheme: &str, host: &str, port: Option<&str>) -> bool {
        if self.scheme != scheme || self.port.as_deref() != port {
            return false;
        }
        match &self.host {
            HostPattern::Any => true,
            HostPattern::SubdomainOf(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }
}

/// Split `host[:port]`; bracketed IPv6 hosts keep their colons.
fn split_port(authority: &str) -> (&str, Option<&str>) {
    let host_end = authority.rfind(']').map_or(0, |i| i + 1);
    match authority[host_end..].rfind(':') {
        Some(i) => {
            let at = host_end + i;
            (&authority[..at], Some(&authority[at + 1..]))
        }
        None => (authority, None),
    }
}

fn host_within_dns_bounds(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return false;
    }
    if host.starts_with('[') {
        return true;
    }
    host.split('.')
        .all(|label| !label.is_empty() && label.len() <= MAX_LABEL_LEN)
}

/// Origin allow-list.
#[derive(Debug, Clone, Default)]
pub struct OriginValidator {
    exact: HashSet<String>,
    patterns: Vec<OriginPattern>,
    allow_null: bool,
    allow_all: bool,
}

impl OriginValidator {
    /// Build from allow-list entries; entries containing `*` are wildcards.
    ///
    /// # Errors
    ///
    /// Returns the first entry whose wildcard form is not supported.
    pub fn new<I, S>(allowed: I) -> Result<Self, OriginPatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut validator = Self::default();
        for origin in allowed {
            validator.add(origin.as_ref())?;
        }
        Ok(validator)
    }

    /// Accept every origin. Only for trusted same-process setups.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }

    /// Add one allow-list entry.
    ///
    /// # Errors
    ///
    /// Fails for an unsupported wildcard form.
    pub fn add(&mut self, origin: &str) -> Result<(), OriginPatternError> {
        if origin == NULL_ORIGIN {
            self.allow_null = true;
        } else if origin.contains('*') {
            self.patterns.push(OriginPattern::compile(origin)?);
        } else {
            self.exact.insert(origin.to_ascii_lowercase());
        }
        Ok(())
    }

    pub fn allows_all(&self) -> bool {
        self.allow_all
    }

    /// Whether a message carrying `origin` may be processed.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        if self.allow_all {
            return true;
        }
        let origin = match origin {
            None | Some(NULL_ORIGIN) => return self.allow_null,
            Some(origin) => origin,
        };
        if origin.len() > MAX_ORIGIN_LEN {
            return false;
        }

        let origin = origin.to_ascii_lowercase();
        if self.exact.contains(&origin) {
            return true;
        }
        if self.patterns.is_empty() {
            return false;
        }

        let Some((scheme, authority)) = origin.split_once("://") else {
            return false;
        };
        let (host, port) = split_port(authority);
        if !host_within_dns_bounds(host) {
            return false;
        }
        self.patterns
            .iter()
            .any(|pattern| pattern.matches(scheme, host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_exact_match() {
        let validator = OriginValidator::new(["https://app.example.com"]).unwrap();
        assert!(validator.is_allowed(Some("https://app.example.com")));
        assert!(validator.is_allowed(Some("HTTPS://APP.EXAMPLE.COM")));
        assert!(!validator.is_allowed(Some("https://evil.example.com")));
        assert!(!validator.is_allowed(Some("http://app.example.com")));
    }

    #[test]
    fn test_subdomain_wildcard() {
        let validator = OriginValidator::new(["https://*.example.com"]).unwrap();
        assert!(validator.is_allowed(Some("https://a.example.com")));
        assert!(validator.is_allowed(Some("https://a.b.example.com")));
        assert!(!validator.is_allowed(Some("https://example.com")));
        assert!(!validator.is_allowed(Some("https://a.example.com.evil.io")));
        assert!(!validator.is_allowed(Some("https://aexample.com")));
        assert!(!validator.is_allowed(Some("http://a.example.com")));
        assert!(!validator.is_allowed(Some("https://a.example.com:8443")));
    }

    #[test]
    fn test_scheme_wildcard_and_port() {
        let validator = OriginValidator::new(["http://*", "https://*.local:8080"]).unwrap();
        assert!(validator.is_allowed(Some("http://anything.at.all")));
        assert!(validator.is_allowed(Some("https://dev.local:8080")));
        assert!(!validator.is_allowed(Some("https://dev.local")));
        assert!(!validator.is_allowed(Some("ws://anything")));
    }

    #[test]
    fn test_null_requires_explicit_entry() {
        let strict = OriginValidator::new(["https://*.example.com"]).unwrap();
        assert!(!strict.is_allowed(Some("null")));
        assert!(!strict.is_allowed(None));

        let lenient = OriginValidator::new(["null"]).unwrap();
        assert!(lenient.is_allowed(Some("null")));
        assert!(lenient.is_allowed(None));
    }

    #[test]
    fn test_allow_all_bypasses_checks() {
        let validator = OriginValidator::allow_all();
        assert!(validator.allows_all());
        assert!(validator.is_allowed(Some("https://whatever")));
        assert!(validator.is_allowed(None));
    }

    #[test]
    fn test_empty_list_rejects_everything() {
        let validator = OriginValidator::new(Vec::<String>::new()).unwrap();
        assert!(!validator.is_allowed(Some("https://example.com")));
    }

    #[test]
    fn test_unsupported_patterns_rejected() {
        assert!(OriginValidator::new(["https://app.*.com"]).is_err());
        assert!(OriginValidator::new(["*://example.com"]).is_err());
        assert!(OriginValidator::new(["*.example.com"]).is_err());
        assert!(OriginValidator::new(["https://*.example.com:*"]).is_err());
    }

    #[test]
    fn test_oversized_host_rejected_quickly() {
        let validator = OriginValidator::new(["https://*.example.com"]).unwrap();
        let hostile = format!("https://{}.example.com", "a".repeat(2000));

        let started = Instant::now();
        assert!(!validator.is_allowed(Some(&hostile)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_overlong_label_rejected() {
        let validator = OriginValidator::new(["https://*.example.com"]).unwrap();
        let origin = format!("https://{}.example.com", "a".repeat(MAX_LABEL_LEN + 1));
        assert!(origin.len() < MAX_ORIGIN_LEN);
        assert!(!validator.is_allowed(Some(&origin)));

        let origin = format!("https://{}.example.com", "a".repeat(MAX_LABEL_LEN));
        assert!(validator.is_allowed(Some(&origin)));
    }

    #[test]
    fn test_split_port() {
        assert_eq!(split_port("a.com:80"), ("a.com", Some("80")));
        assert_eq!(split_port("a.com"), ("a.com", None));
        assert_eq!(split_port("[::1]:80"), ("[::1]", Some("80")));
        assert_eq!(split_port("[::1]"), ("[::1]", None));
    }
}
