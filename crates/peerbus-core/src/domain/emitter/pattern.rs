//! Listener name patterns.

/// Suffix marking a namespace wildcard.
pub const NAMESPACE_WILDCARD: &str = ":*";

/// Name that matches every event.
pub const GLOBAL_WILDCARD: &str = "*";

/// Parsed form of a listener name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPattern {
    /// Matches only this name.
    Exact(String),
    /// `"prefix:*"`, stored as `"prefix:"`.
    Namespace(String),
    /// `"*"`.
    All,
}

impl EventPattern {
    #[must_use]
    pub fn parse(name: &str) -> Self {
        if name == GLOBAL_WILDCARD {
            return Self::All;
        }
        match name.strip_suffix(NAMESPACE_WILDCARD) {
            Some(prefix) => Self::Namespace(format!("{prefix}:")),
            None => Self::Exact(name.to_string()),
        }
    }

    /// `"prefix:*"` matches `"prefix:anything"` but not bare `"prefix"` or `"prefix:"`.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => exact == name,
            Self::Namespace(prefix) => name.len() > prefix.len() && name.starts_with(prefix.as_str()),
        }
    }
}

/// Every registered-name key that could match `name`: the name itself, one
/// `"prefix:*"` per colon, and `"*"`.
pub(crate) fn candidate_keys(name: &str) -> Vec<String> {
    let mut keys = Vec::with_capacity(4);
    keys.push(name.to_string());
    for (idx, _) in name.match_indices(':') {
        if idx + 1 < name.len() {
            let key = format!("{}{NAMESPACE_WILDCARD}", &name[..idx]);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    if name != GLOBAL_WILDCARD {
        keys.push(GLOBAL_WILDCARD.to_string());
    }
    keys
}
