//! Handler name patterns
//!
//! Used to select handlers for removal:
//! - `page.getUrl` matches exactly that name
//! - `page.*` matches anything under `page.`
//! - `*` matches every name, including the wildcard handler slot

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("handler pattern cannot be empty")]
    Empty,

    #[error("wildcard '*' can only appear as the last segment")]
    WildcardNotAtEnd,
}

/// A handler name pattern that may end with a wildcard
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamePattern {
    /// The prefix before the wildcard (or full name if no wildcard)
    prefix: String,
    is_wildcard: bool,
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        if pattern == "*" {
            return Ok(Self {
                prefix: String::new(),
                is_wildcard: true,
            });
        }

        let (prefix, is_wildcard) = match pattern.strip_suffix(".*") {
            Some(prefix) => (prefix, true),
            None => (pattern, false),
        };

        if prefix.is_empty() || prefix.contains('*') {
            return Err(PatternError::WildcardNotAtEnd);
        }

        Ok(Self {
            prefix: prefix.to_string(),
            is_wildcard,
        })
    }

    /// Pattern matching every name
    pub fn any() -> Self {
        Self {
            prefix: String::new(),
            is_wildcard: true,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        if !self.is_wildcard {
            return name == self.prefix;
        }
        if self.prefix.is_empty() {
            return true;
        }
        name.len() > self.prefix.len()
            && name.starts_with(&self.prefix)
            && name.as_bytes()[self.prefix.len()] == b'.'
    }

    /// Whether this is the catch-all `*`
    pub fn is_any(&self) -> bool {
        self.is_wildcard && self.prefix.is_empty()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_wildcard, self.prefix.is_empty()) {
            (true, true) => f.write_str("*"),
            (true, false) => write!(f, "{}.*", self.prefix),
            _ => f.write_str(&self.prefix),
        }
    }
}
