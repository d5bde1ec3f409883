//! Key names
//!
//! Validation of key names and find queries, and the glob matcher used by
//! `find`.
//!
//! A key name is made of ASCII alphanumerics and `. - _ @ { }`. `.` separates
//! namespace components and may not lead the name. `{...}` index groups must
//! be balanced and may not nest. Queries additionally allow `*`, which matches
//! any run of characters (including none).

use regex::Regex;
use thiserror::Error;

/// Why a key name was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyNameError {
    #[error("key name is empty")]
    Empty,

    #[error("key name is {len} bytes, maximum is {max}")]
    TooLong { len: usize, max: usize },

    #[error("invalid character {ch:?} at position {pos}")]
    BadCharacter { ch: char, pos: usize },

    #[error("unbalanced braces")]
    UnbalancedBraces,

    #[error("key name starts with a separator")]
    LeadingSeparator,

    #[error("query does not compile: {0}")]
    BadQuery(String),
}

/// Namespace separator
pub const SEPARATOR: char = '.';

/// Wildcard accepted in queries
pub const WILDCARD: char = '*';

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '@' | '{' | '}')
}

fn check(name: &str, max_len: usize, allow_wildcard: bool) -> Result<(), KeyNameError> {
    if name.is_empty() {
        return Err(KeyNameError::Empty);
    }
    if name.len() > max_len {
        return Err(KeyNameError::TooLong {
            len: name.len(),
            max: max_len,
        });
    }
    if name.starts_with(SEPARATOR) {
        return Err(KeyNameError::LeadingSeparator);
    }

    let mut in_group = false;
    for (pos, ch) in name.char_indices() {
        match ch {
            '{' if in_group => return Err(KeyNameError::UnbalancedBraces),
            '{' => in_group = true,
            '}' if !in_group => return Err(KeyNameError::UnbalancedBraces),
            '}' => in_group = false,
            WILDCARD if allow_wildcard => {}
            c if is_name_char(c) => {}
            c => return Err(KeyNameError::BadCharacter { ch: c, pos }),
        }
    }
    if in_group {
        return Err(KeyNameError::UnbalancedBraces);
    }
    Ok(())
}

/// Validate a key name used by `create`/`open`
pub fn validate_key(name: &str, max_len: usize) -> Result<(), KeyNameError> {
    check(name, max_len, false)
}

/// Validate a `find` query
pub fn validate_query(query: &str, max_len: usize) -> Result<(), KeyNameError> {
    check(query, max_len, true)
}

/// Namespace of a key: everything before the first separator
pub fn namespace(name: &str) -> &str {
    name.split(SEPARATOR).next().unwrap_or(name)
}

/// A validated `find` query compiled for matching
#[derive(Debug, Clone)]
pub struct Query {
    regex: Regex,
}

impl Query {
    /// Validate `query` and compile it; `*` matches any run of characters
    pub fn compile(query: &str, max_len: usize) -> Result<Self, KeyNameError> {
        validate_query(query, max_len)?;

        // Braces stay literal: only the wildcard is translated
        let pattern = regex::escape(query).replace(r"\*", ".*");
        let regex = Regex::new(&format!("^(?s:{pattern})$"))
            .map_err(|e| KeyNameError::BadQuery(e.to_string()))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}
