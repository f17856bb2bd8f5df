//! Case-insensitive header map.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Upper bound on the number of distinct headers in one message.
pub const MAX_HEADER_COUNT: usize = 128;
/// Upper bound on a header name, in bytes.
pub const MAX_HEADER_KEY_LENGTH: usize = 256;
/// Upper bound on a header value, in bytes (after folding).
pub const MAX_HEADER_VALUE_LENGTH: usize = 4096;

/// Normalizes a header name to its canonical form: the first character and
/// each character following a non-letter are upper-cased, everything else is
/// lowered. `accept-encoding` becomes `Accept-Encoding`.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut was_alpha = false;
    for ch in key.chars() {
        let ch = if was_alpha {
            ch.to_ascii_lowercase()
        } else {
            ch.to_ascii_uppercase()
        };
        was_alpha = ch.is_ascii_alphabetic();
        out.push(ch);
    }
    out
}

/// Header storage with normalized keys.
///
/// Lookups accept any casing. Inserting a key that already exists folds the
/// values with a single space separator; this matches the behavior this
/// server is a rework of, and deliberately differs from the RFC 7230
/// comma-join convention.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    map: HashMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(&normalize_key(key)).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(&normalize_key(key))
    }

    /// Inserts or replaces.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.map.insert(normalize_key(key), value.into());
    }

    /// Inserts, folding with a space when the key already exists. Fails with
    /// [`Error::HeaderTooLarge`] when the folded value or the map itself
    /// outgrows its limit.
    pub fn append(&mut self, key: &str, value: &str) -> Result<()> {
        let key = normalize_key(key);
        match self.map.get_mut(&key) {
            Some(existing) => {
                existing.push(' ');
                existing.push_str(value);
                if existing.len() > MAX_HEADER_VALUE_LENGTH {
                    return Err(Error::HeaderTooLarge);
                }
            }
            None => {
                if self.map.len() >= MAX_HEADER_COUNT {
                    return Err(Error::HeaderTooLarge);
                }
                self.map.insert(key, value.to_string());
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over `(normalized key, value)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(&normalize_key(key))
    }
}
