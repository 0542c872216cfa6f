use std::fmt;
use std::str::FromStr;

use crate::error::{ManifestError, ManifestResult};

/// An ordered set of `key = value` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueRecord {
    entries: Vec<(String, String)>,
}

impl KeyValueRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, replacing an existing value in place.
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value of a key that must be present.
    pub fn require(&self, key: &str) -> ManifestResult<&str> {
        self.get(key)
            .ok_or_else(|| ManifestError::MissingKey(key.to_string()))
    }

    /// Parse the value of a required key.
    pub fn parse<T: FromStr>(&self, key: &str) -> ManifestResult<T> {
        let value = self.require(key)?;
        value.parse().map_err(|_| ManifestError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_text(text: &str) -> ManifestResult<Self> {
        let mut record = Self::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ManifestError::Malformed {
                line: i + 1,
                reason: format!("expected key = value, got {line:?}"),
            })?;
            record.set(key.trim(), value.trim());
        }
        Ok(record)
    }

    pub fn from_bytes(data: &[u8]) -> ManifestResult<Self> {
        let text = std::str::from_utf8(data).map_err(|e| ManifestError::Malformed {
            line: 0,
            reason: e.to_string(),
        })?;
        Self::from_text(text)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for KeyValueRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{key} = {value}")?;
        }
        Ok(())
    }
}
