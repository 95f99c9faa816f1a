//! Decode failures and non-fatal warnings.

use std::fmt;

use thiserror::Error;

/// Errors that abort the current decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// A read ran past the end of the buffer.
    #[error("unexpected end of data: wanted {wanted} bytes at offset {pos} of {len}")]
    Truncated { pos: usize, wanted: usize, len: usize },
    /// Unrecognized magic, version or structurally impossible header.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    /// A count, length or index exceeded its documented maximum.
    #[error("{field} out of range ({value})")]
    OutOfRange { field: String, value: i64 },
    /// No decoder claimed the input.
    #[error("unrecognized format")]
    Unrecognized,
}

impl FormatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        FormatError::InvalidHeader(msg.into())
    }

    pub fn out_of_range(field: impl Into<String>, value: impl Into<i64>) -> Self {
        FormatError::OutOfRange { field: field.into(), value: value.into() }
    }
}

pub type Result<T> = std::result::Result<T, FormatError>;

/// A recognized feature that was not translated, or translated lossily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning(pub String);

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Warning collector returned alongside a decoded song.
///
/// Identical messages are recorded once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warnings {
    items: Vec<Warning>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.items.iter().any(|w| w.0 == msg) {
            return;
        }
        tracing::warn!("{}", msg);
        self.items.push(Warning(msg));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.items.iter()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.items.iter().any(|w| w.0.contains(needle))
    }
}

impl IntoIterator for Warnings {
    type Item = Warning;
    type IntoIter = std::vec::IntoIter<Warning>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_deduplicate() {
        let mut w = Warnings::new();
        w.push("effect I not supported");
        w.push("effect I not supported");
        w.push("tremor not supported");
        assert_eq!(w.len(), 2);
        assert!(w.contains("tremor"));
    }

    #[test]
    fn out_of_range_message() {
        let e = FormatError::out_of_range("order 3 on channel 1", 200);
        assert_eq!(e.to_string(), "order 3 on channel 1 out of range (200)");
    }
}
