//! Stream identification.
//!
//! Every event belongs to exactly one stream. Stores identify streams either
//! by GUID or by string key; [`StreamIdentity`] covers both so one engine can
//! serve either configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for `StreamIdentity` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream identity: {0}")]
pub struct ParseStreamIdError(String);

/// Identity of an event stream (one entity's history).
///
/// # Parsing
///
/// `FromStr` produces [`StreamIdentity::Guid`] for anything that parses as a
/// UUID and [`StreamIdentity::Key`] otherwise. Empty input is rejected.
///
/// # Examples
///
/// ```
/// use foldline_core::stream::StreamIdentity;
/// use uuid::Uuid;
///
/// let key = StreamIdentity::key("order-12345");
/// assert_eq!(key.to_string(), "order-12345");
///
/// let id = Uuid::new_v4();
/// let parsed: StreamIdentity = id.to_string().parse().unwrap();
/// assert_eq!(parsed, StreamIdentity::Guid(id));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamIdentity {
    /// Stream identified by GUID.
    Guid(Uuid),
    /// Stream identified by string key.
    Key(String),
}

impl StreamIdentity {
    /// Create a string-keyed stream identity.
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// Create a GUID stream identity.
    #[must_use]
    pub const fn guid(id: Uuid) -> Self {
        Self::Guid(id)
    }

    /// The GUID, if this stream is GUID-identified.
    #[must_use]
    pub const fn as_guid(&self) -> Option<Uuid> {
        match self {
            Self::Guid(id) => Some(*id),
            Self::Key(_) => None,
        }
    }

    /// The string key, if this stream is key-identified.
    #[must_use]
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Self::Guid(_) => None,
            Self::Key(key) => Some(key),
        }
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guid(id) => write!(f, "{id}"),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

impl FromStr for StreamIdentity {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("stream identity cannot be empty".to_string()));
        }
        Ok(Uuid::parse_str(s).map_or_else(|_| Self::Key(s.to_string()), Self::Guid))
    }
}

impl From<Uuid> for StreamIdentity {
    fn from(id: Uuid) -> Self {
        Self::Guid(id)
    }
}

impl From<String> for StreamIdentity {
    fn from(s: String) -> Self {
        Self::Key(s)
    }
}

impl From<&str> for StreamIdentity {
    fn from(s: &str) -> Self {
        Self::Key(s.to_string())
    }
}

/// Whether a slice begins its stream or continues an existing one.
///
/// A single-stream slice whose first event is version 1 is a `Start`: the
/// aggregate is known not to exist yet, so the runtime skips loading it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamActionType {
    /// The slice contains the first event of its stream.
    Start,
    /// The slice continues a stream that already has events.
    Append,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_constructor() {
        let id = StreamIdentity::key("order-123");
        assert_eq!(id.as_key(), Some("order-123"));
        assert_eq!(id.as_guid(), None);
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
    fn parse_prefers_guid() {
        let id = Uuid::new_v4();
        let parsed: StreamIdentity = id.to_string().parse().expect("should parse");
        assert_eq!(parsed, StreamIdentity::Guid(id));
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
    fn parse_falls_back_to_key() {
        let parsed: StreamIdentity = "customer-abc".parse().expect("should parse");
        assert_eq!(parsed, StreamIdentity::key("customer-abc"));
    }

    #[test]
    fn parse_empty_string_fails() {
        let result: Result<StreamIdentity, _> = "".parse();
        assert!(result.is_err());
    }

    #[test]
    fn display() {
        let id = Uuid::new_v4();
        assert_eq!(StreamIdentity::Guid(id).to_string(), id.to_string());
        assert_eq!(StreamIdentity::key("cart-9").to_string(), "cart-9");
    }
}
