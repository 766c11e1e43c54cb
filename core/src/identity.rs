//! Aggregate identity types.
//!
//! A single-stream projection keys each aggregate by the stream it was folded
//! from. [`AggregateIdentity::from_stream`] performs that conversion for the
//! built-in identifier types, and [`value_identity!`](crate::value_identity)
//! extends it to strong-typed wrappers such as `struct OrderId(Uuid)`.

use crate::stream::StreamIdentity;
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// Identifier type of an aggregate document.
///
/// Multi-stream projections compute identities with their own functions and
/// never call [`from_stream`](Self::from_stream) on the hot path, but every
/// identity type still implements it so the same document type can be used
/// by both slicer flavours.
pub trait AggregateIdentity:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Derive the identity from a stream identity.
    ///
    /// Returns `None` when the stream is identified in a form this type
    /// cannot represent (for example a non-UUID key for a `Uuid` identity).
    /// Backends that store stream ids as text read UUID-shaped keys back as
    /// GUIDs, so both built-in types accept either variant when the value
    /// fits.
    fn from_stream(stream: &StreamIdentity) -> Option<Self>;
}

impl AggregateIdentity for Uuid {
    fn from_stream(stream: &StreamIdentity) -> Option<Self> {
        match stream {
            StreamIdentity::Guid(id) => Some(*id),
            StreamIdentity::Key(key) => Uuid::parse_str(key).ok(),
        }
    }
}

impl AggregateIdentity for String {
    fn from_stream(stream: &StreamIdentity) -> Option<Self> {
        Some(stream.to_string())
    }
}

/// Implement [`AggregateIdentity`] for a single-field tuple struct wrapping
/// `Uuid` or `String`.
///
/// The wrapper must already implement `Clone`, `Eq`, `Hash`, `Debug` and
/// `Display`.
///
/// # Examples
///
/// ```
/// use foldline_core::identity::AggregateIdentity;
/// use foldline_core::stream::StreamIdentity;
/// use foldline_core::value_identity;
/// use uuid::Uuid;
///
/// #[derive(Clone, Debug, PartialEq, Eq, Hash)]
/// struct OrderId(Uuid);
///
/// impl std::fmt::Display for OrderId {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "{}", self.0)
///     }
/// }
///
/// value_identity!(OrderId, Uuid);
///
/// let raw = Uuid::new_v4();
/// assert_eq!(OrderId::from_stream(&StreamIdentity::Guid(raw)), Some(OrderId(raw)));
/// ```
#[macro_export]
macro_rules! value_identity {
    ($wrapper:ident, $inner:ty) => {
        impl $crate::identity::AggregateIdentity for $wrapper {
            fn from_stream(stream: &$crate::stream::StreamIdentity) -> Option<Self> {
                <$inner as $crate::identity::AggregateIdentity>::from_stream(stream).map($wrapper)
            }
        }
    };
}
