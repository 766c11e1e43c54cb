//! Event trait and the records the projection engine folds.
//!
//! User events implement [`Event`]. Once committed to the log, each event is
//! wrapped in an [`EventRecord`] that carries the metadata assigned at commit
//! time: the global sequence number, the stream it belongs to, its version
//! within that stream, its tenant and its timestamp.
//!
//! Event payloads are serialized with `bincode`; [`SerializedEvent`] is the
//! wire shape used when side effects append new events.
//!
//! # Example
//!
//! ```
//! use foldline_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum OrderEvent {
//!     OrderPlaced { order_id: String, total: f64 },
//!     OrderShipped { order_id: String, tracking: String },
//! }
//!
//! impl Event for OrderEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             OrderEvent::OrderPlaced { .. } => "OrderPlaced.v1",
//!             OrderEvent::OrderShipped { .. } => "OrderShipped.v1",
//!         }
//!     }
//! }
//! ```

use crate::stream::StreamIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// An immutable fact appended to a stream.
///
/// # Event Naming Convention
///
/// The `event_type()` method should return a stable string identifier that includes
/// a version number. This allows for schema evolution over time. For example:
///
/// - `"OrderPlaced.v1"`
/// - `"OrderCancelled.v1"`
/// - `"OrderShipped.v2"` (after schema change)
///
/// # Serialization
///
/// Events are serialized to binary format using `bincode` for performance and
/// storage efficiency. The trait provides default implementations that work for
/// any type implementing `Serialize` and `DeserializeOwned`.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` to be safely passed between threads
/// in the async runtime and stored in the event store.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    ///
    /// This string is used for:
    /// - Storing the event type in the log
    /// - Filtering fetched ranges down to the types a projection handles
    /// - Dispatching delete triggers and multi-stream identity functions
    ///
    /// # Convention
    ///
    /// Use a descriptive name with a version suffix:
    /// - `"OrderPlaced.v1"`
    /// - `"PaymentProcessed.v2"`
    ///
    /// # Examples
    ///
    /// ```
    /// use foldline_core::event::Event;
    /// # use serde::{Serialize, Deserialize};
    ///
    /// #[derive(Clone, Debug, Serialize, Deserialize)]
    /// enum OrderEvent {
    ///     OrderPlaced { order_id: String },
    /// }
    ///
    /// impl Event for OrderEvent {
    ///     fn event_type(&self) -> &'static str {
    ///         match self {
    ///             OrderEvent::OrderPlaced { .. } => "OrderPlaced.v1",
    ///         }
    ///     }
    /// }
    /// ```
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    /// This can happen if the event contains unsupported types, though this is rare
    /// with bincode.
    ///
    /// # Examples
    ///
    /// ```
    /// use foldline_core::event::Event;
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # enum OrderEvent {
    /// #     OrderPlaced { order_id: String },
    /// # }
    /// # impl Event for OrderEvent {
    /// #     fn event_type(&self) -> &'static str { "OrderPlaced.v1" }
    /// # }
    ///
    /// let event = OrderEvent::OrderPlaced {
    ///     order_id: "order-123".to_string(),
    /// };
    ///
    /// let bytes = event.to_bytes().expect("serialization should succeed");
    /// assert!(!bytes.is_empty());
    /// ```
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes cannot be deserialized
    /// into this event type. This can happen if:
    /// - The bytes are corrupted
    /// - The bytes represent a different event type
    /// - The event schema has changed incompatibly
    ///
    /// # Examples
    ///
    /// ```
    /// use foldline_core::event::Event;
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    /// # enum OrderEvent {
    /// #     OrderPlaced { order_id: String },
    /// # }
    /// # impl Event for OrderEvent {
    /// #     fn event_type(&self) -> &'static str { "OrderPlaced.v1" }
    /// # }
    ///
    /// let original = OrderEvent::OrderPlaced {
    ///     order_id: "order-123".to_string(),
    /// };
    ///
    /// let bytes = original.to_bytes().unwrap();
    /// let deserialized = OrderEvent::from_bytes(&bytes).unwrap();
    ///
    /// assert_eq!(original, deserialized);
    /// ```
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized event ready for storage.
///
/// This struct contains the event type name and the serialized bytes,
/// along with optional metadata. Side effects raised while folding are
/// carried to the log in this shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "OrderPlaced.v1").
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata in JSONB format.
    ///
    /// Common metadata fields:
    /// - `correlation_id`: Links related events across aggregates
    /// - `causation_id`: Links cause-and-effect events
    /// - `user_id`: The user who triggered this event
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    ///
    /// # Examples
    ///
    /// ```
    /// use foldline_core::event::SerializedEvent;
    ///
    /// let event = SerializedEvent::new(
    ///     "OrderPlaced.v1".to_string(),
    ///     vec![1, 2, 3, 4],
    ///     None,
    /// );
    /// ```
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an `Event` trait object.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use foldline_core::event::{Event, SerializedEvent};
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # enum OrderEvent {
    /// #     OrderPlaced { order_id: String },
    /// # }
    /// # impl Event for OrderEvent {
    /// #     fn event_type(&self) -> &'static str { "OrderPlaced.v1" }
    /// # }
    ///
    /// let event = OrderEvent::OrderPlaced {
    ///     order_id: "order-123".to_string(),
    /// };
    ///
    /// let serialized = SerializedEvent::from_event(&event, None).unwrap();
    /// assert_eq!(serialized.event_type, "OrderPlaced.v1");
    /// ```
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// Tenant that owns an event and the documents projected from it.
///
/// Single-tenant stores use [`TenantId::default`], which maps to the
/// `*DEFAULT*` tenant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// Identifier of the implicit tenant used when none is configured.
    pub const DEFAULT: &'static str = "*DEFAULT*";

    /// Create a tenant identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the tenant identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the implicit default tenant.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A committed event together with the metadata the log assigned to it.
///
/// Records are immutable once committed. The engine shares them between
/// slices as `Arc<EventRecord<E>>`, since a multi-stream projection may route
/// one event to several aggregates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord<E> {
    /// Unique event identifier.
    pub id: Uuid,

    /// Global sequence number, assigned at commit time. Monotonic but
    /// gap-tolerant.
    pub sequence: u64,

    /// Stream this event was appended to.
    pub stream: StreamIdentity,

    /// Version within the stream, strictly increasing from 1.
    pub version: u64,

    /// The user event.
    pub data: E,

    /// Owning tenant.
    pub tenant_id: TenantId,

    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
}

impl<E> EventRecord<E> {
    /// Create a record for the default tenant, timestamped now, with a fresh id.
    ///
    /// # Examples
    ///
    /// ```
    /// use foldline_core::event::{EventRecord, TenantId};
    /// use foldline_core::stream::StreamIdentity;
    ///
    /// let record = EventRecord::new(42, StreamIdentity::key("order-1"), 3, "payload")
    ///     .with_tenant(TenantId::new("acme"));
    /// assert_eq!(record.sequence, 42);
    /// assert_eq!(record.tenant_id.as_str(), "acme");
    /// ```
    #[must_use]
    pub fn new(sequence: u64, stream: StreamIdentity, version: u64, data: E) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            stream,
            version,
            data,
            tenant_id: TenantId::default(),
            timestamp: Utc::now(),
        }
    }

    /// Set the owning tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Set the commit timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the event id.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }
}

impl<E: Event> EventRecord<E> {
    /// Type tag of the wrapped event.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.data.event_type()
    }
}
