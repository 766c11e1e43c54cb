//! # Foldline Core
//!
//! Data model and collaborator traits for the Foldline projection engine.
//!
//! Foldline folds an append-only, globally sequenced event log into
//! materialized aggregate documents. This crate holds everything the engine
//! and its storage backends agree on:
//!
//! - **Events**: [`event::EventRecord`] wraps a user event with its global
//!   sequence, stream identity, stream version and tenant
//! - **Aggregates**: the [`aggregate::Aggregator`] capability trait and the
//!   [`aggregate::EventSlice`] unit of work it folds
//! - **Storage**: opaque [`operation::StorageOperation`]s grouped into
//!   [`operation::OperationPage`]s, produced by [`storage::DocumentStorage`]
//! - **Collaborators**: [`event_log::EventLog`], [`event_log::EventSource`],
//!   [`session::SessionExecutor`], [`session::CommitListener`] and
//!   [`session::MessageOutbox`]
//! - **Subscriptions**: [`subscription::Subscription`], a shard consuming
//!   raw event ranges without aggregation
//! - **Configuration**: [`config::DaemonSettings`]
//!
//! The engine itself lives in `foldline-projections`; a Postgres backend lives
//! in `foldline-postgres` and in-memory collaborators in `foldline-testing`.
//!
//! ## Example
//!
//! ```
//! use foldline_core::event::{Event, EventRecord};
//! use foldline_core::stream::StreamIdentity;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum CartEvent {
//!     Opened,
//!     ItemAdded { sku: String },
//! }
//!
//! impl Event for CartEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             CartEvent::Opened => "CartOpened.v1",
//!             CartEvent::ItemAdded { .. } => "CartItemAdded.v1",
//!         }
//!     }
//! }
//!
//! let record = EventRecord::new(1, StreamIdentity::key("cart-1"), 1, CartEvent::Opened);
//! assert_eq!(record.event_type(), "CartOpened.v1");
//! ```

use std::future::Future;
use std::pin::Pin;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod event;
pub mod event_log;
pub mod identity;
pub mod operation;
pub mod progress;
pub mod session;
pub mod storage;
pub mod stream;
pub mod subscription;

/// Boxed, `Send` future returned by the dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Environment module - injected dependencies
///
/// External dependencies are abstracted behind traits so tests can swap
/// them for deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The high-water detector reads the clock to compute its safe-zone
    /// horizon.
    ///
    /// # Examples
    ///
    /// ```
    /// use foldline_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
