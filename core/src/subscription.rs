//! Subscriptions: shards that see raw event ranges instead of slices.
//!
//! A subscription is driven by the same agent loop as an aggregate
//! projection, with the same high-water detection and progression tracking,
//! but skips slicing and folding. Each committed range is handed over as-is
//! together with the unit of work of the pass, so whatever the subscription
//! queues commits atomically with the shard's progression.
//!
//! # Example
//!
//! ```
//! use foldline_core::BoxFuture;
//! use foldline_core::cancellation::CancellationSignal;
//! use foldline_core::error::ProjectionError;
//! use foldline_core::event::EventRecord;
//! use foldline_core::progress::EventRange;
//! use foldline_core::session::{OutboundMessage, UnitOfWork};
//! use foldline_core::subscription::Subscription;
//! use std::sync::Arc;
//!
//! struct Forwarder;
//!
//! impl Subscription<String> for Forwarder {
//!     fn process_events<'a>(
//!         &'a self,
//!         _range: &'a EventRange,
//!         events: &'a [Arc<EventRecord<String>>],
//!         unit_of_work: &'a Arc<dyn UnitOfWork>,
//!         _cancel: &'a CancellationSignal,
//!     ) -> BoxFuture<'a, Result<(), ProjectionError>> {
//!         Box::pin(async move {
//!             let batch = unit_of_work.message_batch().await?;
//!             for event in events {
//!                 let body = serde_json::json!({ "data": event.data });
//!                 batch.publish(OutboundMessage::new("forwarded", body)).await?;
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::BoxFuture;
use crate::cancellation::CancellationSignal;
use crate::error::ProjectionError;
use crate::event::EventRecord;
use crate::progress::EventRange;
use crate::session::UnitOfWork;
use std::sync::Arc;

/// Consumer of committed event ranges.
pub trait Subscription<E>: Send + Sync + 'static {
    /// Event types fetched for this subscription. Empty means every type.
    fn event_types(&self) -> &[&'static str] {
        &[]
    }

    /// Handle the events of `range`, ascending by sequence.
    ///
    /// Operations queued on `unit_of_work` commit in the same transaction as
    /// the shard's progression. `events` may be empty when the range only
    /// held types this subscription does not handle.
    ///
    /// # Errors
    ///
    /// Any error fails the pass; nothing of it commits and the range is
    /// retried on the next pass.
    fn process_events<'a>(
        &'a self,
        range: &'a EventRange,
        events: &'a [Arc<EventRecord<E>>],
        unit_of_work: &'a Arc<dyn UnitOfWork>,
        cancel: &'a CancellationSignal,
    ) -> BoxFuture<'a, Result<(), ProjectionError>>;
}
