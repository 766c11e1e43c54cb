//! The Foldline projection engine.
//!
//! # Overview
//!
//! This crate turns a gapped, globally sequenced event log into committed
//! aggregate documents. One pass of a shard runs these stages in order:
//!
//! 1. [`HighWaterDetector`] finds the largest contiguous prefix of the log
//!    that is safe to consume
//! 2. an [`EventSlicer`] groups the fetched events into per-identity
//!    [`EventSlice`](foldline_core::aggregate::EventSlice)s, per tenant
//! 3. the [`AggregationRuntime`] resolves prior state (cache, then one
//!    multi-get), folds each slice through the user's
//!    [`Aggregator`](foldline_core::aggregate::Aggregator) and queues the
//!    resulting storage operations
//! 4. the [`ProjectionUpdateBatch`] serializes those operations into ordered
//!    pages and executes them in one transaction, with commit listeners
//!
//! [`ShardAgent`] drives the loop for one async projection. Subscriptions
//! (shards that consume raw ranges without aggregating) run through the
//! same agent via [`ShardAgent::subscription`]. [`ProjectionDaemon`] starts
//! and stops a set of uniquely named shards together.
//!
//! # Example
//!
//! ```ignore
//! use foldline_projections::{AggregationRuntime, ShardAgent, SingleStreamSlicer};
//!
//! let runtime = AggregationRuntime::builder(OrderAggregator, storage, SingleStreamSlicer::new())
//!     .cache_limit_per_tenant(1_000)
//!     .build()?;
//! let runtime = std::sync::Arc::new(runtime);
//!
//! let mut daemon = ProjectionDaemon::new();
//! daemon.add(ShardAgent::new("Order:All", runtime, collaborators, settings))?;
//! let running = daemon.start();
//! running.stop().await;
//! ```

pub mod agent;
pub mod batch;
pub mod cache;
pub mod daemon;
pub mod high_water;
pub mod metrics;
pub mod runtime;
pub mod session;
pub mod slicer;

// Re-export main types for convenience
pub use agent::{ShardAgent, ShardCollaborators, ShardProcessor, SubscriptionShard};
pub use batch::{BatchOptions, BatchState, ProjectionUpdateBatch};
pub use cache::{AggregateCache, NulloAggregateCache, RecentlyUsedCache};
pub use daemon::{ProjectionDaemon, RunningDaemon};
pub use high_water::HighWaterDetector;
pub use runtime::{AggregationRuntime, AggregationRuntimeBuilder, RuntimeOptions};
pub use session::{IdentityMap, InlineUnitOfWork, ProjectionSession};
pub use slicer::{EventSlicer, MultiStreamSlicer, SingleStreamSlicer};
