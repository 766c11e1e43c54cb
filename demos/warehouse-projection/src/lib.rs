//! Warehouse stock projections.
//!
//! Bins are opened for a SKU, receive stock, have stock picked from them and
//! are eventually retired. Two async projections read the same log:
//!
//! ```text
//!                      ┌────────────────────────┐
//!                 ┌───▶│ Bin:All      (per bin) │  single-stream
//! ┌───────────┐   │    └────────────────────────┘
//! │ event log │───┤
//! └───────────┘   │    ┌────────────────────────┐
//!                 └───▶│ SkuStock:All (per SKU) │  multi-stream
//!                      └────────────────────────┘
//! ```
//!
//! [`BinProjection`] keeps one document per bin and publishes a
//! `bin.low_stock` message when a pick leaves a bin below
//! [`LOW_STOCK_THRESHOLD`]. [`SkuStockProjection`] sums stock per SKU across
//! every bin, routed by [`sku_slicer`].

use foldline_core::aggregate::{Aggregator, EventSlice, Fold};
use foldline_core::error::BoxError;
use foldline_core::event::{Event, EventRecord};
use foldline_core::session::OutboundMessage;
use foldline_core::storage::AggregateDocument;
use foldline_projections::MultiStreamSlicer;
use serde::{Deserialize, Serialize};

/// Document type of [`Bin`].
pub const BIN_DOCUMENT: &str = "bin";
/// Document type of [`SkuStock`].
pub const SKU_DOCUMENT: &str = "sku_stock";
/// Picks leaving fewer units than this raise `bin.low_stock`.
pub const LOW_STOCK_THRESHOLD: u32 = 5;

/// Events recorded against a bin's stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    /// A bin was opened for `sku`.
    BinOpened {
        /// Stock keeping unit stored in the bin.
        sku: String,
    },
    /// Units were put away into the bin.
    Received {
        /// SKU received.
        sku: String,
        /// Units received.
        quantity: u32,
    },
    /// Units were picked from the bin.
    Picked {
        /// SKU picked.
        sku: String,
        /// Units picked.
        quantity: u32,
    },
    /// The bin's contents were relabelled to another SKU.
    Relabelled {
        /// Previous SKU.
        from: String,
        /// New SKU.
        to: String,
        /// Units moved.
        quantity: u32,
    },
    /// The bin was taken out of service.
    BinRetired,
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::BinOpened { .. } => "BinOpened.v1",
            Self::Received { .. } => "StockReceived.v1",
            Self::Picked { .. } => "StockPicked.v1",
            Self::Relabelled { .. } => "BinRelabelled.v1",
            Self::BinRetired => "BinRetired.v1",
        }
    }
}

// ============================================================================
// Bin:All
// ============================================================================

/// Current contents of one bin.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bin {
    /// Bin identifier, the stream key.
    pub id: String,
    /// SKU currently stored.
    pub sku: String,
    /// Units on hand.
    pub quantity: u32,
    /// Stream version this document reflects.
    pub version: u64,
}

impl AggregateDocument for Bin {
    type Id = String;

    fn identity(&self) -> String {
        self.id.clone()
    }

    fn set_identity(&mut self, id: &String) {
        self.id.clone_from(id);
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Picking more than a bin holds.
#[derive(Debug)]
pub struct InsufficientStock {
    /// Units in the bin.
    pub available: u32,
    /// Units requested.
    pub requested: u32,
}

impl std::fmt::Display for InsufficientStock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot pick {} units from a bin holding {}",
            self.requested, self.available
        )
    }
}

impl std::error::Error for InsufficientStock {}

/// One document per bin. Retiring a bin deletes it.
pub struct BinProjection;

impl Aggregator for BinProjection {
    type Document = Bin;
    type Event = StockEvent;

    fn event_types(&self) -> &[&'static str] {
        &[
            "BinOpened.v1",
            "StockReceived.v1",
            "StockPicked.v1",
            "BinRelabelled.v1",
            "BinRetired.v1",
        ]
    }

    fn delete_event_types(&self) -> &[&'static str] {
        &["BinRetired.v1"]
    }

    fn create(&self, event: &EventRecord<StockEvent>) -> Result<Option<Bin>, BoxError> {
        match &event.data {
            StockEvent::BinOpened { sku } => Ok(Some(Bin {
                sku: sku.clone(),
                ..Bin::default()
            })),
            _ => Ok(None),
        }
    }

    fn apply(&self, bin: &mut Bin, event: &EventRecord<StockEvent>) -> Result<Fold<Bin>, BoxError> {
        match &event.data {
            StockEvent::BinOpened { sku } => bin.sku.clone_from(sku),
            StockEvent::Received { quantity, .. } => bin.quantity += quantity,
            StockEvent::Picked { quantity, .. } => {
                bin.quantity = bin.quantity.checked_sub(*quantity).ok_or(InsufficientStock {
                    available: bin.quantity,
                    requested: *quantity,
                })?;
            }
            StockEvent::Relabelled { to, .. } => bin.sku.clone_from(to),
            StockEvent::BinRetired => {}
        }
        Ok(Fold::Keep)
    }

    fn raise_side_effects(&self, slice: &mut EventSlice<Bin, StockEvent>) -> Result<(), BoxError> {
        let picked = slice
            .last_event()
            .is_some_and(|event| matches!(event.data, StockEvent::Picked { .. }));
        let Some(bin) = slice.aggregate().filter(|bin| picked && bin.quantity < LOW_STOCK_THRESHOLD)
        else {
            return Ok(());
        };

        let body = serde_json::json!({
            "bin": slice.id(),
            "sku": bin.sku,
            "quantity": bin.quantity,
        });
        slice.publish_message(OutboundMessage::new("bin.low_stock", body));
        Ok(())
    }
}

// ============================================================================
// SkuStock:All
// ============================================================================

/// Stock of one SKU summed across bins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuStock {
    /// The SKU.
    pub id: String,
    /// Units on hand across every bin.
    pub on_hand: u32,
    /// Units picked so far.
    pub picked: u32,
    /// Relabels into or out of this SKU.
    pub relabels: u32,
}

impl AggregateDocument for SkuStock {
    type Id = String;

    fn identity(&self) -> String {
        self.id.clone()
    }

    fn set_identity(&mut self, id: &String) {
        self.id.clone_from(id);
    }
}

/// Stock per SKU across every bin stream.
pub struct SkuStockProjection;

impl Aggregator for SkuStockProjection {
    type Document = SkuStock;
    type Event = StockEvent;

    fn event_types(&self) -> &[&'static str] {
        &["StockReceived.v1", "StockPicked.v1", "BinRelabelled.v1"]
    }

    fn default_document(&self) -> Option<SkuStock> {
        Some(SkuStock::default())
    }

    fn apply(
        &self,
        stock: &mut SkuStock,
        event: &EventRecord<StockEvent>,
    ) -> Result<Fold<SkuStock>, BoxError> {
        match &event.data {
            StockEvent::Received { quantity, .. } => stock.on_hand += quantity,
            StockEvent::Picked { quantity, .. } => {
                stock.on_hand = stock.on_hand.saturating_sub(*quantity);
                stock.picked += quantity;
            }
            StockEvent::Relabelled { .. } => stock.relabels += 1,
            StockEvent::BinOpened { .. } | StockEvent::BinRetired => {}
        }
        Ok(Fold::Keep)
    }
}

/// Route stock events to their SKU. A relabel touches both SKUs.
#[must_use]
pub fn sku_slicer() -> MultiStreamSlicer<SkuStock, StockEvent> {
    fn sku_of(event: &EventRecord<StockEvent>) -> Option<String> {
        match &event.data {
            StockEvent::Received { sku, .. } | StockEvent::Picked { sku, .. } => Some(sku.clone()),
            _ => None,
        }
    }

    MultiStreamSlicer::new()
        .identity("StockReceived.v1", sku_of)
        .identity("StockPicked.v1", sku_of)
        .identities("BinRelabelled.v1", |event| match &event.data {
            StockEvent::Relabelled { from, to, .. } => vec![from.clone(), to.clone()],
            _ => Vec::new(),
        })
}
