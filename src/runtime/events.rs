//! Runtime event stream payloads.

use crate::types::{MaterialCategory, OpSeq, PacketSize};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockEvent {
    /// Packets were produced into stock.
    Added {
        /// Targeted packet size.
        size: PacketSize,
        /// Packets added.
        quantity: u64,
        /// Balance after the operation.
        balance: u64,
    },
    /// Packets were removed from stock.
    Removed {
        /// Targeted packet size.
        size: PacketSize,
        /// Packets removed.
        quantity: u64,
        /// Balance after the operation.
        balance: u64,
    },
    /// A material pool was restocked or written off directly.
    MaterialAdjusted {
        /// Adjusted pool.
        category: MaterialCategory,
        /// Pool quantity after the adjustment.
        quantity: u64,
    },
    /// A size's advisory ceiling moved.
    CeilingChanged {
        /// Affected packet size.
        size: PacketSize,
        /// New producible bound.
        max_producible: u64,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
}
