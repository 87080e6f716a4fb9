//! Journal operation model and persistence wrappers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{MaterialCategory, OpSeq, PacketSize};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Material drawn from one pool by an add operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDraw {
    /// Pool the material came from.
    pub category: MaterialCategory,
    /// Amount drawn, in the pool's unit.
    pub amount: u64,
}

/// Immutable operation appended to the journal.
///
/// Ops record the amounts that were actually committed (consumed material,
/// resulting balance) so replay applies history verbatim even if consumption
/// rates change later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Packets produced; material consumed in the same commit.
    Add {
        /// Packet size produced.
        size: PacketSize,
        /// Packets added.
        quantity: u64,
        /// Caller-supplied business date.
        effective_date: NaiveDate,
        /// Material drawn per pool for this batch.
        consumed: Vec<MaterialDraw>,
        /// Balance for `size` after the commit.
        resulting_balance: u64,
    },
    /// Packets removed; raw material is not restored.
    Remove {
        /// Packet size removed.
        size: PacketSize,
        /// Packets removed.
        quantity: u64,
        /// Caller-supplied business date.
        effective_date: NaiveDate,
        /// Balance for `size` after the commit.
        resulting_balance: u64,
    },
    /// Direct raw-material restock or write-off.
    Adjust {
        /// Pool adjusted.
        category: MaterialCategory,
        /// Signed change applied to the pool.
        delta: i64,
        /// Pool quantity after the commit.
        resulting_quantity: u64,
    },
}

/// Journal row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// Monotonic operation sequence.
    pub seq: OpSeq,
    /// Operation timestamp in milliseconds.
    pub ts_ms: u64,
    /// Operation body.
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
