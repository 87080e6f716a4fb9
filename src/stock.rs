//! Ledger domain records: transactions, balance history, and read receipts.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{PacketSize, TxSeq};

/// Direction of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Packets produced into finished-goods stock.
    Add,
    /// Packets sold, rejected, or physically removed.
    Remove,
}

/// Immutable audit-trail entry. Exactly one of `added`/`removed` is non-zero.
///
/// `resulting_balance` is redundant with the balance log by construction and
/// is co-located here so a single record is auditable on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Record sequence; equals the journal op sequence that produced it.
    pub seq: TxSeq,
    /// Packet size this entry belongs to.
    pub size: PacketSize,
    /// Packets added, zero for removals.
    pub added: u64,
    /// Packets removed, zero for additions.
    pub removed: u64,
    /// Balance for `size` after this entry was applied.
    pub resulting_balance: u64,
    /// Direction of the entry.
    pub kind: TxKind,
    /// Caller-supplied business date; may differ from the recorded time.
    pub effective_date: NaiveDate,
    /// Wall-clock time the entry was recorded, milliseconds since epoch.
    pub recorded_at_ms: u64,
}

/// Append-only balance snapshot. The latest record per size is the current
/// balance; older records are kept for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Packet size this snapshot belongs to.
    pub size: PacketSize,
    /// Finished-goods packet count after the mutation.
    pub balance: u64,
    /// Wall-clock time the snapshot was recorded, milliseconds since epoch.
    pub recorded_at_ms: u64,
}

/// Current state of one raw-material pool.
///
/// Raw material has current-value semantics, not a ledger: pouches are whole
/// units, base ingredient is whole grams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialLevel {
    /// Material pool this level describes.
    pub category: crate::types::MaterialCategory,
    /// Quantity on hand, in the category's unit.
    pub quantity: u64,
    /// Wall-clock time of the last mutation, milliseconds since epoch.
    pub updated_at_ms: u64,
}

/// Result of a completed add or remove, returned to the caller together with
/// the refreshed advisory ceiling for the same size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceipt {
    /// Packet size the operation targeted.
    pub size: PacketSize,
    /// Authoritative balance after the operation.
    pub balance: u64,
    /// Maximum packets of `size` producible from remaining raw material.
    pub max_producible: u64,
}

/// Inclusive effective-date filter for history queries. Either bound may be
/// open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    /// Earliest effective date included, unbounded when `None`.
    pub from: Option<NaiveDate>,
    /// Latest effective date included, unbounded when `None`.
    pub to: Option<NaiveDate>,
}

impl DateRange {
    /// Returns true when `date` falls inside both bounds.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
    }
}
