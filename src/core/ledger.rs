use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    op::{MaterialDraw, Op, StoredOp},
    profile::{ConsumptionProfile, MaterialSnapshot},
    stock::{BalanceRecord, DateRange, MaterialLevel, StockReceipt, TransactionRecord, TxKind},
    types::{MaterialCategory, OpSeq, PacketSize},
};

/// Why the ledger rejected an operation, or why a journal could not be
/// replayed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Quantity was zero or arithmetically unrepresentable.
    #[error("invalid quantity: {quantity}")]
    InvalidQuantity {
        /// Rejected quantity.
        quantity: u64,
    },
    /// A required material pool cannot cover the operation.
    #[error("insufficient {material} stock: need {required}, have {available}")]
    InsufficientMaterial {
        /// The limiting material.
        material: MaterialCategory,
        /// Amount the operation needs.
        required: u64,
        /// Amount currently on hand.
        available: u64,
    },
    /// A removal asked for more packets than the size holds.
    #[error("insufficient {size} balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Targeted packet size.
        size: PacketSize,
        /// Packets the removal asked for.
        requested: u64,
        /// Current balance.
        available: u64,
    },
    /// A replayed op does not fit the state the journal itself produced.
    #[error("replay mismatch at seq {seq}: {detail}")]
    ReplayMismatch {
        /// Sequence of the offending op.
        seq: OpSeq,
        /// Human-readable discrepancy.
        detail: String,
    },
}

/// Serializable full-state snapshot used for checkpointing and journal
/// compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshotV1 {
    pub next_op_seq: OpSeq,
    pub transactions: Vec<TransactionRecord>,
    pub balance_log: Vec<BalanceRecord>,
    pub materials: Vec<MaterialLevel>,
}

/// Authoritative finished-goods ledger and raw-material pool.
///
/// All writes go through the single-writer runtime loop, so an operation
/// either fails before touching any field or completes every mutation; there
/// is no partially applied state for another operation to observe.
#[derive(Debug)]
pub struct StockLedger {
    profile: ConsumptionProfile,
    transactions: Vec<TransactionRecord>,
    by_size: HashMap<PacketSize, Vec<usize>>,
    balance_log: Vec<BalanceRecord>,
    current: HashMap<PacketSize, u64>,
    materials: HashMap<MaterialCategory, MaterialLevel>,
    pending_ops: Vec<StoredOp>,
    next_op_seq: OpSeq,
}

impl StockLedger {
    /// Creates an empty ledger: every balance zero, every pool empty.
    pub fn new(profile: ConsumptionProfile) -> Self {
        let mut materials = HashMap::new();
        for category in MaterialCategory::ALL {
            materials.insert(
                category,
                MaterialLevel {
                    category,
                    quantity: 0,
                    updated_at_ms: 0,
                },
            );
        }
        Self {
            profile,
            transactions: Vec::new(),
            by_size: HashMap::new(),
            balance_log: Vec::new(),
            current: HashMap::new(),
            materials,
            pending_ops: Vec::new(),
            next_op_seq: 1,
        }
    }

    /// Rebuilds a ledger from a checkpoint snapshot.
    pub fn from_snapshot(
        profile: ConsumptionProfile,
        snapshot: LedgerSnapshotV1,
    ) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(profile);
        ledger.next_op_seq = snapshot.next_op_seq;

        for (idx, tx) in snapshot.transactions.iter().enumerate() {
            ledger.by_size.entry(tx.size).or_default().push(idx);
        }
        ledger.transactions = snapshot.transactions;

        for rec in &snapshot.balance_log {
            ledger.current.insert(rec.size, rec.balance);
        }
        ledger.balance_log = snapshot.balance_log;

        for level in snapshot.materials {
            ledger.materials.insert(level.category, level);
        }
        Ok(ledger)
    }

    /// Exports the full state for checkpointing.
    pub fn export_snapshot(&self) -> LedgerSnapshotV1 {
        let mut materials: Vec<MaterialLevel> = Vec::with_capacity(MaterialCategory::ALL.len());
        for category in MaterialCategory::ALL {
            materials.push(self.material(category));
        }
        LedgerSnapshotV1 {
            next_op_seq: self.next_op_seq,
            transactions: self.transactions.clone(),
            balance_log: self.balance_log.clone(),
            materials,
        }
    }

    /// Produces `quantity` packets of `size`, consuming raw material.
    ///
    /// Validates everything before mutating anything: a returned error means
    /// no state changed.
    pub fn add_packets(
        &mut self,
        size: PacketSize,
        quantity: u64,
        effective_date: NaiveDate,
    ) -> Result<(StockReceipt, StoredOp), LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity { quantity });
        }
        let draws = self
            .profile
            .draws(size, quantity)
            .ok_or(LedgerError::InvalidQuantity { quantity })?;
        for draw in &draws {
            let available = self.material(draw.category).quantity;
            if available < draw.amount {
                return Err(LedgerError::InsufficientMaterial {
                    material: draw.category,
                    required: draw.amount,
                    available,
                });
            }
        }
        let resulting_balance = self
            .balance(size)
            .checked_add(quantity)
            .ok_or(LedgerError::InvalidQuantity { quantity })?;

        let seq = self.take_next_op_seq();
        let ts_ms = now_ms();
        self.commit_add(seq, ts_ms, size, quantity, effective_date, &draws, resulting_balance);

        let stored = StoredOp {
            seq,
            ts_ms,
            op: Op::Add {
                size,
                quantity,
                effective_date,
                consumed: draws,
                resulting_balance,
            },
        };
        self.pending_ops.push(stored.clone());
        Ok((self.receipt(size), stored))
    }

    /// Removes `quantity` packets of `size` from finished-goods stock.
    ///
    /// Raw material is not restored: a removal is a sale or write-off, not a
    /// production reversal. Misproduced batches are corrected through
    /// [`StockLedger::adjust_material`].
    pub fn remove_packets(
        &mut self,
        size: PacketSize,
        quantity: u64,
        effective_date: NaiveDate,
    ) -> Result<(StockReceipt, StoredOp), LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity { quantity });
        }
        let available = self.balance(size);
        if quantity > available {
            return Err(LedgerError::InsufficientBalance {
                size,
                requested: quantity,
                available,
            });
        }
        let resulting_balance = available - quantity;

        let seq = self.take_next_op_seq();
        let ts_ms = now_ms();
        self.commit_remove(seq, ts_ms, size, quantity, effective_date, resulting_balance);

        let stored = StoredOp {
            seq,
            ts_ms,
            op: Op::Remove {
                size,
                quantity,
                effective_date,
                resulting_balance,
            },
        };
        self.pending_ops.push(stored.clone());
        Ok((self.receipt(size), stored))
    }

    /// Applies a signed restock (positive) or write-off (negative) to one
    /// material pool. Fails without mutation if the pool would go negative.
    pub fn adjust_material(
        &mut self,
        category: MaterialCategory,
        delta: i64,
    ) -> Result<(MaterialLevel, StoredOp), LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidQuantity { quantity: 0 });
        }
        let available = self.material(category).quantity;
        let resulting_quantity = if delta >= 0 {
            available
                .checked_add(delta as u64)
                .ok_or(LedgerError::InvalidQuantity {
                    quantity: delta as u64,
                })?
        } else {
            let debit = delta.unsigned_abs();
            if available < debit {
                return Err(LedgerError::InsufficientMaterial {
                    material: category,
                    required: debit,
                    available,
                });
            }
            available - debit
        };

        let seq = self.take_next_op_seq();
        let ts_ms = now_ms();
        self.commit_adjust(seq, ts_ms, category, resulting_quantity);

        let stored = StoredOp {
            seq,
            ts_ms,
            op: Op::Adjust {
                category,
                delta,
                resulting_quantity,
            },
        };
        self.pending_ops.push(stored.clone());
        Ok((self.material(category), stored))
    }

    /// Sets one material pool to an absolute quantity (stocktake semantics).
    ///
    /// Journals the equivalent delta; setting a pool to its current value is
    /// a no-op and produces no journal entry.
    pub fn set_material(
        &mut self,
        category: MaterialCategory,
        quantity: u64,
    ) -> Result<(MaterialLevel, Option<StoredOp>), LedgerError> {
        let current = self.material(category).quantity;
        if quantity == current {
            return Ok((self.material(category), None));
        }
        let delta = if quantity > current {
            i64::try_from(quantity - current).map_err(|_| LedgerError::InvalidQuantity {
                quantity: quantity - current,
            })?
        } else {
            -i64::try_from(current - quantity).map_err(|_| LedgerError::InvalidQuantity {
                quantity: current - quantity,
            })?
        };
        let (level, stored) = self.adjust_material(category, delta)?;
        Ok((level, Some(stored)))
    }

    /// Re-applies a journaled op during replay. Amounts come from the op
    /// itself, never from the profile, so history replays verbatim.
    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), LedgerError> {
        let seq = stored.seq;
        let ts_ms = stored.ts_ms;
        match stored.op {
            Op::Add {
                size,
                quantity,
                effective_date,
                consumed,
                resulting_balance,
            } => {
                for draw in &consumed {
                    let available = self.material(draw.category).quantity;
                    if available < draw.amount {
                        return Err(LedgerError::ReplayMismatch {
                            seq,
                            detail: format!(
                                "add consumes {} {} but pool holds {available}",
                                draw.amount, draw.category
                            ),
                        });
                    }
                }
                let expected = self.balance(size).checked_add(quantity);
                if expected != Some(resulting_balance) {
                    return Err(LedgerError::ReplayMismatch {
                        seq,
                        detail: format!(
                            "add of {quantity} {size} does not reach balance {resulting_balance}"
                        ),
                    });
                }
                self.commit_add(seq, ts_ms, size, quantity, effective_date, &consumed, resulting_balance);
            }
            Op::Remove {
                size,
                quantity,
                effective_date,
                resulting_balance,
            } => {
                let available = self.balance(size);
                if quantity > available || available - quantity != resulting_balance {
                    return Err(LedgerError::ReplayMismatch {
                        seq,
                        detail: format!(
                            "remove of {quantity} {size} from {available} does not reach balance {resulting_balance}"
                        ),
                    });
                }
                self.commit_remove(seq, ts_ms, size, quantity, effective_date, resulting_balance);
            }
            Op::Adjust {
                category,
                delta,
                resulting_quantity,
            } => {
                let available = self.material(category).quantity;
                let expected = if delta >= 0 {
                    available.checked_add(delta as u64)
                } else {
                    available.checked_sub(delta.unsigned_abs())
                };
                if expected != Some(resulting_quantity) {
                    return Err(LedgerError::ReplayMismatch {
                        seq,
                        detail: format!(
                            "adjust of {delta} {category} from {available} does not reach {resulting_quantity}"
                        ),
                    });
                }
                self.commit_adjust(seq, ts_ms, category, resulting_quantity);
            }
        }
        self.bump_next_seq_from(seq);
        Ok(())
    }

    /// Current balance for `size`; zero on cold start.
    pub fn balance(&self, size: PacketSize) -> u64 {
        self.current.get(&size).copied().unwrap_or(0)
    }

    /// Current balance of every size, in weight order.
    pub fn balances(&self) -> Vec<(PacketSize, u64)> {
        PacketSize::ALL
            .iter()
            .map(|&size| (size, self.balance(size)))
            .collect()
    }

    /// Current level of one material pool.
    pub fn material(&self, category: MaterialCategory) -> MaterialLevel {
        self.materials
            .get(&category)
            .cloned()
            .unwrap_or(MaterialLevel {
                category,
                quantity: 0,
                updated_at_ms: 0,
            })
    }

    /// Current levels of both pools as a ceiling-computation input.
    pub fn material_snapshot(&self) -> MaterialSnapshot {
        MaterialSnapshot {
            pouches: self.material(MaterialCategory::Pouch).quantity,
            base_grams: self.material(MaterialCategory::BaseIngredient).quantity,
        }
    }

    /// Maximum packets of `size` producible from the current pools.
    pub fn max_producible(&self, size: PacketSize) -> u64 {
        self.profile.producible(size, self.material_snapshot())
    }

    /// Audit-trail query: transactions filtered by size and effective-date
    /// range, ordered by effective date descending (ties by sequence
    /// descending, i.e. most recently recorded first).
    pub fn history(&self, size: Option<PacketSize>, range: DateRange) -> Vec<TransactionRecord> {
        let mut out: Vec<TransactionRecord> = match size {
            Some(size) => self
                .by_size
                .get(&size)
                .into_iter()
                .flat_map(|idxs| idxs.iter())
                .map(|&idx| self.transactions[idx].clone())
                .filter(|tx| range.contains(tx.effective_date))
                .collect(),
            None => self
                .transactions
                .iter()
                .filter(|tx| range.contains(tx.effective_date))
                .cloned()
                .collect(),
        };
        out.sort_by(|a, b| {
            b.effective_date
                .cmp(&a.effective_date)
                .then(b.seq.cmp(&a.seq))
        });
        out
    }

    /// Full transaction log in recorded (replay) order.
    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.transactions
    }

    /// Full balance history in recorded order.
    pub fn balance_log(&self) -> &[BalanceRecord] {
        &self.balance_log
    }

    /// Consumption rates this ledger was built with.
    pub fn profile(&self) -> &ConsumptionProfile {
        &self.profile
    }

    /// Takes ownership of ops applied since the last drain, for journaling.
    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        std::mem::take(&mut self.pending_ops)
    }

    /// Sequence of the most recently applied op, zero if none.
    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    fn receipt(&self, size: PacketSize) -> StockReceipt {
        StockReceipt {
            size,
            balance: self.balance(size),
            max_producible: self.max_producible(size),
        }
    }

    // Commit helpers mutate unconditionally; every fallible check happens
    // before the first call.

    fn commit_add(
        &mut self,
        seq: OpSeq,
        ts_ms: u64,
        size: PacketSize,
        quantity: u64,
        effective_date: NaiveDate,
        draws: &[MaterialDraw],
        resulting_balance: u64,
    ) {
        for draw in draws {
            let level = self.materials.entry(draw.category).or_insert(MaterialLevel {
                category: draw.category,
                quantity: 0,
                updated_at_ms: 0,
            });
            level.quantity -= draw.amount;
            level.updated_at_ms = ts_ms;
        }
        self.append_records(
            seq,
            ts_ms,
            size,
            quantity,
            0,
            TxKind::Add,
            effective_date,
            resulting_balance,
        );
    }

    fn commit_remove(
        &mut self,
        seq: OpSeq,
        ts_ms: u64,
        size: PacketSize,
        quantity: u64,
        effective_date: NaiveDate,
        resulting_balance: u64,
    ) {
        self.append_records(
            seq,
            ts_ms,
            size,
            0,
            quantity,
            TxKind::Remove,
            effective_date,
            resulting_balance,
        );
    }

    fn commit_adjust(
        &mut self,
        _seq: OpSeq,
        ts_ms: u64,
        category: MaterialCategory,
        resulting_quantity: u64,
    ) {
        let level = self.materials.entry(category).or_insert(MaterialLevel {
            category,
            quantity: 0,
            updated_at_ms: 0,
        });
        level.quantity = resulting_quantity;
        level.updated_at_ms = ts_ms;
    }

    #[allow(clippy::too_many_arguments)]
    fn append_records(
        &mut self,
        seq: OpSeq,
        ts_ms: u64,
        size: PacketSize,
        added: u64,
        removed: u64,
        kind: TxKind,
        effective_date: NaiveDate,
        resulting_balance: u64,
    ) {
        self.balance_log.push(BalanceRecord {
            size,
            balance: resulting_balance,
            recorded_at_ms: ts_ms,
        });
        self.current.insert(size, resulting_balance);

        let idx = self.transactions.len();
        self.transactions.push(TransactionRecord {
            seq,
            size,
            added,
            removed,
            resulting_balance,
            kind,
            effective_date,
            recorded_at_ms: ts_ms,
        });
        self.by_size.entry(size).or_default().push(idx);
    }

    fn take_next_op_seq(&mut self) -> OpSeq {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        seq
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
