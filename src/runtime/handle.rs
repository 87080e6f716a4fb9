use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};

use crate::{
    core::ledger::{LedgerError, StockLedger},
    engine::capacity::{CapacityBoard, CapacityCeiling},
    op::StoredOp,
    persist::{OpSink, PersistError},
    stock::{DateRange, MaterialLevel, StockReceipt, TransactionRecord},
    types::{MaterialCategory, OpSeq, PacketSize},
};

use super::events::StockEvent;

/// Business rejection plus the authoritative state at rejection time, so a
/// caller can render reality without a second round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Why the ledger refused the operation.
    pub reason: LedgerError,
    /// Current count of the targeted entity: packet balance for add/remove,
    /// pool quantity for material adjustments.
    pub balance: u64,
    /// Current advisory ceiling for the targeted size; for material
    /// adjustments, the smallest ceiling across sizes (the bound the pool
    /// most tightly constrains).
    pub max_producible: u64,
}

/// Failure surface of the runtime handle.
///
/// `Rejected` is a business outcome and must not be retried blindly;
/// `Persist` means the operation was refused before any state changed and is
/// safe to resubmit.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{}", .0.reason)]
    Rejected(Rejection),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("runtime channel closed")]
    ChannelClosed,
}

/// Tuning knobs for the runtime loop and persistence worker.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Flush the journal eagerly after every add.
    pub flush_on_add: bool,
    /// Max ops buffered before a forced journal write.
    pub batch_max_ops: usize,
    /// Max milliseconds an op may sit unflushed.
    pub batch_max_latency_ms: u64,
    /// Bound of the persistence queue; overflow rejects the write.
    pub persist_queue_bound: usize,
    /// Ops between automatic checkpoints, zero to disable.
    pub snapshot_every_ops: usize,
    /// Delete journaled ops covered by an automatic checkpoint.
    pub compact_after_snapshot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_add: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
        }
    }
}

/// Bounded exponential backoff for resubmitting infrastructure failures.
///
/// Business rejections are never retried; see
/// [`PackLogHandle::add_packets_retrying`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: usize,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Upper bound on the per-attempt delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow(attempt as u32);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Cloneable front door to the single-writer runtime loop.
pub struct PackLogHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<StockEvent>,
}

impl Clone for PackLogHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

enum Command {
    Add {
        size: PacketSize,
        quantity: u64,
        effective_date: chrono::NaiveDate,
        resp: oneshot::Sender<Result<StockReceipt, RuntimeError>>,
    },
    Remove {
        size: PacketSize,
        quantity: u64,
        effective_date: chrono::NaiveDate,
        resp: oneshot::Sender<Result<StockReceipt, RuntimeError>>,
    },
    AdjustMaterial {
        category: MaterialCategory,
        delta: i64,
        resp: oneshot::Sender<Result<MaterialLevel, RuntimeError>>,
    },
    SetMaterial {
        category: MaterialCategory,
        quantity: u64,
        resp: oneshot::Sender<Result<MaterialLevel, RuntimeError>>,
    },
    Balances {
        resp: oneshot::Sender<Vec<(PacketSize, u64)>>,
    },
    Material {
        category: MaterialCategory,
        resp: oneshot::Sender<MaterialLevel>,
    },
    History {
        size: Option<PacketSize>,
        range: DateRange,
        resp: oneshot::Sender<Vec<TransactionRecord>>,
    },
    Ceiling {
        size: PacketSize,
        resp: oneshot::Sender<Option<CapacityCeiling>>,
    },
    Ceilings {
        resp: oneshot::Sender<Vec<CapacityCeiling>>,
    },
    Flush {
        resp: oneshot::Sender<Result<OpSeq, RuntimeError>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    // Ceilings that changed with this op ride along so cache writes never
    // compete with ops for queue slots.
    Op(StoredOp, Vec<CapacityCeiling>),
    Ceilings(Vec<CapacityCeiling>),
    Flush {
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: crate::core::ledger::LedgerSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Spawns the runtime loop owning `ledger` and returns its handle.
///
/// Without a sink the ledger is memory-only and every applied op is
/// immediately reported durable.
pub fn spawn_packlog(
    ledger: StockLedger,
    sink: Option<Box<dyn OpSink>>,
    config: RuntimeConfig,
) -> PackLogHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<StockEvent>(1024);

    let (persist_tx_opt, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound);
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<OpSeq, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut ledger = ledger;
        let mut board = CapacityBoard::new(ledger.profile().clone());
        let mut ops_since_snapshot = 0usize;

        tracing::info!(last_seq = ledger.latest_op_seq(), "packlog runtime started");

        // Replayed ledgers may come up with non-empty pools; seed the board
        // and forward any ops applied before the spawn.
        let seeded = board.recompute(ledger.material_snapshot(), now_ms());
        if let Some(tx) = persist_tx_opt.as_ref() {
            for stored in ledger.drain_pending_ops() {
                if tx.try_send(PersistMsg::Op(stored, Vec::new())).is_err() {
                    tracing::warn!("persistence queue full at spawn, op deferred to next flush");
                    break;
                }
            }
            if !seeded.is_empty() && tx.try_send(PersistMsg::Ceilings(seeded)).is_err() {
                tracing::warn!("persistence queue full at spawn, ceiling cache left stale");
            }
        }

        loop {
            if let Some(rx) = durable_rx.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break; };
                        let done = handle_command(
                            cmd,
                            &mut ledger,
                            &mut board,
                            &events_tx_loop,
                            persist_tx_opt.as_ref(),
                            &config,
                            &mut ops_since_snapshot,
                        ).await;

                        if done {
                            break;
                        }
                    }
                    durable = rx.recv() => {
                        if let Some(Ok(op_seq)) = durable {
                            let _ = events_tx_loop.send(StockEvent::DurableUpTo { op_seq });
                        }
                    }
                }
            } else {
                let Some(cmd) = cmd_rx.recv().await else { break; };
                let done = handle_command(
                    cmd,
                    &mut ledger,
                    &mut board,
                    &events_tx_loop,
                    persist_tx_opt.as_ref(),
                    &config,
                    &mut ops_since_snapshot,
                ).await;
                if done {
                    break;
                }
            }
        }

        tracing::info!("packlog runtime stopped");
    });

    PackLogHandle { cmd_tx, events_tx }
}

impl PackLogHandle {
    /// Subscribes to the runtime event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StockEvent> {
        self.events_tx.subscribe()
    }

    /// Produces packets, consuming raw material. Returns the new balance and
    /// refreshed ceiling for `size`.
    pub async fn add_packets(
        &self,
        size: PacketSize,
        quantity: u64,
        effective_date: chrono::NaiveDate,
    ) -> Result<StockReceipt, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Add {
                size,
                quantity,
                effective_date,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Removes packets from finished-goods stock.
    pub async fn remove_packets(
        &self,
        size: PacketSize,
        quantity: u64,
        effective_date: chrono::NaiveDate,
    ) -> Result<StockReceipt, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Remove {
                size,
                quantity,
                effective_date,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Like [`PackLogHandle::add_packets`], resubmitting on infrastructure
    /// failure per `policy`. Business rejections return immediately.
    pub async fn add_packets_retrying(
        &self,
        size: PacketSize,
        quantity: u64,
        effective_date: chrono::NaiveDate,
        policy: &RetryPolicy,
    ) -> Result<StockReceipt, RuntimeError> {
        let mut attempt = 0;
        loop {
            match self.add_packets(size, quantity, effective_date).await {
                Err(RuntimeError::Persist(err)) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts.max(1) {
                        return Err(RuntimeError::Persist(err));
                    }
                    tokio::time::sleep(policy.delay(attempt - 1)).await;
                }
                other => return other,
            }
        }
    }

    /// Like [`PackLogHandle::remove_packets`], resubmitting on
    /// infrastructure failure per `policy`.
    pub async fn remove_packets_retrying(
        &self,
        size: PacketSize,
        quantity: u64,
        effective_date: chrono::NaiveDate,
        policy: &RetryPolicy,
    ) -> Result<StockReceipt, RuntimeError> {
        let mut attempt = 0;
        loop {
            match self.remove_packets(size, quantity, effective_date).await {
                Err(RuntimeError::Persist(err)) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts.max(1) {
                        return Err(RuntimeError::Persist(err));
                    }
                    tokio::time::sleep(policy.delay(attempt - 1)).await;
                }
                other => return other,
            }
        }
    }

    /// Restocks (positive) or writes off (negative) one material pool.
    /// Ceilings recompute before the call returns.
    pub async fn adjust_material(
        &self,
        category: MaterialCategory,
        delta: i64,
    ) -> Result<MaterialLevel, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AdjustMaterial {
                category,
                delta,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Sets one material pool to an absolute quantity (stocktake).
    pub async fn set_material(
        &self,
        category: MaterialCategory,
        quantity: u64,
    ) -> Result<MaterialLevel, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetMaterial {
                category,
                quantity,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Current balance of every size, in weight order.
    pub async fn balances(&self) -> Result<Vec<(PacketSize, u64)>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Balances { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Current level of one material pool.
    pub async fn material(&self, category: MaterialCategory) -> Result<MaterialLevel, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Material { category, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Audit-trail query, effective date descending.
    pub async fn history(
        &self,
        size: Option<PacketSize>,
        range: DateRange,
    ) -> Result<Vec<TransactionRecord>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::History {
                size,
                range,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Latest advisory ceiling for `size`.
    pub async fn ceiling(&self, size: PacketSize) -> Result<Option<CapacityCeiling>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Ceiling { size, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Every known advisory ceiling, in weight order.
    pub async fn ceilings(&self) -> Result<Vec<CapacityCeiling>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Ceilings { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Forces the journal to disk; returns the highest durable sequence.
    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Writes a full-state checkpoint snapshot.
    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkpoint { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Flushes outstanding ops and stops the runtime.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }
}

async fn handle_command(
    cmd: Command,
    ledger: &mut StockLedger,
    board: &mut CapacityBoard,
    events_tx: &broadcast::Sender<StockEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) -> bool {
    match cmd {
        Command::Add {
            size,
            quantity,
            effective_date,
            resp,
        } => {
            let res = apply_packet_op(ledger, board, events_tx, persist_tx, size, |ledger| {
                ledger.add_packets(size, quantity, effective_date)
            })
            .map(|receipt| {
                let _ = events_tx.send(StockEvent::Added {
                    size,
                    quantity,
                    balance: receipt.balance,
                });
                receipt
            });
            if res.is_ok() {
                *ops_since_snapshot += 1;
                maybe_auto_checkpoint(ledger, persist_tx, config, ops_since_snapshot).await;
            }
            let _ = resp.send(res);
        }
        Command::Remove {
            size,
            quantity,
            effective_date,
            resp,
        } => {
            let res = apply_packet_op(ledger, board, events_tx, persist_tx, size, |ledger| {
                ledger.remove_packets(size, quantity, effective_date)
            })
            .map(|receipt| {
                let _ = events_tx.send(StockEvent::Removed {
                    size,
                    quantity,
                    balance: receipt.balance,
                });
                receipt
            });
            if res.is_ok() {
                *ops_since_snapshot += 1;
                maybe_auto_checkpoint(ledger, persist_tx, config, ops_since_snapshot).await;
            }
            let _ = resp.send(res);
        }
        Command::AdjustMaterial {
            category,
            delta,
            resp,
        } => {
            let res = apply_material_op(ledger, board, events_tx, persist_tx, category, |ledger| {
                ledger
                    .adjust_material(category, delta)
                    .map(|(level, stored)| (level, Some(stored)))
            });
            let _ = resp.send(res);
        }
        Command::SetMaterial {
            category,
            quantity,
            resp,
        } => {
            let res = apply_material_op(ledger, board, events_tx, persist_tx, category, |ledger| {
                ledger.set_material(category, quantity)
            });
            let _ = resp.send(res);
        }
        Command::Balances { resp } => {
            let _ = resp.send(ledger.balances());
        }
        Command::Material { category, resp } => {
            let _ = resp.send(ledger.material(category));
        }
        Command::History { size, range, resp } => {
            let _ = resp.send(ledger.history(size, range));
        }
        Command::Ceiling { size, resp } => {
            let _ = resp.send(board.ceiling(size));
        }
        Command::Ceilings { resp } => {
            let _ = resp.send(board.all());
        }
        Command::Flush { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (flush_tx, flush_rx) = oneshot::channel();
                if tx.send(PersistMsg::Flush { resp: flush_tx }).await.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    flush_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(ledger.latest_op_seq())
            };
            let _ = resp.send(out);
        }
        Command::Checkpoint { resp } => {
            let out = if let Some(tx) = persist_tx {
                let snapshot = ledger.export_snapshot();
                let last_seq = ledger.latest_op_seq();
                let (cp_tx, cp_rx) = oneshot::channel();
                if tx
                    .send(PersistMsg::Checkpoint {
                        snapshot,
                        last_seq,
                        compact: config.compact_after_snapshot,
                        resp: cp_tx,
                    })
                    .await
                    .is_err()
                {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    cp_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(())
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (done_tx, done_rx) = oneshot::channel();
                let send_res = tx.send(PersistMsg::Shutdown { resp: done_tx }).await;
                if send_res.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    match done_rx.await {
                        Ok(()) => Ok(()),
                        Err(_) => Err(RuntimeError::ChannelClosed),
                    }
                }
            } else {
                Ok(())
            };
            let _ = resp.send(out);
            return true;
        }
    }

    false
}

/// Applies one packet mutation with reserve-first durability: the persist
/// queue slot is claimed before the ledger mutates, so a queue-full failure
/// refuses the operation with no state changed and the caller may retry.
fn apply_packet_op(
    ledger: &mut StockLedger,
    board: &mut CapacityBoard,
    events_tx: &broadcast::Sender<StockEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    size: PacketSize,
    op: impl FnOnce(&mut StockLedger) -> Result<(StockReceipt, StoredOp), LedgerError>,
) -> Result<StockReceipt, RuntimeError> {
    let permit = match persist_tx {
        Some(tx) => match tx.try_reserve() {
            Ok(permit) => Some(permit),
            Err(err) => {
                tracing::error!(%size, "persistence queue unavailable: {err}");
                return Err(RuntimeError::Persist(PersistError::Message(format!(
                    "persist queue error: {err}"
                ))));
            }
        },
        None => None,
    };

    match op(ledger) {
        Ok((receipt, stored)) => {
            ledger.drain_pending_ops();
            tracing::debug!(%size, seq = stored.seq, balance = receipt.balance, "packet op applied");
            let changed = refresh_ceilings(ledger, board, events_tx);
            match permit {
                Some(permit) => permit.send(PersistMsg::Op(stored, changed)),
                None => {
                    let _ = events_tx.send(StockEvent::DurableUpTo {
                        op_seq: ledger.latest_op_seq(),
                    });
                }
            }
            Ok(receipt)
        }
        Err(reason) => {
            tracing::debug!(%size, %reason, "packet op rejected");
            Err(RuntimeError::Rejected(Rejection {
                reason,
                balance: ledger.balance(size),
                max_producible: ledger.max_producible(size),
            }))
        }
    }
}

/// Material-pool variant of [`apply_packet_op`]; `set_material` may be a
/// journal-free no-op, in which case the reserved slot is released unused.
fn apply_material_op(
    ledger: &mut StockLedger,
    board: &mut CapacityBoard,
    events_tx: &broadcast::Sender<StockEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    category: MaterialCategory,
    op: impl FnOnce(&mut StockLedger) -> Result<(MaterialLevel, Option<StoredOp>), LedgerError>,
) -> Result<MaterialLevel, RuntimeError> {
    let permit = match persist_tx {
        Some(tx) => match tx.try_reserve() {
            Ok(permit) => Some(permit),
            Err(err) => {
                tracing::error!(%category, "persistence queue unavailable: {err}");
                return Err(RuntimeError::Persist(PersistError::Message(format!(
                    "persist queue error: {err}"
                ))));
            }
        },
        None => None,
    };

    match op(ledger) {
        Ok((level, stored)) => {
            ledger.drain_pending_ops();
            if let Some(stored) = stored {
                tracing::debug!(%category, seq = stored.seq, quantity = level.quantity, "material adjusted");
                let changed = refresh_ceilings(ledger, board, events_tx);
                match permit {
                    Some(permit) => permit.send(PersistMsg::Op(stored, changed)),
                    None => {
                        let _ = events_tx.send(StockEvent::DurableUpTo {
                            op_seq: ledger.latest_op_seq(),
                        });
                    }
                }
                let _ = events_tx.send(StockEvent::MaterialAdjusted {
                    category,
                    quantity: level.quantity,
                });
            }
            Ok(level)
        }
        Err(reason) => {
            tracing::debug!(%category, %reason, "material adjustment rejected");
            let tightest = PacketSize::ALL
                .iter()
                .map(|&s| ledger.max_producible(s))
                .min()
                .unwrap_or(0);
            Err(RuntimeError::Rejected(Rejection {
                reason,
                balance: ledger.material(category).quantity,
                max_producible: tightest,
            }))
        }
    }
}

fn refresh_ceilings(
    ledger: &StockLedger,
    board: &mut CapacityBoard,
    events_tx: &broadcast::Sender<StockEvent>,
) -> Vec<CapacityCeiling> {
    let changed = board.recompute(ledger.material_snapshot(), now_ms());
    for ceiling in &changed {
        let _ = events_tx.send(StockEvent::CeilingChanged {
            size: ceiling.size,
            max_producible: ceiling.max_producible,
        });
    }
    changed
}

fn spawn_persistence_worker(
    sink: Box<dyn OpSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        let mut buf = Vec::<StoredOp>::new();
        let mut pending_ceilings = Vec::<CapacityCeiling>::new();
        let mut deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
        let mut last_durable: OpSeq = 0;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                        write_ceiling_cache(&sink, &mut pending_ceilings).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Op(stored, ceilings) => {
                            let is_add = matches!(stored.op, crate::op::Op::Add { .. });
                            buf.push(stored);
                            merge_ceilings(&mut pending_ceilings, ceilings);

                            if buf.len() >= config.batch_max_ops || (config.flush_on_add && is_add) {
                                let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                                write_ceiling_cache(&sink, &mut pending_ceilings).await;
                                deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                            }
                        }
                        PersistMsg::Ceilings(ceilings) => {
                            merge_ceilings(&mut pending_ceilings, ceilings);
                            write_ceiling_cache(&sink, &mut pending_ceilings).await;
                        }
                        PersistMsg::Flush { resp } => {
                            let result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            write_ceiling_cache(&sink, &mut pending_ceilings).await;
                            let _ = resp.send(result.map(|_| last_durable));
                            deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                        }
                        PersistMsg::Checkpoint { snapshot, last_seq, compact, resp } => {
                            let flush_result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            write_ceiling_cache(&sink, &mut pending_ceilings).await;
                            let result = if let Err(err) = flush_result {
                                Err(err)
                            } else {
                                let sink_ref = Arc::clone(&sink);
                                match tokio::task::spawn_blocking(move || {
                                    let mut sink = sink_ref.blocking_lock();
                                    sink.write_snapshot(&snapshot, last_seq)?;
                                    if compact {
                                        let _ = sink.compact_through(last_seq)?;
                                    }
                                    Result::<(), PersistError>::Ok(())
                                }).await {
                                    Ok(inner) => inner,
                                    Err(e) => Err(PersistError::Message(format!("join error: {e}"))),
                                }
                            };
                            if result.is_ok() {
                                tracing::info!(last_seq, "checkpoint written");
                            }
                            let _ = resp.send(result);
                            deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            write_ceiling_cache(&sink, &mut pending_ceilings).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !buf.is_empty() => {
                    let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, false).await;
                    write_ceiling_cache(&sink, &mut pending_ceilings).await;
                    deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                }
            }
        }
    });
}

fn merge_ceilings(pending: &mut Vec<CapacityCeiling>, incoming: Vec<CapacityCeiling>) {
    for ceiling in incoming {
        match pending.iter_mut().find(|c| c.size == ceiling.size) {
            Some(slot) => *slot = ceiling,
            None => pending.push(ceiling),
        }
    }
}

/// Flushes buffered ceiling updates. Failures only warn: the cache is
/// advisory and the next change rewrites it.
async fn write_ceiling_cache(
    sink: &Arc<Mutex<Box<dyn OpSink>>>,
    pending: &mut Vec<CapacityCeiling>,
) {
    if pending.is_empty() {
        return;
    }
    let ceilings = std::mem::take(pending);
    let sink_ref = Arc::clone(sink);
    let res = tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        sink.write_ceilings(&ceilings)
    })
    .await;
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!("ceiling cache write failed: {err}"),
        Err(err) => tracing::warn!("ceiling cache write join error: {err}"),
    }
}

async fn flush_buf(
    sink: &Arc<Mutex<Box<dyn OpSink>>>,
    buf: &mut Vec<StoredOp>,
    last_durable: &mut OpSeq,
    durable_tx: &mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    call_flush: bool,
) -> Result<(), PersistError> {
    if buf.is_empty() {
        if call_flush {
            let sink_ref = Arc::clone(sink);
            tokio::task::spawn_blocking(move || {
                let mut sink = sink_ref.blocking_lock();
                sink.flush()
            })
            .await
            .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
        }
        return Ok(());
    }

    let ops = std::mem::take(buf);
    let sink_ref = Arc::clone(sink);
    let append_res: Result<OpSeq, PersistError> = tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        let seq = sink.append_ops(&ops)?;
        if call_flush {
            sink.flush()?;
        }
        Ok(seq)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match append_res {
        Ok(seq) => {
            *last_durable = (*last_durable).max(seq);
            let _ = durable_tx.send(Ok(*last_durable));
            Ok(())
        }
        Err(err) => {
            tracing::error!("journal append failed: {err}");
            let _ = durable_tx.send(Err(PersistError::Message(format!("append failed: {err}"))));
            Err(err)
        }
    }
}

async fn maybe_auto_checkpoint(
    ledger: &StockLedger,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) {
    if config.snapshot_every_ops == 0 || *ops_since_snapshot < config.snapshot_every_ops {
        return;
    }

    let Some(tx) = persist_tx else {
        return;
    };

    let snapshot = ledger.export_snapshot();
    let last_seq = ledger.latest_op_seq();
    let (cp_tx, cp_rx) = oneshot::channel();
    if tx
        .send(PersistMsg::Checkpoint {
            snapshot,
            last_seq,
            compact: config.compact_after_snapshot,
            resp: cp_tx,
        })
        .await
        .is_ok()
    {
        let _ = cp_rx.await;
        *ops_since_snapshot = 0;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
