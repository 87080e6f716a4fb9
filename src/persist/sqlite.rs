//! SQLite-backed append-only op journal sink.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::{
    core::ledger::{LedgerSnapshotV1, StockLedger},
    engine::capacity::CapacityCeiling,
    op::{Op, StoredOp, StoredOpEnvelope},
    profile::{ConsumptionProfile, MaterialSnapshot},
    types::{OpSeq, PacketSize},
};

use super::{OpSink, PersistError, PersistResult};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u16,
    snapshot: LedgerSnapshotV1,
}

/// SQLite implementation of [`crate::persist::OpSink`].
pub struct SqliteOpSink {
    conn: Connection,
}

impl SqliteOpSink {
    /// Opens or creates a SQLite-backed sink at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Loads ledger state from the latest snapshot plus tail ops.
    pub fn load_ledger(&self, profile: ConsumptionProfile) -> PersistResult<StockLedger> {
        let mut ledger = if let Some(snapshot) = self.load_latest_snapshot()? {
            StockLedger::from_snapshot(profile, snapshot)?
        } else {
            StockLedger::new(profile)
        };

        let events = self.load_events_after(ledger.latest_op_seq())?;
        for event in events {
            ledger.apply_replayed_op(event)?;
        }
        Ok(ledger)
    }

    /// Loads ops strictly after `seq`, in sequence order.
    pub fn load_events_after(&self, seq: OpSeq) -> PersistResult<Vec<StoredOp>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, ts_ms, payload FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let rows = stmt.query_map(params![seq], |row| {
            let seq: i64 = row.get(0)?;
            let ts_ms: i64 = row.get(1)?;
            let payload: Vec<u8> = row.get(2)?;
            let mut op = decode_stored_op_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            op.seq = seq as OpSeq;
            op.ts_ms = ts_ms as u64;
            Ok(op)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Writes a snapshot covering `last_seq`.
    pub fn write_snapshot(
        &mut self,
        snapshot: &LedgerSnapshotV1,
        last_seq: OpSeq,
    ) -> PersistResult<()> {
        let env = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        let ts_ms = now_ms();
        self.conn.execute(
            "INSERT INTO snapshots(last_seq, ts_ms, payload) VALUES (?1, ?2, ?3)",
            params![last_seq as i64, ts_ms as i64, payload],
        )?;
        Ok(())
    }

    /// Deletes ops up to and including `seq`.
    pub fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        let count = self
            .conn
            .execute("DELETE FROM events WHERE seq <= ?1", params![seq as i64])?;
        Ok(count)
    }

    /// Returns the latest sequence persisted in the events table.
    pub fn latest_seq(&self) -> PersistResult<OpSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))
            .optional()?;
        Ok(seq.unwrap_or(0) as OpSeq)
    }

    /// Reads back the advisory ceiling cache, in weight order.
    pub fn load_ceilings(&self) -> PersistResult<Vec<CapacityCeiling>> {
        let mut stmt = self.conn.prepare(
            "SELECT size, max_producible, pouches, base_grams, updated_at_ms FROM ceilings",
        )?;
        let rows = stmt.query_map([], |row| {
            let label: String = row.get(0)?;
            let max_producible: i64 = row.get(1)?;
            let pouches: i64 = row.get(2)?;
            let base_grams: i64 = row.get(3)?;
            let updated_at_ms: i64 = row.get(4)?;
            Ok((label, max_producible, pouches, base_grams, updated_at_ms))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (label, max_producible, pouches, base_grams, updated_at_ms) = row?;
            let Some(size) = PacketSize::from_label(&label) else {
                return Err(PersistError::Message(format!(
                    "unknown packet size in ceiling cache: {label}"
                )));
            };
            out.push(CapacityCeiling {
                size,
                max_producible: max_producible as u64,
                derived_from: MaterialSnapshot {
                    pouches: pouches as u64,
                    base_grams: base_grams as u64,
                },
                updated_at_ms: updated_at_ms as u64,
            });
        }
        out.sort_by_key(|c| PacketSize::ALL.iter().position(|s| *s == c.size));
        Ok(out)
    }

    fn load_latest_snapshot(&self) -> PersistResult<Option<LedgerSnapshotV1>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let env: SnapshotEnvelope = serde_json::from_slice(&payload)?;
        if env.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistError::Message(
                "unsupported snapshot format".to_string(),
            ));
        }
        Ok(Some(env.snapshot))
    }
}

impl OpSink for SqliteOpSink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        if ops.is_empty() {
            return self.latest_seq();
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events(seq, ts_ms, kind, size, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for stored in ops {
                let payload = serde_json::to_vec(&StoredOpEnvelope::new(stored.clone()))?;
                let (kind, size) = op_kind_and_size(&stored.op);
                stmt.execute(params![
                    stored.seq as i64,
                    stored.ts_ms as i64,
                    kind,
                    size.map(PacketSize::label),
                    payload,
                ])?;
            }
        }
        tx.commit()?;

        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &LedgerSnapshotV1, last_seq: OpSeq) -> PersistResult<()> {
        SqliteOpSink::write_snapshot(self, snapshot, last_seq)
    }

    fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        SqliteOpSink::compact_through(self, seq)
    }

    fn write_ceilings(&mut self, ceilings: &[CapacityCeiling]) -> PersistResult<()> {
        if ceilings.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO ceilings(size, max_producible, pouches, base_grams, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for ceiling in ceilings {
                stmt.execute(params![
                    ceiling.size.label(),
                    ceiling.max_producible as i64,
                    ceiling.derived_from.pouches as i64,
                    ceiling.derived_from.base_grams as i64,
                    ceiling.updated_at_ms as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn op_kind_and_size(op: &Op) -> (i64, Option<PacketSize>) {
    match op {
        Op::Add { size, .. } => (1, Some(*size)),
        Op::Remove { size, .. } => (2, Some(*size)),
        Op::Adjust { .. } => (3, None),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn decode_stored_op_payload(payload: &[u8]) -> Result<StoredOp, String> {
    let envelope: StoredOpEnvelope = serde_json::from_slice(payload)
        .map_err(|e| format!("op payload decode failed: {e}"))?;
    if envelope.format_version != crate::op::OP_FORMAT_VERSION {
        return Err(format!(
            "unsupported op format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.stored)
}
