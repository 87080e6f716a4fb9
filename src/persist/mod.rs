pub mod sqlite;

use thiserror::Error;

use crate::{
    core::ledger::{LedgerError, LedgerSnapshotV1},
    engine::capacity::CapacityCeiling,
    op::StoredOp,
    types::OpSeq,
};

/// Infrastructure failure in the journal path. No partial state survives a
/// failed append, so callers may retry safely.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("{0}")]
    Message(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Durable sink for journal ops, checkpoint snapshots, and the advisory
/// ceiling cache.
///
/// `append_ops` must be all-or-nothing per batch: after a failure, no op of
/// the failed batch may be visible to replay.
pub trait OpSink: Send {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    fn write_snapshot(&mut self, _snapshot: &LedgerSnapshotV1, _last_seq: OpSeq) -> PersistResult<()> {
        Ok(())
    }
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
    fn write_ceilings(&mut self, _ceilings: &[CapacityCeiling]) -> PersistResult<()> {
        Ok(())
    }
}
