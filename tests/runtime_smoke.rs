use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;

use packlog::{
    core::ledger::{LedgerError, StockLedger},
    persist::{OpSink, PersistResult},
    profile::ConsumptionProfile,
    runtime::{
        events::StockEvent,
        handle::{RetryPolicy, RuntimeConfig, RuntimeError, spawn_packlog},
    },
    types::{MaterialCategory, OpSeq, PacketSize},
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn stocked_ledger(pouches: i64, base_grams: i64) -> StockLedger {
    let mut ledger = StockLedger::new(ConsumptionProfile::default());
    ledger.adjust_material(MaterialCategory::Pouch, pouches).unwrap();
    ledger
        .adjust_material(MaterialCategory::BaseIngredient, base_grams)
        .unwrap();
    ledger.drain_pending_ops();
    ledger
}

struct SlowSink {
    seen: Arc<Mutex<Vec<OpSeq>>>,
    delay: Duration,
}

impl OpSink for SlowSink {
    fn append_ops(&mut self, ops: &[packlog::op::StoredOp]) -> PersistResult<OpSeq> {
        std::thread::sleep(self.delay);
        let mut seen = self.seen.lock().expect("lock");
        for op in ops {
            seen.push(op.seq);
        }
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

#[tokio::test]
async fn runtime_applies_ops_and_reads_see_writes_immediately() {
    init_tracing();
    let handle = spawn_packlog(stocked_ledger(100, 100_000), None, RuntimeConfig::default());
    let mut sub = handle.subscribe();

    let receipt = handle
        .add_packets(PacketSize::G30, 40, date(2024, 7, 1))
        .await
        .expect("add");
    assert_eq!(receipt.balance, 40);
    assert_eq!(receipt.max_producible, 60);

    // Authoritative read-after-write: the balance is visible before any
    // durability round-trip.
    let balances = handle.balances().await.expect("balances");
    assert!(balances.contains(&(PacketSize::G30, 40)));

    let receipt = handle
        .remove_packets(PacketSize::G30, 12, date(2024, 7, 2))
        .await
        .expect("remove");
    assert_eq!(receipt.balance, 28);

    let ceiling = handle
        .ceiling(PacketSize::G30)
        .await
        .expect("ceiling query")
        .expect("ceiling known");
    assert_eq!(ceiling.max_producible, 60);

    let history = handle
        .history(Some(PacketSize::G30), Default::default())
        .await
        .expect("history");
    assert_eq!(history.len(), 2);

    let mut added_seen = false;
    let mut removed_seen = false;
    for _ in 0..16 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event timeout")
            .expect("recv");
        match evt {
            StockEvent::Added { size, quantity, balance } => {
                assert_eq!((size, quantity, balance), (PacketSize::G30, 40, 40));
                added_seen = true;
            }
            StockEvent::Removed { size, quantity, balance } => {
                assert!(added_seen, "removal event before add event");
                assert_eq!((size, quantity, balance), (PacketSize::G30, 12, 28));
                removed_seen = true;
                break;
            }
            _ => {}
        }
    }
    assert!(added_seen && removed_seen);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn rejection_reports_current_balance_and_ceiling() {
    init_tracing();
    let handle = spawn_packlog(stocked_ledger(100, 100_000), None, RuntimeConfig::default());

    let err = handle
        .add_packets(PacketSize::G30, 150, date(2024, 7, 1))
        .await
        .expect_err("should reject");
    match err {
        RuntimeError::Rejected(rejection) => {
            assert_eq!(
                rejection.reason,
                LedgerError::InsufficientMaterial {
                    material: MaterialCategory::Pouch,
                    required: 150,
                    available: 100,
                }
            );
            assert_eq!(rejection.balance, 0);
            assert_eq!(rejection.max_producible, 100);
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Nothing changed.
    let balances = handle.balances().await.expect("balances");
    assert!(balances.contains(&(PacketSize::G30, 0)));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn material_adjustment_moves_every_ceiling() {
    init_tracing();
    let handle = spawn_packlog(stocked_ledger(100, 100_000), None, RuntimeConfig::default());
    let mut sub = handle.subscribe();

    let level = handle
        .adjust_material(MaterialCategory::Pouch, -40)
        .await
        .expect("write off");
    assert_eq!(level.quantity, 60);

    let mut ceiling_events = 0;
    for _ in 0..16 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event timeout")
            .expect("recv");
        if let StockEvent::CeilingChanged { max_producible, .. } = evt {
            assert_eq!(max_producible, 60);
            ceiling_events += 1;
            if ceiling_events == PacketSize::ALL.len() {
                break;
            }
        }
    }
    // Shared pool: one write-off moved all four ceilings.
    assert_eq!(ceiling_events, PacketSize::ALL.len());

    let level = handle
        .set_material(MaterialCategory::Pouch, 80)
        .await
        .expect("stocktake");
    assert_eq!(level.quantity, 80);
    let level = handle
        .material(MaterialCategory::Pouch)
        .await
        .expect("material query");
    assert_eq!(level.quantity, 80);

    let ceilings = handle.ceilings().await.expect("ceilings");
    assert_eq!(ceilings.len(), PacketSize::ALL.len());
    assert!(ceilings.iter().all(|c| c.max_producible == 80));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn durable_event_advances_and_queue_pressure_refuses_cleanly() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(250),
    };

    let cfg = RuntimeConfig {
        flush_on_add: true,
        batch_max_ops: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
    };

    let handle = spawn_packlog(stocked_ledger(1_000, 1_000_000), Some(Box::new(sink)), cfg);
    let mut sub = handle.subscribe();

    let receipt = handle
        .add_packets(PacketSize::G30, 1, date(2024, 7, 1))
        .await
        .expect("first add");
    assert_eq!(receipt.balance, 1);

    let mut durable_seen = false;
    for _ in 0..8 {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("recv timeout")
            .expect("recv");
        if matches!(evt, StockEvent::DurableUpTo { .. }) {
            durable_seen = true;
            break;
        }
    }
    assert!(durable_seen, "expected DurableUpTo event");

    let mut successes = 1u64; // first add above
    let mut queue_error_seen = false;
    for _ in 0..12 {
        match handle.add_packets(PacketSize::G30, 1, date(2024, 7, 1)).await {
            Ok(_) => successes += 1,
            Err(RuntimeError::Persist(_)) => queue_error_seen = true,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(queue_error_seen, "expected queue pressure to surface as error");

    // A refused write left no trace: the balance counts successes only.
    let balances = handle.balances().await.expect("balances");
    assert!(balances.contains(&(PacketSize::G30, successes)));

    // An explicit flush drains the journal of everything that was accepted.
    let durable = handle.flush().await.expect("flush");
    assert!(durable >= successes);

    handle.shutdown().await.expect("shutdown");
    assert!(!seen.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn concurrent_removals_drain_to_exactly_zero() {
    init_tracing();
    let handle = spawn_packlog(stocked_ledger(200, 200_000), None, RuntimeConfig::default());
    handle
        .add_packets(PacketSize::G30, 100, date(2024, 7, 1))
        .await
        .expect("seed balance");

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle
                .remove_packets(PacketSize::G30, 10, date(2024, 7, 2))
                .await
        }));
    }

    let mut resulting = Vec::new();
    for task in tasks {
        let receipt = task.await.expect("join").expect("remove");
        resulting.push(receipt.balance);
    }

    // Every removal saw a distinct intermediate balance: no double-count.
    resulting.sort_unstable();
    assert_eq!(resulting, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);

    let balances = handle.balances().await.expect("balances");
    assert!(balances.contains(&(PacketSize::G30, 0)));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn retry_gives_up_after_max_attempts() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(600),
    };
    let cfg = RuntimeConfig {
        flush_on_add: true,
        batch_max_ops: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
    };
    let handle = spawn_packlog(stocked_ledger(1_000, 1_000_000), Some(Box::new(sink)), cfg);

    // Worker busy with the first op, queue slot held by the second.
    handle
        .add_packets(PacketSize::G30, 1, date(2024, 7, 1))
        .await
        .expect("first add");
    handle
        .add_packets(PacketSize::G30, 1, date(2024, 7, 1))
        .await
        .expect("second add");

    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(100),
    };
    let err = handle
        .add_packets_retrying(PacketSize::G30, 1, date(2024, 7, 1), &policy)
        .await
        .expect_err("both attempts hit a full queue");
    assert!(matches!(err, RuntimeError::Persist(_)));

    // The refused attempts left nothing behind.
    let balances = handle.balances().await.expect("balances");
    assert!(balances.contains(&(PacketSize::G30, 2)));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn retry_resubmits_infrastructure_failures_only() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(200),
    };
    let cfg = RuntimeConfig {
        flush_on_add: true,
        batch_max_ops: 16,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        compact_after_snapshot: false,
    };
    let handle = spawn_packlog(stocked_ledger(1_000, 1_000_000), Some(Box::new(sink)), cfg);

    // Saturate the worker and the one-slot queue.
    let _ = handle.add_packets(PacketSize::G30, 1, date(2024, 7, 1)).await;
    let _ = handle.add_packets(PacketSize::G30, 1, date(2024, 7, 1)).await;
    let _ = handle.add_packets(PacketSize::G30, 1, date(2024, 7, 1)).await;

    let policy = RetryPolicy {
        max_attempts: 6,
        base_delay: Duration::from_millis(150),
        max_delay: Duration::from_secs(1),
    };
    let receipt = handle
        .add_packets_retrying(PacketSize::G30, 1, date(2024, 7, 1), &policy)
        .await
        .expect("retry should eventually land");
    assert!(receipt.balance >= 2);

    // Business rejections bypass the retry loop entirely.
    let start = tokio::time::Instant::now();
    let slow_policy = RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(5),
    };
    let err = handle
        .remove_packets_retrying(PacketSize::G60, 1, date(2024, 7, 1), &slow_policy)
        .await
        .expect_err("nothing to remove");
    assert!(matches!(err, RuntimeError::Rejected(_)));
    assert!(start.elapsed() < Duration::from_secs(5));

    handle.shutdown().await.expect("shutdown");
}
