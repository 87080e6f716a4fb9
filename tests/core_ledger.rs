use chrono::NaiveDate;

use packlog::{
    core::ledger::{LedgerError, StockLedger},
    profile::ConsumptionProfile,
    stock::{DateRange, TxKind},
    types::{MaterialCategory, PacketSize},
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn stocked_ledger(pouches: i64, base_grams: i64) -> StockLedger {
    let mut ledger = StockLedger::new(ConsumptionProfile::default());
    ledger
        .adjust_material(MaterialCategory::Pouch, pouches)
        .unwrap();
    ledger
        .adjust_material(MaterialCategory::BaseIngredient, base_grams)
        .unwrap();
    ledger
}

#[test]
fn adds_yield_monotonic_seqs() {
    let mut ledger = stocked_ledger(1000, 1_000_000);
    let (_, op1) = ledger.add_packets(PacketSize::G30, 1, date(2024, 7, 1)).unwrap();
    let (_, op2) = ledger.add_packets(PacketSize::G60, 2, date(2024, 7, 1)).unwrap();
    let (_, op3) = ledger.add_packets(PacketSize::Kg1, 3, date(2024, 7, 1)).unwrap();

    // Seqs 1 and 2 were taken by the two restocks.
    assert_eq!((op1.seq, op2.seq, op3.seq), (3, 4, 5));
    assert_eq!(ledger.latest_op_seq(), 5);
}

#[test]
fn simple_add_consumes_material_and_reports_ceiling() {
    let mut ledger = stocked_ledger(100, 100_000);

    let (receipt, _) = ledger.add_packets(PacketSize::G30, 40, date(2024, 7, 1)).unwrap();

    assert_eq!(receipt.balance, 40);
    assert_eq!(ledger.material(MaterialCategory::Pouch).quantity, 60);
    assert_eq!(
        ledger.material(MaterialCategory::BaseIngredient).quantity,
        100_000 - 40 * 30
    );
    // 60 pouches left bound the ceiling; base ingredient is ample.
    assert_eq!(receipt.max_producible, 60);
    assert_eq!(ledger.max_producible(PacketSize::G30), 60);
}

#[test]
fn insufficient_material_names_the_limiting_pool_and_mutates_nothing() {
    let mut ledger = stocked_ledger(100, 100_000);

    let err = ledger
        .add_packets(PacketSize::G30, 150, date(2024, 7, 1))
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::InsufficientMaterial {
            material: MaterialCategory::Pouch,
            required: 150,
            available: 100,
        }
    );
    assert!(err.to_string().contains("pouch"));

    assert_eq!(ledger.balance(PacketSize::G30), 0);
    assert_eq!(ledger.material(MaterialCategory::Pouch).quantity, 100);
    assert_eq!(
        ledger.material(MaterialCategory::BaseIngredient).quantity,
        100_000
    );
    assert!(ledger.transactions().is_empty());
}

#[test]
fn base_ingredient_can_be_the_limiting_material() {
    // Plenty of pouches, only 2 kg of base ingredient.
    let mut ledger = stocked_ledger(10_000, 2_000);

    let err = ledger
        .add_packets(PacketSize::Kg1, 3, date(2024, 7, 1))
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::InsufficientMaterial {
            material: MaterialCategory::BaseIngredient,
            required: 3_000,
            available: 2_000,
        }
    );
}

#[test]
fn remove_more_than_available_is_rejected() {
    let mut ledger = stocked_ledger(100, 100_000);
    ledger.add_packets(PacketSize::G30, 40, date(2024, 7, 1)).unwrap();

    let err = ledger
        .remove_packets(PacketSize::G30, 50, date(2024, 7, 2))
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::InsufficientBalance {
            size: PacketSize::G30,
            requested: 50,
            available: 40,
        }
    );
    assert_eq!(ledger.balance(PacketSize::G30), 40);
    assert_eq!(ledger.transactions().len(), 1);
}

#[test]
fn removal_does_not_restore_material() {
    let mut ledger = stocked_ledger(100, 100_000);
    ledger.add_packets(PacketSize::G30, 40, date(2024, 7, 1)).unwrap();
    let (receipt, _) = ledger
        .remove_packets(PacketSize::G30, 25, date(2024, 7, 2))
        .unwrap();

    assert_eq!(receipt.balance, 15);
    assert_eq!(ledger.material(MaterialCategory::Pouch).quantity, 60);
    assert_eq!(
        ledger.material(MaterialCategory::BaseIngredient).quantity,
        100_000 - 40 * 30
    );
}

#[test]
fn zero_quantities_are_invalid() {
    let mut ledger = stocked_ledger(100, 100_000);

    assert_eq!(
        ledger
            .add_packets(PacketSize::G30, 0, date(2024, 7, 1))
            .unwrap_err(),
        LedgerError::InvalidQuantity { quantity: 0 }
    );
    assert_eq!(
        ledger
            .remove_packets(PacketSize::G30, 0, date(2024, 7, 1))
            .unwrap_err(),
        LedgerError::InvalidQuantity { quantity: 0 }
    );
    assert_eq!(
        ledger
            .adjust_material(MaterialCategory::Pouch, 0)
            .unwrap_err(),
        LedgerError::InvalidQuantity { quantity: 0 }
    );
}

#[test]
fn material_write_off_cannot_go_negative() {
    let mut ledger = stocked_ledger(10, 1_000);

    let err = ledger
        .adjust_material(MaterialCategory::Pouch, -11)
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::InsufficientMaterial {
            material: MaterialCategory::Pouch,
            required: 11,
            available: 10,
        }
    );
    assert_eq!(ledger.material(MaterialCategory::Pouch).quantity, 10);
}

#[test]
fn set_material_journals_the_delta_and_skips_no_ops() {
    let mut ledger = StockLedger::new(ConsumptionProfile::default());

    let (level, op) = ledger.set_material(MaterialCategory::Pouch, 250).unwrap();
    assert_eq!(level.quantity, 250);
    assert!(op.is_some());

    let (level, op) = ledger.set_material(MaterialCategory::Pouch, 250).unwrap();
    assert_eq!(level.quantity, 250);
    assert!(op.is_none());

    let (level, op) = ledger.set_material(MaterialCategory::Pouch, 40).unwrap();
    assert_eq!(level.quantity, 40);
    assert!(op.is_some());
}

#[test]
fn transactions_record_exactly_one_direction() {
    let mut ledger = stocked_ledger(100, 100_000);
    ledger.add_packets(PacketSize::G30, 40, date(2024, 7, 1)).unwrap();
    ledger.remove_packets(PacketSize::G30, 10, date(2024, 7, 2)).unwrap();

    for tx in ledger.transactions() {
        match tx.kind {
            TxKind::Add => assert!(tx.added > 0 && tx.removed == 0),
            TxKind::Remove => assert!(tx.removed > 0 && tx.added == 0),
        }
    }
}

#[test]
fn history_orders_by_effective_date_then_seq_descending() {
    let mut ledger = stocked_ledger(1_000, 1_000_000);
    // Backdated entry recorded after a later-dated one.
    ledger.add_packets(PacketSize::G30, 5, date(2024, 7, 3)).unwrap();
    ledger.add_packets(PacketSize::G30, 7, date(2024, 7, 1)).unwrap();
    ledger.add_packets(PacketSize::G30, 9, date(2024, 7, 3)).unwrap();
    ledger.add_packets(PacketSize::G60, 2, date(2024, 7, 2)).unwrap();

    let all = ledger.history(None, DateRange::default());
    let dates: Vec<_> = all.iter().map(|tx| (tx.effective_date, tx.added)).collect();
    assert_eq!(
        dates,
        vec![
            (date(2024, 7, 3), 9),
            (date(2024, 7, 3), 5),
            (date(2024, 7, 2), 2),
            (date(2024, 7, 1), 7),
        ]
    );

    let g30 = ledger.history(Some(PacketSize::G30), DateRange::default());
    assert_eq!(g30.len(), 3);
    assert!(g30.iter().all(|tx| tx.size == PacketSize::G30));

    let ranged = ledger.history(
        None,
        DateRange {
            from: Some(date(2024, 7, 2)),
            to: Some(date(2024, 7, 3)),
        },
    );
    assert_eq!(ranged.len(), 3);
}

#[test]
fn balances_reconstruct_from_the_transaction_log() {
    let mut ledger = stocked_ledger(1_000, 1_000_000);
    ledger.add_packets(PacketSize::G30, 40, date(2024, 7, 1)).unwrap();
    ledger.add_packets(PacketSize::G60, 15, date(2024, 7, 1)).unwrap();
    ledger.remove_packets(PacketSize::G30, 12, date(2024, 7, 2)).unwrap();
    ledger.add_packets(PacketSize::G30, 3, date(2024, 7, 3)).unwrap();

    for size in PacketSize::ALL {
        let replayed: i128 = ledger
            .transactions()
            .iter()
            .filter(|tx| tx.size == size)
            .map(|tx| i128::from(tx.added) - i128::from(tx.removed))
            .sum();
        assert_eq!(replayed, i128::from(ledger.balance(size)));
    }
}

#[test]
fn replaying_drained_ops_reproduces_the_ledger() {
    let mut ledger = stocked_ledger(1_000, 1_000_000);
    ledger.add_packets(PacketSize::G30, 40, date(2024, 7, 1)).unwrap();
    ledger.remove_packets(PacketSize::G30, 12, date(2024, 7, 2)).unwrap();
    ledger.add_packets(PacketSize::Kg1, 9, date(2024, 7, 2)).unwrap();
    ledger.adjust_material(MaterialCategory::Pouch, -5).unwrap();

    let ops = ledger.drain_pending_ops();
    let mut replayed = StockLedger::new(ConsumptionProfile::default());
    for op in ops {
        replayed.apply_replayed_op(op).unwrap();
    }

    assert_eq!(replayed.export_snapshot(), ledger.export_snapshot());
}

#[test]
fn snapshot_round_trips_state() {
    let mut ledger = stocked_ledger(500, 250_000);
    ledger.add_packets(PacketSize::G500, 20, date(2024, 7, 1)).unwrap();
    ledger.remove_packets(PacketSize::G500, 5, date(2024, 7, 2)).unwrap();

    let snapshot = ledger.export_snapshot();
    let restored =
        StockLedger::from_snapshot(ConsumptionProfile::default(), snapshot.clone()).unwrap();

    assert_eq!(restored.export_snapshot(), snapshot);
    assert_eq!(restored.balance(PacketSize::G500), 15);
    assert_eq!(
        restored.material(MaterialCategory::Pouch).quantity,
        ledger.material(MaterialCategory::Pouch).quantity
    );
    assert_eq!(
        restored.history(Some(PacketSize::G500), DateRange::default()),
        ledger.history(Some(PacketSize::G500), DateRange::default())
    );
}
