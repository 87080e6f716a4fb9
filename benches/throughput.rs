use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use chrono::NaiveDate;

use packlog::{
    core::ledger::StockLedger,
    profile::ConsumptionProfile,
    stock::DateRange,
    types::{MaterialCategory, PacketSize},
};

fn date(day: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(day % 365)
}

fn stocked_ledger(pouches: i64, base_grams: i64) -> StockLedger {
    let mut ledger = StockLedger::new(ConsumptionProfile::default());
    ledger.adjust_material(MaterialCategory::Pouch, pouches).expect("pouches");
    ledger
        .adjust_material(MaterialCategory::BaseIngredient, base_grams)
        .expect("base ingredient");
    ledger
}

fn bench_adds(c: &mut Criterion) {
    c.bench_function("ledger_add_50k", |b| {
        b.iter(|| {
            let mut ledger = stocked_ledger(50_000, 20_000_000);
            for i in 0..50_000u64 {
                let size = PacketSize::ALL[(i % 4) as usize];
                let _ = ledger.add_packets(size, 1, date(i)).expect("add");
            }
        });
    });
}

fn bench_add_remove_cycles(c: &mut Criterion) {
    c.bench_function("ledger_add_remove_10k", |b| {
        b.iter(|| {
            let mut ledger = stocked_ledger(20_000, 1_000_000);
            for i in 0..10_000u64 {
                let _ = ledger.add_packets(PacketSize::G30, 2, date(i)).expect("add");
                let _ = ledger
                    .remove_packets(PacketSize::G30, 1, date(i))
                    .expect("remove");
            }
        });
    });
}

fn bench_history_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_query");
    let mut ledger = stocked_ledger(100_000, 40_000_000);
    for i in 0..50_000u64 {
        let size = PacketSize::ALL[(i % 4) as usize];
        let _ = ledger.add_packets(size, 1, date(i)).expect("add");
    }

    for days in [7u64, 30u64, 365u64] {
        group.bench_with_input(BenchmarkId::from_parameter(days), &days, |b, &days| {
            let range = DateRange {
                from: Some(date(0)),
                to: Some(date(days)),
            };
            b.iter(|| {
                let _ = ledger.history(Some(PacketSize::G30), range);
            });
        });
    }

    group.finish();
}

fn bench_balances(c: &mut Criterion) {
    let mut ledger = stocked_ledger(100_000, 40_000_000);
    for i in 0..50_000u64 {
        let size = PacketSize::ALL[(i % 4) as usize];
        let _ = ledger.add_packets(size, 1, date(i)).expect("add");
    }

    c.bench_function("balances_after_50k_ops", |b| {
        b.iter(|| {
            let _ = ledger.balances();
        });
    });
}

criterion_group!(
    benches,
    bench_adds,
    bench_add_remove_cycles,
    bench_history_query,
    bench_balances
);
criterion_main!(benches);
