//! Authoritative in-memory packet-stock ledger with append-only SQLite
//! journaling and a derived capacity board.
//!
//! Finished-goods packets enter the ledger when they are produced (consuming
//! raw pouch and base-ingredient stock) and leave when they are sold or
//! removed. Every mutation appends a balance record and a transaction record
//! and adjusts the material pools in one validate-then-commit step; an
//! advisory per-size ceiling is recomputed from material levels after every
//! change.
//!
//! # Examples
//!
//! In-memory usage with [`core::ledger::StockLedger`]:
//! ```
//! use chrono::NaiveDate;
//! use packlog::{
//!     core::ledger::StockLedger,
//!     profile::ConsumptionProfile,
//!     types::{MaterialCategory, PacketSize},
//! };
//!
//! let mut ledger = StockLedger::new(ConsumptionProfile::default());
//! ledger
//!     .adjust_material(MaterialCategory::Pouch, 100)
//!     .expect("restock pouches");
//! ledger
//!     .adjust_material(MaterialCategory::BaseIngredient, 100_000)
//!     .expect("restock base ingredient");
//!
//! let today = NaiveDate::from_ymd_opt(2024, 7, 1).expect("date");
//! let (receipt, _op) = ledger
//!     .add_packets(PacketSize::G30, 40, today)
//!     .expect("add packets");
//! assert_eq!(receipt.balance, 40);
//! assert_eq!(receipt.max_producible, 60); // 60 pouches left
//! ```
//!
//! Runtime usage with SQLite sink:
//! ```no_run
//! use chrono::NaiveDate;
//! use packlog::{
//!     persist::sqlite::SqliteOpSink,
//!     profile::ConsumptionProfile,
//!     runtime::handle::{RuntimeConfig, spawn_packlog},
//!     types::{MaterialCategory, PacketSize},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteOpSink::open("packlog.db").expect("open sqlite");
//! let ledger = sink
//!     .load_ledger(ConsumptionProfile::default())
//!     .expect("replay journal");
//! let handle = spawn_packlog(ledger, Some(Box::new(sink)), RuntimeConfig::default());
//!
//! handle
//!     .adjust_material(MaterialCategory::Pouch, 500)
//!     .await
//!     .expect("restock");
//! let today = NaiveDate::from_ymd_opt(2024, 7, 1).expect("date");
//! let receipt = handle
//!     .add_packets(PacketSize::G30, 40, today)
//!     .await
//!     .expect("add packets");
//! println!("balance {} ceiling {}", receipt.balance, receipt.max_producible);
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```

/// Authoritative ledger state and coordinator rules.
pub mod core;
/// Derived advisory capacity ceilings.
pub mod engine;
/// Journal op model and persistence wrapper types.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Per-size consumption rates and material snapshots.
pub mod profile;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Ledger domain records and receipts.
pub mod stock;
/// Shared primitive types and enums.
pub mod types;
