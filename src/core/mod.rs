//! Authoritative ledger state and coordinator rules.

/// Stock ledger, material pool, and the validate-then-commit engine.
pub mod ledger;
