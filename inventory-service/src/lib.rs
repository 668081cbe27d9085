//! Applies external stock corrections to the ledger.

pub mod handlers;

pub use handlers::{InventoryReconciler, Reconciliation};
