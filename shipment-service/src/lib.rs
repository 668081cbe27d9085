//! Turns accepted orders into shipments.

pub mod handlers;

pub use handlers::{ShipmentCreator, ShipmentOutcome};
