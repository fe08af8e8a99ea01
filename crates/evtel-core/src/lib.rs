//! evtel-core - Shared types for the evtel telemetry engine
//!
//! This crate holds the data model every other crate agrees on: CAN frames,
//! UDS request descriptors, the capability-item bitflags, and the hand-off
//! slot between the CAN receive path and the vehicle evaluator.

pub mod error;
pub mod frame;
pub mod item;
pub mod request;
pub mod slot;

pub use error::{InterfaceError, TransportError};
pub use frame::CanFrame;
pub use item::{DataItems, ItemRange};
pub use request::CanRequest;
pub use slot::{ResponseSlot, UdsResponse};
