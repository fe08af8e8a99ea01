//! evtel-can - OBD-II CAN interfaces for the evtel telemetry engine
//!
//! This crate provides the request/response core between the vehicle
//! decoders and the physical OBD-II port:
//!
//! - a transport abstraction with SocketCAN, ELM327-over-stream, and mock
//!   back-ends ([`transport`]),
//! - the ELM327 adapter driver hiding the adapter's stateful AT-command
//!   protocol and firmware quirks ([`transport::elm327`]),
//! - a simplified ISO-TP (ISO 15765-2) reassembly layer that turns frame
//!   streams into complete UDS response payloads ([`isotp`]).
//!
//! Only one request may be outstanding per transport at a time; the layers
//! above enforce this with an in-flight flag and the layers here assume it.

pub mod isotp;
pub mod transport;

pub use isotp::CanManager;
pub use transport::{create_transport, CanTransport, LinkEvent, TransportConfig};
