//! ELM327-compatible adapter driver
//!
//! Presents the CAN transport contract over a text-mode ELM327 adapter,
//! absorbing its stateful AT-command protocol, line-buffered ASCII
//! responses, and known firmware defects. The adapter sits behind an
//! [`Elm327Link`]: a TCP socket for Wi-Fi dongles or a notify-style
//! packet channel for BLE bridges.

mod driver;
mod link;
mod parser;

pub use driver::Elm327Transport;
pub use link::{Elm327Link, LinkIo, NotifyControl, NotifyHarness, NotifyLink, TcpLink};
