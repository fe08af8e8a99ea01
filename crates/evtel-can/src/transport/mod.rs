//! Transport back-ends for the OBD-II request/response core
//!
//! A transport moves single CAN frames between the engine and the vehicle:
//! - SocketCAN for a directly attached CAN controller (Linux only)
//! - ELM327 adapter driver over a stream or packet link
//! - Mock transport for tests and demo runs
//!
//! Frames and interface errors flow upward through a broadcast channel
//! obtained from [`CanTransport::subscribe`]; the ISO-TP layer drains it.

pub mod elm327;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use evtel_core::{CanFrame, InterfaceError, TransportError};

pub use elm327::{Elm327Link, Elm327Transport, NotifyControl, NotifyHarness, NotifyLink, TcpLink};
pub use mock::MockTransport;

/// Event fan-out from a transport back-end to the ISO-TP layer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A frame accepted by the back-end (already response-filtered where
    /// the back-end supports filtering).
    Frame(CanFrame),
    /// An interface error to surface through the manager to the decoder.
    Error(InterfaceError),
}

/// Transport-agnostic interface to an OBD-II CAN link.
///
/// At most one request is outstanding at a time; `transmit_request` for a
/// new request is only called after the previous one completed, errored,
/// or timed out.
#[async_trait]
pub trait CanTransport: Send + Sync {
    /// Whether the link is currently usable for requests.
    fn connected(&self) -> bool;

    /// Send a single-frame UDS request and start timeout bookkeeping.
    async fn transmit_request(
        &self,
        req_id: u32,
        rsp_id: u32,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Send an ISO-TP flow-control frame back to the request id. May be
    /// invoked from the receive path.
    async fn transmit_flow_control(&self, req_id: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Restrict reception to the expected response id where the back-end
    /// supports it. The ELM327 driver ignores this; `ATCRA` already
    /// filters.
    fn set_response_filter(&self, enable: bool);

    /// Stop the request timeout; the response has been fully reassembled.
    fn mark_response_complete(&self);

    /// Subscribe to inbound frames and interface errors.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;
}

/// Transport selection from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Raw SocketCAN interface (Linux only).
    SocketCan(SocketCanConfig),
    /// ELM327-compatible adapter behind a TCP socket (Wi-Fi dongles).
    ElmTcp(ElmTcpConfig),
    /// Mock transport with canned responses.
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN back-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g. "can0").
    pub interface: String,
}

/// TCP stream link configuration for ELM327 Wi-Fi adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElmTcpConfig {
    /// Adapter IP address or hostname.
    pub host: String,
    /// Adapter TCP port (35000 on most Wi-Fi dongles).
    #[serde(default = "default_elm_port")]
    pub port: u16,
}

fn default_elm_port() -> u16 {
    35000
}

/// Mock transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated response latency in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
}

/// Create a transport back-end from configuration.
///
/// `req_timeout_ms` and the bit-rate flag come from the selected vehicle's
/// profile. Packet-notify links (BLE bridges) have no socket-style
/// configuration; construct those with [`NotifyLink::pair`] and
/// [`Elm327Transport::connect`] instead.
pub async fn create_transport(
    config: &TransportConfig,
    req_timeout_ms: u64,
    can_is_500k: bool,
) -> Result<Arc<dyn CanTransport>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let transport = socketcan::SocketCanTransport::new(cfg, req_timeout_ms, can_is_500k)?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::ElmTcp(cfg) => {
            let link = Arc::new(TcpLink::new(cfg.clone()));
            let transport = Elm327Transport::connect(link, req_timeout_ms, can_is_500k).await?;
            Ok(transport)
        }
        TransportConfig::Mock(cfg) => {
            let transport = MockTransport::new(cfg, req_timeout_ms).with_default_responses();
            Ok(Arc::new(transport))
        }
    }
}
