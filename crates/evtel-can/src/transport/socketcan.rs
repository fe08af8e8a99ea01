//! SocketCAN back-end for a directly attached CAN controller

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use embedded_can::{ExtendedId, Frame as EmbeddedFrame, Id, StandardId};
use parking_lot::Mutex;
use socketcan::{CanFilter, CanFrame as SocketCanFrame, CanSocket, Socket, SocketOptions};
use tokio::sync::broadcast;

use evtel_core::{CanFrame, InterfaceError, TransportError};

use super::{CanTransport, LinkEvent, SocketCanConfig};

/// Transport over a raw SocketCAN interface.
///
/// The closest host analogue of an on-chip CAN controller: frame-level
/// tx/rx, an acceptance filter reconfigured per request, and a one-shot
/// request timeout. The kernel driver owns bus-off recovery and the
/// interface bit-rate, so the 250k/500k flag is validated against intent
/// only.
pub struct SocketCanTransport {
    socket: Arc<Mutex<CanSocket>>,
    connected: Arc<AtomicBool>,
    filter_enabled: AtomicBool,
    events: broadcast::Sender<LinkEvent>,
    req_timeout: Duration,
    /// Generation counter doubling as the one-shot timer: a bump from
    /// `mark_response_complete` or a newer request disarms older timers.
    pending: Arc<AtomicU64>,
}

impl SocketCanTransport {
    pub fn new(
        config: &SocketCanConfig,
        req_timeout_ms: u64,
        can_is_500k: bool,
    ) -> Result<Self, TransportError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to open {}: {}",
                config.interface, e
            ))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::InvalidConfig(format!("failed to set non-blocking: {e}")))?;

        // Accept everything until a request installs a response filter.
        socket
            .set_filters(&[CanFilter::new(0, 0)])
            .map_err(|e| TransportError::InvalidConfig(format!("failed to clear filters: {e}")))?;

        tracing::info!(
            interface = %config.interface,
            bitrate = if can_is_500k { 500_000 } else { 250_000 },
            "SocketCAN transport up; bit rate is configured at the interface level"
        );

        let (events, _) = broadcast::channel(1024);
        let transport = Self {
            socket: Arc::new(Mutex::new(socket)),
            connected: Arc::new(AtomicBool::new(true)),
            filter_enabled: AtomicBool::new(false),
            events,
            req_timeout: Duration::from_millis(req_timeout_ms),
            pending: Arc::new(AtomicU64::new(0)),
        };
        transport.start_reader();
        Ok(transport)
    }

    fn start_reader(&self) {
        let socket = Arc::clone(&self.socket);
        let connected = Arc::clone(&self.connected);
        let events = self.events.clone();

        tokio::task::spawn_blocking(move || {
            while connected.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(SocketCanFrame::Data(frame)) => {
                        let id = raw_id(frame.id());
                        if let Some(frame) = CanFrame::new(id, frame.data()) {
                            let _ = events.send(LinkEvent::Frame(frame));
                        }
                    }
                    Ok(_) => {
                        // Remote and error frames are not part of UDS traffic.
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            tracing::debug!("SocketCAN reader stopped");
        });
    }
}

#[async_trait]
impl CanTransport for SocketCanTransport {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn transmit_request(
        &self,
        req_id: u32,
        rsp_id: u32,
        data: &[u8],
    ) -> Result<(), TransportError> {
        // Narrow the acceptance filter to the expected response when asked.
        if self.filter_enabled.load(Ordering::SeqCst) {
            let mask = if rsp_id > 0x7FF { 0x1FFF_FFFF } else { 0x7FF };
            self.socket
                .lock()
                .set_filters(&[CanFilter::new(rsp_id, mask)])
                .map_err(|e| {
                    TransportError::InvalidConfig(format!(
                        "failed to set filter for {rsp_id:#x}: {e}"
                    ))
                })?;
        }

        let frame = build_frame(req_id, data)?;
        let socket = Arc::clone(&self.socket);
        tokio::task::spawn_blocking(move || {
            socket
                .lock()
                .write_frame(&frame)
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("task join error: {e}")))??;

        // Arm the one-shot request timer.
        let generation = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let timeout = self.req_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if pending.load(Ordering::SeqCst) == generation {
                let _ = events.send(LinkEvent::Error(InterfaceError::Timeout));
            }
        });

        Ok(())
    }

    async fn transmit_flow_control(&self, req_id: u32, data: &[u8]) -> Result<(), TransportError> {
        let frame = build_frame(req_id, data)?;
        let socket = Arc::clone(&self.socket);
        tokio::task::spawn_blocking(move || {
            socket
                .lock()
                .write_frame(&frame)
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("task join error: {e}")))?
    }

    fn set_response_filter(&self, enable: bool) {
        self.filter_enabled.store(enable, Ordering::SeqCst);
        if !enable {
            if let Err(e) = self.socket.lock().set_filters(&[CanFilter::new(0, 0)]) {
                tracing::error!(error = %e, "failed to disable filter");
            }
        }
        // The narrowed filter is installed per request in transmit_request.
    }

    fn mark_response_complete(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn build_frame(id: u32, data: &[u8]) -> Result<SocketCanFrame, TransportError> {
    let id = can_id(id)?;
    SocketCanFrame::new(id, data)
        .ok_or_else(|| TransportError::SendFailed("payload exceeds 8 bytes".to_string()))
}

fn can_id(raw: u32) -> Result<Id, TransportError> {
    if raw > 0x7FF {
        ExtendedId::new(raw)
            .map(Id::Extended)
            .ok_or_else(|| TransportError::InvalidConfig(format!("invalid extended CAN id {raw:#x}")))
    } else {
        StandardId::new(raw as u16)
            .map(Id::Standard)
            .ok_or_else(|| TransportError::InvalidConfig(format!("invalid standard CAN id {raw:#x}")))
    }
}

fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => u32::from(id.as_raw()),
        Id::Extended(id) => id.as_raw(),
    }
}
