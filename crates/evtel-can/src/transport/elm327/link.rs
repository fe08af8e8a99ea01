//! Stream and packet links underneath the ELM327 driver
//!
//! The driver speaks CR-terminated ASCII lines; a link moves those bytes
//! over whatever carries the adapter (a TCP socket for Wi-Fi dongles, a
//! notify-style packet channel for BLE bridges) and reports connection
//! state changes. Links are opaque byte pipes; all protocol knowledge
//! stays in the driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use evtel_core::TransportError;

use crate::transport::ElmTcpConfig;

/// I/O notifications from a link to the adapter driver.
#[derive(Debug, Clone)]
pub enum LinkIo {
    /// Link-level connection state changed.
    Connected(bool),
    /// Raw bytes received from the adapter.
    Data(Vec<u8>),
}

/// An opaque byte pipe to an ELM327-compatible adapter.
#[async_trait]
pub trait Elm327Link: Send + Sync {
    /// Begin connection management. Connection state and received bytes
    /// flow through [`Elm327Link::events`].
    async fn start(&self) -> Result<(), TransportError>;

    /// Queue one command line for transmission; the link appends the CR
    /// terminator.
    async fn transmit_line(&self, line: &[u8]) -> Result<(), TransportError>;

    fn events(&self) -> broadcast::Receiver<LinkIo>;
}

/// TCP stream link for Wi-Fi ELM327 adapters.
///
/// Maintains the connection in a background task, reconnecting with a
/// short back-off after any socket error.
pub struct TcpLink {
    config: ElmTcpConfig,
    events: broadcast::Sender<LinkIo>,
    outbound: mpsc::Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    connected: Arc<AtomicBool>,
}

impl TcpLink {
    pub fn new(config: ElmTcpConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (outbound, outbound_rx) = mpsc::channel(16);
        Self {
            config,
            events,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Elm327Link for TcpLink {
    async fn start(&self) -> Result<(), TransportError> {
        let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
            return Err(TransportError::InvalidConfig(
                "link already started".to_string(),
            ));
        };

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let events = self.events.clone();
        let connected = Arc::clone(&self.connected);

        tokio::spawn(async move {
            loop {
                let stream = match TcpStream::connect(&addr).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(%addr, error = %e, "adapter connect failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                tracing::info!(%addr, "adapter socket connected");
                connected.store(true, Ordering::SeqCst);
                let _ = events.send(LinkIo::Connected(true));

                let (mut reader, mut writer) = stream.into_split();
                let mut rx_buf = [0u8; 256];
                loop {
                    tokio::select! {
                        read = reader.read(&mut rx_buf) => match read {
                            Ok(0) => {
                                tracing::info!("adapter closed the connection");
                                break;
                            }
                            Ok(len) => {
                                let _ = events.send(LinkIo::Data(rx_buf[..len].to_vec()));
                            }
                            Err(e) => {
                                tracing::info!(error = %e, "adapter receive failed");
                                break;
                            }
                        },
                        line = outbound_rx.recv() => match line {
                            Some(line) => {
                                if let Err(e) = writer.write_all(&line).await {
                                    tracing::info!(error = %e, "adapter send failed");
                                    break;
                                }
                            }
                            None => return,
                        },
                    }
                }

                connected.store(false, Ordering::SeqCst);
                let _ = events.send(LinkIo::Connected(false));
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        Ok(())
    }

    async fn transmit_line(&self, line: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line);
        framed.push(0x0D);
        self.outbound
            .send(framed)
            .await
            .map_err(|_| TransportError::SendFailed("link task gone".to_string()))
    }

    fn events(&self) -> broadcast::Receiver<LinkIo> {
        self.events.subscribe()
    }
}

/// Channel-backed packet link.
///
/// Stands in for notify-style packet transports (BLE GATT bridges): the
/// embedding side holds the [`NotifyHarness`] and shuttles byte blocks
/// between the link and the real carrier. Also the link the driver tests
/// run against.
pub struct NotifyLink {
    events: broadcast::Sender<LinkIo>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

/// The far side of a [`NotifyLink`].
pub struct NotifyHarness {
    control: NotifyControl,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Cloneable handle for pushing carrier events into a [`NotifyLink`].
#[derive(Clone)]
pub struct NotifyControl {
    events: broadcast::Sender<LinkIo>,
    connected: Arc<AtomicBool>,
}

impl NotifyControl {
    /// Flip the link's connection state as the carrier comes and goes.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let _ = self.events.send(LinkIo::Connected(connected));
    }

    /// Push received bytes up to the driver.
    pub fn push(&self, bytes: &[u8]) {
        let _ = self.events.send(LinkIo::Data(bytes.to_vec()));
    }
}

impl NotifyLink {
    pub fn pair() -> (Arc<NotifyLink>, NotifyHarness) {
        let (events, _) = broadcast::channel(256);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let link = Arc::new(NotifyLink {
            events: events.clone(),
            outbound,
            connected: Arc::clone(&connected),
        });
        let harness = NotifyHarness {
            control: NotifyControl { events, connected },
            outbound: outbound_rx,
        };
        (link, harness)
    }
}

#[async_trait]
impl Elm327Link for NotifyLink {
    async fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn transmit_line(&self, line: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line);
        framed.push(0x0D);
        self.outbound
            .send(framed)
            .map_err(|_| TransportError::SendFailed("harness dropped".to_string()))
    }

    fn events(&self) -> broadcast::Receiver<LinkIo> {
        self.events.subscribe()
    }
}

impl NotifyHarness {
    /// Cloneable handle for the carrier side.
    pub fn control(&self) -> NotifyControl {
        self.control.clone()
    }

    /// Flip the link's connection state as the carrier comes and goes.
    pub fn set_connected(&self, connected: bool) {
        self.control.set_connected(connected);
    }

    /// Push received bytes up to the driver.
    pub fn push(&self, bytes: &[u8]) {
        self.control.push(bytes);
    }

    /// Next CR-terminated line queued by the driver.
    pub async fn recv_line(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }
}
