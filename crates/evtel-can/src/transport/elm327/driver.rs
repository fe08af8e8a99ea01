//! Adapter state machines and the per-request AT handshake

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use evtel_core::{CanFrame, InterfaceError, TransportError};

use super::link::{Elm327Link, LinkIo};
use super::parser::{nibble_char, LineParser};
use crate::transport::{CanTransport, LinkEvent};

/// Line exchanges wait `req_timeout × 10` to accommodate latency in the
/// link plus the adapter itself.
const TIMEOUT_SCALE: u64 = 10;

/// Pause before restarting a failed initialisation sequence.
const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Adapter initialisation sequence, sent on every link (re)establishment.
const INIT_SEQUENCE: [&str; 12] = [
    "ATZ",          // Reset the controller
    "ATE0",         // Echo off
    "ATCAF0",       // No auto formatting; we own every data byte
    "ATCFC1",       // Adapter-side flow control
    "ATM0",         // Do not save protocol changes to memory
    "ATL0",         // No <LF> after <CR>
    "ATH0",         // No header ids in responses
    "ATS1",         // Spaces between data bytes (the parser expects them)
    "ATST7D",       // 500 ms adapter timeout
    "ATFCSH710",    // Dummy flow-control header so ATFCSM1 succeeds
    "ATFCSD300000", // Flow-control response bytes
    "ATFCSM1",      // Custom flow-control response on
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Disconnected,
    Initialising,
    Connected,
}

/// Transmit substate of the in-flight line exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxPhase {
    Idle,
    AtCmd,
    ReqPkt,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderSize {
    Undef,
    Bits11,
    Bits29,
}

/// Phase cell the line sender blocks on until the parser (or a timeout)
/// classifies the exchange.
struct TxGate {
    phase: Mutex<TxPhase>,
    changed: Notify,
}

impl TxGate {
    fn new() -> Self {
        Self {
            phase: Mutex::new(TxPhase::Idle),
            changed: Notify::new(),
        }
    }

    fn phase(&self) -> TxPhase {
        *self.phase.lock()
    }

    fn begin(&self, phase: TxPhase) {
        *self.phase.lock() = phase;
    }

    fn resolve(&self, to: TxPhase) {
        *self.phase.lock() = to;
        self.changed.notify_waiters();
    }

    /// Resolve only when the exchange is still in `from`; a completed or
    /// already-failed exchange is left alone.
    fn resolve_from(&self, from: TxPhase, to: TxPhase) {
        let mut phase = self.phase.lock();
        if *phase == from {
            *phase = to;
            drop(phase);
            self.changed.notify_waiters();
        }
    }

    /// Block until the phase leaves `phase` or `timeout` elapses; on
    /// expiry the phase becomes `Timeout`. Returns the final phase.
    async fn wait_while(&self, phase: TxPhase, timeout: Duration) -> TxPhase {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before the phase check so a resolution landing in
            // between still wakes us.
            notified.as_mut().enable();
            {
                let current = self.phase.lock();
                if *current != phase {
                    return *current;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut current = self.phase.lock();
                if *current == phase {
                    *current = TxPhase::Timeout;
                }
                return *current;
            }
        }
    }
}

/// Cached adapter addressing state, used to suppress redundant
/// ATSH/ATCRA/ATTP commands between requests.
struct HeaderCache {
    header_size: HeaderSize,
    prev_req_id: u32,
    prev_rsp_id: u32,
}

impl HeaderCache {
    fn new() -> Self {
        Self {
            header_size: HeaderSize::Undef,
            prev_req_id: 0,
            prev_rsp_id: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Firmware identity announced by the reset banner.
#[derive(Default)]
struct AdapterInfo {
    version: String,
    is_v15: bool,
}

impl AdapterInfo {
    fn clear(&mut self) {
        self.version.clear();
        self.is_v15 = false;
    }
}

/// CAN transport over an ELM327-compatible adapter.
pub struct Elm327Transport {
    link: Arc<dyn Elm327Link>,
    line_timeout: Duration,
    can_500k: bool,
    op_state: Mutex<OpState>,
    gate: TxGate,
    cache: Mutex<HeaderCache>,
    info: Mutex<AdapterInfo>,
    events: broadcast::Sender<LinkEvent>,
    init_wake: Notify,
}

impl Elm327Transport {
    /// Start the link and the driver tasks. The adapter initialises
    /// asynchronously once the link reports connected; until then
    /// requests fail with `NotConnected`.
    pub async fn connect(
        link: Arc<dyn Elm327Link>,
        req_timeout_ms: u64,
        can_is_500k: bool,
    ) -> Result<Arc<Self>, TransportError> {
        let (events, _) = broadcast::channel(256);
        let driver = Arc::new(Self {
            link,
            line_timeout: Duration::from_millis(req_timeout_ms * TIMEOUT_SCALE),
            can_500k: can_is_500k,
            op_state: Mutex::new(OpState::Disconnected),
            gate: TxGate::new(),
            cache: Mutex::new(HeaderCache::new()),
            info: Mutex::new(AdapterInfo::default()),
            events,
            init_wake: Notify::new(),
        });
        driver.link.start().await?;
        Arc::clone(&driver).spawn_io();
        Arc::clone(&driver).spawn_init();
        Ok(driver)
    }

    /// Adapter firmware version, once initialisation has captured it.
    pub fn adapter_version(&self) -> String {
        self.info.lock().version.clone()
    }

    fn spawn_io(self: Arc<Self>) {
        let mut events = self.link.events();
        tokio::spawn(async move {
            let mut parser = LineParser::new();
            loop {
                match events.recv().await {
                    Ok(LinkIo::Connected(true)) => {
                        let mut state = self.op_state.lock();
                        if *state == OpState::Disconnected {
                            *state = OpState::Initialising;
                            drop(state);
                            self.init_wake.notify_one();
                        }
                    }
                    Ok(LinkIo::Connected(false)) => {
                        *self.op_state.lock() = OpState::Disconnected;
                        // Fail whatever exchange the link dropped under.
                        self.gate.resolve_from(TxPhase::AtCmd, TxPhase::Error);
                        self.gate.resolve_from(TxPhase::ReqPkt, TxPhase::Error);
                    }
                    Ok(LinkIo::Data(bytes)) => {
                        for byte in bytes {
                            if parser.push(byte) {
                                self.handle_exchange(&mut parser);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "link event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_init(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if *self.op_state.lock() != OpState::Initialising {
                    self.init_wake.notified().await;
                    continue;
                }
                self.run_init_sequence().await;
            }
        });
    }

    async fn run_init_sequence(&self) {
        // A fresh adapter has no addressing state; forget ours too so the
        // next request re-emits ATSH/ATCRA.
        self.cache.lock().reset();
        self.info.lock().clear();

        for command in INIT_SEQUENCE {
            if *self.op_state.lock() != OpState::Initialising {
                return;
            }
            if let Err(error) = self.send_line(TxPhase::AtCmd, command.as_bytes()).await {
                tracing::error!(command, %error, "adapter init command failed");
                tokio::time::sleep(INIT_RETRY_DELAY).await;
                return;
            }
        }

        {
            let mut info = self.info.lock();
            info.is_v15 = info.version == "1.5";
            tracing::info!(version = %info.version, quirk_v15 = info.is_v15, "adapter initialised");
        }
        let mut state = self.op_state.lock();
        if *state == OpState::Initialising {
            *state = OpState::Connected;
        }
    }

    fn handle_exchange(&self, parser: &mut LineParser) {
        let phase = self.gate.phase();
        let exchange = parser.process(phase);

        if let Some(version) = exchange.version {
            self.info.lock().version = version;
        }

        // Each hex line is one CAN frame carrying the filtered response id.
        let rsp_id = self.cache.lock().prev_rsp_id;
        for bytes in exchange.frames {
            if let Some(frame) = CanFrame::new(rsp_id, &bytes) {
                let _ = self.events.send(LinkEvent::Frame(frame));
            }
        }

        match phase {
            TxPhase::AtCmd => {
                let outcome = if exchange.success {
                    TxPhase::Idle
                } else {
                    TxPhase::Error
                };
                self.gate.resolve_from(TxPhase::AtCmd, outcome);
            }
            TxPhase::ReqPkt => {
                // Payload success is decided when the ISO-TP layer calls
                // mark_response_complete; the prompt alone only proves the
                // adapter spoke, not that every frame arrived.
                if !exchange.success {
                    self.gate.resolve_from(TxPhase::ReqPkt, TxPhase::Error);
                }
            }
            _ => {}
        }
    }

    /// Send one line and block until the parser classifies the exchange
    /// or the timeout runs down. A timeout surfaces as an interface error
    /// through the event channel; the send itself reports success so the
    /// decoder, not the sender, owns recovery.
    async fn send_line(&self, phase: TxPhase, line: &[u8]) -> Result<(), TransportError> {
        self.gate.begin(phase);
        if let Err(error) = self.link.transmit_line(line).await {
            tracing::error!(%error, "link failed to send line");
            self.gate.resolve(TxPhase::Idle);
            return Err(error);
        }

        let outcome = self.gate.wait_while(phase, self.line_timeout).await;
        self.gate.resolve(TxPhase::Idle);

        match outcome {
            TxPhase::Timeout => {
                let _ = self.events.send(LinkEvent::Error(InterfaceError::Timeout));
                Ok(())
            }
            TxPhase::Error => Err(TransportError::AdapterError),
            _ => Ok(()),
        }
    }
}

fn protocol_command(header: HeaderSize, can_500k: bool) -> &'static str {
    match (header, can_500k) {
        (HeaderSize::Bits29, true) => "ATTP7",
        (HeaderSize::Bits29, false) => "ATTP9",
        (_, true) => "ATTP6",
        (_, false) => "ATTP8",
    }
}

#[async_trait]
impl CanTransport for Elm327Transport {
    fn connected(&self) -> bool {
        *self.op_state.lock() == OpState::Connected
    }

    async fn transmit_request(
        &self,
        req_id: u32,
        rsp_id: u32,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }

        // Switch the adapter protocol when the header width changed.
        let header = if req_id > 0x7FF {
            HeaderSize::Bits29
        } else {
            HeaderSize::Bits11
        };
        let switch_protocol = {
            let mut cache = self.cache.lock();
            if cache.header_size != header {
                cache.header_size = header;
                true
            } else {
                false
            }
        };
        if switch_protocol {
            self.send_line(
                TxPhase::AtCmd,
                protocol_command(header, self.can_500k).as_bytes(),
            )
            .await?;
        }

        let is_v15 = self.info.lock().is_v15;

        if self.cache.lock().prev_req_id != req_id {
            if is_v15 && header == HeaderSize::Bits29 {
                // 1.5 firmware takes only 24 bits through ATSH; ATCP
                // carries the upper byte.
                let command = format!("ATCP{:x}", req_id >> 24);
                self.send_line(TxPhase::AtCmd, command.as_bytes()).await?;
                let command = format!("ATSH{:x}", req_id & 0xFF_FFFF);
                self.send_line(TxPhase::AtCmd, command.as_bytes()).await?;
            } else {
                let command = format!("ATSH{:x}", req_id);
                self.send_line(TxPhase::AtCmd, command.as_bytes()).await?;
            }

            // The flow-control header mirrors the request header.
            let command = format!("ATFCSH{:x}", req_id);
            self.send_line(TxPhase::AtCmd, command.as_bytes()).await?;

            self.cache.lock().prev_req_id = req_id;
        }

        if self.cache.lock().prev_rsp_id != rsp_id {
            let command = format!("ATCRA{:x}", rsp_id);
            self.send_line(TxPhase::AtCmd, command.as_bytes()).await?;
            self.cache.lock().prev_rsp_id = rsp_id;
        }

        let mut len = data.len();
        if is_v15 {
            // Trailing zero bytes trip up cheap clone buffers.
            while len > 0 && data[len - 1] == 0 {
                len -= 1;
            }
        }

        let mut line = Vec::with_capacity(len * 2);
        for &byte in &data[..len] {
            line.push(nibble_char(byte >> 4));
            line.push(nibble_char(byte & 0x0F));
        }
        self.send_line(TxPhase::ReqPkt, &line).await
    }

    async fn transmit_flow_control(&self, _req_id: u32, _data: &[u8]) -> Result<(), TransportError> {
        // ATCFC1/ATFCSM1 make the adapter answer first frames itself.
        Ok(())
    }

    fn set_response_filter(&self, _enable: bool) {
        // Filtering is implicit in ATCRA.
    }

    fn mark_response_complete(&self) {
        self.gate.resolve(TxPhase::Idle);
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
