//! Mock transport for tests and demo runs

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use evtel_core::{CanFrame, InterfaceError, TransportError};

use super::{CanTransport, LinkEvent, MockConfig};

/// A request observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub req_id: u32,
    pub rsp_id: u32,
    pub data: Vec<u8>,
}

/// In-process transport that replays canned frame sequences.
///
/// Requests are matched against scripted payload prefixes; the scripted
/// frames are emitted through the event channel as if received from the
/// vehicle. Unmatched requests run into the same one-shot timeout as the
/// SocketCAN back-end.
pub struct MockTransport {
    latency: Duration,
    req_timeout: Duration,
    connected: AtomicBool,
    filter_enabled: AtomicBool,
    events: broadcast::Sender<LinkEvent>,
    responses: Mutex<Vec<(Vec<u8>, Vec<CanFrame>)>>,
    sent: Mutex<Vec<SentRequest>>,
    flow_controls: Mutex<Vec<(u32, Vec<u8>)>>,
    completions: AtomicUsize,
    pending: Arc<AtomicU64>,
}

impl MockTransport {
    pub fn new(config: &MockConfig, req_timeout_ms: u64) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            latency: Duration::from_millis(config.latency_ms),
            req_timeout: Duration::from_millis(req_timeout_ms),
            connected: AtomicBool::new(true),
            filter_enabled: AtomicBool::new(false),
            events,
            responses: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            flow_controls: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            pending: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Canned responses for the Leaf ZE1 catalogue, used by the daemon's
    /// no-config demo mode.
    pub fn with_default_responses(self) -> Self {
        let sf = |id: u32, bytes: &[u8]| CanFrame::new(id, bytes).expect("frame fits");
        {
            let mut responses = self.responses.lock();
            // Gear position: drive.
            responses.push((
                vec![0x03, 0x22, 0x11, 0x56],
                vec![sf(0x79A, &[0x04, 0x62, 0x11, 0x56, 0x04])],
            ));
            // 12 V battery: 14.40 V, 1.0 A.
            responses.push((
                vec![0x03, 0x22, 0x11, 0x03],
                vec![sf(0x79A, &[0x04, 0x62, 0x11, 0x03, 0xB4])],
            ));
            responses.push((
                vec![0x03, 0x22, 0x11, 0x83],
                vec![sf(0x79A, &[0x05, 0x62, 0x11, 0x83, 0x01, 0x00])],
            ));
            // Aux loads: 1.0 kW each.
            responses.push((
                vec![0x03, 0x22, 0x11, 0x52],
                vec![sf(0x79A, &[0x04, 0x62, 0x11, 0x52, 0x0A])],
            ));
            responses.push((
                vec![0x03, 0x22, 0x11, 0x51],
                vec![sf(0x79A, &[0x04, 0x62, 0x11, 0x51, 0x04])],
            ));
            // Speed: 60.0 km/h.
            responses.push((
                vec![0x03, 0x22, 0x12, 0x1A],
                vec![sf(0x79A, &[0x05, 0x62, 0x12, 0x1A, 0x02, 0x58])],
            ));
            // HV battery info: 53-byte multi-frame, 1.0 A, 360.00 V.
            let mut info = vec![0x61, 0x01];
            info.resize(53, 0);
            info[8..12].copy_from_slice(&1024i32.to_be_bytes());
            info[20..22].copy_from_slice(&36000u16.to_be_bytes());
            responses.push((vec![0x02, 0x21, 0x01], multi_frame(0x7BB, &info)));
            // HV battery temps: 31-byte multi-frame, raw 400 on each sensor.
            let mut temps = vec![0x61, 0x04];
            temps.resize(31, 0);
            temps[2..4].copy_from_slice(&400i16.to_be_bytes());
            temps[5..7].copy_from_slice(&400i16.to_be_bytes());
            temps[11..13].copy_from_slice(&400i16.to_be_bytes());
            responses.push((vec![0x02, 0x21, 0x04], multi_frame(0x7BB, &temps)));
            // Motor torque: 32 N·m.
            responses.push((
                vec![0x03, 0x22, 0x12, 0x25],
                vec![sf(0x78C, &[0x05, 0x62, 0x12, 0x25, 0x08, 0x00])],
            ));
        }
        self
    }

    /// Script the frames to replay for requests whose payload starts with
    /// `prefix`.
    pub fn script(&self, prefix: Vec<u8>, frames: Vec<CanFrame>) {
        self.responses.lock().push((prefix, frames));
    }

    /// Inject an event as if produced by the link.
    pub fn inject(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Requests observed so far.
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    /// Flow-control frames observed so far.
    pub fn flow_controls(&self) -> Vec<(u32, Vec<u8>)> {
        self.flow_controls.lock().clone()
    }

    /// Number of `mark_response_complete` calls.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter_enabled.load(Ordering::SeqCst)
    }

    fn find_response(&self, payload: &[u8]) -> Option<Vec<CanFrame>> {
        let responses = self.responses.lock();
        responses
            .iter()
            .find(|(prefix, _)| payload.starts_with(prefix))
            .map(|(_, frames)| frames.clone())
    }
}

/// Split a UDS payload into ISO-TP first + consecutive frames.
pub fn multi_frame(rsp_id: u32, payload: &[u8]) -> Vec<CanFrame> {
    let mut frames = Vec::new();
    let mut first = vec![
        0x10 | ((payload.len() >> 8) as u8 & 0x0F),
        payload.len() as u8,
    ];
    first.extend_from_slice(&payload[..payload.len().min(6)]);
    frames.push(CanFrame::new(rsp_id, &first).expect("frame fits"));

    let mut seq = 1u8;
    for chunk in payload[payload.len().min(6)..].chunks(7) {
        let mut cf = vec![0x20 | seq];
        cf.extend_from_slice(chunk);
        frames.push(CanFrame::new(rsp_id, &cf).expect("frame fits"));
        seq = (seq + 1) & 0x0F;
    }
    frames
}

#[async_trait]
impl CanTransport for MockTransport {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
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

        self.sent.lock().push(SentRequest {
            req_id,
            rsp_id,
            data: data.to_vec(),
        });

        let generation = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();
        let latency = self.latency;

        match self.find_response(data) {
            Some(frames) => {
                tokio::spawn(async move {
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    for frame in frames {
                        let _ = events.send(LinkEvent::Frame(frame));
                    }
                });
            }
            None => {
                // No scripted response: arm the one-shot request timeout.
                let pending = Arc::clone(&self.pending);
                let timeout = self.req_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if pending.load(Ordering::SeqCst) == generation {
                        let _ = events.send(LinkEvent::Error(InterfaceError::Timeout));
                    }
                });
            }
        }

        Ok(())
    }

    async fn transmit_flow_control(&self, req_id: u32, data: &[u8]) -> Result<(), TransportError> {
        self.flow_controls.lock().push((req_id, data.to_vec()));
        Ok(())
    }

    fn set_response_filter(&self, enable: bool) {
        self.filter_enabled.store(enable, Ordering::SeqCst);
    }

    fn mark_response_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
