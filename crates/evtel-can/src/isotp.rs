//! Simplified ISO-TP (ISO 15765-2) reassembly
//!
//! Sits between the vehicle manager and the selected transport back-end.
//! Outbound requests always fit in a single frame; inbound responses may
//! span single, first, and consecutive frames, which are reassembled here
//! and delivered as complete UDS payloads. Only one request is in flight
//! at a time, so a single reassembly state suffices.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use evtel_core::{CanFrame, CanRequest, ResponseSlot, TransportError};

use crate::transport::{CanTransport, LinkEvent};

/// Flow-control frame sent in response to a first frame: continue-to-send,
/// no block-size limit, no minimum separation time.
pub const FLOW_CONTROL: [u8; 8] = [0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Upper bound on a reassembled UDS response across the supported
/// platforms.
pub const MAX_RESPONSE_LEN: usize = 4096;

/// Reassembly state. Outside of `collecting` every consecutive frame is
/// dropped, which is what closes out a PDU exactly once: delivery returns
/// to the waiting state before the next frame is examined.
struct Reassembly {
    cur_req_id: u32,
    cur_rsp_id: u32,
    expected: usize,
    buf: Vec<u8>,
    next_seq: u8,
    collecting: bool,
}

impl Reassembly {
    fn new() -> Self {
        Self {
            cur_req_id: 0,
            cur_rsp_id: 0,
            expected: 0,
            buf: Vec::with_capacity(MAX_RESPONSE_LEN),
            next_seq: 0,
            collecting: false,
        }
    }

    /// Process one accepted frame. Returns the completed payload and/or a
    /// pending flow-control obligation.
    fn ingest(&mut self, data: &[u8]) -> FrameActions {
        let mut actions = FrameActions::default();
        if data.is_empty() {
            return actions;
        }

        match data[0] & 0xF0 {
            0x00 => {
                // Single frame: length in the low nibble, data from byte 1.
                self.expected = usize::from(data[0] & 0x0F);
                self.buf.clear();
                self.collecting = false;
                let take = self.expected.min(data.len().saturating_sub(1));
                self.buf.extend_from_slice(&data[1..1 + take]);
                if self.buf.len() == self.expected {
                    actions.complete = Some(std::mem::take(&mut self.buf));
                }
            }
            0x10 => {
                // First frame: 12-bit total over bytes 0-1, data from byte 2.
                if data.len() > 1 {
                    self.expected =
                        (usize::from(data[0] & 0x0F) << 8) | usize::from(data[1]);
                    self.buf.clear();
                    self.next_seq = 1;
                    self.collecting = true;
                    let take = self.expected.min(data.len() - 2);
                    self.buf.extend_from_slice(&data[2..2 + take]);
                    if self.buf.len() == self.expected {
                        self.collecting = false;
                        actions.complete = Some(std::mem::take(&mut self.buf));
                    }
                    if self.cur_req_id != 0 {
                        actions.send_flow_control = Some(self.cur_req_id);
                    }
                } else {
                    // Truncated first frame invalidates the reassembly.
                    self.collecting = false;
                }
            }
            0x20 => {
                // Consecutive frame: accept only the expected 4-bit
                // sequence; a mismatch discards the rest of this PDU until
                // the next first frame.
                if self.collecting {
                    if (data[0] & 0x0F) == self.next_seq {
                        let remaining = self.expected - self.buf.len();
                        let take = remaining.min(data.len() - 1);
                        self.buf.extend_from_slice(&data[1..1 + take]);
                        self.next_seq = (self.next_seq + 1) & 0x0F;
                        if self.buf.len() == self.expected {
                            self.collecting = false;
                            actions.complete = Some(std::mem::take(&mut self.buf));
                        }
                    } else {
                        self.collecting = false;
                    }
                }
            }
            _ => {
                // Flow control or reserved PCI from the vehicle: not ours.
            }
        }

        actions
    }
}

#[derive(Default)]
struct FrameActions {
    complete: Option<Vec<u8>>,
    send_flow_control: Option<u32>,
}

/// Unified ISO-TP interface over the selected transport.
///
/// Records the (request id, response id) pair of the current request,
/// reassembles the response, and hands complete payloads to the vehicle
/// manager through its [`ResponseSlot`].
pub struct CanManager {
    transport: Arc<dyn CanTransport>,
    state: Mutex<Reassembly>,
    sink: Arc<ResponseSlot>,
}

impl CanManager {
    pub fn new(transport: Arc<dyn CanTransport>, sink: Arc<ResponseSlot>) -> Self {
        Self {
            transport,
            state: Mutex::new(Reassembly::new()),
            sink,
        }
    }

    /// Start the background task that drains transport events into the
    /// reassembler.
    pub fn spawn(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut events = manager.transport.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Frame(frame)) => manager.receive(&frame).await,
                    Ok(LinkEvent::Error(error)) => manager.sink.note_error(error),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "frame stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    /// Send a request and record its response id as the current
    /// expectation.
    pub async fn transmit(&self, request: &CanRequest) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            state.cur_req_id = request.req_id;
            state.cur_rsp_id = request.rsp_id;
            state.collecting = false;
        }
        self.transport
            .transmit_request(request.req_id, request.rsp_id, request.payload())
            .await
    }

    pub fn set_response_filter(&self, enable: bool) {
        self.transport.set_response_filter(enable);
    }

    /// Inbound frame path. Frames whose id differs from the current
    /// response id are dropped without touching state.
    pub async fn receive(&self, frame: &CanFrame) {
        let actions = {
            let mut state = self.state.lock();
            if frame.id() != state.cur_rsp_id {
                return;
            }
            state.ingest(frame.data())
        };

        if let Some(payload) = actions.complete {
            self.transport.mark_response_complete();
            if !self.sink.offer(frame.id(), payload) {
                tracing::debug!(rsp_id = format_args!("{:#x}", frame.id()), "response slot full, dropping");
            }
        }

        if let Some(req_id) = actions.send_flow_control {
            if let Err(error) = self
                .transport
                .transmit_flow_control(req_id, &FLOW_CONTROL)
                .await
            {
                tracing::warn!(%error, "flow control send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_all(reassembly: &mut Reassembly, frames: &[&[u8]]) -> Vec<Vec<u8>> {
        frames
            .iter()
            .filter_map(|data| reassembly.ingest(data).complete)
            .collect()
    }

    #[test]
    fn single_frame_delivers_immediately() {
        let mut r = Reassembly::new();
        let done = r.ingest(&[0x04, 0x62, 0x11, 0x03, 0xB4]).complete;
        assert_eq!(done, Some(vec![0x62, 0x11, 0x03, 0xB4]));
    }

    #[test]
    fn stray_consecutive_after_single_frame_is_dropped() {
        let mut r = Reassembly::new();
        assert!(r.ingest(&[0x04, 0x62, 0x11, 0x03, 0xB4]).complete.is_some());
        // Low nibble 0 would have matched the original's wrapped counter.
        assert!(r.ingest(&[0x20, 0xAA, 0xBB]).complete.is_none());
        assert!(r.ingest(&[0x21, 0xAA, 0xBB]).complete.is_none());
    }

    #[test]
    fn first_and_consecutive_frames_reassemble_in_order() {
        let mut r = Reassembly::new();
        r.cur_req_id = 0x79B;
        let payload: Vec<u8> = (0u8..20).collect();

        let mut first = vec![0x10, payload.len() as u8];
        first.extend_from_slice(&payload[..6]);
        let actions = r.ingest(&first);
        assert!(actions.complete.is_none());
        assert_eq!(actions.send_flow_control, Some(0x79B));

        let mut delivered = None;
        for (i, chunk) in payload[6..].chunks(7).enumerate() {
            let mut cf = vec![0x21 + i as u8];
            cf.extend_from_slice(chunk);
            delivered = r.ingest(&cf).complete;
        }
        assert_eq!(delivered, Some(payload));
    }

    #[test]
    fn sequence_mismatch_discards_remainder() {
        let mut r = Reassembly::new();
        let mut first = vec![0x10, 16];
        first.extend_from_slice(&[0u8; 6]);
        r.ingest(&first);

        // Expected sequence 1; inject 3.
        assert!(ingest_all(&mut r, &[&[0x23, 1, 2, 3, 4, 5, 6, 7]]).is_empty());
        // The correct frame no longer helps; collection was invalidated.
        assert!(ingest_all(&mut r, &[&[0x21, 1, 2, 3, 4, 5, 6, 7]]).is_empty());
    }

    #[test]
    fn truncated_first_frame_invalidates() {
        let mut r = Reassembly::new();
        r.ingest(&[0x10]);
        assert!(r.ingest(&[0x21, 1, 2, 3, 4, 5, 6, 7]).complete.is_none());
    }

    #[test]
    fn truncated_first_frame_emits_no_flow_control() {
        let mut r = Reassembly::new();
        r.cur_req_id = 0x79B;
        assert!(r.ingest(&[0x10]).send_flow_control.is_none());
    }

    #[test]
    fn no_flow_control_without_request_id() {
        let mut r = Reassembly::new();
        let mut first = vec![0x10, 16];
        first.extend_from_slice(&[0u8; 6]);
        assert!(r.ingest(&first).send_flow_control.is_none());
    }
}
