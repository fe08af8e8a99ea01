//! Round-robin request scheduling shared by the decoders

use evtel_can::CanManager;
use evtel_core::CanRequest;

/// Drives a decoder's compacted request list with at most one request in
/// flight.
///
/// The in-flight flag clears when the evaluator observes a response, an
/// error, or a timeout; the next tick then issues the next list entry and
/// wraps at the end.
pub struct RequestScheduler {
    list: Vec<&'static CanRequest>,
    cursor: usize,
    in_flight: bool,
    saw_response: bool,
    saw_error: bool,
    timed_out: bool,
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self {
            list: Vec::new(),
            cursor: 0,
            in_flight: false,
            saw_response: false,
            saw_error: false,
            timed_out: false,
        }
    }

    /// Replace the compacted request list and restart the rotation.
    pub fn set_list(&mut self, list: Vec<&'static CanRequest>) {
        self.list = list;
        self.cursor = 0;
    }

    pub fn list(&self) -> &[&'static CanRequest] {
        &self.list
    }

    pub fn note_response(&mut self) {
        self.saw_response = true;
    }

    pub fn note_timeout(&mut self) {
        self.timed_out = true;
    }

    /// One evaluator tick: retire a finished request, then issue the next
    /// one when idle.
    pub async fn eval(&mut self, can: &CanManager) {
        if self.in_flight && (self.saw_error || self.saw_response || self.timed_out) {
            self.in_flight = false;
            if self.timed_out {
                self.timed_out = false;
                tracing::info!("request timed out");
            }
        }

        if !self.in_flight && !self.list.is_empty() {
            self.in_flight = true;
            self.saw_response = false;
            self.timed_out = false;

            let request = self.list[self.cursor];
            match can.transmit(request).await {
                Ok(()) => self.saw_error = false,
                Err(error) => {
                    self.saw_error = true;
                    tracing::error!(
                        req_id = format_args!("{:#x}", request.req_id),
                        %error,
                        "request transmit failed"
                    );
                }
            }

            self.cursor += 1;
            if self.cursor >= self.list.len() {
                self.cursor = 0;
            }
        }
    }
}
