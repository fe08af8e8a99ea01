//! Single-entry response hand-off

use parking_lot::Mutex;

use crate::error::InterfaceError;

/// A complete UDS response payload as reassembled by the ISO-TP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsResponse {
    pub rsp_id: u32,
    pub data: Vec<u8>,
}

/// Single-entry hand-off between the CAN receive path and the vehicle
/// evaluator.
///
/// The receive path may run in a reader task while the evaluator consumes
/// on its own tick; holding exactly one pending response keeps deliveries
/// to the decoder ordered and non-overlapping. A response offered while the
/// previous one has not been consumed is dropped.
#[derive(Default)]
pub struct ResponseSlot {
    response: Mutex<Option<UdsResponse>>,
    error: Mutex<Option<InterfaceError>>,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a completed response unless one is already pending.
    /// Returns false when the response was dropped.
    pub fn offer(&self, rsp_id: u32, data: Vec<u8>) -> bool {
        let mut slot = self.response.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(UdsResponse { rsp_id, data });
        true
    }

    pub fn take(&self) -> Option<UdsResponse> {
        self.response.lock().take()
    }

    /// Record an interface error for the evaluator to observe at its next
    /// tick. Later errors of the same kind coalesce.
    pub fn note_error(&self, error: InterfaceError) {
        *self.error.lock() = Some(error);
    }

    pub fn take_error(&self) -> Option<InterfaceError> {
        self.error.lock().take()
    }
}
