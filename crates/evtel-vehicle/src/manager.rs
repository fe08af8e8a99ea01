//! Vehicle manager: decoder selection, response shuttle, matching

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use evtel_broker::DataBroker;
use evtel_can::{create_transport, CanManager, TransportConfig};
use evtel_core::{CanRequest, DataItems, ResponseSlot, TransportError};

use crate::decoder::{VehicleDecoder, VehicleProfile};

/// Fatal configuration errors surfaced from [`VehicleManager::new`].
/// Nothing is published when these occur.
#[derive(Debug, Error)]
pub enum VehicleError {
    #[error("unknown vehicle '{0}'")]
    UnknownVehicle(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Match a UDS response against a request catalogue.
///
/// A positive response echoes the request SID + 0x40 and repeats the
/// sub-function / DID bytes; negative responses (0x7F) match nothing.
/// Returns the index of the first matching catalogue entry.
pub fn resolve_index(rsp_id: u32, data: &[u8], catalogue: &[&CanRequest]) -> Option<usize> {
    // Need at least the SID echo and one byte after it.
    if data.len() < 2 {
        return None;
    }
    if data[0] == 0x7F {
        return None;
    }

    catalogue.iter().position(|request| {
        if rsp_id != request.rsp_id || data[0] != request.data[1].wrapping_add(0x40) {
            return false;
        }
        // The response must carry at least as many bytes as the request
        // described, or the sub-function bytes cannot be checked.
        if data.len() <= usize::from(request.data[0]) {
            return false;
        }
        // Compare the sub-function / DID bytes beyond the SID.
        let extra = usize::from(request.data[0]).saturating_sub(1);
        (0..extra).all(|i| data[1 + i] == request.data[2 + i])
    })
}

/// Owns the active decoder and shuttles work between the receive path and
/// the evaluator loop.
pub struct VehicleManager {
    decoder: Box<dyn VehicleDecoder>,
    can: Arc<CanManager>,
    slot: Arc<ResponseSlot>,
    pending_mask: Mutex<Option<DataItems>>,
}

impl VehicleManager {
    /// Select the decoder for `vehicle_name`, bring up the transport with
    /// the decoder's timeout and bit-rate, and run the decoder's one-shot
    /// init.
    pub async fn new(
        vehicle_name: &str,
        transport: &TransportConfig,
        broker: Arc<DataBroker>,
    ) -> Result<Self, VehicleError> {
        let mut decoder = crate::create_decoder(vehicle_name, broker)
            .ok_or_else(|| VehicleError::UnknownVehicle(vehicle_name.to_string()))?;
        let profile = decoder.profile();

        tracing::info!(
            vehicle = profile.name,
            timeout_ms = profile.req_timeout_ms,
            bitrate_500k = profile.can_is_500k,
            "initialising vehicle"
        );

        let transport =
            create_transport(transport, profile.req_timeout_ms, profile.can_is_500k).await?;
        let slot = Arc::new(ResponseSlot::new());
        let can = Arc::new(CanManager::new(transport, slot.clone()));
        can.spawn();

        decoder.init(&can).await;

        Ok(Self {
            decoder,
            can,
            slot,
            pending_mask: Mutex::new(None),
        })
    }

    pub fn profile(&self) -> &'static VehicleProfile {
        self.decoder.profile()
    }

    pub fn supported_item_mask(&self) -> DataItems {
        self.decoder.profile().supported_items
    }

    pub fn connected(&self) -> bool {
        self.can.connected()
    }

    /// Queue a capability-mask change; it applies at the next eval tick.
    /// In-flight requests are not aborted.
    pub fn set_request_item_mask(&self, mask: DataItems) {
        *self.pending_mask.lock() = Some(mask);
    }

    /// One evaluator tick: drain pending error and response, apply a
    /// queued mask change, then let the decoder evaluate.
    pub async fn eval(&mut self) {
        if let Some(error) = self.slot.take_error() {
            self.decoder.note_error(error);
        }
        if let Some(response) = self.slot.take() {
            self.decoder.rx_data(response.rsp_id, &response.data);
        }
        if let Some(mask) = self.pending_mask.lock().take() {
            self.decoder.set_request_mask(mask);
        }
        let can = Arc::clone(&self.can);
        self.decoder.eval(&can).await;
    }
}
