//! Vehicle decoder contract

use async_trait::async_trait;

use evtel_can::CanManager;
use evtel_core::{DataItems, InterfaceError, ItemRange};

/// Static description of one vehicle platform: which canonical items it
/// can produce, the display ranges for its gauges, and how its OBD-II
/// port expects to be spoken to.
#[derive(Debug, Clone, Copy)]
pub struct VehicleProfile {
    pub name: &'static str,
    pub supported_items: DataItems,
    pub power_kw_range: ItemRange,
    pub aux_kw_range: ItemRange,
    pub torque_nm_range: ItemRange,
    pub hv_batt_i_range: ItemRange,
    pub lv_batt_v_range: ItemRange,
    /// 500 kbit/s bus when true, 250 kbit/s otherwise.
    pub can_is_500k: bool,
    /// Per-request response timeout.
    pub req_timeout_ms: u64,
}

/// Per-platform request catalogue and response decoding.
///
/// The evaluator loop drives `eval` periodically; everything else reacts
/// to events the vehicle manager shuttles in. Implementations never run
/// in the receive path.
#[async_trait]
pub trait VehicleDecoder: Send {
    fn profile(&self) -> &'static VehicleProfile;

    /// One-shot setup once the transport is up.
    async fn init(&mut self, can: &CanManager);

    /// Periodic tick: consume any completed/errored/timed-out request and
    /// issue the next catalogue entry when idle.
    async fn eval(&mut self, can: &CanManager);

    /// Compile the request list down to what `mask` needs. Takes effect
    /// before the next issued request; the round-robin cursor resets.
    fn set_request_mask(&mut self, mask: DataItems);

    /// A complete UDS response routed to this decoder.
    fn rx_data(&mut self, rsp_id: u32, data: &[u8]);

    /// An interface error attributable to the in-flight request.
    fn note_error(&mut self, error: InterfaceError);
}
